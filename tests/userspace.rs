//! Integration test for user space execution.
//!
//! Hand-assembles a minimal ELF32 executable (a dozen bytes of machine
//! code performing the exit syscall), stores it on a RAM-disk volume,
//! and runs it through the real exec path: loader validation, user page
//! grants, argv stack build, the iret drop to Ring 3, the `int 0x80`
//! gate and the resume-on-exit context restore.

#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![test_runner(opal_os::test_runner)]
#![reexport_test_harness_main = "test_main"]
#![allow(missing_docs)]
#![allow(clippy::missing_panics_doc)]

extern crate alloc;

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::panic::PanicInfo;

use opal_os::block::RamDisk;
use opal_os::elf::ElfError;
use opal_os::fat16;
use opal_os::userspace::{self, ExecError, USER_MIN_VADDR};

#[unsafe(no_mangle)]
pub extern "C" fn kernel_main() -> ! {
    opal_os::allocator::init_heap();
    opal_os::init();

    test_main();

    opal_os::hlt_loop();
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    opal_os::test_panic_handler(info)
}

const EHDR_SIZE: u32 = 52;
const PHDR_SIZE: u32 = 32;

/// Build an ET_EXEC image for i386 whose single PT_LOAD segment holds
/// `code` at `vaddr`, entered at `vaddr`.
fn build_elf(vaddr: u32, code: &[u8]) -> Vec<u8> {
    let mut image = Vec::new();

    // e_ident
    image.extend_from_slice(&[0x7F, b'E', b'L', b'F', 1, 1, 1, 0]);
    image.extend_from_slice(&[0; 8]);
    image.extend_from_slice(&2_u16.to_le_bytes()); // e_type = ET_EXEC
    image.extend_from_slice(&3_u16.to_le_bytes()); // e_machine = EM_386
    image.extend_from_slice(&1_u32.to_le_bytes()); // e_version
    image.extend_from_slice(&vaddr.to_le_bytes()); // e_entry
    image.extend_from_slice(&EHDR_SIZE.to_le_bytes()); // e_phoff
    image.extend_from_slice(&0_u32.to_le_bytes()); // e_shoff
    image.extend_from_slice(&0_u32.to_le_bytes()); // e_flags
    image.extend_from_slice(&(EHDR_SIZE as u16).to_le_bytes()); // e_ehsize
    image.extend_from_slice(&(PHDR_SIZE as u16).to_le_bytes()); // e_phentsize
    image.extend_from_slice(&1_u16.to_le_bytes()); // e_phnum
    image.extend_from_slice(&0_u16.to_le_bytes()); // e_shentsize
    image.extend_from_slice(&0_u16.to_le_bytes()); // e_shnum
    image.extend_from_slice(&0_u16.to_le_bytes()); // e_shstrndx

    let code_offset = EHDR_SIZE + PHDR_SIZE;
    image.extend_from_slice(&1_u32.to_le_bytes()); // p_type = PT_LOAD
    image.extend_from_slice(&code_offset.to_le_bytes()); // p_offset
    image.extend_from_slice(&vaddr.to_le_bytes()); // p_vaddr
    image.extend_from_slice(&vaddr.to_le_bytes()); // p_paddr
    image.extend_from_slice(&(code.len() as u32).to_le_bytes()); // p_filesz
    image.extend_from_slice(&(code.len() as u32).to_le_bytes()); // p_memsz
    image.extend_from_slice(&5_u32.to_le_bytes()); // p_flags = R+X
    image.extend_from_slice(&0x1000_u32.to_le_bytes()); // p_align

    image.extend_from_slice(code);
    image
}

fn mount_with_program(path: &str, image: &[u8]) {
    let mut disk = RamDisk::new(2048);
    fat16::format(&mut disk, 2048, 4);
    fat16::mount_device(Box::new(disk)).expect("RAM disk mounts");
    fat16::with_fs(|fs| {
        fs.mkdir("/BIN")?;
        fs.write_file(path, image)
    })
    .expect("program stored");
}

#[test_case]
fn test_exec_runs_ring3_program_and_returns_exit_code() {
    // mov eax, 2 (exit); mov ebx, 42; int 0x80
    let code = [
        0xB8, 0x02, 0x00, 0x00, 0x00, // mov eax, SYS_EXIT
        0xBB, 0x2A, 0x00, 0x00, 0x00, // mov ebx, 42
        0xCD, 0x80, // int 0x80
    ];
    let image = build_elf(USER_MIN_VADDR, &code);
    mount_with_program("/BIN/EXIT42.ELF", &image);

    let code = userspace::exec("/BIN/EXIT42.ELF").expect("exec reaches user mode and back");
    assert_eq!(code, 42, "The exit syscall's code comes back to the caller.");
}

#[test_case]
fn test_exec_restores_kernel_callee_saved_registers() {
    // mov eax, 2; xor ebx, ebx; int 0x80
    let code = [
        0xB8, 0x02, 0x00, 0x00, 0x00, //
        0x31, 0xDB, //
        0xCD, 0x80, //
    ];
    let image = build_elf(USER_MIN_VADDR, &code);
    mount_with_program("/BIN/EXIT0.ELF", &image);

    // Anything the round trip clobbered in the callee-saved set would
    // corrupt these locals across the call.
    let sentinel_a = 0xDEAD_BEEF_u32;
    let sentinel_b = 0x1234_5678_u32;

    let code = userspace::exec("/BIN/EXIT0.ELF").expect("exec succeeds");

    assert_eq!(code, 0, "Exit code zero.");
    assert_eq!(sentinel_a, 0xDEAD_BEEF, "Locals survive the ring round trip.");
    assert_eq!(sentinel_b, 0x1234_5678, "Locals survive the ring round trip.");
}

#[test_case]
fn test_exec_rejects_entry_outside_loaded_range() {
    let code = [0xCD, 0x80];
    let mut image = build_elf(USER_MIN_VADDR, &code);
    // Corrupt e_entry to point far past the segment.
    image[24..28].copy_from_slice(&(USER_MIN_VADDR + 0x10_0000).to_le_bytes());
    mount_with_program("/BIN/BADENT.ELF", &image);

    assert_eq!(
        userspace::exec("/BIN/BADENT.ELF"),
        Err(ExecError::Load(ElfError::BadSegment(
            "entry point outside loaded range"
        ))),
        "Validation must catch a stray entry point.",
    );
}

#[test_case]
fn test_exec_rejects_segment_below_user_window() {
    let code = [0xCD, 0x80];
    let image = build_elf(0x0010_0000, &code);
    mount_with_program("/BIN/LOWSEG.ELF", &image);

    assert_eq!(
        userspace::exec("/BIN/LOWSEG.ELF"),
        Err(ExecError::Load(ElfError::BadSegment(
            "virtual range outside the user window"
        ))),
        "A segment overlapping the kernel must be refused.",
    );
}

#[test_case]
fn test_exec_rejects_non_elf_file() {
    let mut disk = RamDisk::new(2048);
    fat16::format(&mut disk, 2048, 4);
    fat16::mount_device(Box::new(disk)).expect("RAM disk mounts");
    fat16::with_fs(|fs| fs.write_file("/NOT.ELF", b"plain text, not an executable"))
        .expect("file stored");

    assert!(
        matches!(
            userspace::exec("/NOT.ELF"),
            Err(ExecError::Load(ElfError::NotAnExecutable(_)))
        ),
        "Garbage input fails identity validation.",
    );
}
