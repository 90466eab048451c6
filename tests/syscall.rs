//! Syscall gate and file descriptor table tests.
//!
//! These drive the real dispatcher with hand-built trap frames against a
//! RAM-disk filesystem. Pointer arguments are staged inside the user
//! window, which in the test environment is ordinary identity-mapped
//! memory nothing else uses.

#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![test_runner(opal_os::test_runner)]
#![reexport_test_harness_main = "test_main"]
#![allow(missing_docs)]
#![allow(clippy::missing_panics_doc)]

extern crate alloc;

use alloc::boxed::Box;
use core::panic::PanicInfo;

use opal_os::block::RamDisk;
use opal_os::fat16;
use opal_os::interrupts::Registers;
use opal_os::userspace::syscall::{
    self, OpenFlags, SYS_CHDIR, SYS_CLOSE, SYS_GETCWD, SYS_LISTDIR, SYS_OPEN, SYS_READ,
    SYS_WRITEFD,
};
use opal_os::userspace::{SYSCALL_INTERRUPT_INDEX, USER_MIN_VADDR};

/// Staging addresses inside the user window.
const PATH_ADDR: u32 = USER_MIN_VADDR;
const DATA_ADDR: u32 = USER_MIN_VADDR + 0x1000;
const READ_ADDR: u32 = USER_MIN_VADDR + 0x2000;

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

/// Mount a fresh RAM-disk volume as the kernel filesystem and drop every
/// descriptor a previous case may have leaked.
fn reset_world() {
    let mut disk = RamDisk::new(2048);
    fat16::format(&mut disk, 2048, 4);
    fat16::mount_device(Box::new(disk)).expect("RAM disk mounts");
    syscall::reset_fd_table();
}

fn invoke(eax: u32, ebx: u32, ecx: u32, edx: u32) -> u32 {
    let mut frame = Registers {
        ds: 0,
        edi: 0,
        esi: 0,
        ebp: 0,
        esp: 0,
        ebx,
        edx,
        ecx,
        eax,
        int_no: u32::from(SYSCALL_INTERRUPT_INDEX),
        err_code: 0,
        eip: 0,
        cs: 0,
        eflags: 0,
        useresp: 0,
        ss: 0,
    };
    syscall::handle(&mut frame);
    frame.eax
}

/// Stage a NUL-terminated string at a user address.
fn put_cstr(addr: u32, text: &str) {
    // SAFETY:
    // The staging addresses live in the identity-mapped user window,
    // unused by anything else while these tests run.
    unsafe {
        core::ptr::copy_nonoverlapping(text.as_ptr(), addr as *mut u8, text.len());
        *((addr + text.len() as u32) as *mut u8) = 0;
    }
}

fn put_bytes(addr: u32, bytes: &[u8]) {
    // SAFETY:
    // Same staging region as `put_cstr`.
    unsafe {
        core::ptr::copy_nonoverlapping(bytes.as_ptr(), addr as *mut u8, bytes.len());
    }
}

fn user_bytes(addr: u32, len: usize) -> &'static [u8] {
    // SAFETY:
    // Same staging region as `put_cstr`.
    unsafe { core::slice::from_raw_parts(addr as *const u8, len) }
}

#[test_case]
fn test_open_write_close_reopen_read_roundtrip() {
    reset_world();

    put_cstr(PATH_ADDR, "/H");
    let wronly_creat_trunc =
        (OpenFlags::WRONLY | OpenFlags::CREAT | OpenFlags::TRUNC).bits();
    let fd = invoke(SYS_OPEN, PATH_ADDR, wronly_creat_trunc, 0);
    assert!((fd as i32) >= 0, "open(CREAT) yields a descriptor.");

    put_bytes(DATA_ADDR, b"Hi");
    assert_eq!(
        invoke(SYS_WRITEFD, fd, DATA_ADDR, 2),
        2,
        "writefd reports the full count.",
    );
    assert_eq!(invoke(SYS_CLOSE, fd, 0, 0), 0, "close succeeds.");

    let fd = invoke(SYS_OPEN, PATH_ADDR, 0, 0);
    assert!((fd as i32) >= 0, "reopen read-only succeeds.");
    assert_eq!(
        invoke(SYS_READ, fd, READ_ADDR, 16),
        2,
        "read returns the two bytes on disk.",
    );
    assert_eq!(user_bytes(READ_ADDR, 2), b"Hi", "Payload round-trips.");
    assert_eq!(invoke(SYS_CLOSE, fd, 0, 0), 0, "second close succeeds.");
}

#[test_case]
fn test_read_only_fd_rejects_writes_without_mutating() {
    reset_world();

    put_cstr(PATH_ADDR, "/RO");
    let fd = invoke(SYS_OPEN, PATH_ADDR, OpenFlags::CREAT.bits(), 0);
    assert!((fd as i32) >= 0, "open succeeds.");

    put_bytes(DATA_ADDR, b"nope");
    assert_eq!(
        invoke(SYS_WRITEFD, fd, DATA_ADDR, 4),
        u32::MAX,
        "writefd on a read-only descriptor fails.",
    );

    let size = fat16::with_fs(|fs| fs.file_size("/RO")).expect("file still there");
    assert_eq!(size, 0, "The failed write changed nothing on disk.");
}

#[test_case]
fn test_write_only_fd_rejects_reads() {
    reset_world();

    put_cstr(PATH_ADDR, "/WO");
    let flags = (OpenFlags::WRONLY | OpenFlags::CREAT).bits();
    let fd = invoke(SYS_OPEN, PATH_ADDR, flags, 0);
    assert!((fd as i32) >= 0, "open succeeds.");

    assert_eq!(
        invoke(SYS_READ, fd, READ_ADDR, 8),
        u32::MAX,
        "read on a write-only descriptor fails.",
    );
}

#[test_case]
fn test_open_missing_without_creat_fails() {
    reset_world();

    put_cstr(PATH_ADDR, "/MISSING");
    assert_eq!(
        invoke(SYS_OPEN, PATH_ADDR, 0, 0),
        u32::MAX,
        "open without CREAT needs an existing file.",
    );
}

#[test_case]
fn test_append_flag_positions_at_eof() {
    reset_world();

    fat16::with_fs(|fs| fs.write_file("/AP", b"base")).expect("seed file");

    put_cstr(PATH_ADDR, "/AP");
    let flags = (OpenFlags::WRONLY | OpenFlags::APPEND).bits();
    let fd = invoke(SYS_OPEN, PATH_ADDR, flags, 0);
    assert!((fd as i32) >= 0, "open succeeds.");

    put_bytes(DATA_ADDR, b"+more");
    assert_eq!(invoke(SYS_WRITEFD, fd, DATA_ADDR, 5), 5, "append write works.");

    let data = fat16::with_fs(|fs| fs.read_file("/AP")).expect("read back");
    assert_eq!(&data[..], b"base+more", "Appended at end-of-file.");
}

#[test_case]
fn test_trunc_first_write_replaces_then_appends() {
    reset_world();

    fat16::with_fs(|fs| fs.write_file("/TR", b"old content")).expect("seed file");

    put_cstr(PATH_ADDR, "/TR");
    let flags = (OpenFlags::WRONLY | OpenFlags::TRUNC).bits();
    let fd = invoke(SYS_OPEN, PATH_ADDR, flags, 0);
    assert!((fd as i32) >= 0, "open succeeds.");

    put_bytes(DATA_ADDR, b"new");
    assert_eq!(invoke(SYS_WRITEFD, fd, DATA_ADDR, 3), 3, "first write truncates.");
    put_bytes(DATA_ADDR, b"+2");
    assert_eq!(invoke(SYS_WRITEFD, fd, DATA_ADDR, 2), 2, "second write appends.");

    let data = fat16::with_fs(|fs| fs.read_file("/TR")).expect("read back");
    assert_eq!(&data[..], b"new+2", "TRUNC is consumed by the first write.");
}

#[test_case]
fn test_chdir_and_getcwd() {
    reset_world();

    fat16::with_fs(|fs| fs.mkdir_p("/USR/LIB")).expect("seed dirs");

    put_cstr(PATH_ADDR, "/USR/LIB");
    assert_eq!(invoke(SYS_CHDIR, PATH_ADDR, 0, 0), 0, "chdir succeeds.");

    assert_eq!(invoke(SYS_GETCWD, READ_ADDR, 64), 0, "getcwd succeeds.");
    assert_eq!(
        user_bytes(READ_ADDR, 9),
        b"/USR/LIB\0",
        "getcwd is NUL-terminated.",
    );

    // A 4-byte buffer truncates but still terminates.
    assert_eq!(invoke(SYS_GETCWD, READ_ADDR, 4), 0, "tiny getcwd succeeds.");
    assert_eq!(user_bytes(READ_ADDR, 4), b"/US\0", "Truncated and terminated.");
}

#[test_case]
fn test_listdir_reports_entries() {
    reset_world();

    fat16::with_fs(|fs| {
        fs.touch("/ONE.TXT")?;
        fs.touch("/TWO.TXT")
    })
    .expect("seed files");

    put_cstr(PATH_ADDR, "/");
    let written = invoke(SYS_LISTDIR, PATH_ADDR, READ_ADDR, 64);
    assert!((written as i32) > 0, "listdir reports written bytes.");

    let text = core::str::from_utf8(user_bytes(READ_ADDR, written as usize))
        .expect("ASCII listing");
    assert!(text.contains("ONE.TXT\n"), "First name listed.");
    assert!(text.contains("TWO.TXT\n"), "Second name listed.");
}

#[test_case]
fn test_descriptor_table_capacity_is_sixteen() {
    reset_world();

    fat16::with_fs(|fs| fs.write_file("/F", b"x")).expect("seed file");
    put_cstr(PATH_ADDR, "/F");

    for index in 0..16 {
        let fd = invoke(SYS_OPEN, PATH_ADDR, 0, 0);
        assert_eq!(fd, index, "Descriptors hand out the lowest free slot.");
    }
    assert_eq!(
        invoke(SYS_OPEN, PATH_ADDR, 0, 0),
        u32::MAX,
        "The seventeenth open fails.",
    );

    assert_eq!(invoke(SYS_CLOSE, 3, 0, 0), 0, "close frees a slot.");
    assert_eq!(invoke(SYS_OPEN, PATH_ADDR, 0, 0), 3, "The freed slot is reused.");
}
