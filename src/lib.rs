//! Opal OS: a small 32-bit protected mode OS written in Rust.
//! This project is a learning project to understand how an OS works.
//! It is not intended to be a production ready OS.
//! The kernel boots via Multiboot, identity-maps the low 4 MiB, mounts a
//! FAT16 volume on the primary PATA disk and runs ELF user programs in
//! Ring 3 behind an `int 0x80` syscall gate.
//! Refer to the README.md file for more information about the features supported.

#![no_std]
#![cfg_attr(test, no_main)]
#![feature(custom_test_frameworks)]
#![test_runner(crate::test_runner)]
#![reexport_test_harness_main = "test_main"]

extern crate alloc;

use core::panic::PanicInfo;

pub mod allocator;
pub mod ata;
pub mod block;
pub mod boot;
pub mod elf;
pub mod fat16;
pub mod gdt;
pub mod interrupts;
pub mod keyboard;
pub mod logger;
pub mod memory;
pub mod power;
pub mod serial;
pub mod shell;
pub mod timer;
pub mod userspace;
pub mod vga_buffer;

const QEMU_EXIT_PORT: u16 = 0xf4;

/// Initialize the CPU-facing kernel subsystems: GDT + TSS, IDT (with the
/// syscall gate), remapped PIC, PIT timer and keyboard queue, then enable
/// interrupts.
///
/// The heap ([`allocator::init_heap`]) must already be live: the keyboard
/// queue allocates. Paging ([`memory::init`]) and the filesystem mount are
/// separate steps so tests can pick what they need.
pub fn init() {
    gdt::init();
    interrupts::init();
    timer::init(timer::DEFAULT_FREQUENCY_HZ);
    keyboard::init();

    // SAFETY:
    // The IDT and PIC are fully set up; it is now safe to take interrupts.
    unsafe { x86::irq::enable() };
}

/// Halt the CPU until the next interrupt, forever.
pub fn hlt_loop() -> ! {
    loop {
        // SAFETY:
        // `hlt` merely idles the CPU until the next interrupt.
        unsafe { x86::halt() };
    }
}

/// Test entry point for cargo test.
#[cfg(test)]
#[unsafe(no_mangle)]
pub extern "C" fn kernel_main() -> ! {
    allocator::init_heap();
    init();
    test_main();

    hlt_loop();
}

/// Define possible exit code for qemu.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum QemuExitCode {
    /// Define a successfull exit status
    Success = 0x10,
    /// Define a failure exit status
    Failure = 0x11,
}

/// Exit qemu with a specific exit code.
/// Connect to an IO Port to exit qemu.
/// The exit device is configured in `.cargo/config.toml`.
pub fn exit_qemu(exit_code: QemuExitCode) {
    // SAFETY:
    // Writing to the isa-debug-exit port only ever terminates the emulator.
    unsafe {
        x86::io::outl(QEMU_EXIT_PORT, exit_code as u32);
    }
}

/// Panic handler for external (functional) tests.
pub fn test_panic_handler(info: &PanicInfo) -> ! {
    serial_println!("[failed]\n");
    serial_println!("Error: {}\n", info);
    exit_qemu(QemuExitCode::Failure);

    hlt_loop();
}

/// Custom test runner for `no_std` testing.
pub fn test_runner(tests: &[&dyn Testable]) {
    serial_println!("Running {} tests", tests.len());
    for test in tests {
        test.run();
    }

    exit_qemu(QemuExitCode::Success);
}

/// Panic handler for unit tests.
#[cfg(test)]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    test_panic_handler(info);
}

/// Trait to generalize tests cases.
/// Encapsulate the prints
pub trait Testable {
    /// Function that encapsulate the test run function.
    fn run(&self);
}

impl<T> Testable for T
where
    T: Fn(),
{
    fn run(&self) {
        use core::any::type_name;

        serial_print!("{}...\t", type_name::<T>());
        self();
        serial_println!("[ok]");
    }
}
