//! Main for Opal OS.

#![feature(custom_test_frameworks)]
#![test_runner(opal_os::test_runner)]
#![reexport_test_harness_main = "test_main"]
#![no_std]
#![no_main]

extern crate alloc;

use alloc::boxed::Box;
use core::panic::PanicInfo;

use opal_os::ata::AtaDisk;
use opal_os::{allocator, fat16, logger, memory, println, serial_println, shell, userspace};

/// The program the kernel hands control to after bring-up.
const INIT_PROGRAM: &str = "/BIN/INIT.ELF";

////////////////////////
//     Entry point    //
////////////////////////

/// Rust entry point, called by the Multiboot shim in `boot.rs` with a
/// fresh boot stack and interrupts disabled.
#[unsafe(no_mangle)]
pub extern "C" fn kernel_main() -> ! {
    println!("Opal OS {} booting...", env!("CARGO_PKG_VERSION"));
    logger::init();

    allocator::init_heap();
    opal_os::init();
    log::info!("GDT, IDT, PIC, PIT and keyboard ready");

    // SAFETY:
    // Called once, from the identity-mapped Multiboot environment.
    unsafe { memory::init() };
    log::info!("paging enabled");

    if AtaDisk::present() {
        if let Err(err) = fat16::mount_device(Box::new(AtaDisk::primary())) {
            log::warn!("no usable FAT16 volume on the primary disk: {err}");
        }
    } else {
        log::warn!("no disk on the primary ATA channel");
    }

    #[cfg(test)]
    test_main();

    match userspace::exec(INIT_PROGRAM) {
        Ok(code) => log::info!("{INIT_PROGRAM} exited with code {code}"),
        Err(err) => log::warn!("exec {INIT_PROGRAM} failed: {err}"),
    }

    // The shell is the boot idle loop.
    shell::run();
}

////////////////////////
//    Panic handler   //
////////////////////////

/// This function is called on panic.
#[cfg(not(test))]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    println!("KERNEL PANIC: {info}");
    serial_println!("KERNEL PANIC: {}", info);
    opal_os::power::halt();
}

#[cfg(test)]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    opal_os::test_panic_handler(info);
}
