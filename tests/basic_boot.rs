//! Simple boot test for the kernel.

#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![test_runner(opal_os::test_runner)]
#![reexport_test_harness_main = "test_main"]

use core::panic::PanicInfo;

use opal_os::{println, serial_println};

/// Entry point for the test.
#[unsafe(no_mangle)]
pub extern "C" fn kernel_main() -> ! {
    test_main();

    opal_os::hlt_loop();
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    opal_os::test_panic_handler(info)
}

/// Test that we can print a line.
#[test_case]
fn test_println() {
    println!("test_println output");
}

/// Test that the serial port carries output without faulting.
#[test_case]
fn test_serial_println() {
    serial_println!("test_serial_println output");
}
