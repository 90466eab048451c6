//! Minimal user-space program for Opal OS.
//!
//! Runs in Ring 3 and prints a greeting through `sys_write` before
//! terminating via `sys_exit`.

#![no_std]
#![no_main]

usys::entry!(main);

extern "C" fn main(_argc: u32, _argv: *const *const u8) -> i32 {
    usys::write("Hello from user space!\n");
    usys::write("This message was printed via sys_write (int 0x80).\n");
    usys::write("Goodbye! Exiting with code 0.\n");
    0
}
