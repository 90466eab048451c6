//! Halt and reboot.

use x86::io::{inb, outb};

/// Keyboard controller command port, which doubles as the reset line.
const KBC_COMMAND_PORT: u16 = 0x64;
/// Pulse the CPU reset line.
const KBC_CMD_RESET: u8 = 0xFE;

/// Stop the CPU for good: interrupts off, then `hlt` forever.
pub fn halt() -> ! {
    loop {
        // SAFETY:
        // `cli; hlt` parks the CPU; with interrupts masked nothing wakes it.
        unsafe {
            core::arch::asm!("cli", "hlt", options(nomem, nostack));
        }
    }
}

/// Reboot the machine through the 8042 keyboard controller.
pub fn reboot() -> ! {
    // SAFETY:
    // Wait for the controller input buffer to drain, then pulse reset.
    unsafe {
        while inb(KBC_COMMAND_PORT) & 0x02 != 0 {}
        outb(KBC_COMMAND_PORT, KBC_CMD_RESET);
    }

    // If the pulse did not take, park the CPU.
    halt();
}
