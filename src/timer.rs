//! PIT driver and tick accounting.
//!
//! Channel 0 of the 8253/8254 runs in square-wave mode at a configurable
//! frequency; IRQ 0 bumps a single atomic 32-bit tick counter, the only
//! kernel datum an interrupt handler shares with the rest of the kernel.

use core::sync::atomic::{AtomicU32, Ordering};

use x86::io::outb;

use crate::interrupts::{self, Registers};

/// The PIT input clock in Hz.
const PIT_BASE_FREQUENCY_HZ: u32 = 1_193_180;

/// Channel 0 data port.
const PIT_CHANNEL_0: u16 = 0x40;
/// Mode/command port.
const PIT_COMMAND: u16 = 0x43;
/// Channel 0, lobyte/hibyte access, square wave (mode 3).
const PIT_MODE_SQUARE_WAVE: u8 = 0x36;

/// Tick rate the kernel boots with.
pub const DEFAULT_FREQUENCY_HZ: u32 = 100;

static TICKS: AtomicU32 = AtomicU32::new(0);
static FREQUENCY_HZ: AtomicU32 = AtomicU32::new(DEFAULT_FREQUENCY_HZ);

fn tick_handler(_frame: &mut Registers) {
    TICKS.fetch_add(1, Ordering::Relaxed);
}

/// Program the PIT to `frequency` Hz and hook IRQ 0.
pub fn init(frequency: u32) {
    FREQUENCY_HZ.store(frequency, Ordering::Relaxed);
    interrupts::register_irq_handler(interrupts::InterruptIndex::Timer.as_irq(), tick_handler);

    let divisor = PIT_BASE_FREQUENCY_HZ / frequency;

    // SAFETY:
    // The canonical channel 0 reprogramming sequence: mode, then the
    // divisor low and high bytes.
    unsafe {
        outb(PIT_COMMAND, PIT_MODE_SQUARE_WAVE);
        outb(PIT_CHANNEL_0, (divisor & 0xFF) as u8);
        outb(PIT_CHANNEL_0, ((divisor >> 8) & 0xFF) as u8);
    }
}

/// Ticks elapsed since boot.
#[must_use]
pub fn ticks() -> u32 {
    TICKS.load(Ordering::Relaxed)
}

/// Seconds elapsed since boot, rounded down.
#[must_use]
pub fn uptime_seconds() -> u32 {
    let frequency = FREQUENCY_HZ.load(Ordering::Relaxed).max(1);
    ticks() / frequency
}

/// Sleep for `seconds`, halting the CPU between timer interrupts.
///
/// This is one of the two places the kernel voluntarily yields to
/// interrupts (the other is the boot idle loop).
pub fn sleep(seconds: u32) {
    let frequency = FREQUENCY_HZ.load(Ordering::Relaxed);
    let start = ticks();
    let target = seconds.saturating_mul(frequency);

    while ticks().wrapping_sub(start) < target {
        // SAFETY:
        // `sti; hlt` atomically enables interrupts and idles until the
        // next one; the timer interrupt is live, so this always wakes.
        unsafe {
            core::arch::asm!("sti", "hlt", options(nomem, nostack));
        }
    }
}
