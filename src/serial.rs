//! 16550 UART driver for the first serial port.
//!
//! The port is the kernel's debug channel: the logger and the test
//! harness write here so output survives outside the VGA console.

use core::fmt;

use lazy_static::lazy_static;
use spin::Mutex;
use x86::io::{inb, outb};

/// A 16550-compatible UART addressed by its base port.
pub struct SerialPort {
    base: u16,
}

impl SerialPort {
    /// Create a handle for the UART at `base` without touching it.
    ///
    /// # Safety
    ///
    /// `base` must be the I/O base of a real 16550; the standard COM1
    /// value is 0x3F8.
    #[must_use]
    pub const unsafe fn new(base: u16) -> Self {
        Self { base }
    }

    /// Program the UART: 38400 baud, 8N1, FIFOs enabled.
    pub fn init(&mut self) {
        // SAFETY:
        // The constructor contract guarantees these ports belong to a UART.
        unsafe {
            outb(self.base + 1, 0x00); // disable interrupts
            outb(self.base + 3, 0x80); // DLAB on
            outb(self.base, 0x03); // divisor low: 38400 baud
            outb(self.base + 1, 0x00); // divisor high
            outb(self.base + 3, 0x03); // 8 bits, no parity, one stop
            outb(self.base + 2, 0xC7); // FIFO on, cleared, 14-byte threshold
            outb(self.base + 4, 0x0B); // RTS/DSR set, OUT2 on
        }
    }

    fn transmit_ready(&self) -> bool {
        // SAFETY:
        // Line status reads have no side effect.
        unsafe { inb(self.base + 5) & 0x20 != 0 }
    }

    /// Blockingly send one byte.
    pub fn send(&mut self, byte: u8) {
        while !self.transmit_ready() {}

        // SAFETY:
        // The transmit holding register is empty.
        unsafe { outb(self.base, byte) };
    }
}

impl fmt::Write for SerialPort {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            self.send(byte);
        }
        Ok(())
    }
}

lazy_static! {
    /// The first serial port, initialized on first use.
    pub static ref SERIAL1: Mutex<SerialPort> = {
        // SAFETY:
        // 0x3F8 is the standard COM1 base on every PC platform we boot on.
        let mut serial_port = unsafe { SerialPort::new(0x3F8) };
        serial_port.init();
        Mutex::new(serial_port)
    };
}

#[doc(hidden)]
pub fn _print(args: ::core::fmt::Arguments) {
    use core::fmt::Write;

    crate::interrupts::without_interrupts(|| {
        #[expect(
            clippy::expect_used,
            reason = "Serial port writes are infallible once initialized."
        )]
        SERIAL1
            .lock()
            .write_fmt(args)
            .expect("Failed to print on serial port.");
    });
}

/// Print to host machine through serial port interface.
#[macro_export]
macro_rules! serial_print {
    ($($args:tt)*) => {
        $crate::serial::_print(format_args!($($args)*));
    };
}

/// Print to host machine through serial port interface a line.
#[macro_export]
macro_rules! serial_println {
    () => ($crate::serial_print!("\n"));
    ($fmt:expr) => ($crate::serial_print!(concat!($fmt, "\n")));
    ($fmt:expr, $($arg:tt)*) => ($crate::serial_print!(
        concat!($fmt, "\n"), $($arg)*));
}
