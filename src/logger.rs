//! Kernel logger.
//!
//! Routes the `log` crate's records to the serial port, and mirrors
//! warnings and errors to the VGA console so they are visible without a
//! serial line attached.

use log::{Level, LevelFilter, Log, Metadata, Record};

use crate::{println, serial_println};

struct KernelLogger;

static LOGGER: KernelLogger = KernelLogger;

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Debug
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        serial_println!("[{:5}] {}", record.level(), record.args());

        if record.level() <= Level::Warn {
            println!("[{}] {}", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

/// Install the kernel logger; further `log::*!` records reach the serial
/// port. Safe to call once, early in boot.
pub fn init() {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(LevelFilter::Debug);
    }
}
