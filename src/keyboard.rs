//! PS/2 keyboard input.
//!
//! The IRQ 1 handler does the minimum possible: read the scancode byte
//! from port 0x60 and push it to a fixed-capacity lock-free queue. The
//! shell drains the queue at its leisure and decodes scancodes with the
//! `pc-keyboard` crate.

use crossbeam_queue::ArrayQueue;
use lazy_static::lazy_static;
use pc_keyboard::{layouts, DecodedKey, HandleControl, KeyCode, Keyboard, ScancodeSet1};
use x86::io::inb;

use crate::interrupts::{self, InterruptIndex, Registers};

/// Keyboard controller data port.
const KEYBOARD_DATA_PORT: u16 = 0x60;

const QUEUE_CAPACITY: usize = 128;

lazy_static! {
    static ref SCANCODE_QUEUE: ArrayQueue<u8> = ArrayQueue::new(QUEUE_CAPACITY);
}

/// A key press the shell cares about, already decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyEvent {
    /// A printable character (includes `\n`, `\x08` backspace, `\t`).
    Char(char),
    /// Cursor left.
    ArrowLeft,
    /// Cursor right.
    ArrowRight,
    /// History previous.
    ArrowUp,
    /// History next.
    ArrowDown,
}

fn keyboard_interrupt_handler(_frame: &mut Registers) {
    // SAFETY:
    // Reading the data port acknowledges the byte the controller latched.
    let scancode: u8 = unsafe { inb(KEYBOARD_DATA_PORT) };

    if SCANCODE_QUEUE.push(scancode).is_err() {
        log::warn!("scancode queue full; dropping input");
    }
}

/// Hook IRQ 1.
///
/// The queue is forced into existence here so the first keystroke never
/// allocates from interrupt context; the heap must be initialized first.
pub fn init() {
    lazy_static::initialize(&SCANCODE_QUEUE);
    interrupts::register_irq_handler(InterruptIndex::Keyboard.as_irq(), keyboard_interrupt_handler);
}

/// Pop one raw scancode, if any arrived.
#[must_use]
pub fn pop_scancode() -> Option<u8> {
    SCANCODE_QUEUE.pop()
}

/// A stateful scancode decoder for queue consumers.
pub struct KeyDecoder {
    keyboard: Keyboard<layouts::Us104Key, ScancodeSet1>,
}

impl KeyDecoder {
    /// Create a decoder for scancode set 1 with a US layout.
    #[must_use]
    pub fn new() -> Self {
        Self {
            keyboard: Keyboard::new(ScancodeSet1::new(), layouts::Us104Key, HandleControl::Ignore),
        }
    }

    /// Feed one scancode; returns an event when one completes.
    pub fn decode(&mut self, scancode: u8) -> Option<KeyEvent> {
        let key_event = self.keyboard.add_byte(scancode).ok().flatten()?;
        match self.keyboard.process_keyevent(key_event)? {
            // Normalize carriage return so consumers only see '\n'.
            DecodedKey::Unicode('\r') => Some(KeyEvent::Char('\n')),
            DecodedKey::Unicode(character) => Some(KeyEvent::Char(character)),
            DecodedKey::RawKey(KeyCode::ArrowLeft) => Some(KeyEvent::ArrowLeft),
            DecodedKey::RawKey(KeyCode::ArrowRight) => Some(KeyEvent::ArrowRight),
            DecodedKey::RawKey(KeyCode::ArrowUp) => Some(KeyEvent::ArrowUp),
            DecodedKey::RawKey(KeyCode::ArrowDown) => Some(KeyEvent::ArrowDown),
            DecodedKey::RawKey(_) => None,
        }
    }
}

impl Default for KeyDecoder {
    fn default() -> Self {
        Self::new()
    }
}
