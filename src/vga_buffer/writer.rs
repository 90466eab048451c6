use crate::vga_buffer::{
    buffer::Buffer,
    colors::{Color, ColorCode},
};
use core::fmt;
use lazy_static::lazy_static;
use spin::Mutex;
use x86::io::outb;

use super::{
    buffer::ScreenChar,
    constants::{BUFFER_HEIGHT, BUFFER_WIDTH},
};

/// CRT controller index port, used for the hardware cursor.
const CURSOR_INDEX_PORT: u16 = 0x3D4;
/// CRT controller data port.
const CURSOR_DATA_PORT: u16 = 0x3D5;

lazy_static! {
    /// Global instance of the VGA buffer writer.
    /// We use lazy_static to be able to dinamically initialize the color.
    pub static ref WRITER: Mutex<Writer> = Mutex::new(Writer {
        column_position: 0,
        color_code: ColorCode::new(Color::White, Color::Black),

        // SAFETY:
        // vga buffer adress should always exist.
        buffer: unsafe { &mut *(0xb8000 as *mut Buffer) },
    });
}

////////////////////////
//   Screen Writer    //
////////////////////////

/// Represent the writer that will write to the VGA buffer.
///
/// Output always lands on the bottom row; finished lines scroll upwards.
pub struct Writer {
    pub column_position: usize,
    pub color_code: ColorCode,
    pub buffer: &'static mut Buffer,
}

impl Writer {
    /// Write a byte to the VGA buffer.
    pub fn write_byte(&mut self, byte: u8) {
        match byte {
            b'\n' => self.new_line(),
            // Backspace: step the cursor back and blank the cell.
            0x08 => {
                if self.column_position > 0 {
                    self.column_position -= 1;
                    let row = BUFFER_HEIGHT - 1;
                    let color_code = self.color_code;
                    self.buffer.chars[row][self.column_position].write(ScreenChar {
                        ascii_character: b' ',
                        color_code,
                    });
                }
            }
            character => {
                if self.column_position >= BUFFER_WIDTH {
                    self.new_line();
                }

                let row = BUFFER_HEIGHT - 1;
                let col = self.column_position;

                let color_code = self.color_code;
                self.buffer.chars[row][col].write(ScreenChar {
                    ascii_character: character,
                    color_code,
                });
                self.column_position += 1;
            }
        }
    }

    /// Write a string to the VGA buffer.
    pub fn write_string(&mut self, s: &str) {
        for byte in s.bytes() {
            match byte {
                // printable ASCII byte, newline or backspace
                0x20..=0x7e | b'\n' | 0x08 => self.write_byte(byte),
                // not part of printable ASCII range
                _ => self.write_byte(0xfe),
            }
        }
        self.sync_hardware_cursor();
    }

    /// Write a character at an absolute screen position, leaving the
    /// logical cursor untouched. The shell's line editor repaints with it.
    pub fn put_char_at(&mut self, character: u8, col: usize, row: usize) {
        if col >= BUFFER_WIDTH || row >= BUFFER_HEIGHT {
            return;
        }
        let color_code = self.color_code;
        self.buffer.chars[row][col].write(ScreenChar {
            ascii_character: character,
            color_code,
        });
    }

    /// Blank the whole screen and reset the cursor to the bottom-left.
    pub fn clear(&mut self) {
        for row in 0..BUFFER_HEIGHT {
            self.clear_row(row);
        }
        self.column_position = 0;
        self.sync_hardware_cursor();
    }

    /// Move the blinking hardware cursor to an absolute position.
    pub fn move_cursor(&mut self, col: usize, row: usize) {
        let position = (row * BUFFER_WIDTH + col) as u16;

        // SAFETY:
        // Standard CRT controller cursor-location registers 0x0E/0x0F.
        unsafe {
            outb(CURSOR_INDEX_PORT, 0x0E);
            outb(CURSOR_DATA_PORT, (position >> 8) as u8);
            outb(CURSOR_INDEX_PORT, 0x0F);
            outb(CURSOR_DATA_PORT, (position & 0xFF) as u8);
        }
    }

    /// Park the hardware cursor where the next byte will land.
    fn sync_hardware_cursor(&mut self) {
        let col = self.column_position.min(BUFFER_WIDTH - 1);
        self.move_cursor(col, BUFFER_HEIGHT - 1);
    }

    /// Move all characters one row up and clear the last row.
    fn new_line(&mut self) {
        for row in 1..BUFFER_HEIGHT {
            for col in 0..BUFFER_WIDTH {
                let character = self.buffer.chars[row][col].read();
                self.buffer.chars[row - 1][col].write(character);
            }
        }
        self.clear_row(BUFFER_HEIGHT - 1);
        self.column_position = 0;
    }

    /// Clear a row by filling it with blank characters.
    fn clear_row(&mut self, row: usize) {
        let blank = ScreenChar {
            ascii_character: b' ',
            color_code: self.color_code,
        };
        for col in 0..BUFFER_WIDTH {
            self.buffer.chars[row][col].write(blank);
        }
    }
}

impl fmt::Write for Writer {
    /// Implement the `write_str` function from the `fmt::Write` trait to be able to
    /// support the write! and writeln! macros.
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.write_string(s);
        Ok(())
    }
}

/// Column the next printed byte will land in (bottom row).
#[must_use]
pub fn cursor_column() -> usize {
    crate::interrupts::without_interrupts(|| WRITER.lock().column_position)
}

/// Blank the screen through the global writer.
pub fn clear_screen() {
    crate::interrupts::without_interrupts(|| {
        WRITER.lock().clear();
    });
}

/// Write a character at an absolute position through the global writer.
pub fn put_char_at(character: u8, col: usize, row: usize) {
    crate::interrupts::without_interrupts(|| {
        WRITER.lock().put_char_at(character, col, row);
    });
}

/// Move the hardware cursor through the global writer.
pub fn set_cursor_position(col: usize, row: usize) {
    crate::interrupts::without_interrupts(|| {
        WRITER.lock().move_cursor(col, row);
    });
}
