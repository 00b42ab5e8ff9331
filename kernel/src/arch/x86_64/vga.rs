//! VGA text-mode terminal
//!
//! A fixed 80x25 cell grid at physical 0xB8000. Newline resets the
//! column and advances the row, scrolling the grid up when the last row
//! fills.

use core::{fmt, ptr::write_volatile};

use lazy_static::lazy_static;
use spin::Mutex;

/// VGA text-mode color palette.
#[allow(dead_code)] // Full palette per the VGA specification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Color {
    Black = 0,
    Blue = 1,
    Green = 2,
    Cyan = 3,
    Red = 4,
    Magenta = 5,
    Brown = 6,
    LightGray = 7,
    DarkGray = 8,
    LightBlue = 9,
    LightGreen = 10,
    LightCyan = 11,
    LightRed = 12,
    Pink = 13,
    Yellow = 14,
    White = 15,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
struct ColorCode(u8);

impl ColorCode {
    fn new(foreground: Color, background: Color) -> ColorCode {
        ColorCode(((background as u8) << 4) | (foreground as u8))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
struct ScreenChar {
    ascii_character: u8,
    color_code: ColorCode,
}

const BUFFER_HEIGHT: usize = 25;
const BUFFER_WIDTH: usize = 80;

#[repr(transparent)]
struct Buffer {
    chars: [[ScreenChar; BUFFER_WIDTH]; BUFFER_HEIGHT],
}

pub struct Writer {
    column_position: usize,
    row_position: usize,
    color_code: ColorCode,
    buffer: &'static mut Buffer,
}

impl Writer {
    pub fn set_color(&mut self, foreground: Color, background: Color) {
        self.color_code = ColorCode::new(foreground, background);
    }

    pub fn put_char(&mut self, byte: u8) {
        match byte {
            b'\n' => self.new_line(),
            0x08 => self.backspace(),
            byte => {
                if self.column_position >= BUFFER_WIDTH {
                    self.new_line();
                }
                let row = self.row_position;
                let col = self.column_position;
                self.write_cell(row, col, byte);
                self.column_position += 1;
            }
        }
    }

    pub fn write(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            match byte {
                0x20..=0x7e | b'\n' | 0x08 => self.put_char(byte),
                _ => self.put_char(0xfe),
            }
        }
    }

    pub fn write_string(&mut self, s: &str) {
        self.write(s.as_bytes());
    }

    fn write_cell(&mut self, row: usize, col: usize, byte: u8) {
        let cell = ScreenChar {
            ascii_character: byte,
            color_code: self.color_code,
        };
        // SAFETY: row/col are bounded by the grid dimensions; volatile
        // because the buffer is memory-mapped hardware.
        unsafe {
            write_volatile(&mut self.buffer.chars[row][col], cell);
        }
    }

    fn backspace(&mut self) {
        if self.column_position > 0 {
            self.column_position -= 1;
            let (row, col) = (self.row_position, self.column_position);
            self.write_cell(row, col, b' ');
        }
    }

    fn new_line(&mut self) {
        self.column_position = 0;
        if self.row_position + 1 < BUFFER_HEIGHT {
            self.row_position += 1;
            return;
        }
        for row in 1..BUFFER_HEIGHT {
            for col in 0..BUFFER_WIDTH {
                let cell = self.buffer.chars[row][col];
                // SAFETY: bounded indices into the memory-mapped grid.
                unsafe {
                    write_volatile(&mut self.buffer.chars[row - 1][col], cell);
                }
            }
        }
        self.clear_row(BUFFER_HEIGHT - 1);
    }

    fn clear_row(&mut self, row: usize) {
        for col in 0..BUFFER_WIDTH {
            self.write_cell(row, col, b' ');
        }
    }

    pub fn clear(&mut self) {
        for row in 0..BUFFER_HEIGHT {
            self.clear_row(row);
        }
        self.column_position = 0;
        self.row_position = 0;
    }
}

impl fmt::Write for Writer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.write_string(s);
        Ok(())
    }
}

lazy_static! {
    pub static ref WRITER: Mutex<Writer> = Mutex::new(Writer {
        column_position: 0,
        row_position: 0,
        color_code: ColorCode::new(Color::LightGray, Color::Black),
        // SAFETY: 0xB8000 is the VGA text buffer, identity-mapped by the
        // bootloader; exactly one Writer aliases it, behind this Mutex.
        buffer: unsafe { &mut *(0xB8000 as *mut Buffer) },
    });
}

/// Clear the screen at boot.
pub fn init() {
    WRITER.lock().clear();
}

/// Set the terminal colors.
pub fn set_color(foreground: Color, background: Color) {
    WRITER.lock().set_color(foreground, background);
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use core::fmt::Write;
    x86_64::instructions::interrupts::without_interrupts(|| {
        WRITER.lock().write_fmt(args).ok();
    });
}
