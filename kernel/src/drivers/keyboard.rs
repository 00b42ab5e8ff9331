//! PS/2 keyboard, polled
//!
//! The controller is polled through ports 0x60/0x64 (IRQ1 stays masked),
//! scancodes are decoded with `pc-keyboard`, and `read_line` implements
//! the line discipline: local echo, backspace editing, and return on
//! newline.

use lazy_static::lazy_static;
use pc_keyboard::{layouts, DecodedKey, HandleControl, Keyboard, ScancodeSet1};
use spin::Mutex;
use x86_64::instructions::port::Port;

const STATUS_PORT: u16 = 0x64;
const DATA_PORT: u16 = 0x60;

lazy_static! {
    static ref DECODER: Mutex<Keyboard<layouts::Us104Key, ScancodeSet1>> = Mutex::new(
        Keyboard::new(
            ScancodeSet1::new(),
            layouts::Us104Key,
            HandleControl::Ignore
        )
    );
}

/// Read one raw scancode, or 0 when the output buffer is empty.
pub fn read_scancode() -> u8 {
    let mut status: Port<u8> = Port::new(STATUS_PORT);
    let mut data: Port<u8> = Port::new(DATA_PORT);
    // SAFETY: standard 8042 controller ports; reading has no side effect
    // beyond consuming the byte.
    unsafe {
        if status.read() & 1 != 0 {
            data.read()
        } else {
            0
        }
    }
}

/// Decode scancodes until a printable character (or control byte)
/// arrives. Blocks by polling.
pub fn getchar() -> u8 {
    let mut decoder = DECODER.lock();
    loop {
        let scancode = read_scancode();
        if scancode == 0 {
            core::hint::spin_loop();
            continue;
        }
        if let Ok(Some(event)) = decoder.add_byte(scancode) {
            if let Some(key) = decoder.process_keyevent(event) {
                match key {
                    DecodedKey::Unicode(c) if c.is_ascii() => return c as u8,
                    _ => {}
                }
            }
        }
    }
}

/// Line-buffered read with echo and backspace editing. Returns on
/// newline (included in the buffer) or when the buffer fills.
pub fn read_line(buf: &mut [u8]) -> usize {
    if buf.is_empty() {
        return 0;
    }
    let mut len = 0usize;
    loop {
        let byte = getchar();
        match byte {
            b'\r' | b'\n' => {
                crate::print!("\n");
                if len < buf.len() {
                    buf[len] = b'\n';
                    len += 1;
                }
                return len;
            }
            0x08 | 0x7F => {
                if len > 0 {
                    len -= 1;
                    crate::print!("\u{8}");
                }
            }
            byte if (0x20..0x7F).contains(&byte) => {
                if len < buf.len() - 1 {
                    buf[len] = byte;
                    len += 1;
                    crate::print!("{}", byte as char);
                }
            }
            _ => {}
        }
    }
}
