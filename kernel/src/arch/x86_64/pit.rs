//! Programmable interval timer (8253/8254)

use x86_64::instructions::port::Port;

/// Input clock of the PIT in Hz.
pub const PIT_BASE_FREQUENCY: u32 = 1_193_182;

const PIT_COMMAND: u16 = 0x43;
const PIT_CHANNEL0: u16 = 0x40;

/// Channel 0, lobyte/hibyte access, square wave, binary counting.
const PIT_MODE: u8 = 0x36;

/// Program the PIT for a periodic tick. The frequency is clamped to
/// `[1, 1193]` Hz (the divisor must fit in 16 bits) and the effective
/// value is returned.
pub fn init(frequency: u32) -> u32 {
    let frequency = frequency.clamp(1, 1193);
    let divisor = PIT_BASE_FREQUENCY / frequency;

    let mut command: Port<u8> = Port::new(PIT_COMMAND);
    let mut data: Port<u8> = Port::new(PIT_CHANNEL0);
    // SAFETY: standard PIT programming sequence on the documented ports.
    unsafe {
        command.write(PIT_MODE);
        data.write((divisor & 0xFF) as u8);
        data.write((divisor >> 8) as u8);
    }
    log::info!("PIT programmed at {} Hz", frequency);
    frequency
}
