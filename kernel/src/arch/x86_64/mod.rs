//! x86_64 hardware layer: GDT/TSS, IDT and PIC, the PIT, the VGA text
//! writer, the serial port, trap entry stubs, and the ring-3 transition.

pub mod gdt;
pub mod idt;
pub mod pit;
pub mod serial;
pub mod trap;
pub mod usermode;
pub mod vga;

/// Bring up the CPU tables and interrupt controllers. The PIT is
/// programmed separately once the kernel knows its tick frequency.
pub fn init() {
    gdt::init();
    idt::init();
}

/// Halt forever.
pub fn halt() -> ! {
    loop {
        x86_64::instructions::hlt();
    }
}

/// Idle with interrupts enabled until the timer finds something to run.
pub fn idle_loop() -> ! {
    loop {
        x86_64::instructions::interrupts::enable_and_hlt();
    }
}
