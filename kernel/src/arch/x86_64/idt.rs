//! Interrupt descriptor table and legacy PIC setup
//!
//! Exceptions get Rust handlers; the timer IRQ and the `int 0x80`
//! syscall gate use the full-frame assembly stubs from [`super::trap`]
//! so the scheduler can switch contexts on the way out. The keyboard is
//! polled through the controller ports, so IRQ1 stays masked.

use lazy_static::lazy_static;
use pic8259::ChainedPics;
use spin::Mutex;
use x86_64::{
    structures::idt::{InterruptDescriptorTable, InterruptStackFrame},
    PrivilegeLevel, VirtAddr,
};

use super::{gdt, trap};

pub const PIC_1_OFFSET: u8 = 32;
pub const PIC_2_OFFSET: u8 = PIC_1_OFFSET + 8;

/// Software interrupt vector for system calls.
pub const SYSCALL_VECTOR: u8 = 0x80;

// SAFETY: the chosen offsets do not collide with CPU exceptions.
pub static PICS: Mutex<ChainedPics> =
    Mutex::new(unsafe { ChainedPics::new(PIC_1_OFFSET, PIC_2_OFFSET) });

#[derive(Debug, Clone, Copy)]
#[repr(u8)]
pub enum InterruptIndex {
    Timer = PIC_1_OFFSET,
}

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();
        idt.breakpoint.set_handler_fn(breakpoint_handler);
        idt.invalid_opcode.set_handler_fn(invalid_opcode_handler);
        // SAFETY: the double-fault IST slot is set up in the TSS.
        unsafe {
            idt.double_fault
                .set_handler_fn(double_fault_handler)
                .set_stack_index(gdt::DOUBLE_FAULT_IST_INDEX);
        }
        // Full-frame stubs. SAFETY: the stubs follow the interrupt ABI
        // (they preserve all registers and end in iretq).
        unsafe {
            idt.page_fault
                .set_handler_addr(VirtAddr::new(trap::fault_entry as usize as u64));
            idt.general_protection_fault
                .set_handler_addr(VirtAddr::new(trap::fault_entry as usize as u64));
            idt[InterruptIndex::Timer as u8]
                .set_handler_addr(VirtAddr::new(trap::timer_entry as usize as u64));
            idt[SYSCALL_VECTOR]
                .set_handler_addr(VirtAddr::new(trap::syscall_entry as usize as u64))
                .set_privilege_level(PrivilegeLevel::Ring3);
        }
        idt
    };
}

extern "x86-interrupt" fn breakpoint_handler(stack_frame: InterruptStackFrame) {
    log::warn!("breakpoint at {:#x}", stack_frame.instruction_pointer.as_u64());
}

extern "x86-interrupt" fn invalid_opcode_handler(stack_frame: InterruptStackFrame) {
    panic!(
        "invalid opcode at {:#x}",
        stack_frame.instruction_pointer.as_u64()
    );
}

extern "x86-interrupt" fn double_fault_handler(
    stack_frame: InterruptStackFrame,
    _error_code: u64,
) -> ! {
    panic!("double fault\n{:#?}", stack_frame);
}

/// Acknowledge an IRQ at the PIC.
pub fn end_of_interrupt(index: InterruptIndex) {
    // SAFETY: notifying completion of the interrupt currently being
    // serviced.
    unsafe {
        PICS.lock().notify_end_of_interrupt(index as u8);
    }
}

pub fn init() {
    IDT.load();
    // SAFETY: remap the PICs away from the exception range, then mask
    // everything except the timer line (the keyboard is polled).
    unsafe {
        let mut pics = PICS.lock();
        pics.initialize();
        pics.write_masks(0b1111_1110, 0b1111_1111);
    }
    log::info!("IDT loaded, PIC remapped");
}
