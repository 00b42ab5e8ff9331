//! Trap frames and the entry stubs that build them
//!
//! Both the `int 0x80` syscall gate and the timer interrupt save the full
//! register set on the kernel stack and hand a [`TrapFrame`] to Rust.
//! On the way out the frame is reloaded from whatever process the
//! scheduler left current, which is how context switches happen: the
//! iretq at the end of the stub simply resumes a different process.
//!
//! Faulting user processes (page fault, general protection) are killed
//! through the same mechanism.

use crate::{
    kernel::{self, Kernel},
    process::{scheduler, signals, ProcessState, Registers},
    syscall,
};

use super::gdt;

/// Register file pushed by the entry stubs, lowest address first, with
/// the CPU-pushed interrupt frame on top.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct TrapFrame {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
    // CPU-pushed interrupt frame
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

impl TrapFrame {
    fn to_registers(&self) -> Registers {
        Registers {
            rax: self.rax,
            rbx: self.rbx,
            rcx: self.rcx,
            rdx: self.rdx,
            rsi: self.rsi,
            rdi: self.rdi,
            rbp: self.rbp,
            r8: self.r8,
            r9: self.r9,
            r10: self.r10,
            r11: self.r11,
            r12: self.r12,
            r13: self.r13,
            r14: self.r14,
            r15: self.r15,
            rip: self.rip,
            rflags: self.rflags,
            rsp: self.rsp,
            cs: self.cs,
            ss: self.ss,
        }
    }

    fn load_registers(&mut self, regs: &Registers) {
        self.rax = regs.rax;
        self.rbx = regs.rbx;
        self.rcx = regs.rcx;
        self.rdx = regs.rdx;
        self.rsi = regs.rsi;
        self.rdi = regs.rdi;
        self.rbp = regs.rbp;
        self.r8 = regs.r8;
        self.r9 = regs.r9;
        self.r10 = regs.r10;
        self.r11 = regs.r11;
        self.r12 = regs.r12;
        self.r13 = regs.r13;
        self.r14 = regs.r14;
        self.r15 = regs.r15;
        self.rip = regs.rip;
        self.rsp = regs.rsp;
        // Ring-3 selectors and a sane RFLAGS regardless of what the PCB
        // holds; every process resumed through here runs in user mode
        // with interrupts enabled.
        let selectors = gdt::selectors();
        self.cs = selectors.user_code.0 as u64;
        self.ss = selectors.user_data.0 as u64;
        self.rflags = (regs.rflags & !0x400) | 0x202;
    }

    fn from_user(&self) -> bool {
        self.cs & 3 == 3
    }
}

/// Save the interrupted user context into the current PCB.
fn save_current(kernel: &mut Kernel, frame: &TrapFrame) {
    if !frame.from_user() {
        return;
    }
    if let Some(p) = kernel.processes.current_mut() {
        if p.address_space.is_some() {
            p.regs = frame.to_registers();
        }
    }
}

/// Reload the frame from the (possibly different) current process.
/// Returns false when nothing is runnable, in which case the interrupted
/// context resumes instead.
fn restore_current(kernel: &mut Kernel, frame: &mut TrapFrame) -> bool {
    let Some(p) = kernel.processes.current() else {
        return false;
    };
    if p.state != ProcessState::Running {
        return false;
    }
    let Some(space) = p.address_space else {
        return false;
    };
    let regs = p.regs;

    frame.load_registers(&regs);
    kernel.vmm.switch_space(space.root);
    true
}

/// Rust side of the `int 0x80` gate.
#[no_mangle]
extern "C" fn syscall_trap_handler(frame: &mut TrapFrame) {
    let resumed = kernel::with_kernel(|k| {
        save_current(k, frame);
        syscall::dispatch(k);
        restore_current(k, frame)
    });
    if !resumed {
        super::idle_loop();
    }
}

/// Rust side of the timer interrupt.
#[no_mangle]
extern "C" fn timer_trap_handler(frame: &mut TrapFrame) {
    kernel::with_kernel(|k| {
        save_current(k, frame);
        scheduler::timer_tick(k);
        // When nothing is runnable the interrupted context (usually the
        // boot idle loop) resumes as-is.
        restore_current(k, frame);
    });
    super::idt::end_of_interrupt(super::idt::InterruptIndex::Timer);
}

/// Rust side of user-mode faults: kill the offender and move on.
#[no_mangle]
extern "C" fn fault_trap_handler(frame: &mut TrapFrame, error_code: u64) {
    if !frame.from_user() {
        panic!(
            "kernel fault at {:#x}, error code {:#x}",
            frame.rip, error_code
        );
    }
    let resumed = kernel::with_kernel(|k| {
        save_current(k, frame);
        if let Some(pid) = k.processes.current_pid() {
            log::warn!(
                "process {} faulted at {:#x} (error {:#x})",
                pid,
                frame.rip,
                error_code
            );
            crate::process::lifecycle::exit_process(k, pid, (128 + signals::SIGSEGV) as i32);
        }
        scheduler::schedule(k);
        restore_current(k, frame)
    });
    if !resumed {
        super::idle_loop();
    }
}

// ---------------------------------------------------------------------
// Entry stubs
// ---------------------------------------------------------------------

/// `int 0x80` entry: save the register file, call the dispatcher, reload
/// the register file (possibly of a different process), return.
///
/// # Safety
///
/// Only the CPU may call this, through the IDT gate; the stack must hold
/// a hardware interrupt frame.
#[unsafe(naked)]
pub unsafe extern "C" fn syscall_entry() {
    core::arch::naked_asm!(
        "push rax",
        "push rbx",
        "push rcx",
        "push rdx",
        "push rsi",
        "push rdi",
        "push rbp",
        "push r8",
        "push r9",
        "push r10",
        "push r11",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov rdi, rsp",
        "call {handler}",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop r11",
        "pop r10",
        "pop r9",
        "pop r8",
        "pop rbp",
        "pop rdi",
        "pop rsi",
        "pop rdx",
        "pop rcx",
        "pop rbx",
        "pop rax",
        "iretq",
        handler = sym syscall_trap_handler,
    );
}

/// Timer (IRQ0) entry, identical frame handling.
///
/// # Safety
///
/// Only the CPU may call this, through the IDT gate.
#[unsafe(naked)]
pub unsafe extern "C" fn timer_entry() {
    core::arch::naked_asm!(
        "push rax",
        "push rbx",
        "push rcx",
        "push rdx",
        "push rsi",
        "push rdi",
        "push rbp",
        "push r8",
        "push r9",
        "push r10",
        "push r11",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov rdi, rsp",
        "call {handler}",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop r11",
        "pop r10",
        "pop r9",
        "pop r8",
        "pop rbp",
        "pop rdi",
        "pop rsi",
        "pop rdx",
        "pop rcx",
        "pop rbx",
        "pop rax",
        "iretq",
        handler = sym timer_trap_handler,
    );
}

/// Entry for faults that push an error code (page fault, general
/// protection). The `xchg` turns the error-code slot into the saved-RAX
/// slot so the stack matches [`TrapFrame`]; the error code travels in
/// RAX until it is passed as the handler's second argument.
///
/// # Safety
///
/// Only the CPU may call this, through the IDT gate of an exception that
/// pushes an error code.
#[unsafe(naked)]
pub unsafe extern "C" fn fault_entry() {
    core::arch::naked_asm!(
        "xchg [rsp], rax",
        "push rbx",
        "push rcx",
        "push rdx",
        "push rsi",
        "push rdi",
        "push rbp",
        "push r8",
        "push r9",
        "push r10",
        "push r11",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov rdi, rsp",
        "mov rsi, rax",
        "call {handler}",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop r11",
        "pop r10",
        "pop r9",
        "pop r8",
        "pop rbp",
        "pop rdi",
        "pop rsi",
        "pop rdx",
        "pop rcx",
        "pop rbx",
        "pop rax",
        "iretq",
        handler = sym fault_trap_handler,
    );
}
