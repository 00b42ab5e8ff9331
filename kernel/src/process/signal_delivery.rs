//! Signal delivery to user-space handlers
//!
//! A caught signal must run its handler in ring 3, not as a kernel-mode
//! call. Delivery saves the interrupted context into a [`SignalFrame`] on
//! the user stack, writes a small sigreturn trampoline just above it, and
//! redirects the saved RIP to the handler with the signal number in RDI
//! (System V AMD64 convention). When the handler returns it pops the
//! trampoline address, and the trampoline issues the `sigreturn` syscall
//! with a pointer to the frame, which restores the saved context and the
//! saved signal mask.
//!
//! The delivered signal is added to the blocked mask for the duration of
//! the handler, so a signal never interrupts its own handler; different
//! unblocked signals still can, producing nested frames bounded only by
//! user stack space. SIGKILL and SIGSTOP never reach this module.

use crate::{
    error::{KernelError, KernelResult},
    kernel::Kernel,
    mm::user_access,
    process::{signals::UNMASKABLE, Pid},
};

/// Saved context pushed onto the user stack during delivery.
///
/// C-compatible so the trampoline can hand a pointer to it back through
/// `sigreturn`. The layout is ABI: user code may inspect it.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SignalFrame {
    /// Address of the trampoline, placed where the handler's `ret` will
    /// pop it.
    pub trampoline_ret_addr: u64,
    /// Signal number that caused this delivery.
    pub signum: u64,
    /// Blocked mask at delivery time, restored by sigreturn.
    pub saved_mask: u64,

    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,

    pub rsp: u64,
    pub rip: u64,
    pub rflags: u64,
}

/// Size of the signal frame in bytes.
pub const SIGNAL_FRAME_SIZE: usize = core::mem::size_of::<SignalFrame>();

/// Sigreturn trampoline machine code, written to the user stack above the
/// frame.
///
/// ```text
///   lea rdi, [rsp-8]   ; frame pointer (ret already popped one slot)
///   mov rax, 27        ; sigreturn syscall number
///   int 0x80
///   ud2                ; never reached
/// ```
const SIGRETURN_TRAMPOLINE: [u8; 16] = [
    0x48, 0x8d, 0x7c, 0x24, 0xf8, // lea rdi, [rsp-8]
    0x48, 0xc7, 0xc0, 0x1b, 0x00, 0x00, 0x00, // mov rax, 27
    0xcd, 0x80, // int 0x80
    0x0f, 0x0b, // ud2
];

const TRAMPOLINE_SIZE: usize = SIGRETURN_TRAMPOLINE.len();

/// Arrange for `handler` to run in user mode with `signum` as argument.
///
/// On success the process's saved context points at the handler and the
/// delivered signal is blocked until sigreturn. Fails when the process
/// has no user address space or its stack cannot hold the frame.
pub fn push_signal_frame(
    kernel: &mut Kernel,
    pid: Pid,
    signum: u32,
    handler: u64,
) -> KernelResult<()> {
    let (space, regs, saved_mask) = {
        let process = kernel
            .processes
            .get(pid)
            .ok_or(KernelError::ProcessNotFound { pid: pid.0 })?;
        let space = process.address_space.ok_or(KernelError::InvalidState {
            expected: "user process",
            actual: "kernel-mode process",
        })?;
        (space, process.regs, process.blocked_signals)
    };

    // Carve the trampoline and the frame out of the user stack, growing
    // downward from the interrupted RSP. The frame lands 16-byte aligned.
    let mut sp = regs.rsp;
    sp -= TRAMPOLINE_SIZE as u64;
    sp &= !1;
    let trampoline_addr = sp;
    sp -= SIGNAL_FRAME_SIZE as u64;
    sp &= !0xF;
    let frame_addr = sp;

    let frame = SignalFrame {
        trampoline_ret_addr: trampoline_addr,
        signum: signum as u64,
        saved_mask: saved_mask as u64,
        rax: regs.rax,
        rbx: regs.rbx,
        rcx: regs.rcx,
        rdx: regs.rdx,
        rsi: regs.rsi,
        rdi: regs.rdi,
        rbp: regs.rbp,
        r8: regs.r8,
        r9: regs.r9,
        r10: regs.r10,
        r11: regs.r11,
        r12: regs.r12,
        r13: regs.r13,
        r14: regs.r14,
        r15: regs.r15,
        rsp: regs.rsp,
        rip: regs.rip,
        rflags: regs.rflags,
    };

    // SAFETY: SignalFrame is repr(C) with only u64 fields; viewing the
    // local value as bytes is well defined.
    let frame_bytes = unsafe {
        core::slice::from_raw_parts(&frame as *const SignalFrame as *const u8, SIGNAL_FRAME_SIZE)
    };
    if !user_access::copy_to_user(&kernel.vmm, &space, frame_addr, frame_bytes) {
        return Err(KernelError::UnmappedMemory { addr: frame_addr });
    }
    if !user_access::copy_to_user(&kernel.vmm, &space, trampoline_addr, &SIGRETURN_TRAMPOLINE) {
        return Err(KernelError::UnmappedMemory {
            addr: trampoline_addr,
        });
    }

    let Some(process) = kernel.processes.get_mut(pid) else {
        return Err(KernelError::ProcessNotFound { pid: pid.0 });
    };
    // Block the delivered signal while its handler runs.
    process.blocked_signals = (saved_mask | (1 << signum)) & !UNMASKABLE;
    process.handling_signal = true;
    process.regs.rip = handler;
    process.regs.rsp = frame_addr;
    process.regs.rdi = signum as u64;
    // Clear DF, keep interrupts enabled in the handler.
    process.regs.rflags = (regs.rflags & !0x400) | 0x200;

    log::debug!(
        "delivered signal {} to {} handler {:#x}, frame at {:#x}",
        signum,
        pid,
        handler,
        frame_addr
    );
    Ok(())
}

/// Restore the context saved by [`push_signal_frame`].
///
/// Called by the sigreturn syscall with the user pointer the trampoline
/// passed. Returns the restored RAX so the dispatcher can place it back
/// in the return register.
pub fn restore_signal_frame(kernel: &mut Kernel, frame_ptr: u64) -> KernelResult<u64> {
    let pid = kernel
        .processes
        .current_pid()
        .ok_or(KernelError::InvalidState {
            expected: "a current process",
            actual: "none",
        })?;
    let space = kernel
        .processes
        .get(pid)
        .and_then(|p| p.address_space)
        .ok_or(KernelError::InvalidState {
            expected: "user process",
            actual: "kernel-mode process",
        })?;

    let mut buf = [0u8; SIGNAL_FRAME_SIZE];
    if !user_access::copy_from_user(&kernel.vmm, &space, &mut buf, frame_ptr) {
        return Err(KernelError::InvalidAddress { addr: frame_ptr });
    }
    // SAFETY: the buffer holds SIGNAL_FRAME_SIZE bytes and every field of
    // the repr(C) struct is a u64, for which any bit pattern is valid.
    let frame: SignalFrame = unsafe { core::ptr::read(buf.as_ptr() as *const SignalFrame) };

    let Some(process) = kernel.processes.get_mut(pid) else {
        return Err(KernelError::ProcessNotFound { pid: pid.0 });
    };
    process.regs.rax = frame.rax;
    process.regs.rbx = frame.rbx;
    process.regs.rcx = frame.rcx;
    process.regs.rdx = frame.rdx;
    process.regs.rsi = frame.rsi;
    process.regs.rdi = frame.rdi;
    process.regs.rbp = frame.rbp;
    process.regs.r8 = frame.r8;
    process.regs.r9 = frame.r9;
    process.regs.r10 = frame.r10;
    process.regs.r11 = frame.r11;
    process.regs.r12 = frame.r12;
    process.regs.r13 = frame.r13;
    process.regs.r14 = frame.r14;
    process.regs.r15 = frame.r15;
    process.regs.rsp = frame.rsp;
    process.regs.rip = frame.rip;
    process.regs.rflags = frame.rflags;

    process.blocked_signals = (frame.saved_mask as u32) & !UNMASKABLE;
    process.handling_signal = false;

    log::debug!("sigreturn for {}, resuming at {:#x}", pid, frame.rip);
    Ok(frame.rax)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        mm::{PageFlags, VirtualAddress, PAGE_SIZE, USER_BASE},
        process::{signals, Pid, ProcessState},
        sim::SimMachine,
    };

    /// Spawn a user process with one mapped stack page and RSP at its top.
    fn user_process(kernel: &mut crate::kernel::Kernel) -> Pid {
        let pid = kernel.processes.create("victim", Pid(0), 0).unwrap();
        let space = kernel.vmm.create_user_space(&mut kernel.pmm).unwrap();
        let stack_base = USER_BASE + 16 * PAGE_SIZE as u64;
        kernel
            .vmm
            .alloc_user_page(
                &space,
                VirtualAddress::new(stack_base),
                PageFlags::WRITABLE,
                &mut kernel.pmm,
            )
            .unwrap();
        let p = kernel.processes.get_mut(pid).unwrap();
        p.address_space = Some(space);
        p.regs.rsp = stack_base + PAGE_SIZE as u64 - 16;
        p.regs.rip = 0x40_1000;
        p.regs.rax = 0xAAAA;
        pid
    }

    #[test]
    fn frame_roundtrip_restores_context_and_mask() {
        let sim = SimMachine::new(16 * 1024 * 1024);
        let mut kernel = sim.kernel();
        let pid = user_process(&mut kernel);
        let idx = kernel.processes.slot_of(pid).unwrap();
        kernel.processes.set_current(idx);

        let before = kernel.processes.get(pid).unwrap().regs;
        push_signal_frame(&mut kernel, pid, signals::SIGTERM, 0x40_2000).unwrap();

        {
            let p = kernel.processes.get(pid).unwrap();
            assert!(p.handling_signal);
            assert_eq!(p.regs.rip, 0x40_2000);
            assert_eq!(p.regs.rdi, signals::SIGTERM as u64);
            assert_eq!(p.regs.rsp % 16, 0);
            assert_ne!(p.blocked_signals & (1 << signals::SIGTERM), 0);
        }

        let frame_ptr = kernel.processes.get(pid).unwrap().regs.rsp;
        let rax = restore_signal_frame(&mut kernel, frame_ptr).unwrap();
        let p = kernel.processes.get(pid).unwrap();
        assert_eq!(rax, 0xAAAA);
        assert!(!p.handling_signal);
        assert_eq!(p.regs.rip, before.rip);
        assert_eq!(p.regs.rsp, before.rsp);
        assert_eq!(p.blocked_signals, 0);
    }

    #[test]
    fn handler_dispatch_happens_once_per_pass() {
        let sim = SimMachine::new(16 * 1024 * 1024);
        let mut kernel = sim.kernel();
        let pid = user_process(&mut kernel);

        {
            let p = kernel.processes.get_mut(pid).unwrap();
            signals::set_handler(p, signals::SIGUSR1, 0x40_3000).unwrap();
            signals::set_handler(p, signals::SIGUSR2, 0x40_4000).unwrap();
            p.pending_signals = (1 << signals::SIGUSR1) | (1 << signals::SIGUSR2);
        }

        assert!(signals::deliver_pending(&mut kernel, pid));
        let p = kernel.processes.get(pid).unwrap();
        // Lowest number first; the second stays pending for the next pass.
        assert_eq!(p.regs.rip, 0x40_3000);
        assert_ne!(p.pending_signals & (1 << signals::SIGUSR2), 0);
        assert_eq!(p.pending_signals & (1 << signals::SIGUSR1), 0);

        // While the handler runs, nothing else is delivered.
        assert!(!signals::deliver_pending(&mut kernel, pid));
    }

    #[test]
    fn delivery_without_stack_terminates() {
        let sim = SimMachine::new(16 * 1024 * 1024);
        let mut kernel = sim.kernel();
        let pid = kernel.processes.create("nostack", Pid(0), 0).unwrap();
        {
            let p = kernel.processes.get_mut(pid).unwrap();
            let space = kernel.vmm.create_user_space(&mut kernel.pmm).unwrap();
            p.address_space = Some(space);
            p.regs.rsp = USER_BASE + PAGE_SIZE as u64; // nothing mapped
            signals::set_handler(p, signals::SIGUSR1, 0x40_3000).unwrap();
            p.pending_signals = 1 << signals::SIGUSR1;
        }
        assert!(signals::deliver_pending(&mut kernel, pid));
        assert_eq!(
            kernel.processes.get(pid).unwrap().state,
            ProcessState::Zombie
        );
    }
}
