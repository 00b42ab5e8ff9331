//! System-call dispatch
//!
//! The dispatcher is reached from the `int 0x80` gate. The syscall code
//! arrives in RAX and up to five arguments in RDI, RSI, RDX, R10 and R8;
//! the result is placed back in RAX. Every user pointer is validated
//! before it is dereferenced.
//!
//! Blocking calls use restart semantics: the handler parks the process
//! (Blocked or Sleeping) and the dispatcher rewinds the saved RIP by the
//! length of the `int` instruction, so the call re-executes when the
//! process is scheduled again and re-checks its condition. A write that
//! already committed bytes carries its progress in the PCB across
//! restarts.
//!
//! Before returning to user mode the pending-signal delivery pass runs,
//! and the scheduler is invoked if the caller is no longer runnable.

pub mod filesystem;
pub mod process;
pub mod signal;

use crate::{
    kernel::Kernel,
    mm::AddressSpace,
    process::{scheduler, signals, ProcessState},
};

/// System call numbers.
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syscall {
    Exit = 1,
    Fork = 2,
    Read = 3,
    Write = 4,
    Open = 5,
    Close = 6,
    Sleep = 7,
    GetPid = 8,
    Exec = 9,
    GetPPid = 10,
    Pipe = 11,
    Dup = 12,
    Dup2 = 13,
    Mkdir = 14,
    Rmdir = 15,
    Wait = 16,
    Kill = 17,
    Signal = 18,
    SigAction = 19,
    SigProcMask = 20,
    SigPending = 21,
    SigSuspend = 22,
    SetPgid = 23,
    GetPgid = 24,
    SetSid = 25,
    GetSid = 26,
    /// Internal: issued by the signal trampoline, not by user code.
    SigReturn = 27,
}

impl TryFrom<u64> for Syscall {
    type Error = ();

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Syscall::Exit),
            2 => Ok(Syscall::Fork),
            3 => Ok(Syscall::Read),
            4 => Ok(Syscall::Write),
            5 => Ok(Syscall::Open),
            6 => Ok(Syscall::Close),
            7 => Ok(Syscall::Sleep),
            8 => Ok(Syscall::GetPid),
            9 => Ok(Syscall::Exec),
            10 => Ok(Syscall::GetPPid),
            11 => Ok(Syscall::Pipe),
            12 => Ok(Syscall::Dup),
            13 => Ok(Syscall::Dup2),
            14 => Ok(Syscall::Mkdir),
            15 => Ok(Syscall::Rmdir),
            16 => Ok(Syscall::Wait),
            17 => Ok(Syscall::Kill),
            18 => Ok(Syscall::Signal),
            19 => Ok(Syscall::SigAction),
            20 => Ok(Syscall::SigProcMask),
            21 => Ok(Syscall::SigPending),
            22 => Ok(Syscall::SigSuspend),
            23 => Ok(Syscall::SetPgid),
            24 => Ok(Syscall::GetPgid),
            25 => Ok(Syscall::SetSid),
            26 => Ok(Syscall::GetSid),
            27 => Ok(Syscall::SigReturn),
            _ => Err(()),
        }
    }
}

/// What a handler did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The call finished; the value goes into the caller's RAX.
    Complete(isize),
    /// The caller was parked; rewind RIP so the call restarts on wake.
    Block,
}

/// Length of `int 0x80` (0xCD 0x80), the rewind distance for restarts.
const SYSCALL_INSN_LEN: u64 = 2;

/// Per-call cap on kernel bounce buffers for read/write.
pub(crate) const IO_CHUNK_MAX: usize = 64 * 1024;

/// User address space of the current process, if it has one.
pub(crate) fn current_space(kernel: &Kernel) -> Option<AddressSpace> {
    kernel.processes.current().and_then(|p| p.address_space)
}

/// Dispatch the syscall encoded in the current process's saved context.
///
/// Reads the code and arguments from the saved registers, runs the
/// handler, applies the outcome, delivers pending signals, and schedules
/// if the caller is no longer runnable.
pub fn dispatch(kernel: &mut Kernel) {
    let Some(pid) = kernel.processes.current_pid() else {
        return;
    };
    let (num, a1, a2, a3, a4, a5) = {
        let Some(p) = kernel.processes.current() else {
            return;
        };
        (
            p.regs.rax,
            p.regs.rdi,
            p.regs.rsi,
            p.regs.rdx,
            p.regs.r10,
            p.regs.r8,
        )
    };

    let outcome = match Syscall::try_from(num) {
        Ok(call) => handle(kernel, call, a1, a2, a3, a4, a5),
        Err(()) => {
            log::warn!("process {}: invalid syscall {}", pid, num);
            Outcome::Complete(-1)
        }
    };

    if let Some(p) = kernel.processes.get_mut(pid) {
        match outcome {
            Outcome::Complete(value) => {
                p.regs.rax = value as u64;
                p.restart_progress = 0;
            }
            Outcome::Block => {
                // RAX still holds the syscall number; re-execute the
                // `int 0x80` when the process wakes.
                p.regs.rip -= SYSCALL_INSN_LEN;
            }
        }
    }

    signals::deliver_pending(kernel, pid);

    let current_runnable = kernel
        .processes
        .current()
        .is_some_and(|p| matches!(p.state, ProcessState::Ready | ProcessState::Running));
    if !current_runnable {
        scheduler::schedule(kernel);
    }
}

#[allow(unused_variables)]
fn handle(
    kernel: &mut Kernel,
    call: Syscall,
    a1: u64,
    a2: u64,
    a3: u64,
    a4: u64,
    a5: u64,
) -> Outcome {
    match call {
        Syscall::Exit => process::sys_exit(kernel, a1),
        Syscall::Fork => process::sys_fork(kernel),
        Syscall::Read => filesystem::sys_read(kernel, a1, a2, a3),
        Syscall::Write => filesystem::sys_write(kernel, a1, a2, a3),
        Syscall::Open => filesystem::sys_open(kernel, a1, a2),
        Syscall::Close => filesystem::sys_close(kernel, a1),
        Syscall::Sleep => process::sys_sleep(kernel, a1),
        Syscall::GetPid => process::sys_getpid(kernel),
        Syscall::Exec => process::sys_exec(kernel, a1, a2),
        Syscall::GetPPid => process::sys_getppid(kernel),
        Syscall::Pipe => filesystem::sys_pipe(kernel, a1),
        // Descriptor duplication is not implemented in this kernel.
        Syscall::Dup | Syscall::Dup2 => Outcome::Complete(-1),
        Syscall::Mkdir => filesystem::sys_mkdir(kernel, a1, a2),
        Syscall::Rmdir => filesystem::sys_rmdir(kernel, a1),
        Syscall::Wait => process::sys_wait(kernel, a1),
        Syscall::Kill => signal::sys_kill(kernel, a1, a2),
        Syscall::Signal => signal::sys_signal(kernel, a1, a2),
        Syscall::SigAction => signal::sys_sigaction(kernel, a1, a2, a3),
        Syscall::SigProcMask => signal::sys_sigprocmask(kernel, a1, a2, a3),
        Syscall::SigPending => signal::sys_sigpending(kernel, a1),
        Syscall::SigSuspend => signal::sys_sigsuspend(kernel, a1),
        Syscall::SetPgid => process::sys_setpgid(kernel, a1, a2),
        Syscall::GetPgid => process::sys_getpgid(kernel, a1),
        Syscall::SetSid => process::sys_setsid(kernel),
        Syscall::GetSid => process::sys_getsid(kernel, a1),
        Syscall::SigReturn => signal::sys_sigreturn(kernel, a1),
    }
}
