//! Signal subsystem
//!
//! Per-process pending and blocked 32-bit sets plus per-signal
//! dispositions. Sending sets a pending bit (SIGKILL, SIGSTOP and SIGCONT
//! act immediately); delivery happens at the two safe points -- scheduler
//! entry and syscall return -- in ascending signal order. SIGKILL and
//! SIGSTOP can never be masked, ignored, or caught.
//!
//! A signal sent to a Blocked or Sleeping process whose mask does not
//! cover it wakes the target, so blocking syscalls observe the wakeup and
//! surface an interrupted error.

use crate::{
    error::{KernelError, KernelResult},
    kernel::Kernel,
    process::{lifecycle, pcb::Process, scheduler, Pid, ProcessState},
};

use super::signal_delivery;

pub const SIGHUP: u32 = 1;
pub const SIGINT: u32 = 2;
pub const SIGQUIT: u32 = 3;
pub const SIGILL: u32 = 4;
pub const SIGTRAP: u32 = 5;
pub const SIGABRT: u32 = 6;
pub const SIGBUS: u32 = 7;
pub const SIGFPE: u32 = 8;
pub const SIGKILL: u32 = 9;
pub const SIGUSR1: u32 = 10;
pub const SIGSEGV: u32 = 11;
pub const SIGUSR2: u32 = 12;
pub const SIGPIPE: u32 = 13;
pub const SIGALRM: u32 = 14;
pub const SIGTERM: u32 = 15;
pub const SIGSTKFLT: u32 = 16;
pub const SIGCHLD: u32 = 17;
pub const SIGCONT: u32 = 18;
pub const SIGSTOP: u32 = 19;
pub const SIGTSTP: u32 = 20;
pub const SIGTTIN: u32 = 21;
pub const SIGTTOU: u32 = 22;
pub const SIGURG: u32 = 23;
pub const SIGXCPU: u32 = 24;
pub const SIGXFSZ: u32 = 25;
pub const SIGVTALRM: u32 = 26;
pub const SIGPROF: u32 = 27;
pub const SIGWINCH: u32 = 28;
pub const SIGIO: u32 = 29;
pub const SIGPWR: u32 = 30;
pub const SIGSYS: u32 = 31;

/// Signal numbers run 1..=31; the sets are 32-bit.
pub const MAX_SIGNALS: usize = 32;

/// Disposition value for the default action.
pub const SIG_DFL: u64 = 0;
/// Disposition value for "ignore".
pub const SIG_IGN: u64 = 1;

/// Bits that can never appear in a blocked set.
pub const UNMASKABLE: u32 = (1 << SIGKILL) | (1 << SIGSTOP);

/// What the kernel does for a signal whose disposition is `SIG_DFL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultAction {
    Terminate,
    TerminateCore,
    Ignore,
    Continue,
    Stop,
}

/// Fixed default-action table, indexed by signal number.
pub fn default_action(signum: u32) -> DefaultAction {
    match signum {
        SIGQUIT | SIGILL | SIGTRAP | SIGABRT | SIGBUS | SIGFPE | SIGSEGV | SIGSYS => {
            DefaultAction::TerminateCore
        }
        SIGCHLD | SIGURG | SIGWINCH => DefaultAction::Ignore,
        SIGCONT => DefaultAction::Continue,
        SIGSTOP | SIGTSTP | SIGTTIN | SIGTTOU => DefaultAction::Stop,
        _ => DefaultAction::Terminate,
    }
}

/// `sigprocmask` operation selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaskHow {
    Block,
    Unblock,
    SetMask,
}

impl TryFrom<u64> for MaskHow {
    type Error = KernelError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MaskHow::Block),
            1 => Ok(MaskHow::Unblock),
            2 => Ok(MaskHow::SetMask),
            _ => Err(KernelError::InvalidArgument {
                name: "how",
                value: "expected SIG_BLOCK, SIG_UNBLOCK or SIG_SETMASK",
            }),
        }
    }
}

fn valid_signum(signum: u32) -> KernelResult<()> {
    if signum == 0 || signum as usize >= MAX_SIGNALS {
        return Err(KernelError::InvalidArgument {
            name: "signum",
            value: "signal number out of range (1-31)",
        });
    }
    Ok(())
}

/// Send `signum` to one process.
///
/// SIGKILL terminates, SIGSTOP stops, and SIGCONT resumes a stopped
/// target immediately; everything else becomes pending and is delivered
/// at the target's next delivery point. A deliverable signal wakes a
/// Blocked or Sleeping target so its interrupted syscall can return.
pub fn send(kernel: &mut Kernel, pid: Pid, signum: u32) -> KernelResult<()> {
    valid_signum(signum)?;
    let state = kernel
        .processes
        .get(pid)
        .ok_or(KernelError::ProcessNotFound { pid: pid.0 })?
        .state;

    match signum {
        SIGKILL => {
            lifecycle::exit_process(kernel, pid, (128 + SIGKILL) as i32);
            return Ok(());
        }
        SIGSTOP => {
            scheduler::stop_process(&mut kernel.processes, pid);
            return Ok(());
        }
        SIGCONT => {
            if state == ProcessState::Stopped {
                scheduler::continue_process(&mut kernel.processes, pid);
            }
            // fall through: the pending bit is still set so an installed
            // SIGCONT handler runs at the next delivery point
        }
        _ => {}
    }

    let Some(process) = kernel.processes.get_mut(pid) else {
        return Err(KernelError::ProcessNotFound { pid: pid.0 });
    };
    process.pending_signals |= 1 << signum;

    // Implicit unblock: a deliverable signal interrupts a blocking wait.
    if process.blocked_signals & (1 << signum) == 0
        && matches!(process.state, ProcessState::Blocked | ProcessState::Sleeping)
    {
        process.state = ProcessState::Ready;
    }
    Ok(())
}

/// Send to every member of a process group; returns how many processes
/// were signalled.
pub fn send_to_group(kernel: &mut Kernel, pgid: u64, signum: u32) -> KernelResult<usize> {
    valid_signum(signum)?;
    let members = kernel.processes.group_members(pgid);
    let mut sent = 0;
    for pid in members {
        if send(kernel, pid, signum).is_ok() {
            sent += 1;
        }
    }
    Ok(sent)
}

/// Add `mask` to the blocked set; returns the previous set.
pub fn block_mask(process: &mut Process, mask: u32) -> u32 {
    let old = process.blocked_signals;
    process.blocked_signals |= mask & !UNMASKABLE;
    old
}

/// Remove `mask` from the blocked set; returns the previous set.
pub fn unblock_mask(process: &mut Process, mask: u32) -> u32 {
    let old = process.blocked_signals;
    process.blocked_signals &= !mask;
    old
}

/// Replace the blocked set; returns the previous set.
pub fn set_mask(process: &mut Process, mask: u32) -> u32 {
    let old = process.blocked_signals;
    process.blocked_signals = mask & !UNMASKABLE;
    old
}

/// `sigprocmask` with the standard BLOCK | UNBLOCK | SETMASK semantics.
/// Returns the previous set.
pub fn proc_mask(process: &mut Process, how: MaskHow, set: Option<u32>) -> u32 {
    let old = process.blocked_signals;
    if let Some(mask) = set {
        match how {
            MaskHow::Block => {
                block_mask(process, mask);
            }
            MaskHow::Unblock => {
                unblock_mask(process, mask);
            }
            MaskHow::SetMask => {
                set_mask(process, mask);
            }
        }
    }
    old
}

/// Install a disposition for `signum`. Rejected for SIGKILL and SIGSTOP.
/// Returns the previous handler value.
pub fn set_handler(process: &mut Process, signum: u32, handler: u64) -> KernelResult<u64> {
    valid_signum(signum)?;
    if signum == SIGKILL || signum == SIGSTOP {
        return Err(KernelError::PermissionDenied {
            operation: "changing the SIGKILL/SIGSTOP disposition",
        });
    }
    let old = process.signal_actions[signum as usize].handler;
    process.signal_actions[signum as usize].handler = handler;
    Ok(old)
}

/// Deliver pending, unblocked signals to one process.
///
/// Runs at scheduler entry and on syscall return. Iterates signal numbers
/// ascending; default and ignored dispositions are handled in-kernel, and
/// at most one user handler is dispatched per pass (the iteration stops
/// after arranging the handler so semantics stay predictable). Returns
/// true when the pass changed the process (terminated, stopped, or
/// dispatched a handler).
pub fn deliver_pending(kernel: &mut Kernel, pid: Pid) -> bool {
    let Some(process) = kernel.processes.get(pid) else {
        return false;
    };
    if process.handling_signal || process.state == ProcessState::Zombie {
        return false;
    }

    for signum in 1..MAX_SIGNALS as u32 {
        let bit = 1u32 << signum;
        let Some(process) = kernel.processes.get_mut(pid) else {
            return false;
        };
        if process.pending_signals & bit == 0 || process.blocked_signals & bit != 0 {
            continue;
        }
        process.pending_signals &= !bit;
        let handler = process.signal_actions[signum as usize].handler;

        if handler == SIG_DFL {
            match default_action(signum) {
                DefaultAction::Terminate | DefaultAction::TerminateCore => {
                    lifecycle::exit_process(kernel, pid, (128 + signum) as i32);
                    return true;
                }
                DefaultAction::Ignore => continue,
                DefaultAction::Continue => {
                    if process.state == ProcessState::Stopped {
                        scheduler::continue_process(&mut kernel.processes, pid);
                    }
                    continue;
                }
                DefaultAction::Stop => {
                    scheduler::stop_process(&mut kernel.processes, pid);
                    return true;
                }
            }
        } else if handler == SIG_IGN {
            continue;
        } else {
            match signal_delivery::push_signal_frame(kernel, pid, signum, handler) {
                Ok(()) => return true,
                Err(e) => {
                    // No usable user stack to run the handler on; fall
                    // back to terminating like an uncaught fatal signal.
                    log::warn!("signal {} delivery to {} failed: {}", signum, pid, e);
                    lifecycle::exit_process(kernel, pid, (128 + signum) as i32);
                    return true;
                }
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::pcb::{Pid, Process};

    fn process() -> Process {
        Process::new(Pid(5), Pid(1), "t", 0)
    }

    #[test]
    fn default_table_matches_posix() {
        assert_eq!(default_action(SIGTERM), DefaultAction::Terminate);
        assert_eq!(default_action(SIGSEGV), DefaultAction::TerminateCore);
        assert_eq!(default_action(SIGCHLD), DefaultAction::Ignore);
        assert_eq!(default_action(SIGCONT), DefaultAction::Continue);
        assert_eq!(default_action(SIGTSTP), DefaultAction::Stop);
    }

    #[test]
    fn kill_and_stop_cannot_be_masked() {
        let mut p = process();
        block_mask(&mut p, 0xFFFF_FFFF);
        assert_eq!(p.blocked_signals & UNMASKABLE, 0);

        set_mask(&mut p, (1 << SIGKILL) | (1 << SIGSTOP) | (1 << SIGCHLD));
        assert_eq!(p.blocked_signals, 1 << SIGCHLD);
    }

    #[test]
    fn proc_mask_implements_block_unblock_setmask() {
        let mut p = process();
        let old = proc_mask(&mut p, MaskHow::Block, Some(1 << SIGUSR1));
        assert_eq!(old, 0);
        assert_eq!(p.blocked_signals, 1 << SIGUSR1);

        proc_mask(&mut p, MaskHow::Block, Some(1 << SIGUSR2));
        assert_eq!(p.blocked_signals, (1 << SIGUSR1) | (1 << SIGUSR2));

        proc_mask(&mut p, MaskHow::Unblock, Some(1 << SIGUSR1));
        assert_eq!(p.blocked_signals, 1 << SIGUSR2);

        let old = proc_mask(&mut p, MaskHow::SetMask, Some(1 << SIGALRM));
        assert_eq!(old, 1 << SIGUSR2);
        assert_eq!(p.blocked_signals, 1 << SIGALRM);

        // None leaves the mask untouched but still reports it.
        let old = proc_mask(&mut p, MaskHow::SetMask, None);
        assert_eq!(old, 1 << SIGALRM);
        assert_eq!(p.blocked_signals, 1 << SIGALRM);
    }

    #[test]
    fn handler_installation_rejects_uncatchable() {
        let mut p = process();
        assert!(set_handler(&mut p, SIGKILL, 0x1000).is_err());
        assert!(set_handler(&mut p, SIGSTOP, SIG_IGN).is_err());
        let old = set_handler(&mut p, SIGTERM, 0x1000).unwrap();
        assert_eq!(old, SIG_DFL);
        assert_eq!(set_handler(&mut p, SIGTERM, SIG_IGN).unwrap(), 0x1000);
    }
}
