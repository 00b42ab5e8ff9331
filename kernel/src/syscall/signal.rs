//! Signal system calls

use super::{current_space, Outcome};
use crate::{
    kernel::Kernel,
    mm::user_access,
    process::{
        lifecycle, scheduler, signal_delivery,
        signals::{self, MaskHow, MAX_SIGNALS, SIGSEGV, UNMASKABLE},
        Pid, SignalAction,
    },
};

const SIGACTION_SIZE: usize = core::mem::size_of::<SignalAction>();

fn signum_ok(signum: u64) -> bool {
    signum != 0 && signum < MAX_SIGNALS as u64
}

/// Send a signal. Negative and zero pids broadcast: 0 targets the
/// caller's process group, -1 every process, and anything below -1 the
/// group with id `-pid`. Broadcasts return the number of processes
/// signalled.
pub fn sys_kill(kernel: &mut Kernel, pid_arg: u64, signum: u64) -> Outcome {
    if !signum_ok(signum) {
        return Outcome::Complete(-1);
    }
    let signum = signum as u32;
    let pid = pid_arg as i64;

    let result = if pid == 0 {
        let Some(pgid) = kernel.processes.current().map(|p| p.process_group) else {
            return Outcome::Complete(-1);
        };
        signals::send_to_group(kernel, pgid, signum).map(|n| n as isize)
    } else if pid == -1 {
        // Simplified permission model: signal every live process.
        let pids = kernel.processes.pids();
        let mut sent = 0isize;
        for target in pids {
            if signals::send(kernel, target, signum).is_ok() {
                sent += 1;
            }
        }
        Ok(sent)
    } else if pid < -1 {
        signals::send_to_group(kernel, (-pid) as u64, signum).map(|n| n as isize)
    } else {
        signals::send(kernel, Pid(pid as u64), signum).map(|_| 0isize)
    };

    match result {
        Ok(v) => Outcome::Complete(v),
        Err(e) => Outcome::Complete(e.code()),
    }
}

/// Install a bare handler for a signal, returning the previous one.
pub fn sys_signal(kernel: &mut Kernel, signum: u64, handler: u64) -> Outcome {
    if !signum_ok(signum) {
        return Outcome::Complete(-1);
    }
    let Some(p) = kernel.processes.current_mut() else {
        return Outcome::Complete(-1);
    };
    match signals::set_handler(p, signum as u32, handler) {
        Ok(old) => Outcome::Complete(old as isize),
        Err(_) => Outcome::Complete(-1),
    }
}

/// Install or query a full signal action.
pub fn sys_sigaction(kernel: &mut Kernel, signum: u64, act_ptr: u64, oldact_ptr: u64) -> Outcome {
    if !signum_ok(signum) {
        return Outcome::Complete(-1);
    }
    if signum as u32 == signals::SIGKILL || signum as u32 == signals::SIGSTOP {
        return Outcome::Complete(-1);
    }
    let Some(space) = current_space(kernel) else {
        return Outcome::Complete(-1);
    };

    let new_action = if act_ptr != 0 {
        let mut buf = [0u8; SIGACTION_SIZE];
        if !user_access::copy_from_user(&kernel.vmm, &space, &mut buf, act_ptr) {
            return Outcome::Complete(-1);
        }
        // SAFETY: SignalAction is repr(C) with integer fields only, so
        // any bit pattern read from user memory is a valid value.
        let mut action: SignalAction = unsafe { core::ptr::read(buf.as_ptr() as *const SignalAction) };
        action.mask &= !UNMASKABLE;
        Some(action)
    } else {
        None
    };

    let old = {
        let Some(p) = kernel.processes.current_mut() else {
            return Outcome::Complete(-1);
        };
        let old = p.signal_actions[signum as usize];
        if let Some(action) = new_action {
            p.signal_actions[signum as usize] = action;
        }
        old
    };

    if oldact_ptr != 0 {
        // SAFETY: viewing the repr(C) struct as bytes for the copy out.
        let bytes = unsafe {
            core::slice::from_raw_parts(&old as *const SignalAction as *const u8, SIGACTION_SIZE)
        };
        if !user_access::copy_to_user(&kernel.vmm, &space, oldact_ptr, bytes) {
            return Outcome::Complete(-1);
        }
    }
    Outcome::Complete(0)
}

/// Manipulate the blocked-signal mask with BLOCK/UNBLOCK/SETMASK
/// semantics. SIGKILL and SIGSTOP are silently excluded.
pub fn sys_sigprocmask(kernel: &mut Kernel, how: u64, set_ptr: u64, oldset_ptr: u64) -> Outcome {
    let Ok(how) = MaskHow::try_from(how) else {
        return Outcome::Complete(-1);
    };
    let Some(space) = current_space(kernel) else {
        return Outcome::Complete(-1);
    };

    let set = if set_ptr != 0 {
        match user_access::get_user_u64(&kernel.vmm, &space, set_ptr) {
            Some(value) => Some(value as u32),
            None => return Outcome::Complete(-1),
        }
    } else {
        None
    };

    let old = {
        let Some(p) = kernel.processes.current_mut() else {
            return Outcome::Complete(-1);
        };
        signals::proc_mask(p, how, set)
    };

    if oldset_ptr != 0 && !user_access::put_user_u64(&kernel.vmm, &space, oldset_ptr, old as u64) {
        return Outcome::Complete(-1);
    }
    Outcome::Complete(0)
}

/// Copy the pending set to user memory.
pub fn sys_sigpending(kernel: &mut Kernel, set_ptr: u64) -> Outcome {
    if set_ptr == 0 {
        return Outcome::Complete(-1);
    }
    let Some(space) = current_space(kernel) else {
        return Outcome::Complete(-1);
    };
    let Some(pending) = kernel.processes.current().map(|p| p.pending_signals) else {
        return Outcome::Complete(-1);
    };
    if !user_access::put_user_u64(&kernel.vmm, &space, set_ptr, pending as u64) {
        return Outcome::Complete(-1);
    }
    Outcome::Complete(0)
}

/// Atomically install a temporary mask and wait for a signal. Always
/// surfaces an interrupted error after the wakeup, with the previous
/// mask restored.
pub fn sys_sigsuspend(kernel: &mut Kernel, mask_ptr: u64) -> Outcome {
    let Some(pid) = kernel.processes.current_pid() else {
        return Outcome::Complete(-1);
    };

    // A restart with a saved mask means the suspension was interrupted:
    // restore and report.
    let saved = kernel.processes.get(pid).and_then(|p| p.saved_sigmask);
    if let Some(old_mask) = saved {
        if let Some(p) = kernel.processes.get_mut(pid) {
            p.blocked_signals = old_mask & !UNMASKABLE;
            p.saved_sigmask = None;
        }
        return Outcome::Complete(-1);
    }

    if mask_ptr == 0 {
        return Outcome::Complete(-1);
    }
    let Some(space) = current_space(kernel) else {
        return Outcome::Complete(-1);
    };
    let Some(mask) = user_access::get_user_u64(&kernel.vmm, &space, mask_ptr) else {
        return Outcome::Complete(-1);
    };

    if let Some(p) = kernel.processes.get_mut(pid) {
        p.saved_sigmask = Some(p.blocked_signals);
        p.blocked_signals = (mask as u32) & !UNMASKABLE;
    }
    scheduler::block_process(&mut kernel.processes, pid);
    Outcome::Block
}

/// Restore the context saved by signal delivery. Issued by the
/// trampoline, not by user code; a corrupt frame terminates the caller.
pub fn sys_sigreturn(kernel: &mut Kernel, frame_ptr: u64) -> Outcome {
    match signal_delivery::restore_signal_frame(kernel, frame_ptr) {
        Ok(rax) => Outcome::Complete(rax as isize),
        Err(e) => {
            log::warn!("bad sigreturn frame: {}", e);
            if let Some(pid) = kernel.processes.current_pid() {
                lifecycle::exit_process(kernel, pid, (128 + SIGSEGV) as i32);
            }
            Outcome::Complete(-1)
        }
    }
}
