//! Process-management system calls

use super::{current_space, Outcome};
use crate::{
    kernel::Kernel,
    mm::user_access,
    process::{lifecycle, scheduler, Pid},
};

/// Terminate the calling process with `status`. Never returns to the
/// caller; the dispatcher schedules away from the zombie.
pub fn sys_exit(kernel: &mut Kernel, status: u64) -> Outcome {
    if let Some(pid) = kernel.processes.current_pid() {
        lifecycle::exit_process(kernel, pid, status as i32);
    }
    Outcome::Complete(0)
}

/// Clone the caller. The parent sees the child pid, the child sees 0.
pub fn sys_fork(kernel: &mut Kernel) -> Outcome {
    match lifecycle::fork(kernel) {
        Ok(child) => Outcome::Complete(child.0 as isize),
        Err(e) => Outcome::Complete(e.code()),
    }
}

/// Sleep for `ms` milliseconds. Returns 0 once the deadline (or an
/// interrupting signal) wakes the caller.
pub fn sys_sleep(kernel: &mut Kernel, ms: u64) -> Outcome {
    scheduler::sleep_current(kernel, ms);
    Outcome::Complete(0)
}

pub fn sys_getpid(kernel: &mut Kernel) -> Outcome {
    match kernel.processes.current_pid() {
        Some(pid) => Outcome::Complete(pid.0 as isize),
        None => Outcome::Complete(0),
    }
}

pub fn sys_getppid(kernel: &mut Kernel) -> Outcome {
    match kernel.processes.current() {
        Some(p) => Outcome::Complete(p.parent.0 as isize),
        None => Outcome::Complete(0),
    }
}

/// Replace the caller's image from an ELF64 file on the volume. The
/// `argv` argument is accepted for ABI shape but not consumed by the
/// flat loader.
pub fn sys_exec(kernel: &mut Kernel, path_ptr: u64, _argv_ptr: u64) -> Outcome {
    let Some(space) = current_space(kernel) else {
        return Outcome::Complete(-1);
    };
    let Some(path) = user_access::copy_cstr_from_user(&kernel.vmm, &space, path_ptr) else {
        return Outcome::Complete(-1);
    };
    match lifecycle::exec(kernel, &path) {
        Ok(()) => Outcome::Complete(0),
        Err(e) => Outcome::Complete(e.code()),
    }
}

/// Reap the first zombie child, copying its status out when a pointer is
/// given. Blocks while children exist but none has exited; returns -1
/// when there are no children or a signal interrupts the wait.
pub fn sys_wait(kernel: &mut Kernel, status_ptr: u64) -> Outcome {
    let Some(pid) = kernel.processes.current_pid() else {
        return Outcome::Complete(-1);
    };
    match lifecycle::wait_for_child(kernel, pid) {
        lifecycle::WaitResult::Reaped { pid: child, status } => {
            if status_ptr != 0 {
                let Some(space) = current_space(kernel) else {
                    return Outcome::Complete(-1);
                };
                if !user_access::put_user_u64(&kernel.vmm, &space, status_ptr, status as u64) {
                    return Outcome::Complete(-1);
                }
            }
            Outcome::Complete(child.0 as isize)
        }
        lifecycle::WaitResult::NoChildren => Outcome::Complete(-1),
        lifecycle::WaitResult::ShouldBlock => {
            let interrupted = kernel
                .processes
                .get(pid)
                .is_some_and(|p| p.has_deliverable_signal());
            if interrupted {
                return Outcome::Complete(crate::error::KernelError::Interrupted.code());
            }
            scheduler::block_process(&mut kernel.processes, pid);
            Outcome::Block
        }
    }
}

/// Move a process (0 = the caller) into a process group (0 = its own).
pub fn sys_setpgid(kernel: &mut Kernel, pid_arg: u64, pgid: u64) -> Outcome {
    let target = if pid_arg == 0 {
        match kernel.processes.current_pid() {
            Some(pid) => pid,
            None => return Outcome::Complete(-1),
        }
    } else {
        Pid(pid_arg)
    };
    match kernel.processes.set_process_group(target, pgid) {
        Ok(()) => Outcome::Complete(0),
        Err(e) => Outcome::Complete(e.code()),
    }
}

pub fn sys_getpgid(kernel: &mut Kernel, pid_arg: u64) -> Outcome {
    let target = if pid_arg == 0 {
        kernel.processes.current_pid()
    } else {
        Some(Pid(pid_arg))
    };
    match target.and_then(|pid| kernel.processes.get(pid)) {
        Some(p) => Outcome::Complete(p.process_group as isize),
        None => Outcome::Complete(-1),
    }
}

pub fn sys_setsid(kernel: &mut Kernel) -> Outcome {
    let Some(pid) = kernel.processes.current_pid() else {
        return Outcome::Complete(-1);
    };
    match kernel.processes.create_session(pid) {
        Ok(sid) => Outcome::Complete(sid as isize),
        Err(e) => Outcome::Complete(e.code()),
    }
}

pub fn sys_getsid(kernel: &mut Kernel, pid_arg: u64) -> Outcome {
    let target = if pid_arg == 0 {
        kernel.processes.current_pid()
    } else {
        Some(Pid(pid_arg))
    };
    match target.and_then(|pid| kernel.processes.get(pid)) {
        Some(p) => Outcome::Complete(p.session_id as isize),
        None => Outcome::Complete(-1),
    }
}
