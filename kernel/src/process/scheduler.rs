//! Round-robin scheduler
//!
//! Non-priority, preemptive at timer granularity: the tick handler wakes
//! expired sleepers and invokes `schedule` every `timer_hz / 100` ticks.
//! Selection starts at the slot after the current one and takes the first
//! live process that is Ready or Running; when nothing is runnable the
//! current choice is retained. Pending signals are delivered to a
//! candidate before it is dispatched, which may disqualify it (default
//! terminate/stop actions), in which case scanning simply continues.

use crate::{
    kernel::Kernel,
    process::{signals, Pid, ProcessState, ProcessTable, MAX_PROCESSES},
};

/// Mark a process Blocked.
pub fn block_process(table: &mut ProcessTable, pid: Pid) {
    if let Some(p) = table.get_mut(pid) {
        p.state = ProcessState::Blocked;
    }
}

/// Wake a Blocked process; any other state is left alone.
pub fn unblock_process(table: &mut ProcessTable, pid: Pid) {
    if let Some(p) = table.get_mut(pid) {
        if p.state == ProcessState::Blocked {
            p.state = ProcessState::Ready;
        }
    }
}

/// Stop a live process (SIGSTOP/SIGTSTP default action).
pub fn stop_process(table: &mut ProcessTable, pid: Pid) {
    if let Some(p) = table.get_mut(pid) {
        if p.state != ProcessState::Zombie {
            p.state = ProcessState::Stopped;
            log::info!("stopped process {}", pid);
        }
    }
}

/// Resume a Stopped process; only fires from Stopped.
pub fn continue_process(table: &mut ProcessTable, pid: Pid) {
    if let Some(p) = table.get_mut(pid) {
        if p.state == ProcessState::Stopped {
            p.state = ProcessState::Ready;
            log::info!("continued process {}", pid);
        }
    }
}

/// Put the current process to sleep for `ms` milliseconds (at least one
/// tick). The caller is responsible for scheduling afterwards.
pub fn sleep_current(kernel: &mut Kernel, ms: u64) {
    let ticks = ((kernel.timer_hz as u64 * ms) / 1000).max(1);
    let deadline = kernel.ticks + ticks;
    if let Some(p) = kernel.processes.current_mut() {
        p.sleep_until = deadline;
        p.state = ProcessState::Sleeping;
    }
}

/// Pick the next process to run.
///
/// Scans `(current+1) % N` onward for a slot with a nonzero pid in the
/// Ready or Running state. The winning candidate gets its pending
/// signals delivered first; if that terminates or stops it, the scan
/// moves on. After a successful pick exactly one process is Running.
pub fn schedule(kernel: &mut Kernel) {
    let prev = kernel.processes.current_index();

    for offset in 1..=MAX_PROCESSES {
        let idx = (prev + offset) % MAX_PROCESSES;
        let Some(candidate) = kernel.processes.by_index(idx) else {
            continue;
        };
        if !matches!(
            candidate.state,
            ProcessState::Ready | ProcessState::Running
        ) {
            continue;
        }
        let pid = candidate.pid;

        signals::deliver_pending(kernel, pid);
        let still_runnable = kernel
            .processes
            .get(pid)
            .is_some_and(|p| matches!(p.state, ProcessState::Ready | ProcessState::Running));
        if !still_runnable {
            continue;
        }

        if idx != prev {
            if let Some(old) = kernel.processes.by_index_mut(prev) {
                if old.state == ProcessState::Running {
                    old.state = ProcessState::Ready;
                }
            }
        }
        kernel.processes.set_current(idx);
        if let Some(p) = kernel.processes.by_index_mut(idx) {
            p.state = ProcessState::Running;
            p.cpu_time += 1;
        }
        return;
    }
    // Nothing runnable; retain the current choice.
}

/// Timer tick: advance the monotonic counter, wake expired sleepers, and
/// preempt at the 10 ms boundary.
pub fn timer_tick(kernel: &mut Kernel) {
    kernel.ticks += 1;
    let now = kernel.ticks;

    for idx in 0..MAX_PROCESSES {
        if let Some(p) = kernel.processes.by_index_mut(idx) {
            if p.state == ProcessState::Sleeping && now >= p.sleep_until {
                p.state = ProcessState::Ready;
            }
        }
    }

    let quantum = (kernel.timer_hz / 100).max(1) as u64;
    if now % quantum == 0 {
        schedule(kernel);
    }
}
