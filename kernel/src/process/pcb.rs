//! Process control block
//!
//! The PCB is a fixed-size table entry holding everything the kernel
//! knows about one process: identity, saved machine context, address
//! space, signal state, the descriptor table, and job-control ids.

use alloc::string::String;

use crate::{
    fs::pipe::PipeId,
    mm::{AddressSpace, VirtualAddress},
    process::{signals, MAX_FDS, NAME_MAX},
};

/// Process identifier. `Pid(0)` never names a process; a table slot with
/// pid 0 is free.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pid(pub u64);

impl core::fmt::Display for Pid {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Process state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Runnable, waiting for the scheduler
    Ready,
    /// Currently on the CPU
    Running,
    /// Waiting on a kernel event (pipe space, child exit, signal)
    Blocked,
    /// Waiting for a tick deadline
    Sleeping,
    /// Exited but not yet reaped by the parent
    Zombie,
    /// Stopped by SIGSTOP/SIGTSTP, resumable by SIGCONT
    Stopped,
}

impl ProcessState {
    pub fn name(&self) -> &'static str {
        match self {
            ProcessState::Ready => "ready",
            ProcessState::Running => "running",
            ProcessState::Blocked => "blocked",
            ProcessState::Sleeping => "sleeping",
            ProcessState::Zombie => "zombie",
            ProcessState::Stopped => "stopped",
        }
    }
}

/// Saved machine context. Filled from the trap frame on kernel entry and
/// written back on return to user mode.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Registers {
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
    pub rip: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub cs: u64,
    pub ss: u64,
}

/// One entry of the per-process descriptor table.
///
/// The integer a user process holds is just an index into this table;
/// the kernel dispatches on the tagged entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Descriptor {
    /// Free slot
    None,
    /// VGA terminal (write side of stdout/stderr)
    Terminal,
    /// Keyboard line discipline (read side of stdin)
    Keyboard,
    /// Read end of a pipe
    PipeRead { pipe: PipeId, nonblock: bool },
    /// Write end of a pipe
    PipeWrite { pipe: PipeId, nonblock: bool },
    /// Open FAT32 file, index into the kernel open-file table
    File { slot: usize },
}

/// Per-signal disposition. `handler` holds [`signals::SIG_DFL`],
/// [`signals::SIG_IGN`], or a user handler address. The layout is ABI:
/// `sigaction` copies this struct to and from user memory.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SignalAction {
    pub handler: u64,
    pub flags: u32,
    pub mask: u32,
}

/// Process control block.
#[derive(Debug)]
pub struct Process {
    pub pid: Pid,
    /// Creator; rewritten to `init` on orphaning.
    pub parent: Pid,
    pub name: String,
    pub state: ProcessState,

    /// Saved context, valid while not Running.
    pub regs: Registers,
    /// Root of the user address space; `None` for kernel-mode processes.
    pub address_space: Option<AddressSpace>,
    /// Kernel stack used for ring transitions while this process runs.
    pub kernel_stack: Option<VirtualAddress>,
    pub kernel_stack_pages: usize,

    /// Tick at which a Sleeping process becomes Ready.
    pub sleep_until: u64,
    pub start_time: u64,
    pub cpu_time: u64,

    /// Signals sent but not yet delivered (bit per signal number).
    pub pending_signals: u32,
    /// Signals masked from delivery. Never contains SIGKILL or SIGSTOP.
    pub blocked_signals: u32,
    pub signal_actions: [SignalAction; signals::MAX_SIGNALS],
    /// Reentrancy guard: set while a user handler runs, cleared by
    /// sigreturn.
    pub handling_signal: bool,
    /// Mask to restore when a sigsuspend wakes up.
    pub saved_sigmask: Option<u32>,
    /// Signal sent to the parent on exit.
    pub exit_signal: u32,
    pub exit_code: i32,

    /// Bytes already committed by a blocking write that is being
    /// restarted; cleared when the syscall completes.
    pub restart_progress: usize,

    pub fds: [Descriptor; MAX_FDS],

    pub tty: u64,
    pub process_group: u64,
    pub session_id: u64,
}

impl Process {
    /// Build a fresh PCB in the Ready state with default dispositions and
    /// fds 0/1/2 wired to the keyboard and terminal.
    pub fn new(pid: Pid, parent: Pid, name: &str, start_time: u64) -> Self {
        let mut fds = [Descriptor::None; MAX_FDS];
        fds[0] = Descriptor::Keyboard;
        fds[1] = Descriptor::Terminal;
        fds[2] = Descriptor::Terminal;

        let mut truncated = String::from(name);
        truncated.truncate(NAME_MAX);

        Self {
            pid,
            parent,
            name: truncated,
            state: ProcessState::Ready,
            regs: Registers::default(),
            address_space: None,
            kernel_stack: None,
            kernel_stack_pages: 0,
            sleep_until: 0,
            start_time,
            cpu_time: 0,
            pending_signals: 0,
            blocked_signals: 0,
            signal_actions: [SignalAction::default(); signals::MAX_SIGNALS],
            handling_signal: false,
            saved_sigmask: None,
            exit_signal: signals::SIGCHLD,
            exit_code: 0,
            restart_progress: 0,
            fds,
            tty: 0,
            process_group: pid.0,
            session_id: pid.0,
        }
    }

    /// Lowest free descriptor slot, if any.
    pub fn free_fd(&self) -> Option<usize> {
        self.fds.iter().position(|d| *d == Descriptor::None)
    }

    /// Whether a deliverable (pending and unblocked) signal exists.
    pub fn has_deliverable_signal(&self) -> bool {
        self.pending_signals & !self.blocked_signals != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::signals::{SIGKILL, SIGSTOP};

    #[test]
    fn new_process_has_standard_streams() {
        let p = Process::new(Pid(7), Pid(1), "sh", 0);
        assert_eq!(p.fds[0], Descriptor::Keyboard);
        assert_eq!(p.fds[1], Descriptor::Terminal);
        assert_eq!(p.fds[2], Descriptor::Terminal);
        assert_eq!(p.free_fd(), Some(3));
        assert_eq!(p.state, ProcessState::Ready);
        assert_eq!(p.process_group, 7);
        assert_eq!(p.session_id, 7);
    }

    #[test]
    fn name_is_bounded() {
        let long = "x".repeat(100);
        let p = Process::new(Pid(2), Pid(1), &long, 0);
        assert_eq!(p.name.len(), NAME_MAX);
    }

    #[test]
    fn deliverable_signal_respects_mask() {
        let mut p = Process::new(Pid(3), Pid(1), "t", 0);
        assert!(!p.has_deliverable_signal());
        p.pending_signals = 1 << 15;
        assert!(p.has_deliverable_signal());
        p.blocked_signals = 1 << 15;
        assert!(!p.has_deliverable_signal());
        // KILL and STOP can never end up masked.
        assert_eq!(p.blocked_signals & ((1 << SIGKILL) | (1 << SIGSTOP)), 0);
    }
}
