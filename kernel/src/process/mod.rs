//! Process management
//!
//! A fixed-capacity table of process control blocks, a round-robin
//! scheduler driven by the timer tick, the process lifecycle (spawn,
//! fork, exit, wait), and the signal subsystem.

pub mod lifecycle;
pub mod pcb;
pub mod scheduler;
pub mod signal_delivery;
pub mod signals;
pub mod table;

pub use pcb::{Descriptor, Pid, Process, ProcessState, Registers, SignalAction};
pub use table::ProcessTable;

/// Fixed number of process table slots.
pub const MAX_PROCESSES: usize = 64;

/// Per-process descriptor table size.
pub const MAX_FDS: usize = 16;

/// Longest process name kept in the PCB.
pub const NAME_MAX: usize = 31;

/// Pid of `init`, the adopter of orphaned processes.
pub const INIT_PID: Pid = Pid(1);
