//! Global process table
//!
//! A fixed array of 64 slots holding boxed PCBs. A slot is free when it
//! holds `None`; pids increase monotonically and are never reused. The
//! table also tracks which slot is current for the round-robin scheduler
//! and implements the job-control relations (groups, sessions,
//! reparenting).

use alloc::boxed::Box;
use alloc::vec::Vec;

use super::{pcb::Process, Pid, ProcessState, INIT_PID, MAX_PROCESSES};
use crate::error::{KernelError, KernelResult};

/// Fixed-capacity process table.
pub struct ProcessTable {
    slots: [Option<Box<Process>>; MAX_PROCESSES],
    /// Slot index of the current (last scheduled) process.
    current: usize,
    next_pid: u64,
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTable {
    pub fn new() -> Self {
        Self {
            slots: [const { None }; MAX_PROCESSES],
            current: 0,
            next_pid: 1,
        }
    }

    /// Allocate the first free slot for a new PCB.
    pub fn create(&mut self, name: &str, parent: Pid, now: u64) -> KernelResult<Pid> {
        let slot = self
            .slots
            .iter()
            .position(|s| s.is_none())
            .ok_or(KernelError::ResourceExhausted {
                resource: "process table",
            })?;
        let pid = Pid(self.next_pid);
        self.next_pid += 1;
        self.slots[slot] = Some(Box::new(Process::new(pid, parent, name, now)));
        log::info!("created process {} ({})", pid, name);
        Ok(pid)
    }

    pub fn get(&self, pid: Pid) -> Option<&Process> {
        if pid.0 == 0 {
            return None;
        }
        self.slots
            .iter()
            .flatten()
            .find(|p| p.pid == pid)
            .map(|p| &**p)
    }

    pub fn get_mut(&mut self, pid: Pid) -> Option<&mut Process> {
        if pid.0 == 0 {
            return None;
        }
        self.slots
            .iter_mut()
            .flatten()
            .find(|p| p.pid == pid)
            .map(|p| &mut **p)
    }

    /// Remove a PCB, freeing its slot.
    pub fn remove(&mut self, pid: Pid) -> Option<Box<Process>> {
        let slot = self.slot_of(pid)?;
        self.slots[slot].take()
    }

    pub fn slot_of(&self, pid: Pid) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.as_ref().is_some_and(|p| p.pid == pid))
    }

    pub fn by_index(&self, index: usize) -> Option<&Process> {
        self.slots.get(index)?.as_deref()
    }

    pub fn by_index_mut(&mut self, index: usize) -> Option<&mut Process> {
        self.slots.get_mut(index)?.as_deref_mut()
    }

    pub fn current_index(&self) -> usize {
        self.current
    }

    pub fn set_current(&mut self, index: usize) {
        self.current = index;
    }

    pub fn current(&self) -> Option<&Process> {
        self.by_index(self.current)
    }

    pub fn current_mut(&mut self) -> Option<&mut Process> {
        self.by_index_mut(self.current)
    }

    pub fn current_pid(&self) -> Option<Pid> {
        self.current().map(|p| p.pid)
    }

    /// Number of live processes.
    pub fn count(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub fn pids(&self) -> Vec<Pid> {
        self.slots.iter().flatten().map(|p| p.pid).collect()
    }

    /// Pids of every member of a process group.
    pub fn group_members(&self, pgid: u64) -> Vec<Pid> {
        self.slots
            .iter()
            .flatten()
            .filter(|p| p.process_group == pgid)
            .map(|p| p.pid)
            .collect()
    }

    /// Children of `parent`, in slot order.
    pub fn children_of(&self, parent: Pid) -> Vec<Pid> {
        self.slots
            .iter()
            .flatten()
            .filter(|p| p.parent == parent)
            .map(|p| p.pid)
            .collect()
    }

    /// Rewrite the parent of every child of `pid` to `init`.
    pub fn reparent_children(&mut self, pid: Pid) {
        for slot in self.slots.iter_mut().flatten() {
            if slot.parent == pid {
                slot.parent = INIT_PID;
            }
        }
    }

    /// Assign a process to a group; `pgid == 0` means "its own pid".
    pub fn set_process_group(&mut self, pid: Pid, pgid: u64) -> KernelResult<()> {
        let process = self
            .get_mut(pid)
            .ok_or(KernelError::ProcessNotFound { pid: pid.0 })?;
        process.process_group = if pgid == 0 { pid.0 } else { pgid };
        Ok(())
    }

    /// Make `pid` a session and group leader. Fails for processes that
    /// already lead their group.
    pub fn create_session(&mut self, pid: Pid) -> KernelResult<u64> {
        let process = self
            .get_mut(pid)
            .ok_or(KernelError::ProcessNotFound { pid: pid.0 })?;
        if process.pid.0 == process.process_group {
            return Err(KernelError::InvalidState {
                expected: "non-leader",
                actual: "process group leader",
            });
        }
        process.process_group = pid.0;
        process.session_id = pid.0;
        Ok(pid.0)
    }

    /// A process group is orphaned when no member has a parent in the
    /// same session.
    pub fn is_orphaned_group(&self, pgid: u64) -> bool {
        for member in self.slots.iter().flatten() {
            if member.process_group != pgid {
                continue;
            }
            if let Some(parent) = self.get(member.parent) {
                if parent.session_id == member.session_id {
                    return false;
                }
            }
        }
        true
    }

    /// Exactly-one-running invariant probe, used by tests and assertions.
    pub fn running_count(&self) -> usize {
        self.slots
            .iter()
            .flatten()
            .filter(|p| p.state == ProcessState::Running)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pids_are_monotonic_and_slots_reusable() {
        let mut table = ProcessTable::new();
        let a = table.create("a", Pid(0), 0).unwrap();
        let b = table.create("b", Pid(0), 0).unwrap();
        assert_eq!(a, Pid(1));
        assert_eq!(b, Pid(2));

        table.remove(a).unwrap();
        let c = table.create("c", Pid(0), 0).unwrap();
        // Slot is reused, pid is not.
        assert_eq!(c, Pid(3));
        assert_eq!(table.slot_of(c), Some(0));
    }

    #[test]
    fn table_full_is_reported() {
        let mut table = ProcessTable::new();
        for i in 0..MAX_PROCESSES {
            table.create("p", Pid(0), i as u64).unwrap();
        }
        let err = table.create("overflow", Pid(0), 0).unwrap_err();
        assert!(matches!(err, KernelError::ResourceExhausted { .. }));
    }

    #[test]
    fn reparenting_moves_children_to_init() {
        let mut table = ProcessTable::new();
        let init = table.create("init", Pid(0), 0).unwrap();
        let parent = table.create("parent", init, 0).unwrap();
        let child = table.create("child", parent, 0).unwrap();

        table.reparent_children(parent);
        assert_eq!(table.get(child).unwrap().parent, INIT_PID);
    }

    #[test]
    fn group_and_session_rules() {
        let mut table = ProcessTable::new();
        let leader = table.create("leader", Pid(0), 0).unwrap();
        let member = table.create("member", leader, 0).unwrap();

        // pgid 0 means "own pid".
        table.set_process_group(member, 0).unwrap();
        assert_eq!(table.get(member).unwrap().process_group, member.0);

        // A fresh process leads its own group, so setsid must fail...
        assert!(table.create_session(leader).is_err());

        // ...until it joins another group.
        table.set_process_group(leader, member.0).unwrap();
        let sid = table.create_session(leader).unwrap();
        assert_eq!(sid, leader.0);
        assert_eq!(table.get(leader).unwrap().process_group, leader.0);
    }

    #[test]
    fn orphaned_group_detection() {
        let mut table = ProcessTable::new();
        let init = table.create("init", Pid(0), 0).unwrap();
        let leader = table.create("leader", init, 0).unwrap();
        let member = table.create("member", leader, 0).unwrap();
        table.set_process_group(member, leader.0).unwrap();
        // Put the whole tree in one session, as fork inheritance would.
        for pid in [leader, member] {
            table.get_mut(pid).unwrap().session_id = init.0;
        }
        table.get_mut(init).unwrap().session_id = init.0;

        // The leader's parent (init) shares the session: not orphaned.
        assert!(!table.is_orphaned_group(leader.0));

        // Once the in-session parents are gone, the group is orphaned.
        table.remove(init);
        table.remove(leader);
        assert!(table.is_orphaned_group(leader.0));
    }

    #[test]
    fn group_members_collects_the_whole_group() {
        let mut table = ProcessTable::new();
        let a = table.create("a", Pid(0), 0).unwrap();
        let b = table.create("b", a, 0).unwrap();
        let c = table.create("c", a, 0).unwrap();
        table.set_process_group(b, a.0).unwrap();
        table.set_process_group(c, a.0).unwrap();

        let members = table.group_members(a.0);
        assert_eq!(members.len(), 3);
        assert!(members.contains(&a) && members.contains(&b) && members.contains(&c));
    }
}
