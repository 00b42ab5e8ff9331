//! Process lifecycle
//!
//! Spawning, forking, program replacement, exit, and child reaping. All
//! of these orchestrate several kernel tables at once, so they operate on
//! the whole [`Kernel`] context.

use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

use crate::{
    elf,
    error::{FsError, KernelError, KernelResult},
    kernel::Kernel,
    mm::heap,
    process::{scheduler, signals, Descriptor, Pid, ProcessState},
};

/// Pages in each per-process kernel stack (16 KiB).
pub const KERNEL_STACK_PAGES: usize = 4;

/// Create a process in the Ready state with a kernel stack.
///
/// The new PCB has no user address space yet; `spawn_user`, `fork` or
/// `exec` installs one.
pub fn spawn(kernel: &mut Kernel, name: &str, parent: Pid) -> KernelResult<Pid> {
    let now = kernel.ticks;
    let pid = kernel.processes.create(name, parent, now)?;
    match heap::kmalloc_pages(&mut kernel.vmm, &mut kernel.pmm, KERNEL_STACK_PAGES) {
        Ok(stack) => {
            if let Some(p) = kernel.processes.get_mut(pid) {
                p.kernel_stack = Some(stack);
                p.kernel_stack_pages = KERNEL_STACK_PAGES;
            }
            Ok(pid)
        }
        Err(e) => {
            kernel.processes.remove(pid);
            Err(e)
        }
    }
}

/// Spawn a process from an in-memory ELF image.
pub fn spawn_user(kernel: &mut Kernel, name: &str, parent: Pid, image: &[u8]) -> KernelResult<Pid> {
    let pid = spawn(kernel, name, parent)?;
    match elf::load_image(&mut kernel.vmm, &mut kernel.pmm, image) {
        Ok(loaded) => {
            if let Some(p) = kernel.processes.get_mut(pid) {
                p.address_space = Some(loaded.space);
                p.regs.rip = loaded.entry;
                p.regs.rsp = loaded.stack_top;
                p.regs.rflags = 0x202;
            }
            Ok(pid)
        }
        Err(e) => {
            release_slot(kernel, pid);
            Err(e)
        }
    }
}

/// Clone the current process.
///
/// The child is a READY copy: registers (with RAX forced to 0 so the
/// child observes a 0 return), an eagerly copied user address space,
/// signal dispositions, pending and blocked sets, the descriptor table
/// (pipe ends and open files gain a reference), and the job-control ids.
pub fn fork(kernel: &mut Kernel) -> KernelResult<Pid> {
    let parent_pid = kernel
        .processes
        .current_pid()
        .ok_or(KernelError::InvalidState {
            expected: "a current process",
            actual: "none",
        })?;

    let (name, space, regs, pending, blocked, actions, fds, pgid, sid, tty, exit_signal) = {
        let parent = kernel
            .processes
            .get(parent_pid)
            .ok_or(KernelError::ProcessNotFound { pid: parent_pid.0 })?;
        let space = parent.address_space.ok_or(KernelError::InvalidState {
            expected: "user process",
            actual: "kernel-mode process",
        })?;
        (
            parent.name.clone(),
            space,
            parent.regs,
            parent.pending_signals,
            parent.blocked_signals,
            parent.signal_actions,
            parent.fds,
            parent.process_group,
            parent.session_id,
            parent.tty,
            parent.exit_signal,
        )
    };

    let child_pid = spawn(kernel, &name, parent_pid)?;
    let child_space = match kernel.vmm.clone_user_space(&space, &mut kernel.pmm) {
        Ok(s) => s,
        Err(e) => {
            release_slot(kernel, child_pid);
            return Err(e);
        }
    };

    // Duplicated descriptors add a reference to the objects they name.
    for fd in fds.iter() {
        match *fd {
            Descriptor::PipeRead { pipe, .. } => kernel.pipes.retain_read(pipe),
            Descriptor::PipeWrite { pipe, .. } => kernel.pipes.retain_write(pipe),
            Descriptor::File { slot } => kernel.files.retain(slot),
            _ => {}
        }
    }

    if let Some(child) = kernel.processes.get_mut(child_pid) {
        child.address_space = Some(child_space);
        child.regs = regs;
        child.regs.rax = 0;
        child.pending_signals = pending;
        child.blocked_signals = blocked;
        child.signal_actions = actions;
        child.fds = fds;
        child.process_group = pgid;
        child.session_id = sid;
        child.tty = tty;
        child.exit_signal = exit_signal;
    }
    log::info!("fork: {} -> {}", parent_pid, child_pid);
    Ok(child_pid)
}

/// Read an entire file off the mounted volume.
pub fn read_program(kernel: &mut Kernel, path: &str) -> KernelResult<Vec<u8>> {
    let fs = kernel.fs.as_mut().ok_or(FsError::NotMounted)?;
    let mut file = fs.open(path)?;
    if file.entry.is_dir {
        return Err(FsError::IsADirectory.into());
    }
    let mut data = vec![0u8; file.entry.size as usize];
    let mut read = 0usize;
    while read < data.len() {
        let n = fs.read(&mut file, &mut data[read..])?;
        if n == 0 {
            break;
        }
        read += n;
    }
    data.truncate(read);
    Ok(data)
}

/// Replace the current process image from an ELF64 file on the volume.
///
/// The old user address space is torn down, caught signal dispositions
/// reset to default (ignored ones stay ignored), and the saved context
/// restarted at the new entry point. The descriptor table survives.
pub fn exec(kernel: &mut Kernel, path: &str) -> KernelResult<()> {
    let pid = kernel
        .processes
        .current_pid()
        .ok_or(KernelError::InvalidState {
            expected: "a current process",
            actual: "none",
        })?;

    let image = read_program(kernel, path)?;
    let loaded = elf::load_image(&mut kernel.vmm, &mut kernel.pmm, &image)?;

    let old_space = {
        let Some(p) = kernel.processes.get_mut(pid) else {
            kernel.vmm.destroy_user_space(&loaded.space, &mut kernel.pmm);
            return Err(KernelError::ProcessNotFound { pid: pid.0 });
        };
        let old = p.address_space.replace(loaded.space);

        p.regs = Default::default();
        p.regs.rip = loaded.entry;
        p.regs.rsp = loaded.stack_top;
        p.regs.rflags = 0x202;

        let mut name = String::from(path.trim_start_matches('/'));
        name.truncate(crate::process::NAME_MAX);
        p.name = name;

        for action in p.signal_actions.iter_mut() {
            if action.handler != signals::SIG_DFL && action.handler != signals::SIG_IGN {
                action.handler = signals::SIG_DFL;
            }
        }
        p.handling_signal = false;
        p.saved_sigmask = None;
        old
    };

    if let Some(old) = old_space {
        kernel.vmm.destroy_user_space(&old, &mut kernel.pmm);
    }
    log::info!("exec: {} now runs {}", pid, path);
    Ok(())
}

/// Close one descriptor, waking pipe waiters as needed.
pub fn close_descriptor(kernel: &mut Kernel, descriptor: Descriptor) {
    match descriptor {
        Descriptor::PipeRead { pipe, .. } => {
            for pid in kernel.pipes.close_read(pipe) {
                scheduler::unblock_process(&mut kernel.processes, pid);
            }
        }
        Descriptor::PipeWrite { pipe, .. } => {
            for pid in kernel.pipes.close_write(pipe) {
                scheduler::unblock_process(&mut kernel.processes, pid);
            }
        }
        Descriptor::File { slot } => {
            if let Err(e) = kernel.files.close(slot) {
                log::warn!("closing file slot {}: {:?}", slot, e);
            }
        }
        _ => {}
    }
}

/// Free the memory resources of a PCB and drop its slot entirely.
/// Used on construction failures, before the process ever ran.
fn release_slot(kernel: &mut Kernel, pid: Pid) {
    teardown_resources(kernel, pid);
    kernel.processes.remove(pid);
}

/// Close descriptors and free the address space and kernel stack.
fn teardown_resources(kernel: &mut Kernel, pid: Pid) {
    let Some(p) = kernel.processes.get_mut(pid) else {
        return;
    };
    let fds = core::mem::replace(&mut p.fds, [Descriptor::None; crate::process::MAX_FDS]);
    let space = p.address_space.take();
    let stack = p.kernel_stack.take();
    let stack_pages = core::mem::take(&mut p.kernel_stack_pages);

    for fd in fds {
        close_descriptor(kernel, fd);
    }
    if let Some(space) = space {
        kernel.vmm.destroy_user_space(&space, &mut kernel.pmm);
    }
    if let Some(stack) = stack {
        heap::kfree_pages(&mut kernel.vmm, &mut kernel.pmm, stack, stack_pages);
    }
}

/// Terminate a process.
///
/// Sends the exit signal (normally SIGCHLD) to the parent, reparents
/// children to `init`, releases descriptors, the user address space and
/// the kernel stack, and leaves the slot as a ZOMBIE holding the exit
/// code until the parent reaps it with `wait`.
pub fn exit_process(kernel: &mut Kernel, pid: Pid, code: i32) {
    let Some(p) = kernel.processes.get(pid) else {
        return;
    };
    if p.state == ProcessState::Zombie {
        return;
    }
    let parent = p.parent;
    let exit_signal = p.exit_signal;

    teardown_resources(kernel, pid);
    kernel.processes.reparent_children(pid);

    if let Some(p) = kernel.processes.get_mut(pid) {
        p.state = ProcessState::Zombie;
        p.exit_code = code;
        p.pending_signals = 0;
    }
    log::info!("process {} exited with code {}", pid, code);

    if parent.0 != 0 && exit_signal != 0 {
        let _ = signals::send(kernel, parent, exit_signal);
    }
}

/// Outcome of a `wait` attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    /// A zombie child was reaped; its slot is free again.
    Reaped { pid: Pid, status: i32 },
    /// The caller has no children at all.
    NoChildren,
    /// Children exist but none has exited yet.
    ShouldBlock,
}

/// Reap the first zombie child of `parent`, freeing its PCB slot.
pub fn wait_for_child(kernel: &mut Kernel, parent: Pid) -> WaitResult {
    let children = kernel.processes.children_of(parent);
    if children.is_empty() {
        return WaitResult::NoChildren;
    }
    for child in children {
        let is_zombie = kernel
            .processes
            .get(child)
            .is_some_and(|p| p.state == ProcessState::Zombie);
        if is_zombie {
            let status = kernel
                .processes
                .get(child)
                .map(|p| p.exit_code)
                .unwrap_or(0);
            kernel.processes.remove(child);
            return WaitResult::Reaped { pid: child, status };
        }
    }
    WaitResult::ShouldBlock
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        fs::RamBlockDevice,
        mm::USER_BASE,
        process::signals::{SIGCHLD, SIGTERM},
        sim::{format_fat32, tiny_exec, SimMachine},
    };
    use alloc::boxed::Box;

    fn kernel_with_user_process() -> (SimMachine, crate::kernel::Kernel, Pid) {
        let sim = SimMachine::new(32 * 1024 * 1024);
        let mut kernel = sim.kernel();
        let image = tiny_exec(USER_BASE, b"\x90\x90\x90\x90", 64);
        let pid = spawn_user(&mut kernel, "init", Pid(0), &image).unwrap();
        let idx = kernel.processes.slot_of(pid).unwrap();
        kernel.processes.set_current(idx);
        (sim, kernel, pid)
    }

    #[test]
    fn spawn_allocates_a_kernel_stack() {
        let sim = SimMachine::new(16 * 1024 * 1024);
        let mut kernel = sim.kernel();
        let pid = spawn(&mut kernel, "worker", Pid(0)).unwrap();
        let p = kernel.processes.get(pid).unwrap();
        assert!(p.kernel_stack.is_some());
        assert_eq!(p.kernel_stack_pages, KERNEL_STACK_PAGES);
        assert_eq!(p.state, ProcessState::Ready);
    }

    #[test]
    fn fork_clones_context_and_memory() {
        let (_sim, mut kernel, parent) = kernel_with_user_process();
        {
            let p = kernel.processes.get_mut(parent).unwrap();
            p.regs.rax = 1234;
            p.regs.rbx = 77;
            p.blocked_signals = 1 << SIGTERM;
            signals::set_handler(p, SIGTERM, 0x41_0000).unwrap();
        }

        let child = fork(&mut kernel).unwrap();
        let c = kernel.processes.get(child).unwrap();
        assert_eq!(c.parent, parent);
        assert_eq!(c.regs.rax, 0, "child observes fork() == 0");
        assert_eq!(c.regs.rbx, 77);
        assert_eq!(c.blocked_signals, 1 << SIGTERM);
        assert_eq!(c.signal_actions[SIGTERM as usize].handler, 0x41_0000);
        assert_ne!(
            c.address_space.unwrap().root,
            kernel.processes.get(parent).unwrap().address_space.unwrap().root
        );
    }

    #[test]
    fn fork_of_kernel_process_is_rejected() {
        let sim = SimMachine::new(16 * 1024 * 1024);
        let mut kernel = sim.kernel();
        let pid = spawn(&mut kernel, "kthread", Pid(0)).unwrap();
        let idx = kernel.processes.slot_of(pid).unwrap();
        kernel.processes.set_current(idx);
        assert!(matches!(
            fork(&mut kernel).unwrap_err(),
            KernelError::InvalidState { .. }
        ));
    }

    #[test]
    fn exit_reparents_notifies_and_zombifies() {
        let (_sim, mut kernel, init) = kernel_with_user_process();
        let parent = spawn(&mut kernel, "parent", init).unwrap();
        let child = spawn(&mut kernel, "child", parent).unwrap();

        exit_process(&mut kernel, parent, 3);

        let p = kernel.processes.get(parent).unwrap();
        assert_eq!(p.state, ProcessState::Zombie);
        assert_eq!(p.exit_code, 3);
        assert!(p.kernel_stack.is_none());

        // Child adopted by init, init got SIGCHLD.
        assert_eq!(kernel.processes.get(child).unwrap().parent, Pid(1));
        assert_ne!(
            kernel.processes.get(init).unwrap().pending_signals & (1 << SIGCHLD),
            0
        );
    }

    #[test]
    fn wait_reaps_and_frees_the_slot() {
        let (_sim, mut kernel, init) = kernel_with_user_process();
        let child = spawn(&mut kernel, "child", init).unwrap();

        assert_eq!(wait_for_child(&mut kernel, init), WaitResult::ShouldBlock);
        exit_process(&mut kernel, child, 143);
        assert_eq!(
            wait_for_child(&mut kernel, init),
            WaitResult::Reaped {
                pid: child,
                status: 143
            }
        );
        assert!(kernel.processes.get(child).is_none());
        assert_eq!(wait_for_child(&mut kernel, init), WaitResult::NoChildren);
    }

    #[test]
    fn exit_frames_are_returned_to_the_allocator() {
        let sim = SimMachine::new(32 * 1024 * 1024);
        let mut kernel = sim.kernel();
        let watcher = spawn(&mut kernel, "watcher", Pid(0)).unwrap();
        let _ = watcher;

        let free_before = kernel.pmm.free_frames();
        let image = tiny_exec(USER_BASE, b"\x90", 0);
        let pid = spawn_user(&mut kernel, "short", Pid(0), &image).unwrap();
        exit_process(&mut kernel, pid, 0);
        kernel.processes.remove(pid);
        // Everything except interior kernel page-table frames comes back.
        assert!(kernel.pmm.free_frames() >= free_before - 3);
    }

    #[test]
    fn exec_replaces_the_image() {
        let (_sim, mut kernel, pid) = kernel_with_user_process();

        let mut disk = RamBlockDevice::new(8192);
        format_fat32(&mut disk).unwrap();
        kernel.mount(Box::new(disk)).unwrap();

        // Put a program on the volume.
        let image = tiny_exec(USER_BASE + 0x1000, b"\xCC\xCC", 0);
        {
            let fs = kernel.fs_mut().unwrap();
            let mut f = fs.create("shell").unwrap();
            fs.write(&mut f, &image).unwrap();
        }

        let old_root = kernel.processes.get(pid).unwrap().address_space.unwrap().root;
        {
            let p = kernel.processes.get_mut(pid).unwrap();
            signals::set_handler(p, SIGTERM, 0x41_0000).unwrap();
        }

        exec(&mut kernel, "shell").unwrap();

        let p = kernel.processes.get(pid).unwrap();
        assert_eq!(p.regs.rip, USER_BASE + 0x1000);
        assert_ne!(p.address_space.unwrap().root, old_root);
        assert_eq!(p.name, "shell");
        // Caught handlers reset to default on exec.
        assert_eq!(p.signal_actions[SIGTERM as usize].handler, signals::SIG_DFL);
    }

    #[test]
    fn exec_of_missing_file_fails_cleanly() {
        let (_sim, mut kernel, pid) = kernel_with_user_process();
        let mut disk = RamBlockDevice::new(8192);
        format_fat32(&mut disk).unwrap();
        kernel.mount(Box::new(disk)).unwrap();

        let old_root = kernel.processes.get(pid).unwrap().address_space.unwrap().root;
        let err = exec(&mut kernel, "nosuch").unwrap_err();
        assert_eq!(err.code(), -2);
        // The old image is untouched.
        assert_eq!(
            kernel.processes.get(pid).unwrap().address_space.unwrap().root,
            old_root
        );
    }
}
