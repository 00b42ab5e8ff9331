//! Shared fixture for the integration tests: a simulated machine plus
//! helpers that drive the kernel the way the trap layer does, one
//! syscall dispatch at a time.

#![allow(dead_code)]

use ferrite_kernel::{
    fs::RamBlockDevice,
    kernel::Kernel,
    mm::{user_access, PageFlags, VirtualAddress, PAGE_SIZE, USER_BASE},
    process::{lifecycle, scheduler, Pid, ProcessState},
    sim::{format_fat32, tiny_exec, SimMachine},
    syscall::{self, Syscall},
};

/// RIP planted before each simulated `int 0x80`; a blocked call rewinds
/// it by the instruction length.
pub const FAKE_RIP: u64 = USER_BASE + 0x100;

/// Scratch user memory is mapped upward from here.
const SCRATCH_BASE: u64 = USER_BASE + 0x20_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallStatus {
    Completed(i64),
    /// The process parked itself and the call will restart.
    Blocked,
}

impl SyscallStatus {
    pub fn value(self) -> i64 {
        match self {
            SyscallStatus::Completed(v) => v,
            SyscallStatus::Blocked => panic!("syscall blocked, no value"),
        }
    }
}

pub struct TestOs {
    pub sim: SimMachine,
    pub kernel: Kernel,
    scratch: u64,
}

impl TestOs {
    pub fn new() -> Self {
        let sim = SimMachine::new(64 * 1024 * 1024);
        let kernel = sim.kernel();
        Self {
            sim,
            kernel,
            scratch: SCRATCH_BASE,
        }
    }

    /// Machine with a formatted FAT32 RAM disk mounted.
    pub fn with_disk() -> Self {
        let mut os = Self::new();
        let mut disk = RamBlockDevice::new(8192);
        format_fat32(&mut disk).expect("format");
        os.kernel.mount(Box::new(disk)).expect("mount");
        os
    }

    /// Spawn a user process from a tiny ELF (code page + 64 KiB stack).
    pub fn spawn(&mut self, name: &str) -> Pid {
        let image = tiny_exec(USER_BASE, &[0x90u8; 16], 0);
        lifecycle::spawn_user(&mut self.kernel, name, Pid(0), &image).expect("spawn")
    }

    pub fn state(&self, pid: Pid) -> Option<ProcessState> {
        self.kernel.processes.get(pid).map(|p| p.state)
    }

    pub fn exit_code(&self, pid: Pid) -> i32 {
        self.kernel.processes.get(pid).expect("live process").exit_code
    }

    /// Map `len` bytes of fresh user memory into `pid`'s address space.
    pub fn user_buf(&mut self, pid: Pid, len: usize) -> u64 {
        let space = self
            .kernel
            .processes
            .get(pid)
            .and_then(|p| p.address_space)
            .expect("user process");
        let base = self.scratch;
        let pages = len.div_ceil(PAGE_SIZE).max(1);
        for i in 0..pages {
            self.kernel
                .vmm
                .alloc_user_page(
                    &space,
                    VirtualAddress::new(base + (i * PAGE_SIZE) as u64),
                    PageFlags::WRITABLE,
                    &mut self.kernel.pmm,
                )
                .expect("map scratch");
        }
        self.scratch += (pages * PAGE_SIZE) as u64 + PAGE_SIZE as u64;
        base
    }

    pub fn poke(&mut self, pid: Pid, addr: u64, bytes: &[u8]) {
        let space = self
            .kernel
            .processes
            .get(pid)
            .and_then(|p| p.address_space)
            .expect("user process");
        assert!(user_access::copy_to_user(
            &self.kernel.vmm,
            &space,
            addr,
            bytes
        ));
    }

    pub fn peek(&self, pid: Pid, addr: u64, len: usize) -> Vec<u8> {
        let space = self
            .kernel
            .processes
            .get(pid)
            .and_then(|p| p.address_space)
            .expect("user process");
        let mut buf = vec![0u8; len];
        assert!(user_access::copy_from_user(
            &self.kernel.vmm,
            &space,
            &mut buf,
            addr
        ));
        buf
    }

    pub fn peek_u64(&self, pid: Pid, addr: u64) -> u64 {
        let bytes = self.peek(pid, addr, 8);
        u64::from_le_bytes(bytes.try_into().unwrap())
    }

    /// Run one syscall as `pid`, exactly like the trap path: install the
    /// register arguments, dispatch, and inspect the saved context.
    pub fn syscall(&mut self, pid: Pid, call: Syscall, args: [u64; 5]) -> SyscallStatus {
        let idx = self.kernel.processes.slot_of(pid).expect("live pid");
        self.kernel.processes.set_current(idx);
        {
            let p = self.kernel.processes.get_mut(pid).expect("live pid");
            p.state = ProcessState::Running;
            p.regs.rax = call as u64;
            p.regs.rdi = args[0];
            p.regs.rsi = args[1];
            p.regs.rdx = args[2];
            p.regs.r10 = args[3];
            p.regs.r8 = args[4];
            p.regs.rip = FAKE_RIP;
        }
        syscall::dispatch(&mut self.kernel);

        let p = self.kernel.processes.get(pid).expect("pid survives dispatch");
        if p.regs.rip == FAKE_RIP - 2 {
            SyscallStatus::Blocked
        } else {
            SyscallStatus::Completed(p.regs.rax as i64)
        }
    }

    /// Re-run a blocked syscall after its wakeup, as the restarted
    /// `int 0x80` would.
    pub fn restart_syscall(&mut self, pid: Pid) -> SyscallStatus {
        let (call, args) = {
            let p = self.kernel.processes.get(pid).expect("live pid");
            (
                Syscall::try_from(p.regs.rax).expect("restart keeps the call number"),
                [p.regs.rdi, p.regs.rsi, p.regs.rdx, p.regs.r10, p.regs.r8],
            )
        };
        self.syscall(pid, call, args)
    }

    pub fn schedule(&mut self) {
        scheduler::schedule(&mut self.kernel);
    }

    pub fn tick(&mut self, n: u64) {
        for _ in 0..n {
            scheduler::timer_tick(&mut self.kernel);
        }
    }
}
