//! The kernel context
//!
//! Every kernel-wide table lives in one [`Kernel`] value: the frame
//! allocator, the VMM, the process and pipe tables, the open-file table,
//! and the mounted volume. Subsystems receive the context (or the fields
//! they need) explicitly; the only global is the boot holder below, which
//! interrupt handlers go through.
//!
//! Initialization order: frame allocator, VMM (heap tables pre-created so
//! later user spaces share them), kernel heap, process/pipe/file tables,
//! then optionally the FAT32 mount.

use alloc::boxed::Box;

use spin::{Mutex, Once};

use crate::{
    error::{FsError, KernelResult},
    fs::{blockdev::BlockDevice, fat32::Fat32Volume, pipe::PipeTable, OpenFileTable},
    mm::{FrameAllocator, MemoryRegion, PhysWindow, PhysicalAddress, Vmm},
    process::{Pid, ProcessTable},
};

/// Boot-time configuration.
#[derive(Debug, Clone, Copy)]
pub struct KernelConfig {
    /// PIT frequency in Hz, clamped to `[1, 1193]`.
    pub timer_hz: u32,
}

/// The kernel-wide state, constructed once at boot.
pub struct Kernel {
    pub pmm: FrameAllocator,
    pub vmm: Vmm,
    pub processes: ProcessTable,
    pub pipes: PipeTable,
    pub files: OpenFileTable,
    pub fs: Option<Fat32Volume>,
    /// Monotonic timer tick counter.
    pub ticks: u64,
    pub timer_hz: u32,
}

impl Kernel {
    /// Build the kernel context over a physical memory map.
    ///
    /// `kernel_root` is the live master page table on bare metal; passing
    /// `None` allocates a fresh (empty) master table, which is what the
    /// simulated machine does.
    pub fn init(
        window: PhysWindow,
        regions: &[MemoryRegion],
        kernel_root: Option<PhysicalAddress>,
        config: KernelConfig,
    ) -> KernelResult<Self> {
        let timer_hz = config.timer_hz.clamp(1, 1193);
        let mut pmm = FrameAllocator::init(regions, window)?;
        let root = match kernel_root {
            Some(root) => root,
            None => pmm.alloc_page()?,
        };
        let mut vmm = Vmm::new(window, root);
        vmm.ensure_kernel_heap_tables(&mut pmm)?;

        log::info!(
            "memory: {} MiB usable, {} MiB free",
            pmm.stats().total / (1024 * 1024),
            pmm.stats().free / (1024 * 1024)
        );

        Ok(Self {
            pmm,
            vmm,
            processes: ProcessTable::new(),
            pipes: PipeTable::new(),
            files: OpenFileTable::new(),
            fs: None,
            ticks: 0,
            timer_hz,
        })
    }

    /// Mount a FAT32 volume from a block device.
    pub fn mount(&mut self, dev: Box<dyn BlockDevice>) -> Result<(), FsError> {
        self.fs = Some(Fat32Volume::mount(dev)?);
        Ok(())
    }

    pub fn fs_mut(&mut self) -> Result<&mut Fat32Volume, FsError> {
        self.fs.as_mut().ok_or(FsError::NotMounted)
    }

    pub fn current_pid(&self) -> Option<Pid> {
        self.processes.current_pid()
    }
}

/// The boot kernel instance. Interrupt and syscall entry paths reach the
/// context through here; everything else receives it as a parameter.
static KERNEL: Once<Mutex<Kernel>> = Once::new();

/// Install the boot kernel. Called exactly once from the entry point.
pub fn install(kernel: Kernel) {
    KERNEL.call_once(|| Mutex::new(kernel));
}

/// Run `f` against the boot kernel with interrupts masked for the
/// duration of the lock.
pub fn with_kernel<R>(f: impl FnOnce(&mut Kernel) -> R) -> R {
    let Some(kernel) = KERNEL.get() else {
        panic!("kernel context used before install()");
    };

    #[cfg(target_os = "none")]
    {
        x86_64::instructions::interrupts::without_interrupts(|| f(&mut kernel.lock()))
    }
    #[cfg(not(target_os = "none"))]
    {
        f(&mut kernel.lock())
    }
}
