//! FerriteOS kernel entry point
//!
//! Boots to long mode via the bootloader, brings up the hardware layer
//! and the kernel context in order, mounts the FAT32 volume, loads the
//! shell, and transfers control to ring 3.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
mod boot {
    use bootloader_api::{
        config::Mapping,
        entry_point,
        info::{MemoryRegionKind as BootRegionKind, Optional},
        BootInfo, BootloaderConfig,
    };
    use core::panic::PanicInfo;

    use ferrite_kernel::{
        arch::{self, x86_64::pit, x86_64::usermode, x86_64::vga},
        drivers::ata::AtaDevice,
        kernel,
        logger,
        mm::{heap, MemoryRegion, PhysWindow, PhysicalAddress},
        println, serial_println,
        process::{lifecycle, scheduler, Pid},
        Kernel, KernelConfig,
    };

    extern crate alloc;
    use alloc::boxed::Box;

    /// Timer frequency requested at boot.
    const TIMER_HZ: u32 = 100;

    /// Program loaded as the first ring-3 process.
    const SHELL_PATH: &str = "SHELL";

    /// Largest LBA the 28-bit PIO driver can address.
    const ATA_MAX_SECTORS: u64 = 0x0FFF_FFFF;

    const MAX_BOOT_REGIONS: usize = 128;

    pub static BOOTLOADER_CONFIG: BootloaderConfig = {
        let mut config = BootloaderConfig::new_default();
        config.mappings.physical_memory = Some(Mapping::Dynamic);
        config
    };

    entry_point!(kernel_main, config = &BOOTLOADER_CONFIG);

    fn kernel_main(boot_info: &'static mut BootInfo) -> ! {
        logger::init();
        vga::init();
        println!("FerriteOS v{}", env!("CARGO_PKG_VERSION"));

        arch::init();
        let timer_hz = pit::init(TIMER_HZ);

        let Optional::Some(phys_offset) = boot_info.physical_memory_offset else {
            panic!("bootloader did not map physical memory");
        };
        let window = PhysWindow::new(phys_offset);

        // Collapse the boot memory map into the kernel's region format.
        let mut regions = [MemoryRegion::reserved(0, 0); MAX_BOOT_REGIONS];
        let mut count = 0;
        for region in boot_info.memory_regions.iter() {
            if count == MAX_BOOT_REGIONS {
                break;
            }
            let size = region.end - region.start;
            regions[count] = match region.kind {
                BootRegionKind::Usable => MemoryRegion::usable(region.start, size),
                _ => MemoryRegion::reserved(region.start, size),
            };
            count += 1;
        }

        let kernel_root = {
            use x86_64::registers::control::Cr3;
            PhysicalAddress::new(Cr3::read().0.start_address().as_u64())
        };

        let mut kernel = match Kernel::init(
            window,
            &regions[..count],
            Some(kernel_root),
            KernelConfig { timer_hz },
        ) {
            Ok(kernel) => kernel,
            Err(e) => panic!("kernel init failed: {}", e),
        };
        if let Err(e) = heap::init_kernel_heap(&mut kernel.vmm, &mut kernel.pmm) {
            panic!("heap init failed: {}", e);
        }

        // Storage and the root volume are optional; the kernel idles
        // without them.
        match kernel.mount(Box::new(AtaDevice::new(ATA_MAX_SECTORS))) {
            Ok(()) => spawn_shell(&mut kernel),
            Err(e) => log::warn!("no root volume: {:?}", e),
        }

        serial_println!(
            "boot complete: {} processes, {} ticks/s",
            kernel.processes.count(),
            kernel.timer_hz
        );
        kernel::install(kernel);

        kernel::with_kernel(scheduler::schedule);
        usermode::enter_current();
    }

    fn spawn_shell(kernel: &mut Kernel) {
        match lifecycle::read_program(kernel, SHELL_PATH) {
            Ok(image) => match lifecycle::spawn_user(kernel, "shell", Pid(0), &image) {
                Ok(pid) => log::info!("shell loaded as pid {}", pid),
                Err(e) => log::warn!("shell spawn failed: {}", e),
            },
            Err(e) => log::warn!("no {} on the volume: {}", SHELL_PATH, e),
        }
    }

    #[panic_handler]
    fn panic(info: &PanicInfo) -> ! {
        vga::set_color(vga::Color::LightRed, vga::Color::Black);
        println!("[KERNEL PANIC] {}", info);
        serial_println!("[KERNEL PANIC] {}", info);
        arch::halt();
    }
}

#[cfg(not(target_os = "none"))]
fn main() {
    // The kernel binary only targets bare metal; the host build exists
    // so `cargo test` can exercise the library.
}
