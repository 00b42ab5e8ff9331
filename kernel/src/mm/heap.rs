//! Kernel heap
//!
//! Page-granular kernel allocations: `kmalloc_pages` hands out virtually
//! contiguous kernel addresses from the VMM's monotonic cursor and backs
//! each page with whatever frame the allocator returns, so physical
//! contiguity is never guaranteed. On bare metal a slice of this region
//! seeds the `linked_list_allocator` heap behind `alloc`.

use super::{FrameAllocator, PageFlags, VirtualAddress, Vmm, PAGE_SIZE};
use crate::error::{KernelError, KernelResult};

/// Pages given to the `alloc` heap at boot (4 MiB).
pub const KERNEL_HEAP_PAGES: usize = 1024;

/// Allocate `count` virtually contiguous kernel pages.
pub fn kmalloc_pages(
    vmm: &mut Vmm,
    pmm: &mut FrameAllocator,
    count: usize,
) -> KernelResult<VirtualAddress> {
    if count == 0 {
        return Err(KernelError::InvalidArgument {
            name: "count",
            value: "zero pages requested",
        });
    }
    let start = vmm.heap_cursor_advance(count);
    let kernel_root = vmm.kernel_root();
    for i in 0..count {
        let virt = VirtualAddress::new(start.as_u64() + (i * PAGE_SIZE) as u64);
        let frame = match pmm.alloc_page() {
            Ok(f) => f,
            Err(e) => {
                kfree_pages(vmm, pmm, start, i);
                return Err(e);
            }
        };
        if let Err(e) = vmm.map_in(kernel_root, frame, virt, PageFlags::WRITABLE, pmm) {
            let _ = pmm.free_page(frame);
            kfree_pages(vmm, pmm, start, i);
            return Err(e);
        }
    }
    Ok(start)
}

/// Allocate one kernel page.
pub fn kmalloc_page(vmm: &mut Vmm, pmm: &mut FrameAllocator) -> KernelResult<VirtualAddress> {
    kmalloc_pages(vmm, pmm, 1)
}

/// Unmap and free `count` pages starting at `addr`.
pub fn kfree_pages(vmm: &mut Vmm, pmm: &mut FrameAllocator, addr: VirtualAddress, count: usize) {
    let kernel_root = vmm.kernel_root();
    for i in 0..count {
        let virt = VirtualAddress::new(addr.as_u64() + (i * PAGE_SIZE) as u64);
        match vmm.unmap_in(kernel_root, virt) {
            Some(frame) => {
                if let Err(e) = pmm.free_page(frame) {
                    log::warn!("kfree: {}", e);
                }
            }
            None => log::warn!("kfree: no mapping at {:#x}", virt.as_u64()),
        }
    }
}

/// Free one kernel page.
pub fn kfree_page(vmm: &mut Vmm, pmm: &mut FrameAllocator, addr: VirtualAddress) {
    kfree_pages(vmm, pmm, addr, 1);
}

/// Map the boot heap and hand it to the global allocator.
#[cfg(target_os = "none")]
pub fn init_kernel_heap(vmm: &mut Vmm, pmm: &mut FrameAllocator) -> KernelResult<()> {
    let start = kmalloc_pages(vmm, pmm, KERNEL_HEAP_PAGES)?;
    // SAFETY: the range was just mapped writable in the kernel root and
    // is handed to the allocator exactly once at boot.
    unsafe {
        crate::allocator()
            .lock()
            .init(start.as_u64() as *mut u8, KERNEL_HEAP_PAGES * PAGE_SIZE);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimMachine;

    #[test]
    fn kmalloc_is_virtually_contiguous_and_mapped() {
        let sim = SimMachine::new(16 * 1024 * 1024);
        let mut pmm = FrameAllocator::init(&sim.regions, sim.window).unwrap();
        let root = pmm.alloc_page().unwrap();
        let mut vmm = Vmm::new(sim.window, root);

        let region = kmalloc_pages(&mut vmm, &mut pmm, 4).unwrap();
        assert_eq!(region.as_u64(), super::super::KERNEL_BASE);
        for i in 0..4u64 {
            let virt = VirtualAddress::new(region.as_u64() + i * PAGE_SIZE as u64);
            assert!(vmm.translate(virt).is_some());
        }

        let next = kmalloc_page(&mut vmm, &mut pmm).unwrap();
        assert_eq!(next.as_u64(), region.as_u64() + 4 * PAGE_SIZE as u64);
    }

    #[test]
    fn kfree_returns_frames_to_the_allocator() {
        let sim = SimMachine::new(16 * 1024 * 1024);
        let mut pmm = FrameAllocator::init(&sim.regions, sim.window).unwrap();
        let root = pmm.alloc_page().unwrap();
        let mut vmm = Vmm::new(sim.window, root);

        let free_before = pmm.free_frames();
        let region = kmalloc_pages(&mut vmm, &mut pmm, 3).unwrap();
        assert!(pmm.free_frames() < free_before);
        kfree_pages(&mut vmm, &mut pmm, region, 3);
        // The three interior table frames (PDPT, PD, PT) created on first
        // use stay allocated; only the leaf frames come back.
        assert_eq!(pmm.free_frames(), free_before - 3);
    }
}
