//! Virtual memory manager
//!
//! Walks and builds four-level page tables through the physical memory
//! window. One master table holds the kernel half; user address spaces are
//! created by copying the kernel-half entries (indices 256..511) so every
//! process shares the same kernel mappings while the user half stays
//! private.
//!
//! The walker always targets an explicit root, so operations on a foreign
//! address space never have to switch CR3. `alloc_user_page` still
//! retargets the active root for the duration of the mapping and restores
//! it on every exit path, since callers rely on the active space being
//! unchanged afterwards.

use alloc::vec::Vec;

use super::{
    page_table::{PageTable, VirtualAddressBreakdown},
    FrameAllocator, PageFlags, PageTableEntry, PhysWindow, PhysicalAddress, VirtualAddress,
    KERNEL_BASE, PAGE_SIZE, USER_BASE, USER_STACK_TOP,
};
use crate::error::{KernelError, KernelResult};

/// A user address space, identified by the physical address of its root
/// (PML4) table. The kernel half of the table is byte-identical to the
/// master kernel table; the user half is private.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressSpace {
    pub root: PhysicalAddress,
}

/// Index of the first kernel-half entry in a root table.
const KERNEL_HALF_START: usize = 256;

/// The virtual memory manager.
pub struct Vmm {
    window: PhysWindow,
    kernel_root: PhysicalAddress,
    active_root: PhysicalAddress,
    /// Monotonic cursor handing out kernel virtual addresses.
    heap_cursor: u64,
}

impl Vmm {
    /// Create a VMM around an existing master root table.
    pub fn new(window: PhysWindow, kernel_root: PhysicalAddress) -> Self {
        Self {
            window,
            kernel_root,
            active_root: kernel_root,
            heap_cursor: KERNEL_BASE,
        }
    }

    pub fn kernel_root(&self) -> PhysicalAddress {
        self.kernel_root
    }

    /// The physical memory window this VMM walks tables through.
    pub fn window(&self) -> PhysWindow {
        self.window
    }

    pub fn active_root(&self) -> PhysicalAddress {
        self.active_root
    }

    /// Borrow the page table at `pa`.
    ///
    /// # Safety
    ///
    /// `pa` must be the frame of a live page table reachable through the
    /// window, and the caller must not hold another reference to it.
    unsafe fn table_mut(&self, pa: PhysicalAddress) -> &'static mut PageTable {
        // SAFETY: delegated to the caller; PageTable is exactly one frame
        // and has alignment 4096, which frame addresses satisfy.
        unsafe { &mut *(self.window.ptr(pa) as *mut PageTable) }
    }

    /// Descend the four levels for `virt` under `root`, creating missing
    /// interior tables with `PRESENT | WRITABLE | extra`.
    fn walk_create(
        &mut self,
        root: PhysicalAddress,
        virt: VirtualAddress,
        extra: PageFlags,
        pmm: &mut FrameAllocator,
    ) -> KernelResult<&'static mut PageTableEntry> {
        let b = VirtualAddressBreakdown::new(virt);
        let mut table_pa = root;
        for index in [b.pml4_index, b.pdpt_index, b.pd_index] {
            // SAFETY: `table_pa` is the root the caller handed us or an
            // interior table reached through a present entry; no other
            // reference to it is live in this walk.
            let table = unsafe { self.table_mut(table_pa) };
            let entry = &mut table[index];
            if !entry.is_present() {
                let frame = pmm.alloc_page()?;
                entry.set(frame, PageFlags::PRESENT | PageFlags::WRITABLE | extra);
            }
            table_pa = match entry.addr() {
                Some(next) => next,
                None => return Err(KernelError::UnmappedMemory { addr: virt.as_u64() }),
            };
        }
        // SAFETY: as above; `table_pa` is now the level-1 table.
        let table = unsafe { self.table_mut(table_pa) };
        Ok(&mut table[b.pt_index])
    }

    /// Read-only descent; `None` when any interior level is missing.
    fn walk_lookup(
        &self,
        root: PhysicalAddress,
        virt: VirtualAddress,
    ) -> Option<&'static mut PageTableEntry> {
        let b = VirtualAddressBreakdown::new(virt);
        let mut table_pa = root;
        for index in [b.pml4_index, b.pdpt_index, b.pd_index] {
            // SAFETY: interior tables reached through present entries of a
            // live root; no other reference is held during the walk.
            let table = unsafe { self.table_mut(table_pa) };
            let entry = &table[index];
            if !entry.is_present() {
                return None;
            }
            table_pa = entry.addr()?;
        }
        // SAFETY: as above.
        let table = unsafe { self.table_mut(table_pa) };
        Some(&mut table[b.pt_index])
    }

    /// Map `virt` (page-aligned down) to `phys` under an explicit root.
    pub fn map_in(
        &mut self,
        root: PhysicalAddress,
        phys: PhysicalAddress,
        virt: VirtualAddress,
        flags: PageFlags,
        pmm: &mut FrameAllocator,
    ) -> KernelResult<()> {
        let virt = virt.align_down();
        let entry = self.walk_create(root, virt, flags & PageFlags::USER, pmm)?;
        if entry.is_present() {
            return Err(KernelError::AlreadyMapped { addr: virt.as_u64() });
        }
        entry.set(phys, flags | PageFlags::PRESENT);
        self.flush_tlb(virt);
        Ok(())
    }

    /// Map into the active address space.
    pub fn map(
        &mut self,
        phys: PhysicalAddress,
        virt: VirtualAddress,
        flags: PageFlags,
        pmm: &mut FrameAllocator,
    ) -> KernelResult<()> {
        self.map_in(self.active_root, phys, virt, flags, pmm)
    }

    /// Remove the mapping for `virt` under `root`, returning the frame it
    /// pointed to.
    pub fn unmap_in(
        &mut self,
        root: PhysicalAddress,
        virt: VirtualAddress,
    ) -> Option<PhysicalAddress> {
        let virt = virt.align_down();
        let entry = self.walk_lookup(root, virt)?;
        let frame = entry.addr()?;
        entry.clear();
        self.flush_tlb(virt);
        Some(frame)
    }

    /// Remove a mapping from the active address space.
    pub fn unmap(&mut self, virt: VirtualAddress) -> Option<PhysicalAddress> {
        self.unmap_in(self.active_root, virt)
    }

    /// Translate under an explicit root: `frame | page offset`.
    pub fn translate_in(
        &self,
        root: PhysicalAddress,
        virt: VirtualAddress,
    ) -> Option<PhysicalAddress> {
        let entry = self.walk_lookup(root, virt.align_down())?;
        let frame = entry.addr()?;
        Some(PhysicalAddress::new(frame.as_u64() | virt.page_offset()))
    }

    /// Translate through the active address space.
    pub fn translate(&self, virt: VirtualAddress) -> Option<PhysicalAddress> {
        self.translate_in(self.active_root, virt)
    }

    /// Allocate a zeroed root table and copy the kernel-half entries from
    /// the master table into it.
    pub fn create_user_space(&mut self, pmm: &mut FrameAllocator) -> KernelResult<AddressSpace> {
        let root = pmm.alloc_page()?;
        // SAFETY: `root` is a freshly allocated frame and `kernel_root` is
        // the live master table; the two never alias.
        let (new_table, master) = unsafe { (self.table_mut(root), self.table_mut(self.kernel_root)) };
        for i in KERNEL_HALF_START..super::PAGE_TABLE_ENTRIES {
            new_table[i] = master[i];
        }
        Ok(AddressSpace { root })
    }

    /// Install `root` as the active address space.
    pub fn switch_space(&mut self, root: PhysicalAddress) {
        self.active_root = root;
        #[cfg(target_os = "none")]
        {
            use x86_64::{
                registers::control::{Cr3, Cr3Flags},
                structures::paging::PhysFrame,
                PhysAddr,
            };
            // SAFETY: `root` is a live root table whose kernel half maps
            // the kernel image and heap, so execution continues after the
            // CR3 write.
            unsafe {
                Cr3::write(
                    PhysFrame::containing_address(PhysAddr::new(root.as_u64())),
                    Cr3Flags::empty(),
                );
            }
        }
    }

    /// Allocate a frame and map it at `virt` in a foreign address space.
    ///
    /// The walker is retargeted to `space` for the duration of the mapping
    /// and restored before returning, on success and on failure.
    pub fn alloc_user_page(
        &mut self,
        space: &AddressSpace,
        virt: VirtualAddress,
        flags: PageFlags,
        pmm: &mut FrameAllocator,
    ) -> KernelResult<VirtualAddress> {
        if virt.as_u64() >= KERNEL_BASE {
            return Err(KernelError::InvalidAddress { addr: virt.as_u64() });
        }
        let frame = pmm.alloc_page()?;

        let previous = self.active_root;
        self.active_root = space.root;
        let result = self.map(frame, virt, flags | PageFlags::USER, pmm);
        self.active_root = previous;

        match result {
            Ok(()) => Ok(virt.align_down()),
            Err(e) => {
                let _ = pmm.free_page(frame);
                Err(e)
            }
        }
    }

    /// True iff every page spanned by `[ptr, ptr+size)` is present, user
    /// accessible, writable when `write` is requested, and the whole range
    /// lies inside `[USER_BASE, USER_STACK_TOP)`.
    pub fn validate_user(&self, space: &AddressSpace, ptr: u64, size: usize, write: bool) -> bool {
        if ptr < USER_BASE {
            return false;
        }
        let Some(end) = ptr.checked_add(size as u64) else {
            return false;
        };
        if end > USER_STACK_TOP {
            return false;
        }
        if size == 0 {
            return true;
        }

        let first = ptr & !(PAGE_SIZE as u64 - 1);
        let last = (end - 1) & !(PAGE_SIZE as u64 - 1);
        let mut page = first;
        loop {
            match self.walk_lookup(space.root, VirtualAddress::new(page)) {
                Some(entry) if entry.is_present() => {
                    let flags = entry.flags();
                    if !flags.contains(PageFlags::USER) {
                        return false;
                    }
                    if write && !flags.contains(PageFlags::WRITABLE) {
                        return false;
                    }
                }
                _ => return false,
            }
            if page == last {
                break;
            }
            page += PAGE_SIZE as u64;
        }
        true
    }

    /// Collect `(virt, frame, flags)` for every mapped page in the user
    /// half of `space`.
    pub fn collect_user_mappings(
        &self,
        space: &AddressSpace,
    ) -> Vec<(VirtualAddress, PhysicalAddress, PageFlags)> {
        let mut mappings = Vec::new();
        // SAFETY: `space.root` is a live root table; the traversal holds
        // one table reference at a time per level.
        let root = unsafe { self.table_mut(space.root) };
        for i4 in 0..KERNEL_HALF_START {
            let Some(l3_pa) = root[i4].addr() else { continue };
            // SAFETY: reached through a present entry.
            let l3 = unsafe { self.table_mut(l3_pa) };
            for i3 in 0..super::PAGE_TABLE_ENTRIES {
                let Some(l2_pa) = l3[i3].addr() else { continue };
                // SAFETY: reached through a present entry.
                let l2 = unsafe { self.table_mut(l2_pa) };
                for i2 in 0..super::PAGE_TABLE_ENTRIES {
                    let Some(l1_pa) = l2[i2].addr() else { continue };
                    // SAFETY: reached through a present entry.
                    let l1 = unsafe { self.table_mut(l1_pa) };
                    for i1 in 0..super::PAGE_TABLE_ENTRIES {
                        let entry = &l1[i1];
                        let Some(frame) = entry.addr() else { continue };
                        let virt = ((i4 as u64) << 39)
                            | ((i3 as u64) << 30)
                            | ((i2 as u64) << 21)
                            | ((i1 as u64) << 12);
                        mappings.push((VirtualAddress::new(virt), frame, entry.flags()));
                    }
                }
            }
        }
        mappings
    }

    /// Duplicate every mapped user page of `src` into a fresh address
    /// space, copying page contents eagerly.
    pub fn clone_user_space(
        &mut self,
        src: &AddressSpace,
        pmm: &mut FrameAllocator,
    ) -> KernelResult<AddressSpace> {
        let new_space = self.create_user_space(pmm)?;
        for (virt, frame, flags) in self.collect_user_mappings(src) {
            let copy = match pmm.alloc_page() {
                Ok(f) => f,
                Err(e) => {
                    self.destroy_user_space(&new_space, pmm);
                    return Err(e);
                }
            };
            // SAFETY: `frame` is a mapped user frame of `src` and `copy`
            // was just allocated; both lie inside the window and do not
            // overlap.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    self.window.ptr(frame),
                    self.window.ptr(copy),
                    PAGE_SIZE,
                );
            }
            if let Err(e) = self.map_in(new_space.root, copy, virt, flags, pmm) {
                let _ = pmm.free_page(copy);
                self.destroy_user_space(&new_space, pmm);
                return Err(e);
            }
        }
        Ok(new_space)
    }

    /// Free every user-half frame and interior table of `space`, then the
    /// root table itself. Kernel-half tables are shared and left alone.
    pub fn destroy_user_space(&mut self, space: &AddressSpace, pmm: &mut FrameAllocator) {
        // SAFETY: `space.root` is a live root table that no other walk
        // holds references into.
        let root = unsafe { self.table_mut(space.root) };
        for i4 in 0..KERNEL_HALF_START {
            if let Some(l3_pa) = root[i4].addr() {
                self.free_subtree(l3_pa, 3, pmm);
                root[i4].clear();
            }
        }
        if let Err(e) = pmm.free_page(space.root) {
            log::warn!("leaking user root table: {}", e);
        }
    }

    /// Free everything referenced by the table at `table_pa` (frames at
    /// level 1, subtrees above), then the table itself.
    fn free_subtree(&mut self, table_pa: PhysicalAddress, level: u8, pmm: &mut FrameAllocator) {
        // SAFETY: `table_pa` was reached through a present entry of a
        // table this teardown owns.
        let table = unsafe { self.table_mut(table_pa) };
        for i in 0..super::PAGE_TABLE_ENTRIES {
            let Some(child) = table[i].addr() else { continue };
            if level > 1 {
                self.free_subtree(child, level - 1, pmm);
            } else if let Err(e) = pmm.free_page(child) {
                log::warn!("leaking user frame {:#x}: {}", child.as_u64(), e);
            }
        }
        if let Err(e) = pmm.free_page(table_pa) {
            log::warn!("leaking page table {:#x}: {}", table_pa.as_u64(), e);
        }
    }

    /// Pre-create the interior tables covering the kernel heap base so
    /// that user spaces copied from the master table later share them.
    pub fn ensure_kernel_heap_tables(&mut self, pmm: &mut FrameAllocator) -> KernelResult<()> {
        self.walk_create(
            self.kernel_root,
            VirtualAddress::new(KERNEL_BASE),
            PageFlags::empty(),
            pmm,
        )?;
        Ok(())
    }

    /// Hand out `pages` pages of kernel virtual address space.
    pub(crate) fn heap_cursor_advance(&mut self, pages: usize) -> VirtualAddress {
        let start = self.heap_cursor;
        self.heap_cursor += (pages * PAGE_SIZE) as u64;
        VirtualAddress::new(start)
    }

    #[allow(unused_variables)]
    fn flush_tlb(&self, virt: VirtualAddress) {
        #[cfg(target_os = "none")]
        x86_64::instructions::tlb::flush(x86_64::VirtAddr::new(virt.as_u64()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimMachine;

    fn setup() -> (SimMachine, FrameAllocator, Vmm) {
        let sim = SimMachine::new(16 * 1024 * 1024);
        let mut pmm = FrameAllocator::init(&sim.regions, sim.window).unwrap();
        let root = pmm.alloc_page().unwrap();
        let vmm = Vmm::new(sim.window, root);
        (sim, pmm, vmm)
    }

    #[test]
    fn map_translate_unmap_roundtrip() {
        let (_sim, mut pmm, mut vmm) = setup();
        let frame = pmm.alloc_page().unwrap();
        let virt = VirtualAddress::new(0x40_0000);

        vmm.map(frame, virt, PageFlags::WRITABLE, &mut pmm).unwrap();
        let translated = vmm.translate(VirtualAddress::new(0x40_0123)).unwrap();
        assert_eq!(translated.as_u64(), frame.as_u64() + 0x123);

        assert_eq!(vmm.unmap(virt), Some(frame));
        assert!(vmm.translate(virt).is_none());
    }

    #[test]
    fn double_map_rejected() {
        let (_sim, mut pmm, mut vmm) = setup();
        let frame = pmm.alloc_page().unwrap();
        let virt = VirtualAddress::new(0x40_0000);
        vmm.map(frame, virt, PageFlags::WRITABLE, &mut pmm).unwrap();
        let err = vmm.map(frame, virt, PageFlags::WRITABLE, &mut pmm).unwrap_err();
        assert!(matches!(err, KernelError::AlreadyMapped { .. }));
    }

    #[test]
    fn user_space_shares_kernel_half() {
        let (_sim, mut pmm, mut vmm) = setup();
        vmm.ensure_kernel_heap_tables(&mut pmm).unwrap();
        let space = vmm.create_user_space(&mut pmm).unwrap();

        // A kernel mapping made through the master root must be visible
        // through the user root as well.
        let frame = pmm.alloc_page().unwrap();
        let kvirt = VirtualAddress::new(KERNEL_BASE + 0x1000);
        vmm.map(frame, kvirt, PageFlags::WRITABLE, &mut pmm).unwrap();
        assert_eq!(
            vmm.translate_in(space.root, kvirt).map(|p| p.as_u64()),
            Some(frame.as_u64())
        );
    }

    #[test]
    fn validate_user_checks_range_and_flags() {
        let (_sim, mut pmm, mut vmm) = setup();
        let space = vmm.create_user_space(&mut pmm).unwrap();
        let virt = VirtualAddress::new(USER_BASE);
        vmm.alloc_user_page(&space, virt, PageFlags::WRITABLE, &mut pmm)
            .unwrap();

        assert!(vmm.validate_user(&space, USER_BASE, 64, true));
        // Unmapped second page
        assert!(!vmm.validate_user(&space, USER_BASE, PAGE_SIZE + 1, false));
        // Out of user range
        assert!(!vmm.validate_user(&space, KERNEL_BASE, 8, false));
        assert!(!vmm.validate_user(&space, USER_BASE - PAGE_SIZE as u64, 8, false));
    }

    #[test]
    fn validate_user_write_needs_writable() {
        let (_sim, mut pmm, mut vmm) = setup();
        let space = vmm.create_user_space(&mut pmm).unwrap();
        let virt = VirtualAddress::new(USER_BASE);
        vmm.alloc_user_page(&space, virt, PageFlags::empty(), &mut pmm)
            .unwrap();
        assert!(vmm.validate_user(&space, USER_BASE, 16, false));
        assert!(!vmm.validate_user(&space, USER_BASE, 16, true));
    }

    #[test]
    fn alloc_user_page_restores_active_root_on_failure() {
        let (_sim, mut pmm, mut vmm) = setup();
        let space = vmm.create_user_space(&mut pmm).unwrap();
        let virt = VirtualAddress::new(USER_BASE);
        vmm.alloc_user_page(&space, virt, PageFlags::WRITABLE, &mut pmm)
            .unwrap();
        let active_before = vmm.active_root();
        // Second allocation at the same page must fail and leave the
        // active root untouched.
        let err = vmm
            .alloc_user_page(&space, virt, PageFlags::WRITABLE, &mut pmm)
            .unwrap_err();
        assert!(matches!(err, KernelError::AlreadyMapped { .. }));
        assert_eq!(vmm.active_root(), active_before);
    }

    #[test]
    fn clone_copies_pages_deeply() {
        let (sim, mut pmm, mut vmm) = setup();
        let space = vmm.create_user_space(&mut pmm).unwrap();
        let virt = VirtualAddress::new(USER_BASE);
        vmm.alloc_user_page(&space, virt, PageFlags::WRITABLE, &mut pmm)
            .unwrap();
        let frame = vmm.translate_in(space.root, virt).unwrap();
        // SAFETY: the frame was just mapped and is inside the arena.
        unsafe { sim.window.bytes_mut(frame, 4)[..4].copy_from_slice(b"fork") };

        let twin = vmm.clone_user_space(&space, &mut pmm).unwrap();
        let twin_frame = vmm.translate_in(twin.root, virt).unwrap();
        assert_ne!(twin_frame.as_u64(), frame.as_u64());
        // SAFETY: mapped frame inside the arena.
        let copied = unsafe { sim.window.bytes(twin_frame, 4) };
        assert_eq!(copied, b"fork");

        // Mutating the clone must not affect the original.
        // SAFETY: mapped frame inside the arena.
        unsafe { sim.window.bytes_mut(twin_frame, 4)[0] = b'F' };
        // SAFETY: mapped frame inside the arena.
        assert_eq!(unsafe { sim.window.bytes(frame, 4) }, b"fork");
    }

    #[test]
    fn destroy_returns_frames() {
        let (_sim, mut pmm, mut vmm) = setup();
        let free_before = pmm.free_frames();
        let space = vmm.create_user_space(&mut pmm).unwrap();
        for i in 0..4u64 {
            vmm.alloc_user_page(
                &space,
                VirtualAddress::new(USER_BASE + i * PAGE_SIZE as u64),
                PageFlags::WRITABLE,
                &mut pmm,
            )
            .unwrap();
        }
        vmm.destroy_user_space(&space, &mut pmm);
        assert_eq!(pmm.free_frames(), free_before);
    }

    #[test]
    fn pmm_bitmap_covers_every_live_mapping() {
        let (_sim, mut pmm, mut vmm) = setup();
        let space = vmm.create_user_space(&mut pmm).unwrap();
        for i in 0..3u64 {
            vmm.alloc_user_page(
                &space,
                VirtualAddress::new(USER_BASE + i * PAGE_SIZE as u64),
                PageFlags::WRITABLE,
                &mut pmm,
            )
            .unwrap();
        }
        for (_, frame, _) in vmm.collect_user_mappings(&space) {
            assert!(pmm.is_allocated(frame));
        }
    }
}
