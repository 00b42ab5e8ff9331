//! Physical frame allocator
//!
//! A bitmap with one bit per 4 KiB frame (1 = allocated). The bitmap is
//! placed in a usable region above the legacy 1 MiB area at init and its
//! own frames, together with everything below 1 MiB and every hole in the
//! memory map, are marked allocated up front. Allocation scans the bitmap
//! byte-at-a-time for the first clear bit; freed frames must be aligned
//! and currently allocated.
//!
//! The allocator is the only component that mutates the bitmap. All other
//! subsystems obtain frames through it.

use crate::{
    error::{KernelError, KernelResult},
    mm::{MemoryRegion, MemoryRegionKind, PhysWindow, PhysicalAddress, PAGE_SIZE},
};

/// Everything below this physical address is reserved at init (real-mode
/// IVT, EBDA, VGA, and the area the original loader parks the kernel in).
const LOW_MEMORY_LIMIT: u64 = 0x10_0000;

/// Byte counters kept by the allocator. `free + used == total` always
/// holds; `reserved` counts memory the map never offered as usable.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameAllocatorStats {
    pub total: u64,
    pub free: u64,
    pub used: u64,
    pub reserved: u64,
}

/// Bitmap allocator over physical 4 KiB frames.
pub struct FrameAllocator {
    window: PhysWindow,
    /// Physical address of the bitmap itself.
    bitmap: PhysicalAddress,
    bitmap_bytes: usize,
    /// Number of frames the bitmap covers.
    frame_count: u64,
    stats: FrameAllocatorStats,
}

impl FrameAllocator {
    /// Build the allocator from the boot-supplied memory map.
    ///
    /// The bitmap covers every frame up to the end of the highest usable
    /// region. It starts fully allocated; usable frames are then cleared,
    /// and the low-memory area plus the bitmap's own frames are
    /// re-reserved.
    pub fn init(regions: &[MemoryRegion], window: PhysWindow) -> KernelResult<Self> {
        let mut total = 0u64;
        let mut reserved = 0u64;
        let mut highest_usable = 0u64;
        for r in regions {
            match r.kind {
                MemoryRegionKind::Usable => {
                    total += r.size;
                    highest_usable = highest_usable.max(r.end());
                }
                MemoryRegionKind::Reserved => reserved += r.size,
            }
        }
        if highest_usable == 0 {
            return Err(KernelError::InvalidArgument {
                name: "regions",
                value: "no usable memory",
            });
        }

        let frame_count = highest_usable / PAGE_SIZE as u64;
        let bitmap_bytes = frame_count.div_ceil(8) as usize;

        let bitmap = Self::place_bitmap(regions, bitmap_bytes)?;

        let mut allocator = Self {
            window,
            bitmap,
            bitmap_bytes,
            frame_count,
            stats: FrameAllocatorStats {
                total,
                free: 0,
                used: total,
                reserved,
            },
        };

        // Start fully allocated, then open up the usable regions.
        allocator.bitmap_mut().fill(0xFF);
        for r in regions {
            if r.kind != MemoryRegionKind::Usable {
                continue;
            }
            let first = r.start.div_ceil(PAGE_SIZE as u64);
            let last = r.end() / PAGE_SIZE as u64;
            for frame in first..last {
                allocator.clear_bit(frame);
                allocator.stats.free += PAGE_SIZE as u64;
                allocator.stats.used -= PAGE_SIZE as u64;
            }
        }

        allocator.reserve_range(0, LOW_MEMORY_LIMIT);
        allocator.reserve_range(bitmap.as_u64(), bitmap.as_u64() + bitmap_bytes as u64);

        Ok(allocator)
    }

    /// Find a usable region that can hold the bitmap above low memory.
    fn place_bitmap(regions: &[MemoryRegion], bitmap_bytes: usize) -> KernelResult<PhysicalAddress> {
        for r in regions {
            if r.kind != MemoryRegionKind::Usable {
                continue;
            }
            let start = r.start.max(LOW_MEMORY_LIMIT).next_multiple_of(PAGE_SIZE as u64);
            if start + bitmap_bytes as u64 <= r.end() {
                return Ok(PhysicalAddress::new(start));
            }
        }
        Err(KernelError::ResourceExhausted {
            resource: "frame bitmap placement",
        })
    }

    fn bitmap_mut(&self) -> &'static mut [u8] {
        // SAFETY: the bitmap range was carved out of a usable region at
        // init, is covered by the window, and is only ever accessed
        // through the allocator, which callers serialize.
        unsafe { self.window.bytes_mut(self.bitmap, self.bitmap_bytes) }
    }

    fn bit_is_set(&self, frame: u64) -> bool {
        let map = self.bitmap_mut();
        map[(frame / 8) as usize] & (1 << (frame % 8)) != 0
    }

    fn set_bit(&mut self, frame: u64) {
        let map = self.bitmap_mut();
        map[(frame / 8) as usize] |= 1 << (frame % 8);
    }

    fn clear_bit(&mut self, frame: u64) {
        let map = self.bitmap_mut();
        map[(frame / 8) as usize] &= !(1 << (frame % 8));
    }

    /// Mark every frame overlapping `[start, end)` allocated, adjusting
    /// the counters for frames that were free.
    fn reserve_range(&mut self, start: u64, end: u64) {
        let first = start / PAGE_SIZE as u64;
        let last = end.div_ceil(PAGE_SIZE as u64).min(self.frame_count);
        for frame in first..last {
            if !self.bit_is_set(frame) {
                self.set_bit(frame);
                self.stats.free -= PAGE_SIZE as u64;
                self.stats.used += PAGE_SIZE as u64;
            }
        }
    }

    /// Allocate one zeroed frame.
    pub fn alloc_page(&mut self) -> KernelResult<PhysicalAddress> {
        for byte_index in 0..self.bitmap_bytes {
            let byte = self.bitmap_mut()[byte_index];
            if byte == 0xFF {
                continue;
            }
            let bit_index = byte.trailing_ones() as u64;
            let frame = byte_index as u64 * 8 + bit_index;
            if frame >= self.frame_count {
                break;
            }
            self.set_bit(frame);
            self.stats.free -= PAGE_SIZE as u64;
            self.stats.used += PAGE_SIZE as u64;

            let addr = PhysicalAddress::new(frame * PAGE_SIZE as u64);
            // SAFETY: the frame was just taken out of the free set, so no
            // references into it exist; it lies below `frame_count` and is
            // therefore covered by the window.
            unsafe { self.window.zero_frame(addr) };
            return Ok(addr);
        }
        Err(KernelError::OutOfMemory {
            requested: PAGE_SIZE,
            available: 0,
        })
    }

    /// Return a frame to the free set.
    pub fn free_page(&mut self, addr: PhysicalAddress) -> KernelResult<()> {
        if !addr.is_page_aligned() {
            return Err(KernelError::MisalignedAddress { addr: addr.as_u64() });
        }
        let frame = addr.frame_index();
        if frame >= self.frame_count {
            return Err(KernelError::InvalidAddress { addr: addr.as_u64() });
        }
        if !self.bit_is_set(frame) {
            return Err(KernelError::DoubleFree { addr: addr.as_u64() });
        }
        self.clear_bit(frame);
        self.stats.free += PAGE_SIZE as u64;
        self.stats.used -= PAGE_SIZE as u64;
        Ok(())
    }

    /// Whether the bitmap bit for `addr`'s frame is set.
    pub fn is_allocated(&self, addr: PhysicalAddress) -> bool {
        let frame = addr.frame_index();
        frame < self.frame_count && self.bit_is_set(frame)
    }

    pub fn stats(&self) -> FrameAllocatorStats {
        self.stats
    }

    /// Number of currently free frames.
    pub fn free_frames(&self) -> u64 {
        self.stats.free / PAGE_SIZE as u64
    }
}
