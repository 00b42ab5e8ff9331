//! Simulated machine for host-side testing
//!
//! Stands in for the hardware the kernel normally runs on: a leaked,
//! page-aligned allocation plays the role of physical memory (addresses
//! starting at 0, reached through a [`PhysWindow`] whose offset is the
//! arena base), and the boot memory map is a single usable region covering
//! it. The whole memory/process/signal/pipe/filesystem core runs unchanged
//! on top.

use alloc::vec;
use alloc::vec::Vec;

use crate::{
    error::FsError,
    fs::{blockdev::BlockDevice, RamBlockDevice, SECTOR_SIZE},
    kernel::{Kernel, KernelConfig},
    mm::{MemoryRegion, PhysWindow, PAGE_SIZE},
};

/// A fake physical machine: an arena of "physical" memory plus its map.
pub struct SimMachine {
    pub window: PhysWindow,
    pub regions: Vec<MemoryRegion>,
}

impl SimMachine {
    /// Allocate a zeroed arena of `bytes` physical memory. The arena is
    /// leaked; test processes are short-lived.
    pub fn new(bytes: usize) -> Self {
        assert!(bytes % PAGE_SIZE == 0, "arena must be a whole number of frames");
        let layout = core::alloc::Layout::from_size_align(bytes, PAGE_SIZE)
            .expect("arena layout");
        // SAFETY: layout has non-zero size and valid alignment; the
        // returned block is leaked so the window stays valid for 'static.
        let base = unsafe { std::alloc::alloc_zeroed(layout) };
        assert!(!base.is_null(), "arena allocation failed");
        Self {
            window: PhysWindow::new(base as u64),
            regions: vec![MemoryRegion::usable(0, bytes as u64)],
        }
    }

    /// Build a fully initialized kernel over this machine.
    pub fn kernel(&self) -> Kernel {
        Kernel::init(
            self.window,
            &self.regions,
            None,
            KernelConfig { timer_hz: 100 },
        )
        .expect("kernel init")
    }
}

/// Assemble a minimal ELF64 `ET_EXEC` image with one loadable segment
/// placed at `entry`, carrying `code` plus `memsz_extra` zeroed tail
/// bytes.
pub fn tiny_exec(entry: u64, code: &[u8], memsz_extra: u64) -> Vec<u8> {
    use crate::elf::{EHDR_SIZE, PHDR_SIZE};

    let mut image = vec![0u8; EHDR_SIZE + PHDR_SIZE];
    image[0..4].copy_from_slice(&[0x7F, b'E', b'L', b'F']);
    image[4] = 2; // ELFCLASS64
    image[5] = 1; // little endian
    image[16..18].copy_from_slice(&2u16.to_le_bytes()); // ET_EXEC
    image[18..20].copy_from_slice(&0x3Eu16.to_le_bytes()); // EM_X86_64
    image[24..32].copy_from_slice(&entry.to_le_bytes());
    image[32..40].copy_from_slice(&(EHDR_SIZE as u64).to_le_bytes());
    image[54..56].copy_from_slice(&(PHDR_SIZE as u16).to_le_bytes());
    image[56..58].copy_from_slice(&1u16.to_le_bytes());

    let code_offset = image.len() as u64;
    let ph = EHDR_SIZE;
    image[ph..ph + 4].copy_from_slice(&1u32.to_le_bytes()); // PT_LOAD
    image[ph + 4..ph + 8].copy_from_slice(&3u32.to_le_bytes()); // PF_W | PF_X
    image[ph + 8..ph + 16].copy_from_slice(&code_offset.to_le_bytes());
    image[ph + 16..ph + 24].copy_from_slice(&entry.to_le_bytes());
    image[ph + 32..ph + 40].copy_from_slice(&(code.len() as u64).to_le_bytes());
    image[ph + 40..ph + 48].copy_from_slice(&(code.len() as u64 + memsz_extra).to_le_bytes());

    image.extend_from_slice(code);
    image
}

/// Lay down a minimal FAT32 volume on a RAM disk: an MBR whose first
/// partition starts at LBA 2048, a boot sector with one sector per
/// cluster, two FATs, and an empty root directory at cluster 2. Enough
/// structure for the volume layer to mount and exercise every operation.
pub fn format_fat32(dev: &mut RamBlockDevice) -> Result<(), FsError> {
    const PARTITION_START: u32 = 2048;
    const RESERVED_SECTORS: u32 = 32;
    const NUM_FATS: u32 = 2;
    const FAT_SIZE: u32 = 64;

    let mut mbr = [0u8; SECTOR_SIZE];
    mbr[0x1BE + 4] = 0x0C; // partition type: FAT32 LBA
    mbr[0x1BE + 8..0x1BE + 12].copy_from_slice(&PARTITION_START.to_le_bytes());
    mbr[510] = 0x55;
    mbr[511] = 0xAA;
    dev.write_sectors(0, &mbr)?;

    let mut boot = [0u8; SECTOR_SIZE];
    boot[11..13].copy_from_slice(&(SECTOR_SIZE as u16).to_le_bytes());
    boot[13] = 1; // sectors per cluster
    boot[14..16].copy_from_slice(&(RESERVED_SECTORS as u16).to_le_bytes());
    boot[16] = NUM_FATS as u8;
    boot[36..40].copy_from_slice(&FAT_SIZE.to_le_bytes());
    boot[44..48].copy_from_slice(&2u32.to_le_bytes()); // root cluster
    boot[66] = 0x28; // extended boot signature
    boot[510] = 0x55;
    boot[511] = 0xAA;
    dev.write_sectors(PARTITION_START as u64, &boot)?;

    // FAT entries 0 and 1 are reserved; cluster 2 (the empty root
    // directory) is an end-of-chain.
    let mut fat = [0u8; SECTOR_SIZE];
    fat[0..4].copy_from_slice(&0x0FFF_FFF8u32.to_le_bytes());
    fat[4..8].copy_from_slice(&0x0FFF_FFFFu32.to_le_bytes());
    fat[8..12].copy_from_slice(&0x0FFF_FFFFu32.to_le_bytes());
    for copy in 0..NUM_FATS {
        dev.write_sectors((PARTITION_START + RESERVED_SECTORS + copy * FAT_SIZE) as u64, &fat)?;
    }
    Ok(())
}
