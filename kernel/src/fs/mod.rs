//! Filesystem layer
//!
//! The FAT32 volume, the block-device interface under it, the anonymous
//! pipe pool (pipes share the descriptor space with files), and the
//! kernel-wide table of open files that per-process descriptors point
//! into.

pub mod blockdev;
pub mod fat32;
pub mod pipe;

pub use blockdev::{BlockDevice, RamBlockDevice, SECTOR_SIZE};
pub use fat32::{DirEntry, Fat32Volume, FatFile};

use bitflags::bitflags;

use crate::error::FsError;

/// Capacity of the kernel-wide open file table.
pub const MAX_OPEN_FILES: usize = 64;

bitflags! {
    /// `open(2)`-style flags as passed in the syscall register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u64 {
        /// Open for writing.
        const WRITE  = 0x001;
        /// Create the file if it does not exist.
        const CREATE = 0x040;
        /// Start positioned at end of file.
        const APPEND = 0x400;
    }
}

/// An open file shared by every descriptor that references it. `fork`
/// duplicates descriptors, not open files, so parent and child share the
/// file position (POSIX semantics).
pub struct OpenFile {
    pub file: FatFile,
    pub refs: u32,
}

/// Kernel-wide open file table. Per-process descriptors hold slot
/// indices into this table.
pub struct OpenFileTable {
    slots: [Option<OpenFile>; MAX_OPEN_FILES],
}

impl Default for OpenFileTable {
    fn default() -> Self {
        Self::new()
    }
}

impl OpenFileTable {
    pub fn new() -> Self {
        Self {
            slots: [const { None }; MAX_OPEN_FILES],
        }
    }

    /// Insert an open file, returning its slot index.
    pub fn insert(&mut self, file: FatFile) -> Result<usize, FsError> {
        let slot = self
            .slots
            .iter()
            .position(|s| s.is_none())
            .ok_or(FsError::TooManyOpenFiles)?;
        self.slots[slot] = Some(OpenFile { file, refs: 1 });
        Ok(slot)
    }

    pub fn get_mut(&mut self, slot: usize) -> Option<&mut OpenFile> {
        self.slots.get_mut(slot)?.as_mut()
    }

    /// Account for a duplicated descriptor (fork).
    pub fn retain(&mut self, slot: usize) {
        if let Some(open) = self.get_mut(slot) {
            open.refs += 1;
        }
    }

    /// Drop one reference; frees the slot when the last one goes away.
    pub fn close(&mut self, slot: usize) -> Result<(), FsError> {
        let open = self.get_mut(slot).ok_or(FsError::BadFileDescriptor)?;
        open.refs -= 1;
        if open.refs == 0 {
            self.slots[slot] = None;
        }
        Ok(())
    }

    pub fn count(&self) -> usize {
        self.slots.iter().flatten().count()
    }
}
