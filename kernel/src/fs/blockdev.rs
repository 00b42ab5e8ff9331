//! Block device abstraction
//!
//! A common interface for sector-granular storage. The FAT32 layer sits
//! on top of this; the ATA PIO driver implements it on bare metal and
//! [`RamBlockDevice`] backs the test suite and ramdisks.

use alloc::vec;
use alloc::vec::Vec;

use crate::error::FsError;

/// Sector size in bytes. The FAT32 layer only mounts 512-byte volumes.
pub const SECTOR_SIZE: usize = 512;

/// Sector-granular storage device.
pub trait BlockDevice: Send {
    /// Device name for diagnostics.
    fn name(&self) -> &str;

    /// Total number of sectors.
    fn sector_count(&self) -> u64;

    /// Read whole sectors starting at `lba`. `buf` must be a multiple of
    /// [`SECTOR_SIZE`] long.
    fn read_sectors(&mut self, lba: u64, buf: &mut [u8]) -> Result<(), FsError>;

    /// Write whole sectors starting at `lba`. `buf` must be a multiple of
    /// [`SECTOR_SIZE`] long.
    fn write_sectors(&mut self, lba: u64, buf: &[u8]) -> Result<(), FsError>;
}

/// RAM-backed block device for tests and ramdisks.
pub struct RamBlockDevice {
    data: Vec<u8>,
}

impl RamBlockDevice {
    pub fn new(sectors: u64) -> Self {
        Self {
            data: vec![0u8; sectors as usize * SECTOR_SIZE],
        }
    }

    fn range(&self, lba: u64, len: usize) -> Result<(usize, usize), FsError> {
        if len % SECTOR_SIZE != 0 {
            return Err(FsError::IoError);
        }
        let start = lba as usize * SECTOR_SIZE;
        let end = start + len;
        if end > self.data.len() {
            return Err(FsError::IoError);
        }
        Ok((start, end))
    }
}

impl BlockDevice for RamBlockDevice {
    fn name(&self) -> &str {
        "ramdisk"
    }

    fn sector_count(&self) -> u64 {
        (self.data.len() / SECTOR_SIZE) as u64
    }

    fn read_sectors(&mut self, lba: u64, buf: &mut [u8]) -> Result<(), FsError> {
        let (start, end) = self.range(lba, buf.len())?;
        buf.copy_from_slice(&self.data[start..end]);
        Ok(())
    }

    fn write_sectors(&mut self, lba: u64, buf: &[u8]) -> Result<(), FsError> {
        let (start, end) = self.range(lba, buf.len())?;
        self.data[start..end].copy_from_slice(buf);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ram_device_roundtrips_sectors() {
        let mut dev = RamBlockDevice::new(64);
        assert_eq!(dev.sector_count(), 64);

        let data = [0x42u8; SECTOR_SIZE];
        dev.write_sectors(3, &data).unwrap();
        let mut back = [0u8; SECTOR_SIZE];
        dev.read_sectors(3, &mut back).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn out_of_range_access_is_an_io_error() {
        let mut dev = RamBlockDevice::new(4);
        let mut buf = [0u8; SECTOR_SIZE];
        assert_eq!(dev.read_sectors(4, &mut buf), Err(FsError::IoError));
        assert_eq!(dev.read_sectors(0, &mut buf[..100]), Err(FsError::IoError));
    }
}
