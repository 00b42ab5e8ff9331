//! ATA PIO block device (primary bus, master drive, 28-bit LBA)
//!
//! Simple polled programmed I/O, enough to back the FAT32 volume. One
//! sector per command; errors surface as `FsError::IoError`.

use x86_64::instructions::port::Port;

use crate::{
    error::FsError,
    fs::{blockdev::BlockDevice, SECTOR_SIZE},
};

const ATA_DATA: u16 = 0x1F0;
const ATA_SECTOR_COUNT: u16 = 0x1F2;
const ATA_LBA_LOW: u16 = 0x1F3;
const ATA_LBA_MID: u16 = 0x1F4;
const ATA_LBA_HIGH: u16 = 0x1F5;
const ATA_DRIVE: u16 = 0x1F6;
const ATA_COMMAND: u16 = 0x1F7;

const CMD_READ_SECTORS: u8 = 0x20;
const CMD_WRITE_SECTORS: u8 = 0x30;
const CMD_FLUSH: u8 = 0xE7;

const STATUS_BSY: u8 = 0x80;
const STATUS_DRQ: u8 = 0x08;
const STATUS_ERR: u8 = 0x01;

/// Primary-master ATA drive.
pub struct AtaDevice {
    sectors: u64,
}

impl AtaDevice {
    /// Assume a drive is present; the first failed command will surface
    /// as an I/O error anyway.
    pub fn new(sectors: u64) -> Self {
        Self { sectors }
    }

    fn wait_not_busy(&self) -> Result<(), FsError> {
        let mut status: Port<u8> = Port::new(ATA_COMMAND);
        for _ in 0..1_000_000 {
            // SAFETY: status port read, no side effects.
            let value = unsafe { status.read() };
            if value & STATUS_ERR != 0 {
                return Err(FsError::IoError);
            }
            if value & STATUS_BSY == 0 {
                return Ok(());
            }
            core::hint::spin_loop();
        }
        Err(FsError::IoError)
    }

    fn wait_data_ready(&self) -> Result<(), FsError> {
        let mut status: Port<u8> = Port::new(ATA_COMMAND);
        for _ in 0..1_000_000 {
            // SAFETY: status port read, no side effects.
            let value = unsafe { status.read() };
            if value & STATUS_ERR != 0 {
                return Err(FsError::IoError);
            }
            if value & STATUS_BSY == 0 && value & STATUS_DRQ != 0 {
                return Ok(());
            }
            core::hint::spin_loop();
        }
        Err(FsError::IoError)
    }

    fn setup_transfer(&self, lba: u64, command: u8) -> Result<(), FsError> {
        if lba >= self.sectors || lba > 0x0FFF_FFFF {
            return Err(FsError::IoError);
        }
        self.wait_not_busy()?;
        let mut drive: Port<u8> = Port::new(ATA_DRIVE);
        let mut count: Port<u8> = Port::new(ATA_SECTOR_COUNT);
        let mut low: Port<u8> = Port::new(ATA_LBA_LOW);
        let mut mid: Port<u8> = Port::new(ATA_LBA_MID);
        let mut high: Port<u8> = Port::new(ATA_LBA_HIGH);
        let mut cmd: Port<u8> = Port::new(ATA_COMMAND);
        // SAFETY: standard ATA PIO register sequence for one sector.
        unsafe {
            drive.write(0xE0 | ((lba >> 24) & 0x0F) as u8);
            count.write(1);
            low.write(lba as u8);
            mid.write((lba >> 8) as u8);
            high.write((lba >> 16) as u8);
            cmd.write(command);
        }
        Ok(())
    }
}

impl BlockDevice for AtaDevice {
    fn name(&self) -> &str {
        "ata0"
    }

    fn sector_count(&self) -> u64 {
        self.sectors
    }

    fn read_sectors(&mut self, lba: u64, buf: &mut [u8]) -> Result<(), FsError> {
        if buf.len() % SECTOR_SIZE != 0 {
            return Err(FsError::IoError);
        }
        let mut data: Port<u16> = Port::new(ATA_DATA);
        for (i, sector) in buf.chunks_exact_mut(SECTOR_SIZE).enumerate() {
            self.setup_transfer(lba + i as u64, CMD_READ_SECTORS)?;
            self.wait_data_ready()?;
            for word in sector.chunks_exact_mut(2) {
                // SAFETY: DRQ is set, one 16-bit read per loop drains the
                // sector buffer.
                let value = unsafe { data.read() };
                word.copy_from_slice(&value.to_le_bytes());
            }
        }
        Ok(())
    }

    fn write_sectors(&mut self, lba: u64, buf: &[u8]) -> Result<(), FsError> {
        if buf.len() % SECTOR_SIZE != 0 {
            return Err(FsError::IoError);
        }
        let mut data: Port<u16> = Port::new(ATA_DATA);
        let mut cmd: Port<u8> = Port::new(ATA_COMMAND);
        for (i, sector) in buf.chunks_exact(SECTOR_SIZE).enumerate() {
            self.setup_transfer(lba + i as u64, CMD_WRITE_SECTORS)?;
            self.wait_data_ready()?;
            for word in sector.chunks_exact(2) {
                // SAFETY: DRQ is set, one 16-bit write per loop fills the
                // sector buffer.
                unsafe { data.write(u16::from_le_bytes([word[0], word[1]])) };
            }
            self.wait_not_busy()?;
            // SAFETY: cache flush after each written sector.
            unsafe { cmd.write(CMD_FLUSH) };
            self.wait_not_busy()?;
        }
        Ok(())
    }
}
