//! ATA PIO driver for the primary channel.
//!
//! Single-sector, 28-bit LBA reads and writes with BSY/DRQ polling and no
//! interrupt usage. Writes are followed by a cache flush. The protocol has
//! no error reporting path here: a request is assumed to complete, and a
//! wedged device hangs the kernel in the status poll.

use bitflags::bitflags;
use x86::io::{inb, inw, outb, outw};

use crate::block::{BlockDevice, SECTOR_SIZE};

/// Primary channel I/O port base.
const ATA_PRIMARY_IO: u16 = 0x1F0;

const ATA_REG_DATA: u16 = ATA_PRIMARY_IO;
const ATA_REG_SECTOR_COUNT: u16 = ATA_PRIMARY_IO + 2;
const ATA_REG_LBA_LOW: u16 = ATA_PRIMARY_IO + 3;
const ATA_REG_LBA_MID: u16 = ATA_PRIMARY_IO + 4;
const ATA_REG_LBA_HIGH: u16 = ATA_PRIMARY_IO + 5;
const ATA_REG_DRIVE_SELECT: u16 = ATA_PRIMARY_IO + 6;
const ATA_REG_COMMAND: u16 = ATA_PRIMARY_IO + 7;
const ATA_REG_STATUS: u16 = ATA_PRIMARY_IO + 7;

const ATA_CMD_READ_PIO: u8 = 0x20;
const ATA_CMD_WRITE_PIO: u8 = 0x30;
const ATA_CMD_CACHE_FLUSH: u8 = 0xE7;

/// LBA mode, master drive, bits 27..24 of the LBA in the low nibble.
const DRIVE_SELECT_LBA_MASTER: u8 = 0xE0;

bitflags! {
    /// Status register bits the polling loops care about.
    #[derive(Debug, Clone, Copy)]
    struct AtaStatus: u8 {
        /// Device busy; no other bit is valid while set.
        const BSY = 0x80;
        /// Data request: the device wants a PIO transfer.
        const DRQ = 0x08;
        /// Error; unreported by design, see module docs.
        const ERR = 0x01;
    }
}

/// Handle to the master drive on the primary channel.
///
/// Holding the value is the capability to touch the ports; the kernel
/// creates exactly one and hands it to the filesystem mount.
pub struct AtaDisk(());

impl AtaDisk {
    /// Claim the primary-channel master drive.
    #[must_use]
    pub const fn primary() -> Self {
        Self(())
    }

    /// Whether something answers on the primary channel. A floating bus
    /// reads 0xFF; polling a missing device would spin forever.
    #[must_use]
    pub fn present() -> bool {
        // SAFETY:
        // Status reads have no side effect on the primary channel.
        unsafe { inb(ATA_REG_STATUS) != 0xFF }
    }

    fn wait_not_busy() {
        // SAFETY:
        // Status reads have no side effect on the primary channel.
        while unsafe { AtaStatus::from_bits_truncate(inb(ATA_REG_STATUS)) }.contains(AtaStatus::BSY)
        {
        }
    }

    fn wait_data_request() {
        // SAFETY:
        // Status reads have no side effect on the primary channel.
        while !unsafe { AtaStatus::from_bits_truncate(inb(ATA_REG_STATUS)) }
            .contains(AtaStatus::DRQ)
        {}
    }

    fn select(lba: u32) {
        // SAFETY:
        // Programs the drive/head and LBA registers of an idle device.
        unsafe {
            outb(
                ATA_REG_DRIVE_SELECT,
                DRIVE_SELECT_LBA_MASTER | (((lba >> 24) & 0x0F) as u8),
            );
            outb(ATA_REG_SECTOR_COUNT, 1);
            outb(ATA_REG_LBA_LOW, (lba & 0xFF) as u8);
            outb(ATA_REG_LBA_MID, ((lba >> 8) & 0xFF) as u8);
            outb(ATA_REG_LBA_HIGH, ((lba >> 16) & 0xFF) as u8);
        }
    }
}

impl BlockDevice for AtaDisk {
    fn read_sector(&mut self, lba: u32, buf: &mut [u8; SECTOR_SIZE]) {
        Self::wait_not_busy();
        Self::select(lba);

        // SAFETY:
        // The device is selected and idle; issuing READ SECTORS starts a
        // single-sector PIO transfer.
        unsafe { outb(ATA_REG_COMMAND, ATA_CMD_READ_PIO) };

        Self::wait_not_busy();
        Self::wait_data_request();

        for word_index in 0..SECTOR_SIZE / 2 {
            // SAFETY:
            // DRQ is set: the data register yields one 16-bit word per read.
            let word = unsafe { inw(ATA_REG_DATA) };
            buf[word_index * 2] = (word & 0xFF) as u8;
            buf[word_index * 2 + 1] = (word >> 8) as u8;
        }
    }

    fn write_sector(&mut self, lba: u32, buf: &[u8; SECTOR_SIZE]) {
        Self::wait_not_busy();
        Self::select(lba);

        // SAFETY:
        // The device is selected and idle; issuing WRITE SECTORS starts a
        // single-sector PIO transfer.
        unsafe { outb(ATA_REG_COMMAND, ATA_CMD_WRITE_PIO) };

        Self::wait_data_request();

        for word_index in 0..SECTOR_SIZE / 2 {
            let word = u16::from(buf[word_index * 2]) | (u16::from(buf[word_index * 2 + 1]) << 8);
            // SAFETY:
            // DRQ is set: the data register accepts one 16-bit word per write.
            unsafe { outw(ATA_REG_DATA, word) };
        }

        // SAFETY:
        // Flush the write cache so the sector is durable before returning.
        unsafe { outb(ATA_REG_COMMAND, ATA_CMD_CACHE_FLUSH) };
        Self::wait_not_busy();
    }
}
