//! Directory entry layout and directory scanning.
//!
//! A directory is either the fixed root region (cluster number 0 by
//! convention) or a cluster chain. Scans visit live entries only; slot
//! allocation additionally sees free and end-of-directory slots.

use alloc::string::String;

use crate::block::{BlockDevice, SECTOR_SIZE};

use super::bpb::BiosParameterBlock;
use super::name::decode_83;
use super::{table, Fat16Error, Result};

/// Entry attribute: subdirectory.
pub const ATTR_DIRECTORY: u8 = 0x10;
/// Entry attribute: regular file.
pub const ATTR_ARCHIVE: u8 = 0x20;
/// Attribute combination marking a long-file-name entry; always skipped.
const ATTR_LONG_NAME: u8 = 0x0F;

/// Size of one directory slot in bytes.
pub(super) const ENTRY_SIZE: usize = 32;
/// First-byte marker: end of directory.
const MARKER_END: u8 = 0x00;
/// First-byte marker: deleted slot, reusable.
const MARKER_DELETED: u8 = 0xE5;

/// The fields of a 32-byte directory entry this engine uses. Time and
/// date fields are neither read nor maintained; they encode as zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirEntry {
    /// Padded 8.3 name.
    pub name: [u8; 11],
    /// Attribute byte.
    pub attr: u8,
    /// First cluster of the entry's chain; 0 for an empty file.
    pub first_cluster: u16,
    /// File size in bytes; 0 for directories.
    pub size: u32,
}

impl DirEntry {
    /// Whether this entry names a subdirectory.
    #[must_use]
    pub fn is_directory(&self) -> bool {
        self.attr & ATTR_DIRECTORY != 0
    }

    /// The human-readable `NAME.EXT` form.
    #[must_use]
    pub fn display_name(&self) -> String {
        decode_83(&self.name)
    }

    pub(super) fn decode(slot: &[u8]) -> Self {
        let mut name = [0_u8; 11];
        name.copy_from_slice(&slot[..11]);
        Self {
            name,
            attr: slot[11],
            first_cluster: u16::from_le_bytes([slot[26], slot[27]]),
            size: u32::from_le_bytes([slot[28], slot[29], slot[30], slot[31]]),
        }
    }

    pub(super) fn encode(&self, slot: &mut [u8]) {
        slot.fill(0);
        slot[..11].copy_from_slice(&self.name);
        slot[11] = self.attr;
        slot[26..28].copy_from_slice(&self.first_cluster.to_le_bytes());
        slot[28..32].copy_from_slice(&self.size.to_le_bytes());
    }
}

/// Where a directory slot lives on disk, so it can be rewritten without
/// a rescan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct SlotLocation {
    pub sector: u32,
    pub offset: usize,
}

/// Visit every live entry of `dir_cluster` in order until `visit` returns
/// `Some`, which becomes the scan result.
///
/// Deleted and long-file-name slots are skipped; an end-of-directory
/// marker stops the scan.
pub(super) fn scan<D: BlockDevice, T>(
    device: &mut D,
    bpb: &BiosParameterBlock,
    dir_cluster: u16,
    mut visit: impl FnMut(&DirEntry, SlotLocation) -> Option<T>,
) -> Option<T> {
    let mut walker = SectorWalker::new(bpb, dir_cluster);
    let mut buf = [0_u8; SECTOR_SIZE];

    while let Some(sector) = walker.next_sector(device, bpb) {
        device.read_sector(sector, &mut buf);

        for offset in (0..SECTOR_SIZE).step_by(ENTRY_SIZE) {
            let slot = &buf[offset..offset + ENTRY_SIZE];
            match slot[0] {
                MARKER_END => return None,
                MARKER_DELETED => continue,
                _ if slot[11] == ATTR_LONG_NAME => continue,
                _ => {}
            }

            let entry = DirEntry::decode(slot);
            if let Some(result) = visit(&entry, SlotLocation { sector, offset }) {
                return Some(result);
            }
        }
    }

    None
}

/// Find the live entry called `name11` in `dir_cluster`.
pub(super) fn find_entry<D: BlockDevice>(
    device: &mut D,
    bpb: &BiosParameterBlock,
    dir_cluster: u16,
    name11: &[u8; 11],
) -> Option<(DirEntry, SlotLocation)> {
    scan(device, bpb, dir_cluster, |entry, slot| {
        if entry.name == *name11 {
            Some((*entry, slot))
        } else {
            None
        }
    })
}

/// Whether the directory holds nothing besides `.` and `..`.
pub(super) fn is_empty<D: BlockDevice>(
    device: &mut D,
    bpb: &BiosParameterBlock,
    dir_cluster: u16,
) -> bool {
    scan(device, bpb, dir_cluster, |entry, _slot| {
        if entry.name == super::name::DOT_NAME || entry.name == super::name::DOTDOT_NAME {
            None
        } else {
            Some(())
        }
    })
    .is_none()
}

/// Find a reusable slot (free or end-of-directory) in `dir_cluster`.
///
/// The fixed root cannot grow: exhausting it is an error. A subdirectory
/// whose chain is full gets a fresh zeroed cluster linked to the tail,
/// and the first slot of that cluster is returned.
pub(super) fn find_free_slot<D: BlockDevice>(
    device: &mut D,
    bpb: &BiosParameterBlock,
    dir_cluster: u16,
) -> Result<SlotLocation> {
    let mut walker = SectorWalker::new(bpb, dir_cluster);
    let mut buf = [0_u8; SECTOR_SIZE];
    let mut last_cluster = dir_cluster;

    while let Some(sector) = walker.next_sector(device, bpb) {
        last_cluster = walker.current_cluster().unwrap_or(dir_cluster);

        device.read_sector(sector, &mut buf);
        for offset in (0..SECTOR_SIZE).step_by(ENTRY_SIZE) {
            if buf[offset] == MARKER_END || buf[offset] == MARKER_DELETED {
                return Ok(SlotLocation { sector, offset });
            }
        }
    }

    if dir_cluster == 0 {
        return Err(Fat16Error::RootDirectoryFull);
    }

    // Grow the subdirectory by one zeroed cluster.
    let new_cluster = table::alloc_cluster(device, bpb)?;
    table::set_entry(device, bpb, last_cluster, new_cluster);
    zero_cluster(device, bpb, new_cluster);

    Ok(SlotLocation {
        sector: bpb.cluster_to_sector(new_cluster),
        offset: 0,
    })
}

/// Write `entry` into its slot, read-modify-write of the owning sector.
pub(super) fn write_slot<D: BlockDevice>(
    device: &mut D,
    slot: SlotLocation,
    entry: &DirEntry,
) {
    let mut buf = [0_u8; SECTOR_SIZE];
    device.read_sector(slot.sector, &mut buf);
    entry.encode(&mut buf[slot.offset..slot.offset + ENTRY_SIZE]);
    device.write_sector(slot.sector, &buf);
}

/// Mark a slot deleted by overwriting its first byte with 0xE5.
pub(super) fn mark_deleted<D: BlockDevice>(device: &mut D, slot: SlotLocation) {
    let mut buf = [0_u8; SECTOR_SIZE];
    device.read_sector(slot.sector, &mut buf);
    buf[slot.offset] = MARKER_DELETED;
    device.write_sector(slot.sector, &buf);
}

/// Overwrite every sector of `cluster` with zeroes.
pub(super) fn zero_cluster<D: BlockDevice>(
    device: &mut D,
    bpb: &BiosParameterBlock,
    cluster: u16,
) {
    let zeroes = [0_u8; SECTOR_SIZE];
    let start = bpb.cluster_to_sector(cluster);
    for sector in 0..u32::from(bpb.sectors_per_cluster) {
        device.write_sector(start + sector, &zeroes);
    }
}

/// Sector-by-sector cursor over a directory, hiding the difference
/// between the fixed root region and a cluster chain.
struct SectorWalker {
    /// Remaining sectors in the root region (root directories only).
    root_remaining: u32,
    /// Next root sector (root directories only).
    root_next: u32,
    /// Current cluster, or `None` for the root / an exhausted chain.
    cluster: Option<u16>,
    /// Sector index within the current cluster.
    sector_in_cluster: u32,
}

impl SectorWalker {
    fn new(bpb: &BiosParameterBlock, dir_cluster: u16) -> Self {
        if dir_cluster == 0 {
            Self {
                root_remaining: bpb.root_dir_sectors(),
                root_next: bpb.root_start_sector(),
                cluster: None,
                sector_in_cluster: 0,
            }
        } else {
            Self {
                root_remaining: 0,
                root_next: 0,
                cluster: Some(dir_cluster),
                sector_in_cluster: 0,
            }
        }
    }

    fn current_cluster(&self) -> Option<u16> {
        self.cluster
    }

    fn next_sector<D: BlockDevice>(
        &mut self,
        device: &mut D,
        bpb: &BiosParameterBlock,
    ) -> Option<u32> {
        if self.root_remaining > 0 {
            self.root_remaining -= 1;
            let sector = self.root_next;
            self.root_next += 1;
            return Some(sector);
        }

        let cluster = self.cluster?;

        if self.sector_in_cluster >= u32::from(bpb.sectors_per_cluster) {
            let next = table::entry(device, bpb, cluster);
            if !(2..table::FAT_END_MIN).contains(&next) {
                self.cluster = None;
                return None;
            }
            self.cluster = Some(next);
            self.sector_in_cluster = 0;
            return self.next_sector(device, bpb);
        }

        let sector = bpb.cluster_to_sector(cluster) + self.sector_in_cluster;
        self.sector_in_cluster += 1;
        Some(sector)
    }
}
