//! FAT16 filesystem engine.
//!
//! Owns everything between the sector interface and the syscall layer:
//! BPB parsing, FAT chain walking and mutation (mirrored into the second
//! FAT), directory search and allocation, 8.3 names, path normalization
//! and the full set of file operations.
//!
//! The engine is generic over [`BlockDevice`] so the same code runs over
//! the ATA driver in the kernel and over a [`RamDisk`](crate::block::RamDisk)
//! in tests. All mutable state (the cached BPB and the working directory
//! pair) lives inside the [`Fat16`] value; the kernel holds exactly one
//! mounted instance behind a mutex, which also serializes every operation
//! (a single logical operation must never interleave with another).

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

use spin::Mutex;

use crate::block::{BlockDevice, SECTOR_SIZE};

pub mod bpb;
mod dir;
mod name;
pub mod path;
mod table;

pub use bpb::BiosParameterBlock;
pub use dir::{DirEntry, ATTR_ARCHIVE, ATTR_DIRECTORY};

use dir::SlotLocation;

/// Everything that can go wrong inside the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fat16Error {
    /// No filesystem is mounted.
    NotMounted,
    /// The boot sector does not describe a usable FAT16 volume.
    BadVolume(&'static str),
    /// A path component does not exist.
    NotFound,
    /// Creation target already exists (also: `mv` destination exists).
    AlreadyExists,
    /// A file operation hit a directory.
    NotAFile,
    /// A directory operation hit a file.
    NotADirectory,
    /// `rmdir` on a directory still holding entries.
    DirectoryNotEmpty,
    /// The operation would remove or overwrite the root.
    RootForbidden,
    /// The fixed root directory has no free slot left.
    RootDirectoryFull,
    /// Every data cluster is allocated.
    NoFreeCluster,
    /// The name cannot be encoded as an 8.3 short name.
    InvalidName,
}

impl fmt::Display for Fat16Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::NotMounted => write!(f, "no filesystem mounted"),
            Self::BadVolume(reason) => write!(f, "bad volume: {reason}"),
            Self::NotFound => write!(f, "no such file or directory"),
            Self::AlreadyExists => write!(f, "already exists"),
            Self::NotAFile => write!(f, "not a file"),
            Self::NotADirectory => write!(f, "not a directory"),
            Self::DirectoryNotEmpty => write!(f, "directory not empty"),
            Self::RootForbidden => write!(f, "refusing to operate on the root"),
            Self::RootDirectoryFull => write!(f, "root directory full"),
            Self::NoFreeCluster => write!(f, "no space left on volume"),
            Self::InvalidName => write!(f, "invalid 8.3 name"),
        }
    }
}

/// Engine result type.
pub type Result<T> = core::result::Result<T, Fat16Error>;

/// A mounted FAT16 volume plus the process-wide working directory state.
pub struct Fat16<D> {
    device: D,
    bpb: BiosParameterBlock,
    /// Cluster of the working directory; 0 denotes the fixed root.
    current_dir_cluster: u16,
    /// Canonical absolute working directory path.
    current_path: String,
}

impl<D: BlockDevice> Fat16<D> {
    /// Mount the volume: read sector 0, validate the BPB, start at `/`.
    pub fn mount(mut device: D) -> Result<Self> {
        let mut sector = [0_u8; SECTOR_SIZE];
        device.read_sector(0, &mut sector);
        let bpb = BiosParameterBlock::parse(&sector)?;

        log::info!(
            "FAT16 volume: {} sectors, {} per cluster, {} root entries",
            bpb.total_sectors(),
            bpb.sectors_per_cluster,
            bpb.root_entries,
        );

        Ok(Self {
            device,
            bpb,
            current_dir_cluster: 0,
            current_path: String::from("/"),
        })
    }

    /// The cached BPB.
    #[must_use]
    pub fn bpb(&self) -> &BiosParameterBlock {
        &self.bpb
    }

    /// The canonical absolute working directory.
    #[must_use]
    pub fn current_path(&self) -> &str {
        &self.current_path
    }

    /// Change the working directory. The path is normalized first, so
    /// `cd ..` at the root stays at the root.
    pub fn change_dir(&mut self, path: &str) -> Result<()> {
        let abs = self.absolute(path);
        let cluster = self.resolve_dir(&abs)?;
        self.current_dir_cluster = cluster;
        self.current_path = abs;
        Ok(())
    }

    /// Whether `path` names an existing file or directory.
    pub fn exists(&mut self, path: &str) -> bool {
        let abs = self.absolute(path);
        self.exists_abs(&abs)
    }

    /// Size in bytes of the file at `path`.
    pub fn file_size(&mut self, path: &str) -> Result<u32> {
        let abs = self.absolute(path);
        let (_, entry, _) = self.locate(&abs)?;
        if entry.is_directory() {
            return Err(Fat16Error::NotAFile);
        }
        Ok(entry.size)
    }

    /// The directory entry behind `path` (which must not be the root).
    pub fn stat(&mut self, path: &str) -> Result<DirEntry> {
        let abs = self.absolute(path);
        let (_, entry, _) = self.locate(&abs)?;
        Ok(entry)
    }

    /// The FAT entry for `cluster` as stored in each of the two FAT
    /// copies. Diagnostic surface: the disk self-test and the filesystem
    /// tests check the mirror invariant through it.
    pub fn fat_entry_pair(&mut self, cluster: u16) -> (u16, u16) {
        let (sector, offset) = self.bpb.fat_entry_location(cluster);
        let mut buf = [0_u8; SECTOR_SIZE];

        self.device.read_sector(sector, &mut buf);
        let first = u16::from_le_bytes([buf[offset], buf[offset + 1]]);

        self.device
            .read_sector(sector + u32::from(self.bpb.sectors_per_fat), &mut buf);
        let second = u16::from_le_bytes([buf[offset], buf[offset + 1]]);

        (first, second)
    }

    /// Create an empty file; fails if the name already exists.
    pub fn touch(&mut self, path: &str) -> Result<()> {
        let abs = self.absolute(path);
        let (parent_cluster, name11) = self.prepare_new_entry(&abs)?;

        let slot = dir::find_free_slot(&mut self.device, &self.bpb, parent_cluster)?;
        dir::write_slot(
            &mut self.device,
            slot,
            &DirEntry {
                name: name11,
                attr: ATTR_ARCHIVE,
                first_cluster: 0,
                size: 0,
            },
        );
        Ok(())
    }

    /// Create a directory with its `.` and `..` entries.
    pub fn mkdir(&mut self, path: &str) -> Result<()> {
        let abs = self.absolute(path);
        let (parent_cluster, name11) = self.prepare_new_entry(&abs)?;

        let cluster = table::alloc_cluster(&mut self.device, &self.bpb)?;
        dir::zero_cluster(&mut self.device, &self.bpb, cluster);

        // `.` points at the new directory itself, `..` at its parent
        // (cluster 0 when the parent is the root).
        let mut sector = [0_u8; SECTOR_SIZE];
        DirEntry {
            name: name::DOT_NAME,
            attr: ATTR_DIRECTORY,
            first_cluster: cluster,
            size: 0,
        }
        .encode(&mut sector[..dir::ENTRY_SIZE]);
        DirEntry {
            name: name::DOTDOT_NAME,
            attr: ATTR_DIRECTORY,
            first_cluster: parent_cluster,
            size: 0,
        }
        .encode(&mut sector[dir::ENTRY_SIZE..2 * dir::ENTRY_SIZE]);
        self.device
            .write_sector(self.bpb.cluster_to_sector(cluster), &sector);

        let slot = dir::find_free_slot(&mut self.device, &self.bpb, parent_cluster)?;
        dir::write_slot(
            &mut self.device,
            slot,
            &DirEntry {
                name: name11,
                attr: ATTR_DIRECTORY,
                first_cluster: cluster,
                size: 0,
            },
        );
        Ok(())
    }

    /// Create every missing directory along `path`. Existing directories
    /// are fine; an existing non-directory component is a hard failure.
    pub fn mkdir_p(&mut self, path: &str) -> Result<()> {
        let abs = self.absolute(path);
        if abs == "/" {
            return Ok(());
        }

        let mut so_far = String::new();
        for component in abs[1..].split('/') {
            so_far.push('/');
            so_far.push_str(component);

            match self.locate(&so_far) {
                Ok((_, entry, _)) => {
                    if !entry.is_directory() {
                        return Err(Fat16Error::NotADirectory);
                    }
                }
                Err(Fat16Error::NotFound) => self.mkdir(&so_far)?,
                Err(other) => return Err(other),
            }
        }
        Ok(())
    }

    /// Replace (or create) the file at `path` with `data`.
    ///
    /// An existing chain is freed first, then a fresh chain is built
    /// cluster by cluster with zero-filled tails, and finally the
    /// directory slot gets the new first cluster and size.
    pub fn write_file(&mut self, path: &str, data: &[u8]) -> Result<()> {
        let abs = self.absolute(path);

        let (slot, mut entry) = match self.locate(&abs) {
            Ok((_, entry, slot)) => {
                if entry.is_directory() {
                    return Err(Fat16Error::NotAFile);
                }
                if entry.first_cluster >= 2 {
                    table::free_chain(&mut self.device, &self.bpb, entry.first_cluster);
                }
                (slot, entry)
            }
            Err(Fat16Error::NotFound) => {
                let (parent_cluster, name11) = self.prepare_new_entry(&abs)?;
                let slot = dir::find_free_slot(&mut self.device, &self.bpb, parent_cluster)?;
                let entry = DirEntry {
                    name: name11,
                    attr: ATTR_ARCHIVE,
                    first_cluster: 0,
                    size: 0,
                };
                dir::write_slot(&mut self.device, slot, &entry);
                (slot, entry)
            }
            Err(other) => return Err(other),
        };

        entry.first_cluster = if data.is_empty() {
            0
        } else {
            self.write_chain(data)?
        };
        entry.size = data.len() as u32;
        dir::write_slot(&mut self.device, slot, &entry);
        Ok(())
    }

    /// Append `data` to the file at `path`.
    ///
    /// An empty file degenerates to [`write_file`](Self::write_file). A
    /// partially used last cluster is filled in place (read-modify-write
    /// of the affected sectors) before fresh clusters are linked on.
    pub fn append_file(&mut self, path: &str, data: &[u8]) -> Result<()> {
        let abs = self.absolute(path);
        let (_, entry, slot) = self.locate(&abs)?;
        if entry.is_directory() {
            return Err(Fat16Error::NotAFile);
        }

        if entry.size == 0 || entry.first_cluster < 2 {
            return self.write_file(&abs, data);
        }
        if data.is_empty() {
            return Ok(());
        }

        let cluster_bytes = self.bpb.cluster_bytes();
        let mut last = table::last_cluster(&mut self.device, &self.bpb, entry.first_cluster);
        let mut remaining = data;

        let tail_used = (entry.size % cluster_bytes) as usize;
        if tail_used != 0 {
            let space = cluster_bytes as usize - tail_used;
            let take = remaining.len().min(space);
            self.fill_cluster_suffix(last, tail_used, &remaining[..take]);
            remaining = &remaining[take..];
        }

        for chunk in remaining.chunks(cluster_bytes as usize) {
            let cluster = table::alloc_cluster(&mut self.device, &self.bpb)?;
            table::set_entry(&mut self.device, &self.bpb, last, cluster);
            self.fill_fresh_cluster(cluster, chunk);
            last = cluster;
        }

        let mut updated = entry;
        updated.size += data.len() as u32;
        dir::write_slot(&mut self.device, slot, &updated);
        Ok(())
    }

    /// Read up to `out.len()` bytes from byte `offset` of the file at
    /// `path`. Reading at or past EOF succeeds with 0 bytes.
    pub fn read_at(&mut self, path: &str, offset: u32, out: &mut [u8]) -> Result<usize> {
        let abs = self.absolute(path);
        let (_, entry, _) = self.locate(&abs)?;
        if entry.is_directory() {
            return Err(Fat16Error::NotAFile);
        }
        if offset >= entry.size || out.is_empty() {
            return Ok(0);
        }

        let len = out.len().min((entry.size - offset) as usize);
        let cluster_bytes = self.bpb.cluster_bytes();

        // Skip whole clusters, then position within the first one read.
        let mut cluster = table::nth_cluster(
            &mut self.device,
            &self.bpb,
            entry.first_cluster,
            offset / cluster_bytes,
        )
        .ok_or(Fat16Error::BadVolume("chain shorter than file size"))?;
        let mut in_cluster = (offset % cluster_bytes) as usize;

        let mut copied = 0_usize;
        let mut sector_buf = [0_u8; SECTOR_SIZE];
        while copied < len {
            let sector_index = (in_cluster / SECTOR_SIZE) as u32;
            let byte_offset = in_cluster % SECTOR_SIZE;
            self.device.read_sector(
                self.bpb.cluster_to_sector(cluster) + sector_index,
                &mut sector_buf,
            );

            let take = (SECTOR_SIZE - byte_offset).min(len - copied);
            out[copied..copied + take]
                .copy_from_slice(&sector_buf[byte_offset..byte_offset + take]);
            copied += take;
            in_cluster += take;

            if in_cluster >= cluster_bytes as usize && copied < len {
                let next = table::entry(&mut self.device, &self.bpb, cluster);
                if !(2..table::FAT_END_MIN).contains(&next) {
                    break;
                }
                cluster = next;
                in_cluster = 0;
            }
        }

        Ok(copied)
    }

    /// Read a whole file into a heap buffer.
    pub fn read_file(&mut self, path: &str) -> Result<Vec<u8>> {
        let abs = self.absolute(path);
        let size = self.file_size(&abs)? as usize;
        let mut data = vec![0_u8; size];
        let read = self.read_at(&abs, 0, &mut data)?;
        data.truncate(read);
        Ok(data)
    }

    /// Delete a file: free its chain, mark its slot deleted.
    pub fn rm(&mut self, path: &str) -> Result<()> {
        let abs = self.absolute(path);
        let (_, entry, slot) = self.locate(&abs)?;
        if entry.is_directory() {
            return Err(Fat16Error::NotAFile);
        }

        if entry.first_cluster >= 2 {
            table::free_chain(&mut self.device, &self.bpb, entry.first_cluster);
        }
        dir::mark_deleted(&mut self.device, slot);
        Ok(())
    }

    /// Delete an empty directory.
    pub fn rmdir(&mut self, path: &str) -> Result<()> {
        let abs = self.absolute(path);
        let (_, entry, slot) = self.locate(&abs)?;
        if !entry.is_directory() {
            return Err(Fat16Error::NotADirectory);
        }
        if !dir::is_empty(&mut self.device, &self.bpb, entry.first_cluster) {
            return Err(Fat16Error::DirectoryNotEmpty);
        }

        table::free_chain(&mut self.device, &self.bpb, entry.first_cluster);
        dir::mark_deleted(&mut self.device, slot);
        Ok(())
    }

    /// Delete a file or a whole directory tree, bottom-up. The root
    /// itself cannot be removed.
    pub fn rm_rf(&mut self, path: &str) -> Result<()> {
        let abs = self.absolute(path);
        if abs == "/" {
            return Err(Fat16Error::RootForbidden);
        }

        let (_, entry, slot) = self.locate(&abs)?;
        if entry.is_directory() {
            self.remove_tree(entry.first_cluster)?;
        }
        if entry.first_cluster >= 2 {
            table::free_chain(&mut self.device, &self.bpb, entry.first_cluster);
        }
        dir::mark_deleted(&mut self.device, slot);
        Ok(())
    }

    /// Rename or move.
    ///
    /// When `dst` names an existing directory the final name is
    /// `basename(src)` inside it. Within one parent directory this is an
    /// in-place rename (files and directories alike); across parents it
    /// is copy-then-delete, files only, and not atomic: a failure between
    /// the two phases leaves both names on disk.
    pub fn mv(&mut self, src: &str, dst: &str) -> Result<()> {
        let src_abs = self.absolute(src);
        let (src_parent_cluster, src_entry, src_slot) = self.locate(&src_abs)?;

        let dst_abs = self.destination_path(&src_abs, dst);
        if dst_abs == src_abs {
            return Ok(());
        }
        if self.exists_abs(&dst_abs) {
            return Err(Fat16Error::AlreadyExists);
        }

        let (dst_parent, dst_name) = path::split_parent(&dst_abs);
        if dst_name.is_empty() {
            return Err(Fat16Error::RootForbidden);
        }
        let dst_parent_cluster = self.resolve_dir(dst_parent)?;

        if dst_parent_cluster == src_parent_cluster {
            let mut renamed = src_entry;
            renamed.name = name::encode_83(dst_name)?;
            dir::write_slot(&mut self.device, src_slot, &renamed);
            return Ok(());
        }

        if src_entry.is_directory() {
            return Err(Fat16Error::NotAFile);
        }

        let data = self.read_file(&src_abs)?;
        self.write_file(&dst_abs, &data)?;
        self.rm(&src_abs)
    }

    /// Copy a file. Directory sources are refused; the destination is
    /// disambiguated like [`mv`](Self::mv) and overwritten if it is an
    /// existing file.
    pub fn cp(&mut self, src: &str, dst: &str) -> Result<()> {
        let src_abs = self.absolute(src);
        let (_, src_entry, _) = self.locate(&src_abs)?;
        if src_entry.is_directory() {
            return Err(Fat16Error::NotAFile);
        }

        let dst_abs = self.destination_path(&src_abs, dst);
        if dst_abs == src_abs {
            return Err(Fat16Error::AlreadyExists);
        }
        if self.is_directory_abs(&dst_abs) {
            return Err(Fat16Error::NotAFile);
        }

        let data = self.read_file(&src_abs)?;
        self.write_file(&dst_abs, &data)
    }

    /// Names of the live entries in the directory at `path`, `.`/`..`
    /// excluded.
    pub fn list_names(&mut self, path: &str) -> Result<Vec<String>> {
        let abs = self.absolute(path);
        let cluster = self.resolve_dir(&abs)?;

        let mut names = Vec::new();
        dir::scan(&mut self.device, &self.bpb, cluster, |entry, _slot| {
            if entry.name != name::DOT_NAME && entry.name != name::DOTDOT_NAME {
                names.push(entry.display_name());
            }
            None::<()>
        });
        Ok(names)
    }

    /// Directory listing into a caller buffer: one name per `\n`-ended
    /// line, always NUL-terminated, truncated to `out.len() - 1` bytes.
    /// Returns the byte count written, NUL excluded.
    pub fn list_dir(&mut self, path: &str, out: &mut [u8]) -> Result<usize> {
        let names = self.list_names(path)?;
        if out.is_empty() {
            return Ok(0);
        }

        let cap = out.len() - 1;
        let mut written = 0_usize;
        'fill: for entry_name in &names {
            for &byte in entry_name.as_bytes().iter().chain(core::iter::once(&b'\n')) {
                if written >= cap {
                    break 'fill;
                }
                out[written] = byte;
                written += 1;
            }
        }
        out[written] = 0;
        Ok(written)
    }

    /// Normalize `input` against the working directory.
    fn absolute(&self, input: &str) -> String {
        path::normalize(&self.current_path, input)
    }

    /// Walk a canonical absolute path to a directory cluster. Every
    /// component must name a directory.
    fn resolve_dir(&mut self, abs: &str) -> Result<u16> {
        if abs == "/" {
            return Ok(0);
        }
        if abs == self.current_path {
            return Ok(self.current_dir_cluster);
        }

        let mut cluster = 0_u16;
        for component in abs[1..].split('/') {
            let name11 = name::encode_83(component)?;
            let (entry, _) =
                dir::find_entry(&mut self.device, &self.bpb, cluster, &name11)
                    .ok_or(Fat16Error::NotFound)?;
            if !entry.is_directory() {
                return Err(Fat16Error::NotADirectory);
            }
            cluster = entry.first_cluster;
        }
        Ok(cluster)
    }

    /// Locate a non-root canonical path: parent cluster, entry and slot.
    fn locate(&mut self, abs: &str) -> Result<(u16, DirEntry, SlotLocation)> {
        let (parent, final_name) = path::split_parent(abs);
        if final_name.is_empty() {
            return Err(Fat16Error::RootForbidden);
        }

        let parent_cluster = self.resolve_dir(parent)?;
        let name11 = name::encode_83(final_name)?;
        let (entry, slot) = dir::find_entry(&mut self.device, &self.bpb, parent_cluster, &name11)
            .ok_or(Fat16Error::NotFound)?;
        Ok((parent_cluster, entry, slot))
    }

    /// Common front half of every create: parent must exist, name must
    /// encode, nothing may already wear it. Returns (parent, name11).
    fn prepare_new_entry(&mut self, abs: &str) -> Result<(u16, [u8; 11])> {
        let (parent, final_name) = path::split_parent(abs);
        if final_name.is_empty() {
            return Err(Fat16Error::InvalidName);
        }

        let parent_cluster = self.resolve_dir(parent)?;
        let name11 = name::encode_83(final_name)?;
        if dir::find_entry(&mut self.device, &self.bpb, parent_cluster, &name11).is_some() {
            return Err(Fat16Error::AlreadyExists);
        }
        Ok((parent_cluster, name11))
    }

    fn exists_abs(&mut self, abs: &str) -> bool {
        abs == "/" || self.locate(abs).is_ok()
    }

    fn is_directory_abs(&mut self, abs: &str) -> bool {
        abs == "/"
            || matches!(self.locate(abs), Ok((_, entry, _)) if entry.is_directory())
    }

    /// Resolve the `mv`/`cp` destination rule: an existing directory
    /// receives `basename(src)` inside it.
    fn destination_path(&mut self, src_abs: &str, dst: &str) -> String {
        let dst_abs = self.absolute(dst);
        if self.is_directory_abs(&dst_abs) {
            path::normalize(&dst_abs, path::basename(src_abs))
        } else {
            dst_abs
        }
    }

    /// Allocate and fill a fresh chain for `data`, returning its first
    /// cluster. `data` must not be empty.
    fn write_chain(&mut self, data: &[u8]) -> Result<u16> {
        let cluster_bytes = self.bpb.cluster_bytes() as usize;
        let mut first = 0_u16;
        let mut previous = 0_u16;

        for chunk in data.chunks(cluster_bytes) {
            let cluster = table::alloc_cluster(&mut self.device, &self.bpb)?;
            if previous == 0 {
                first = cluster;
            } else {
                table::set_entry(&mut self.device, &self.bpb, previous, cluster);
            }
            self.fill_fresh_cluster(cluster, chunk);
            previous = cluster;
        }

        Ok(first)
    }

    /// Write `data` from the start of a fresh cluster, zero-filling every
    /// unused tail byte.
    fn fill_fresh_cluster(&mut self, cluster: u16, data: &[u8]) {
        let start = self.bpb.cluster_to_sector(cluster);
        let mut buf = [0_u8; SECTOR_SIZE];

        for sector_index in 0..u32::from(self.bpb.sectors_per_cluster) {
            buf.fill(0);
            let from = sector_index as usize * SECTOR_SIZE;
            if from < data.len() {
                let take = (data.len() - from).min(SECTOR_SIZE);
                buf[..take].copy_from_slice(&data[from..from + take]);
            }
            self.device.write_sector(start + sector_index, &buf);
        }
    }

    /// Write `data` into an existing cluster starting at byte
    /// `start_offset`, read-modify-writing only the affected sectors.
    fn fill_cluster_suffix(&mut self, cluster: u16, start_offset: usize, data: &[u8]) {
        let base = self.bpb.cluster_to_sector(cluster);
        let mut buf = [0_u8; SECTOR_SIZE];

        let mut written = 0_usize;
        let mut offset = start_offset;
        while written < data.len() {
            let sector_index = (offset / SECTOR_SIZE) as u32;
            let byte_offset = offset % SECTOR_SIZE;
            let take = (SECTOR_SIZE - byte_offset).min(data.len() - written);

            self.device.read_sector(base + sector_index, &mut buf);
            buf[byte_offset..byte_offset + take]
                .copy_from_slice(&data[written..written + take]);
            self.device.write_sector(base + sector_index, &buf);

            written += take;
            offset += take;
        }
    }

    /// Depth-first deletion of everything below `dir_cluster`.
    fn remove_tree(&mut self, dir_cluster: u16) -> Result<()> {
        let mut children: Vec<(DirEntry, SlotLocation)> = Vec::new();
        dir::scan(&mut self.device, &self.bpb, dir_cluster, |entry, slot| {
            if entry.name != name::DOT_NAME && entry.name != name::DOTDOT_NAME {
                children.push((*entry, slot));
            }
            None::<()>
        });

        for (entry, slot) in children {
            if entry.is_directory() {
                self.remove_tree(entry.first_cluster)?;
            }
            if entry.first_cluster >= 2 {
                table::free_chain(&mut self.device, &self.bpb, entry.first_cluster);
            }
            dir::mark_deleted(&mut self.device, slot);
        }
        Ok(())
    }
}

/// Write a blank FAT16 filesystem onto `device`: boot sector, two mirrored
/// FATs with the reserved head entries, and an empty root directory.
///
/// Tests format [`RamDisk`](crate::block::RamDisk)s with this; the shell's
/// disk self-test uses it on scratch images too.
pub fn format<D: BlockDevice>(device: &mut D, total_sectors: u32, sectors_per_cluster: u8) {
    const RESERVED_SECTORS: u16 = 1;
    const NUM_FATS: u8 = 2;
    const ROOT_ENTRIES: u16 = 512;

    let root_sectors = u32::from(ROOT_ENTRIES) * 32 / SECTOR_SIZE as u32;

    // Fixed-point iteration: the FAT size depends on the cluster count,
    // which depends on the FAT size. Two rounds converge.
    let mut sectors_per_fat = 1_u32;
    for _ in 0..2 {
        let data_sectors = total_sectors
            - u32::from(RESERVED_SECTORS)
            - root_sectors
            - u32::from(NUM_FATS) * sectors_per_fat;
        let clusters = data_sectors / u32::from(sectors_per_cluster);
        sectors_per_fat = ((clusters + 2) * 2).div_ceil(SECTOR_SIZE as u32);
    }

    let mut boot = [0_u8; SECTOR_SIZE];
    boot[0] = 0xEB; // jmp short
    boot[1] = 0x3C;
    boot[2] = 0x90; // nop
    boot[3..11].copy_from_slice(b"OPAL OS ");
    boot[11..13].copy_from_slice(&(SECTOR_SIZE as u16).to_le_bytes());
    boot[13] = sectors_per_cluster;
    boot[14..16].copy_from_slice(&RESERVED_SECTORS.to_le_bytes());
    boot[16] = NUM_FATS;
    boot[17..19].copy_from_slice(&ROOT_ENTRIES.to_le_bytes());
    if total_sectors <= u32::from(u16::MAX) {
        boot[19..21].copy_from_slice(&(total_sectors as u16).to_le_bytes());
    } else {
        boot[32..36].copy_from_slice(&total_sectors.to_le_bytes());
    }
    boot[21] = 0xF8; // fixed-disk media descriptor
    boot[22..24].copy_from_slice(&(sectors_per_fat as u16).to_le_bytes());
    boot[510] = 0x55;
    boot[511] = 0xAA;
    device.write_sector(0, &boot);

    // Both FATs: reserved entries 0 and 1, everything else free.
    let mut fat_head = [0_u8; SECTOR_SIZE];
    fat_head[0..2].copy_from_slice(&0xFFF8_u16.to_le_bytes());
    fat_head[2..4].copy_from_slice(&0xFFFF_u16.to_le_bytes());
    let zeroes = [0_u8; SECTOR_SIZE];
    for copy in 0..u32::from(NUM_FATS) {
        let fat_start = u32::from(RESERVED_SECTORS) + copy * sectors_per_fat;
        device.write_sector(fat_start, &fat_head);
        for sector in 1..sectors_per_fat {
            device.write_sector(fat_start + sector, &zeroes);
        }
    }

    // Empty root directory.
    let root_start = u32::from(RESERVED_SECTORS) + u32::from(NUM_FATS) * sectors_per_fat;
    for sector in 0..root_sectors {
        device.write_sector(root_start + sector, &zeroes);
    }
}

/// The kernel's one mounted filesystem, shared by the syscall layer, the
/// exec loader and the shell.
static FILESYSTEM: Mutex<Option<Fat16<Box<dyn BlockDevice + Send>>>> = Mutex::new(None);

/// Mount `device` as the kernel filesystem, replacing any previous mount.
pub fn mount_device(device: Box<dyn BlockDevice + Send>) -> Result<()> {
    let fs = Fat16::mount(device)?;
    *FILESYSTEM.lock() = Some(fs);
    Ok(())
}

/// Run `f` against the mounted filesystem.
///
/// Holding the mutex for the whole closure is what serializes complete
/// FAT16 operations, per the engine's re-entrancy contract.
pub fn with_fs<T>(
    f: impl FnOnce(&mut Fat16<Box<dyn BlockDevice + Send>>) -> Result<T>,
) -> Result<T> {
    let mut guard = FILESYSTEM.lock();
    match guard.as_mut() {
        Some(fs) => f(fs),
        None => Err(Fat16Error::NotMounted),
    }
}
