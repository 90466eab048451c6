//! ELF32 executable loader.
//!
//! Loads `ET_EXEC` images for i386 straight out of the filesystem into
//! the identity-mapped user window: `PT_LOAD` file bytes are read to
//! their virtual addresses, BSS tails are zero-filled, and the union of
//! the loaded segments is reported back so the exec layer can scope the
//! user page grants.

use core::fmt;

use crate::block::BlockDevice;
use crate::fat16::{Fat16, Fat16Error};
use crate::userspace::{USER_MAX_VADDR, USER_MIN_VADDR};

/// ELF header size for class 32.
const EHDR_SIZE: usize = 52;
/// Program header entry size for class 32.
const PHDR_SIZE: usize = 32;
/// Upper bound on program headers a sane image of ours carries.
const MAX_PHDRS: u16 = 32;

const ET_EXEC: u16 = 2;
const EM_386: u16 = 3;
const PT_LOAD: u32 = 1;

/// Loader failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElfError {
    /// The filesystem could not produce the image bytes.
    Filesystem(Fat16Error),
    /// The file is not a loadable i386 ELF32 executable.
    NotAnExecutable(&'static str),
    /// A program header describes an impossible or out-of-window segment.
    BadSegment(&'static str),
}

impl fmt::Display for ElfError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Filesystem(err) => write!(f, "filesystem: {err}"),
            Self::NotAnExecutable(reason) => write!(f, "not an executable: {reason}"),
            Self::BadSegment(reason) => write!(f, "bad segment: {reason}"),
        }
    }
}

impl From<Fat16Error> for ElfError {
    fn from(err: Fat16Error) -> Self {
        Self::Filesystem(err)
    }
}

/// Where a successfully loaded image ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadedImage {
    /// Program entry point.
    pub entry: u32,
    /// Lowest loaded virtual address.
    pub low: u32,
    /// One past the highest loaded virtual address.
    pub high: u32,
}

struct Header {
    e_type: u16,
    e_machine: u16,
    e_version: u32,
    e_entry: u32,
    e_phoff: u32,
    e_phentsize: u16,
    e_phnum: u16,
}

struct ProgramHeader {
    p_type: u32,
    p_offset: u32,
    p_vaddr: u32,
    p_filesz: u32,
    p_memsz: u32,
}

/// Validate and load the executable at `path` into user memory.
pub fn load<D: BlockDevice>(fs: &mut Fat16<D>, path: &str) -> Result<LoadedImage, ElfError> {
    let file_size = fs.file_size(path)?;
    if (file_size as usize) < EHDR_SIZE {
        return Err(ElfError::NotAnExecutable("file shorter than an ELF header"));
    }

    let mut ehdr_bytes = [0_u8; EHDR_SIZE];
    read_exact(fs, path, 0, &mut ehdr_bytes)?;
    let header = parse_header(&ehdr_bytes)?;

    if header.e_type != ET_EXEC {
        return Err(ElfError::NotAnExecutable("not ET_EXEC"));
    }
    if header.e_machine != EM_386 {
        return Err(ElfError::NotAnExecutable("not an i386 image"));
    }
    if header.e_version != 1 {
        return Err(ElfError::NotAnExecutable("bad ELF version"));
    }
    if usize::from(header.e_phentsize) != PHDR_SIZE {
        return Err(ElfError::NotAnExecutable("unexpected program header size"));
    }
    if header.e_phnum == 0 || header.e_phnum > MAX_PHDRS {
        return Err(ElfError::NotAnExecutable("unreasonable program header count"));
    }

    let table_bytes = u32::from(header.e_phnum) * PHDR_SIZE as u32;
    if header.e_phoff.checked_add(table_bytes).map_or(true, |end| end > file_size) {
        return Err(ElfError::NotAnExecutable("program header table escapes file"));
    }

    let mut low = u32::MAX;
    let mut high = 0_u32;

    for index in 0..header.e_phnum {
        let mut phdr_bytes = [0_u8; PHDR_SIZE];
        read_exact(
            fs,
            path,
            header.e_phoff + u32::from(index) * PHDR_SIZE as u32,
            &mut phdr_bytes,
        )?;
        let phdr = parse_program_header(&phdr_bytes);

        if phdr.p_type != PT_LOAD || phdr.p_memsz == 0 {
            continue;
        }

        if phdr
            .p_offset
            .checked_add(phdr.p_filesz)
            .map_or(true, |end| end > file_size)
        {
            return Err(ElfError::BadSegment("file extent escapes the file"));
        }

        let seg_start = phdr.p_vaddr;
        let seg_end = phdr
            .p_vaddr
            .checked_add(phdr.p_memsz)
            .ok_or(ElfError::BadSegment("virtual range wraps"))?;
        if seg_start < USER_MIN_VADDR || seg_end > USER_MAX_VADDR || seg_end <= seg_start {
            return Err(ElfError::BadSegment("virtual range outside the user window"));
        }

        low = low.min(seg_start);
        high = high.max(seg_end);

        if phdr.p_filesz > 0 {
            // SAFETY:
            // The segment range was just validated against the identity
            // mapped user window, which is backed by real memory and owned
            // by the (single) user image being replaced right now.
            let dest = unsafe {
                core::slice::from_raw_parts_mut(seg_start as *mut u8, phdr.p_filesz as usize)
            };
            read_exact(fs, path, phdr.p_offset, dest)?;
        }

        if phdr.p_memsz > phdr.p_filesz {
            // SAFETY:
            // Same validated range; this is the BSS tail.
            unsafe {
                core::ptr::write_bytes(
                    (seg_start + phdr.p_filesz) as *mut u8,
                    0,
                    (phdr.p_memsz - phdr.p_filesz) as usize,
                );
            }
        }
    }

    if low == u32::MAX || high == 0 {
        return Err(ElfError::BadSegment("no loadable segment"));
    }
    if header.e_entry < low || header.e_entry >= high {
        return Err(ElfError::BadSegment("entry point outside loaded range"));
    }

    Ok(LoadedImage {
        entry: header.e_entry,
        low,
        high,
    })
}

fn parse_header(bytes: &[u8; EHDR_SIZE]) -> Result<Header, ElfError> {
    if bytes[0..4] != [0x7F, b'E', b'L', b'F'] {
        return Err(ElfError::NotAnExecutable("bad magic"));
    }
    if bytes[4] != 1 {
        return Err(ElfError::NotAnExecutable("not ELFCLASS32"));
    }
    if bytes[5] != 1 {
        return Err(ElfError::NotAnExecutable("not little-endian"));
    }
    if bytes[6] != 1 {
        return Err(ElfError::NotAnExecutable("bad ident version"));
    }

    Ok(Header {
        e_type: read_u16(bytes, 16),
        e_machine: read_u16(bytes, 18),
        e_version: read_u32(bytes, 20),
        e_entry: read_u32(bytes, 24),
        e_phoff: read_u32(bytes, 28),
        e_phentsize: read_u16(bytes, 42),
        e_phnum: read_u16(bytes, 44),
    })
}

fn parse_program_header(bytes: &[u8; PHDR_SIZE]) -> ProgramHeader {
    ProgramHeader {
        p_type: read_u32(bytes, 0),
        p_offset: read_u32(bytes, 4),
        p_vaddr: read_u32(bytes, 8),
        p_filesz: read_u32(bytes, 16),
        p_memsz: read_u32(bytes, 20),
    }
}

fn read_exact<D: BlockDevice>(
    fs: &mut Fat16<D>,
    path: &str,
    offset: u32,
    out: &mut [u8],
) -> Result<(), ElfError> {
    let read = fs.read_at(path, offset, out)?;
    if read != out.len() {
        return Err(ElfError::NotAnExecutable("truncated read"));
    }
    Ok(())
}

fn read_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn test_header_parser_rejects_wrong_magic() {
        let mut bytes = [0_u8; EHDR_SIZE];
        bytes[0..4].copy_from_slice(b"ELF\x7F");
        assert!(parse_header(&bytes).is_err(), "Shuffled magic must fail.");
    }

    #[test_case]
    fn test_header_parser_accepts_i386_exec_ident() {
        let mut bytes = [0_u8; EHDR_SIZE];
        bytes[0..4].copy_from_slice(&[0x7F, b'E', b'L', b'F']);
        bytes[4] = 1; // ELFCLASS32
        bytes[5] = 1; // ELFDATA2LSB
        bytes[6] = 1; // EV_CURRENT
        bytes[16..18].copy_from_slice(&ET_EXEC.to_le_bytes());
        bytes[18..20].copy_from_slice(&EM_386.to_le_bytes());

        let header = parse_header(&bytes).expect("valid ident");
        assert_eq!(header.e_type, ET_EXEC, "Type field decoded.");
        assert_eq!(header.e_machine, EM_386, "Machine field decoded.");
    }
}
