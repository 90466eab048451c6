//! Syscall handler module.
//!
//! Provides the interrupt-based syscall interface for user-mode programs.
//! User programs invoke syscalls via `int 0x80` with the following
//! register convention:
//!
//! - `eax`: syscall number
//! - `ebx`: first argument
//! - `ecx`: second argument
//! - `edx`: third argument
//!
//! The return value is placed in the saved `eax` slot of the trap frame,
//! which `iretd` delivers back to the caller. Pointer arguments arrive as
//! raw user addresses and are never trusted: every access goes through
//! [`UserPtr`], which bounds-checks against the user window.

use alloc::string::{String, ToString};

use bitflags::bitflags;
use spin::Mutex;

use crate::fat16::{self, Fat16Error};
use crate::interrupts::Registers;
use crate::vga_buffer::clear_screen;
use crate::{print, userspace};

use super::process;

/// Write a NUL-terminated string to the console.
pub const SYS_WRITE: u32 = 0;
/// Clear the console.
pub const SYS_CLEAR: u32 = 1;
/// Terminate the process; never returns to user mode.
pub const SYS_EXIT: u32 = 2;
/// Open a file, honoring the open flags.
pub const SYS_OPEN: u32 = 3;
/// Read from an open descriptor at its current offset.
pub const SYS_READ: u32 = 4;
/// Close a descriptor.
pub const SYS_CLOSE: u32 = 5;
/// Change the working directory.
pub const SYS_CHDIR: u32 = 6;
/// Copy the working directory into a user buffer.
pub const SYS_GETCWD: u32 = 7;
/// Write through an open descriptor (append-oriented, see [`sys_writefd`]).
pub const SYS_WRITEFD: u32 = 8;
/// List a directory into a user buffer, one name per line.
pub const SYS_LISTDIR: u32 = 9;

/// The generic syscall failure value.
const SYSCALL_ERROR: u32 = -1_i32 as u32;

bitflags! {
    /// Open flags; read-only is the absence of every bit.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        /// Write-only descriptor.
        const WRONLY = 1 << 0;
        /// Every write lands at end-of-file.
        const APPEND = 1 << 1;
        /// Create the file when missing.
        const CREAT = 1 << 2;
        /// The first write replaces the file content.
        const TRUNC = 1 << 3;
    }
}

/// Open descriptor capacity.
const MAX_FDS: usize = 16;
/// Stored path bound, terminator included.
const FD_PATH_MAX: usize = 128;

/// One open-file record.
struct OpenFile {
    flags: OpenFlags,
    /// Byte offset of the next read.
    offset: u32,
    /// Size snapshot, maintained across writes through this descriptor.
    size: u32,
    path: String,
}

const NO_FILE: Option<OpenFile> = None;

static FD_TABLE: Mutex<[Option<OpenFile>; MAX_FDS]> = Mutex::new([NO_FILE; MAX_FDS]);

/// A raw address received from Ring 3.
///
/// User pointers must land inside the identity-mapped user region (image
/// window plus stack); anything else is rejected before the first byte is
/// touched.
#[derive(Debug, Clone, Copy)]
struct UserPtr(u32);

impl UserPtr {
    fn in_bounds(self, len: u32) -> bool {
        let start = self.0;
        match start.checked_add(len) {
            Some(end) => {
                start >= userspace::USER_MIN_VADDR && end <= userspace::USER_STACK_TOP
            }
            None => false,
        }
    }

    /// Borrow `len` user bytes for reading.
    fn as_slice(self, len: u32) -> Option<&'static [u8]> {
        if !self.in_bounds(len) {
            return None;
        }
        // SAFETY:
        // The range lies inside the identity-mapped user window, which is
        // always backed by real memory.
        Some(unsafe { core::slice::from_raw_parts(self.0 as *const u8, len as usize) })
    }

    /// Borrow `len` user bytes for writing.
    fn as_mut_slice(self, len: u32) -> Option<&'static mut [u8]> {
        if !self.in_bounds(len) {
            return None;
        }
        // SAFETY:
        // Same range argument as `as_slice`; the kernel is single-threaded
        // per process, so no aliasing access exists while the handler runs.
        Some(unsafe { core::slice::from_raw_parts_mut(self.0 as *mut u8, len as usize) })
    }

    /// Copy in a NUL-terminated string of at most `max - 1` content bytes.
    fn read_cstr(self, max: usize) -> Option<String> {
        for len in 0..max as u32 {
            let byte_ptr = Self(self.0 + len);
            let byte = *byte_ptr.as_slice(1)?.first()?;
            if byte == 0 {
                let bytes = self.as_slice(len)?;
                return core::str::from_utf8(bytes).ok().map(ToString::to_string);
            }
        }
        None
    }
}

/// Dispatch a syscall trap: decode `eax` and the argument registers, run
/// the operation, and write the result into the frame's `eax` slot.
pub fn handle(frame: &mut Registers) {
    let result = match frame.eax {
        SYS_WRITE => sys_write(UserPtr(frame.ebx)),
        SYS_CLEAR => {
            clear_screen();
            0
        }
        SYS_EXIT => {
            log::debug!("user process exited with code {}", frame.ebx as i32);
            process::exit_to_kernel(frame.ebx as i32);
        }
        SYS_OPEN => sys_open(UserPtr(frame.ebx), frame.ecx),
        SYS_READ => sys_read(frame.ebx as i32, UserPtr(frame.ecx), frame.edx),
        SYS_CLOSE => sys_close(frame.ebx as i32),
        SYS_CHDIR => sys_chdir(UserPtr(frame.ebx)),
        SYS_GETCWD => sys_getcwd(UserPtr(frame.ebx), frame.ecx),
        SYS_WRITEFD => sys_writefd(frame.ebx as i32, UserPtr(frame.ecx), frame.edx),
        SYS_LISTDIR => sys_listdir(UserPtr(frame.ebx), UserPtr(frame.ecx), frame.edx),
        unknown => {
            log::warn!("unknown syscall number: {unknown}");
            SYSCALL_ERROR
        }
    };

    frame.eax = result;
}

fn sys_write(message: UserPtr) -> u32 {
    // The console is a text device; cap a single write at one screen's
    // worth of a pathological string rather than scanning forever.
    match message.read_cstr(4096) {
        Some(text) => {
            print!("{text}");
            0
        }
        None => SYSCALL_ERROR,
    }
}

fn sys_open(path: UserPtr, flags: u32) -> u32 {
    let Some(path) = path.read_cstr(FD_PATH_MAX) else {
        return SYSCALL_ERROR;
    };
    let flags = OpenFlags::from_bits_truncate(flags);

    let size = match fat16::with_fs(|fs| match fs.file_size(&path) {
        Ok(size) => Ok(Some(size)),
        Err(Fat16Error::NotFound) => Ok(None),
        Err(other) => Err(other),
    }) {
        Ok(Some(size)) => size,
        Ok(None) => {
            if !flags.contains(OpenFlags::CREAT) {
                return SYSCALL_ERROR;
            }
            if fat16::with_fs(|fs| fs.write_file(&path, &[])).is_err() {
                return SYSCALL_ERROR;
            }
            0
        }
        Err(_) => return SYSCALL_ERROR,
    };

    let mut table = FD_TABLE.lock();
    let Some(fd) = table.iter().position(|slot| slot.is_none()) else {
        return SYSCALL_ERROR;
    };

    table[fd] = Some(OpenFile {
        flags,
        offset: if flags.contains(OpenFlags::APPEND) { size } else { 0 },
        size,
        path,
    });
    fd as u32
}

fn sys_read(fd: i32, buf: UserPtr, count: u32) -> u32 {
    let Some(out) = buf.as_mut_slice(count) else {
        return SYSCALL_ERROR;
    };

    let mut table = FD_TABLE.lock();
    let Some(file) = open_file(&mut table, fd) else {
        return SYSCALL_ERROR;
    };
    if file.flags.contains(OpenFlags::WRONLY) {
        return SYSCALL_ERROR;
    }

    let offset = file.offset;
    let path = file.path.clone();
    match fat16::with_fs(|fs| fs.read_at(&path, offset, out)) {
        Ok(read) => {
            file.offset += read as u32;
            read as u32
        }
        Err(_) => SYSCALL_ERROR,
    }
}

/// WRITEFD keeps the narrow append-oriented contract: with `APPEND`,
/// every write lands at end-of-file; with `TRUNC` and a zero offset, the
/// first write replaces the file and clears `TRUNC`; everything else
/// appends. There is no positional write.
fn sys_writefd(fd: i32, buf: UserPtr, count: u32) -> u32 {
    let Some(data) = buf.as_slice(count) else {
        return SYSCALL_ERROR;
    };

    let mut table = FD_TABLE.lock();
    let Some(file) = open_file(&mut table, fd) else {
        return SYSCALL_ERROR;
    };
    if !file.flags.contains(OpenFlags::WRONLY) {
        return SYSCALL_ERROR;
    }

    let path = file.path.clone();
    let outcome = if file.flags.contains(OpenFlags::APPEND) {
        fat16::with_fs(|fs| fs.append_file(&path, data))
    } else if file.flags.contains(OpenFlags::TRUNC) && file.offset == 0 {
        file.flags.remove(OpenFlags::TRUNC);
        fat16::with_fs(|fs| fs.write_file(&path, data))
    } else {
        fat16::with_fs(|fs| fs.append_file(&path, data))
    };

    if outcome.is_err() {
        return SYSCALL_ERROR;
    }

    file.offset += count;
    file.size += count;
    count
}

fn sys_close(fd: i32) -> u32 {
    let mut table = FD_TABLE.lock();
    if open_file(&mut table, fd).is_none() {
        return SYSCALL_ERROR;
    }
    table[fd as usize] = None;
    0
}

fn sys_chdir(path: UserPtr) -> u32 {
    let Some(path) = path.read_cstr(FD_PATH_MAX) else {
        return SYSCALL_ERROR;
    };
    match fat16::with_fs(|fs| fs.change_dir(&path)) {
        Ok(()) => 0,
        Err(_) => SYSCALL_ERROR,
    }
}

fn sys_getcwd(buf: UserPtr, size: u32) -> u32 {
    if size == 0 {
        return SYSCALL_ERROR;
    }
    let Some(out) = buf.as_mut_slice(size) else {
        return SYSCALL_ERROR;
    };

    let Ok(cwd) = fat16::with_fs(|fs| Ok(String::from(fs.current_path()))) else {
        return SYSCALL_ERROR;
    };

    // Copy at most size - 1 bytes; the buffer is always NUL-terminated.
    let take = cwd.len().min(out.len() - 1);
    out[..take].copy_from_slice(&cwd.as_bytes()[..take]);
    out[take] = 0;
    0
}

fn sys_listdir(path: UserPtr, buf: UserPtr, size: u32) -> u32 {
    let Some(path) = path.read_cstr(FD_PATH_MAX) else {
        return SYSCALL_ERROR;
    };
    if size == 0 {
        return SYSCALL_ERROR;
    }
    let Some(out) = buf.as_mut_slice(size) else {
        return SYSCALL_ERROR;
    };

    match fat16::with_fs(|fs| fs.list_dir(&path, out)) {
        Ok(written) => written as u32,
        Err(_) => SYSCALL_ERROR,
    }
}

fn open_file<'t>(
    table: &'t mut [Option<OpenFile>; MAX_FDS],
    fd: i32,
) -> Option<&'t mut OpenFile> {
    if !(0..MAX_FDS as i32).contains(&fd) {
        return None;
    }
    table[fd as usize].as_mut()
}

/// Drop every open descriptor. Tests use this to isolate scenarios; the
/// kernel itself never needs it with a single process.
pub fn reset_fd_table() {
    *FD_TABLE.lock() = [NO_FILE; MAX_FDS];
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(eax: u32, ebx: u32, ecx: u32, edx: u32) -> Registers {
        Registers {
            ds: 0,
            edi: 0,
            esi: 0,
            ebp: 0,
            esp: 0,
            ebx,
            edx,
            ecx,
            eax,
            int_no: u32::from(userspace::SYSCALL_INTERRUPT_INDEX),
            err_code: 0,
            eip: 0,
            cs: 0,
            eflags: 0,
            useresp: 0,
            ss: 0,
        }
    }

    #[test_case]
    fn test_unknown_syscall_returns_error() {
        let mut registers = frame(999, 0, 0, 0);
        handle(&mut registers);
        assert_eq!(
            registers.eax, SYSCALL_ERROR,
            "Unknown syscall should return -1.",
        );
    }

    #[test_case]
    fn test_sys_write_rejects_null_pointer() {
        let mut registers = frame(SYS_WRITE, 0, 0, 0);
        handle(&mut registers);
        assert_eq!(
            registers.eax, SYSCALL_ERROR,
            "Address 0 is outside the user window.",
        );
    }

    #[test_case]
    fn test_sys_write_rejects_kernel_pointer() {
        let mut registers = frame(SYS_WRITE, 0x0010_0000, 0, 0);
        handle(&mut registers);
        assert_eq!(
            registers.eax, SYSCALL_ERROR,
            "Kernel addresses must fail validation.",
        );
    }

    #[test_case]
    fn test_sys_read_rejects_bad_fd() {
        let mut registers = frame(SYS_READ, 77, userspace::USER_MIN_VADDR, 4);
        handle(&mut registers);
        assert_eq!(registers.eax, SYSCALL_ERROR, "fd 77 is never open.");
    }

    #[test_case]
    fn test_user_ptr_rejects_wrapping_range() {
        assert!(
            UserPtr(userspace::USER_MIN_VADDR).as_slice(u32::MAX).is_none(),
            "A length overflowing the address space must fail.",
        );
    }
}
