//! User space support module.
//!
//! This module provides the infrastructure to load and execute user-mode
//! ELF binaries in Ring 3. It includes:
//! - A syscall interface via `int 0x80` for user programs to request kernel services.
//! - The exec glue that loads an image, rescopes the user page grants and
//!   builds the argv stack.
//! - A mechanism to switch from kernel mode (Ring 0) to user mode (Ring 3)
//!   and to resume the kernel when the program exits.

use core::fmt;

use crate::elf::{self, ElfError};
use crate::fat16::{self, Fat16Error};
use crate::memory;

pub mod process;
pub mod syscall;

/// Interrupt vector number used for syscalls (`int 0x80`).
pub const SYSCALL_INTERRUPT_INDEX: u8 = 0x80;

/// Lowest virtual address a user image may occupy.
pub const USER_MIN_VADDR: u32 = 0x0020_0000;

/// One past the highest virtual address a user image may occupy.
pub const USER_MAX_VADDR: u32 = 0x003F_0000;

/// Bottom of the user-mode stack.
pub const USER_STACK_BASE: u32 = 0x003F_C000;

/// Top of the user-mode stack (stack grows downward).
pub const USER_STACK_TOP: u32 = 0x0040_0000;

/// Arguments beyond this count are dropped.
const MAX_ARGS: usize = 32;

/// Argument strings are clipped to this many bytes, terminator included.
const MAX_ARG_LEN: usize = 256;

/// Why an exec attempt never reached user mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecError {
    /// The filesystem was unavailable.
    Filesystem(Fat16Error),
    /// The image failed validation or loading.
    Load(ElfError),
    /// The argv block did not fit in the user stack.
    StackOverflow,
}

impl fmt::Display for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Filesystem(err) => write!(f, "{err}"),
            Self::Load(err) => write!(f, "{err}"),
            Self::StackOverflow => write!(f, "argument block overflows the user stack"),
        }
    }
}

/// Execute the program at `path` with `argv[0] = path`, returning its
/// exit code once it performs the exit syscall.
pub fn exec(path: &str) -> Result<i32, ExecError> {
    exec_argv(path, &[path])
}

/// Execute the program at `path` with explicit arguments.
///
/// On success this does not return until the program exits: the CPU runs
/// Ring 3 code and comes back through the `SYS_EXIT` resume path. On any
/// load failure the previous image's page grants are already revoked and
/// the caller stays in the kernel.
pub fn exec_argv(path: &str, argv: &[&str]) -> Result<i32, ExecError> {
    // Revoke the previous program before loading over it.
    memory::clear_user(USER_MIN_VADDR, USER_MAX_VADDR);
    memory::clear_user(USER_STACK_BASE, USER_STACK_TOP);

    let image = fat16::with_fs(|fs| Ok(elf::load(fs, path)))
        .map_err(ExecError::Filesystem)?
        .map_err(ExecError::Load)?;

    log::debug!(
        "exec {}: entry {:#x}, image [{:#x}, {:#x})",
        path,
        image.entry,
        image.low,
        image.high,
    );

    // Expose exactly the new image and a fresh stack to Ring 3.
    memory::mark_user(image.low, image.high);
    memory::mark_user(USER_STACK_BASE, USER_STACK_TOP);
    memory::protect_kernel();

    // SAFETY:
    // The stack range is identity mapped and now owned by the program
    // being launched.
    unsafe {
        core::ptr::write_bytes(
            USER_STACK_BASE as *mut u8,
            0,
            (USER_STACK_TOP - USER_STACK_BASE) as usize,
        );
    }

    let user_sp = build_user_stack(argv, USER_STACK_TOP);
    if !(USER_STACK_BASE..USER_STACK_TOP).contains(&user_sp) {
        return Err(ExecError::StackOverflow);
    }

    Ok(process::enter_user_mode(image.entry, user_sp))
}

/// Lay out the System V-style argument block below `stack_top`:
/// strings first (descending), then the NULL-terminated pointer array,
/// then `argv` and `argc`, 16-byte aligned before the final pushes.
fn build_user_stack(argv: &[&str], stack_top: u32) -> u32 {
    let argc = argv.len().min(MAX_ARGS);
    let mut sp = stack_top;
    let mut arg_ptrs = [0_u32; MAX_ARGS];

    for index in (0..argc).rev() {
        let bytes = argv[index].as_bytes();
        let len = bytes.len().min(MAX_ARG_LEN - 1);

        sp -= len as u32 + 1;
        // SAFETY:
        // `sp` stays inside the zeroed, identity-mapped user stack range;
        // the caller validates the final pointer against the stack base.
        unsafe {
            core::ptr::copy_nonoverlapping(bytes.as_ptr(), sp as *mut u8, len);
            *((sp + len as u32) as *mut u8) = 0;
        }
        arg_ptrs[index] = sp;
    }

    sp &= !0xF;

    sp = push_u32(sp, 0); // argv[argc] = NULL
    for index in (0..argc).rev() {
        sp = push_u32(sp, arg_ptrs[index]);
    }
    let argv_base = sp;
    sp = push_u32(sp, argv_base);
    push_u32(sp, argc as u32)
}

fn push_u32(sp: u32, value: u32) -> u32 {
    let sp = sp - 4;
    // SAFETY:
    // Same identity-mapped user stack range as the string copies.
    unsafe {
        *(sp as *mut u32) = value;
    }
    sp
}
