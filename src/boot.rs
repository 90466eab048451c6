//! Multiboot entry shim.
//!
//! QEMU (or GRUB) loads the kernel ELF through the Multiboot protocol and
//! jumps to `_start` in 32-bit protected mode with paging disabled and a
//! flat GDT provided by the loader. This module carries the Multiboot
//! header and the assembly stub that sets up a boot stack before handing
//! control to the Rust entry point.
//!
//! Every binary linked against this crate (the kernel itself and each
//! integration test) provides its own `kernel_main`.

use core::arch::global_asm;

/// Size of the boot stack in bytes.
pub const BOOT_STACK_SIZE: usize = 64 * 1024;

global_asm!(
    // Multiboot 1 header: magic, flags (page-align modules + memory info),
    // checksum. The loader scans the first 8 KiB of the image for it.
    ".section .multiboot_header, \"a\"",
    ".align 4",
    ".long 0x1BADB002",
    ".long 0x00000003",
    ".long -(0x1BADB002 + 0x00000003)",
    // The boot stack lives in .bss so it does not bloat the image.
    ".section .bss",
    ".align 16",
    "boot_stack_bottom:",
    ".skip {stack_size}",
    "boot_stack_top:",
    ".section .text",
    ".global _start",
    "_start:",
    // The loader leaves an unspecified stack; install ours before any call.
    "mov esp, offset boot_stack_top",
    "xor ebp, ebp",
    "cld",
    "call kernel_main",
    // `kernel_main` never returns; halt forever if it somehow does.
    "2:",
    "cli",
    "hlt",
    "jmp 2b",
    stack_size = const BOOT_STACK_SIZE,
);
