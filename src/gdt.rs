//! GDT and TSS initialization.
//! This module sets up the six-entry Global Descriptor Table (GDT) and the
//! 32-bit Task State Segment (TSS).
//! It includes both kernel and user mode segment descriptors to support
//! Ring 3 execution; the TSS carries the Ring 0 stack used when a trap
//! arrives while the CPU runs user code.

use core::mem::size_of;

use lazy_static::lazy_static;
use spin::Mutex;
use x86::{
    dtables::{lgdt, DescriptorTablePointer},
    segmentation::{load_ds, load_es, load_fs, load_gs, load_ss, SegmentSelector},
    task::load_tr,
};

/// Kernel code segment selector (GDT entry 1, RPL 0).
pub const KERNEL_CODE_SELECTOR: u16 = 0x08;
/// Kernel data segment selector (GDT entry 2, RPL 0).
pub const KERNEL_DATA_SELECTOR: u16 = 0x10;
/// User code segment selector (GDT entry 3, RPL 3).
pub const USER_CODE_SELECTOR: u16 = 0x1B;
/// User data segment selector (GDT entry 4, RPL 3).
pub const USER_DATA_SELECTOR: u16 = 0x23;
/// TSS selector (GDT entry 5, RPL 3).
pub const TSS_SELECTOR: u16 = 0x2B;

/// Size of the kernel trap stack used when transitioning from Ring 3 to
/// Ring 0 on an interrupt or syscall.
const TRAP_STACK_SIZE: usize = 4096 * 5;

/// One 8-byte segment descriptor, split the way the CPU reads it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C, packed)]
struct GdtEntry {
    limit_low: u16,
    base_low: u16,
    base_middle: u8,
    access: u8,
    granularity: u8,
    base_high: u8,
}

impl GdtEntry {
    /// Encode a descriptor from its base, limit, access byte and the high
    /// granularity nibble (G, D/B, AVL).
    const fn new(base: u32, limit: u32, access: u8, gran: u8) -> Self {
        Self {
            limit_low: (limit & 0xFFFF) as u16,
            base_low: (base & 0xFFFF) as u16,
            base_middle: ((base >> 16) & 0xFF) as u8,
            access,
            granularity: (((limit >> 16) & 0x0F) as u8) | (gran & 0xF0),
            base_high: ((base >> 24) & 0xFF) as u8,
        }
    }

    /// The all-zero null descriptor occupying GDT entry 0.
    const fn null() -> Self {
        Self::new(0, 0, 0, 0)
    }
}

/// The 32-bit hardware TSS layout.
///
/// Only `esp0`/`ss0` (trap stack) and `iomap_base` matter to this kernel:
/// there is no hardware task switching, so the general-purpose register
/// slots are never read by the CPU.
#[repr(C, packed)]
pub struct TaskStateSegment {
    prev_tss: u32,
    esp0: u32,
    ss0: u32,
    esp1: u32,
    ss1: u32,
    esp2: u32,
    ss2: u32,
    cr3: u32,
    eip: u32,
    eflags: u32,
    eax: u32,
    ecx: u32,
    edx: u32,
    ebx: u32,
    esp: u32,
    ebp: u32,
    esi: u32,
    edi: u32,
    es: u32,
    cs: u32,
    ss: u32,
    ds: u32,
    fs: u32,
    gs: u32,
    ldt: u32,
    trap: u16,
    iomap_base: u16,
}

impl TaskStateSegment {
    const fn zeroed() -> Self {
        Self {
            prev_tss: 0,
            esp0: 0,
            ss0: 0,
            esp1: 0,
            ss1: 0,
            esp2: 0,
            ss2: 0,
            cr3: 0,
            eip: 0,
            eflags: 0,
            eax: 0,
            ecx: 0,
            edx: 0,
            ebx: 0,
            esp: 0,
            ebp: 0,
            esi: 0,
            edi: 0,
            es: 0,
            cs: 0,
            ss: 0,
            ds: 0,
            fs: 0,
            gs: 0,
            ldt: 0,
            trap: 0,
            iomap_base: 0,
        }
    }
}

static TSS: Mutex<TaskStateSegment> = Mutex::new(TaskStateSegment::zeroed());

lazy_static! {
    static ref GDT: [GdtEntry; 6] = {
        let tss_base = {
            let tss = TSS.lock();
            core::ptr::addr_of!(*tss) as u32
        };
        let tss_limit = (size_of::<TaskStateSegment>() - 1) as u32;

        [
            GdtEntry::null(),
            // Kernel code: base 0, limit 4 GiB, execute/read, Ring 0.
            GdtEntry::new(0, 0xFFFF_FFFF, 0x9A, 0xCF),
            // Kernel data: base 0, limit 4 GiB, read/write, Ring 0.
            GdtEntry::new(0, 0xFFFF_FFFF, 0x92, 0xCF),
            // User code: Ring 3.
            GdtEntry::new(0, 0xFFFF_FFFF, 0xFA, 0xCF),
            // User data: Ring 3.
            GdtEntry::new(0, 0xFFFF_FFFF, 0xF2, 0xCF),
            // TSS: byte granular, 32-bit available TSS.
            GdtEntry::new(tss_base, tss_limit, 0x89, 0x00),
        ]
    };
}

/// Initialize the Global Descriptor Table (GDT), reload every segment
/// register and load the task register.
pub fn init() {
    configure_tss();

    let pointer = DescriptorTablePointer {
        limit: (size_of::<[GdtEntry; 6]>() - 1) as u16,
        base: GDT.as_ptr(),
    };

    // SAFETY:
    // The GDT is a 'static table whose entries were just fully encoded.
    unsafe { lgdt(&pointer) };

    // SAFETY:
    // The new GDT is loaded; entry 1/2 are valid flat kernel segments and
    // entry 5 is a valid TSS descriptor.
    unsafe {
        reload_cs();
        load_ds(SegmentSelector::from_raw(KERNEL_DATA_SELECTOR));
        load_es(SegmentSelector::from_raw(KERNEL_DATA_SELECTOR));
        load_fs(SegmentSelector::from_raw(KERNEL_DATA_SELECTOR));
        load_gs(SegmentSelector::from_raw(KERNEL_DATA_SELECTOR));
        load_ss(SegmentSelector::from_raw(KERNEL_DATA_SELECTOR));
        load_tr(SegmentSelector::from_raw(TSS_SELECTOR));
    }
}

/// Update the Ring 0 stack pointer handed to the CPU on a Ring 3 trap.
///
/// Called before every return to user mode on paths that may re-enter the
/// kernel with a different trap stack.
pub fn set_kernel_stack(esp0: u32) {
    TSS.lock().esp0 = esp0;
}

static mut TRAP_STACK: [u8; TRAP_STACK_SIZE] = [0; TRAP_STACK_SIZE];

/// Top of the kernel trap stack the CPU switches to on a Ring 3 trap.
#[must_use]
pub fn trap_stack_top() -> u32 {
    (&raw const TRAP_STACK) as *const u8 as u32 + TRAP_STACK_SIZE as u32
}

/// Fill the static TSS: trap stack, user segment snapshot and an I/O map
/// base past the segment limit so Ring 3 gets no port access.
fn configure_tss() {
    let stack_top = trap_stack_top();

    let mut tss = TSS.lock();
    tss.ss0 = u32::from(KERNEL_DATA_SELECTOR);
    tss.esp0 = stack_top;

    // Not used for the interrupt stack switch, but kept consistent.
    tss.cs = u32::from(USER_CODE_SELECTOR);
    tss.ss = u32::from(USER_DATA_SELECTOR);
    tss.ds = u32::from(USER_DATA_SELECTOR);
    tss.es = u32::from(USER_DATA_SELECTOR);
    tss.fs = u32::from(USER_DATA_SELECTOR);
    tss.gs = u32::from(USER_DATA_SELECTOR);

    // An I/O map base equal to the TSS size means "no ports allowed".
    tss.iomap_base = size_of::<TaskStateSegment>() as u16;
}

/// Reload CS with the kernel code selector via a far return.
///
/// # Safety
///
/// The GDT holding [`KERNEL_CODE_SELECTOR`] must already be loaded.
unsafe fn reload_cs() {
    // SAFETY:
    // Pushes the new selector and a label address, then `retf` pops both,
    // continuing at the label with CS reloaded.
    unsafe {
        core::arch::asm!(
            "push {sel}",
            "lea {tmp}, [2f]",
            "push {tmp}",
            "retf",
            "2:",
            sel = in(reg) u32::from(KERNEL_CODE_SELECTOR),
            tmp = out(reg) _,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn test_selectors_match_gdt_layout() {
        assert_eq!(KERNEL_CODE_SELECTOR, 1 << 3, "Kernel code must be GDT entry 1.");
        assert_eq!(KERNEL_DATA_SELECTOR, 2 << 3, "Kernel data must be GDT entry 2.");
        assert_eq!(USER_CODE_SELECTOR, (3 << 3) | 3, "User code must be entry 3, RPL 3.");
        assert_eq!(USER_DATA_SELECTOR, (4 << 3) | 3, "User data must be entry 4, RPL 3.");
        assert_eq!(TSS_SELECTOR, (5 << 3) | 3, "TSS must be entry 5.");
    }

    #[test_case]
    fn test_tss_has_hardware_layout() {
        assert_eq!(
            size_of::<TaskStateSegment>(),
            104,
            "The 32-bit TSS is 104 bytes.",
        );
    }

    #[test_case]
    fn test_kernel_code_descriptor_encoding() {
        let entry = GdtEntry::new(0, 0xFFFF_FFFF, 0x9A, 0xCF);
        // Copy fields out: references into a packed struct are not allowed.
        let (limit_low, access, granularity, base_high) =
            (entry.limit_low, entry.access, entry.granularity, entry.base_high);
        assert_eq!(limit_low, 0xFFFF, "Low limit bits.");
        assert_eq!(access, 0x9A, "Present, Ring 0, code, execute/read.");
        assert_eq!(granularity, 0xCF, "4 KiB granular, 32-bit, limit high nibble.");
        assert_eq!(base_high, 0, "Flat segment base.");
    }
}
