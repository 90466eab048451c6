//! Memory management module: identity paging of the low 4 MiB with
//! per-page user/supervisor protection.
//!
//! The kernel owns exactly one page directory and one page table, both
//! static. Every page below 4 MiB is identity mapped, supervisor-only by
//! default; [`mark_user`] and [`clear_user`] toggle the U/S bit on page
//! ranges so the exec layer can expose just the current program image and
//! its stack to Ring 3.

use bitflags::bitflags;
use spin::Mutex;

/// Size of one page in bytes.
pub const PAGE_SIZE: u32 = 4096;

/// Number of entries in a page directory or page table.
const TABLE_ENTRIES: usize = 1024;

/// End of the identity-mapped region; addresses at or above are ignored
/// by the user-bit walkers.
pub const IDENTITY_LIMIT: u32 = 4 * 1024 * 1024;

bitflags! {
    /// Page directory / page table entry bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u32 {
        /// The mapping is present.
        const PRESENT = 1 << 0;
        /// The page is writable.
        const WRITABLE = 1 << 1;
        /// The page is reachable from Ring 3.
        const USER = 1 << 2;
    }
}

/// A 4 KiB-aligned table of 1024 32-bit entries, used for both the page
/// directory and the single page table.
#[repr(C, align(4096))]
struct PageTable {
    entries: [u32; TABLE_ENTRIES],
}

impl PageTable {
    const fn zeroed() -> Self {
        Self {
            entries: [0; TABLE_ENTRIES],
        }
    }
}

static PAGE_DIRECTORY: Mutex<PageTable> = Mutex::new(PageTable::zeroed());
static FIRST_PAGE_TABLE: Mutex<PageTable> = Mutex::new(PageTable::zeroed());

/// Initialize paging: identity map the first 4 MiB supervisor-only,
/// revoke the user bit over the kernel image, then enable translation.
///
/// # Safety
///
/// Must be called exactly once, while running on the identity-mapped low
/// memory the tables describe (the Multiboot environment guarantees this).
pub unsafe fn init() {
    build_identity_map();
    protect_kernel();

    let directory_addr = {
        let directory = PAGE_DIRECTORY.lock();
        directory.entries.as_ptr() as u32
    };

    // SAFETY:
    // The directory is fully built and, because the kernel runs identity
    // mapped, its virtual address equals the physical address CR3 needs.
    unsafe {
        core::arch::asm!("mov cr3, {}", in(reg) directory_addr, options(nostack));

        let mut cr0: u32;
        core::arch::asm!("mov {}, cr0", out(reg) cr0, options(nomem, nostack));
        cr0 |= 0x8000_0000; // PG
        core::arch::asm!("mov cr0, {}", in(reg) cr0, options(nostack));
    }
}

/// Fill the static tables: PTEs identity map the low 4 MiB as present and
/// writable (supervisor-only), and PDE 0 links the table with the user bit
/// set so PTE-level user grants inside its range are not blocked.
fn build_identity_map() {
    let mut table = FIRST_PAGE_TABLE.lock();
    for (index, entry) in table.entries.iter_mut().enumerate() {
        *entry = (index as u32 * PAGE_SIZE)
            | (PageFlags::PRESENT | PageFlags::WRITABLE).bits();
    }

    let mut directory = PAGE_DIRECTORY.lock();
    for entry in directory.entries.iter_mut() {
        // Not present; writable once something is mapped there.
        *entry = PageFlags::WRITABLE.bits();
    }
    directory.entries[0] = (table.entries.as_ptr() as u32)
        | (PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER).bits();
}

/// Grant Ring 3 access to every page intersecting `[start, end)`.
///
/// `start` is aligned down and `end` up; addresses beyond the identity
/// mapped 4 MiB are ignored.
pub fn mark_user(start: u32, end: u32) {
    update_range(start, end, |entry| entry | PageFlags::USER.bits());
}

/// Revoke Ring 3 access from every page intersecting `[start, end)`.
pub fn clear_user(start: u32, end: u32) {
    update_range(start, end, |entry| entry & !PageFlags::USER.bits());
}

/// Make the kernel image supervisor-only.
///
/// The identity map already defaults to supervisor, so this is a
/// re-assertable invariant rather than a state change.
pub fn protect_kernel() {
    let (kernel_start, kernel_end) = kernel_image_range();
    clear_user(kernel_start, kernel_end);
}

/// The `[start, end)` range covered by the kernel image, from linker
/// script symbols.
#[must_use]
pub fn kernel_image_range() -> (u32, u32) {
    extern "C" {
        static __kernel_start: u8;
        static __kernel_end: u8;
    }

    // SAFETY:
    // Only the addresses of the linker symbols are taken, never their
    // contents.
    unsafe {
        (
            core::ptr::addr_of!(__kernel_start) as u32,
            core::ptr::addr_of!(__kernel_end) as u32,
        )
    }
}

fn update_range(start: u32, end: u32, apply: impl Fn(u32) -> u32) {
    if end <= start {
        return;
    }

    let first_page = start / PAGE_SIZE;
    let last_page = end.div_ceil(PAGE_SIZE);

    let mut table = FIRST_PAGE_TABLE.lock();
    for page in first_page..last_page {
        let index = page as usize;
        if index >= TABLE_ENTRIES {
            break;
        }
        table.entries[index] = apply(table.entries[index]);
    }
    drop(table);

    flush_tlb();
}

/// Flush the whole TLB by rewriting CR3.
fn flush_tlb() {
    // SAFETY:
    // Reloading CR3 with its current value only drops cached translations.
    unsafe {
        core::arch::asm!(
            "mov {tmp}, cr3",
            "mov cr3, {tmp}",
            tmp = out(reg) _,
            options(nostack),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pte(addr: u32) -> u32 {
        FIRST_PAGE_TABLE.lock().entries[(addr / PAGE_SIZE) as usize]
    }

    #[test_case]
    fn test_identity_map_is_supervisor_by_default() {
        build_identity_map();

        let entry = pte(0x0030_0000);
        assert_eq!(entry & 0xFFFF_F000, 0x0030_0000, "Identity mapping.");
        assert!(
            PageFlags::from_bits_truncate(entry).contains(PageFlags::PRESENT | PageFlags::WRITABLE),
            "Pages are present and writable.",
        );
        assert!(
            !PageFlags::from_bits_truncate(entry).contains(PageFlags::USER),
            "Pages start supervisor-only.",
        );
    }

    #[test_case]
    fn test_mark_and_clear_user_roundtrip() {
        build_identity_map();

        // Unaligned bounds cover the full pages they intersect.
        mark_user(0x0020_0010, 0x0020_1010);
        assert!(pte(0x0020_0000) & PageFlags::USER.bits() != 0, "First page granted.");
        assert!(pte(0x0020_1000) & PageFlags::USER.bits() != 0, "Partially covered page granted.");
        assert!(pte(0x0020_2000) & PageFlags::USER.bits() == 0, "Page past the range untouched.");

        clear_user(0x0020_0000, 0x0020_2000);
        assert!(pte(0x0020_0000) & PageFlags::USER.bits() == 0, "Grant revoked.");
    }

    #[test_case]
    fn test_out_of_range_addresses_are_ignored() {
        build_identity_map();
        // Nothing to assert beyond "does not panic / does not wrap".
        mark_user(IDENTITY_LIMIT, IDENTITY_LIMIT + 0x1000);
        clear_user(0xFFFF_0000, 0xFFFF_FFFF);
    }
}
