//! A simple heap allocator using the `linked_list_allocator` crate.
//!
//! The heap lives in a static arena inside the kernel's .bss, which keeps
//! it inside the identity-mapped, supervisor-only low memory without any
//! frame allocation. The linker script asserts the kernel image (arena
//! included) stays below the user window at 2 MiB.

use linked_list_allocator::LockedHeap;

/// Size of the heap in bytes.
pub const HEAP_SIZE: usize = 512 * 1024; // 512 KiB

static mut HEAP_ARENA: [u8; HEAP_SIZE] = [0; HEAP_SIZE];

/// Initialize the heap over the static arena.
///
/// Must be called once, before the first allocation.
pub fn init_heap() {
    let start = (&raw mut HEAP_ARENA) as *mut u8 as usize;

    // SAFETY:
    // The arena is a dedicated static used for nothing else, and init is
    // called once during boot before any allocation.
    unsafe {
        ALLOCATOR.lock().init(start, HEAP_SIZE);
    }
}

#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();
