//! Ring transitions and the resume-on-exit context.
//!
//! [`enter_user_mode`] mirrors the kernel's callee-saved registers and
//! stack pointer into a process-wide save slot, builds an `iret` frame
//! and drops to Ring 3. When the program performs the exit syscall,
//! [`exit_to_kernel`] restores that context and "returns" from
//! [`enter_user_mode`] with the exit code, as if nothing had happened in
//! between.

use core::arch::naked_asm;
use core::sync::atomic::{AtomicI32, AtomicU32, Ordering};

use crate::gdt;

/// Saved kernel ESP before entering user mode.
///
/// When [`switch_to_user_mode`] executes `iretd`, the original kernel
/// stack is abandoned. This static stores the kernel ESP (pointing at the
/// pushed callee-saved registers) so the exit path can restore it and
/// effectively return from the switch.
static KERNEL_ESP: AtomicU32 = AtomicU32::new(0);

/// Exit code of the most recently finished user program.
static LAST_EXIT_CODE: AtomicI32 = AtomicI32::new(0);

/// Drop to Ring 3 at `entry` with the given user stack pointer; blocks
/// until the program exits and returns its exit code.
pub fn enter_user_mode(entry: u32, user_sp: u32) -> i32 {
    // Re-arm the trap stack: any interrupt or syscall taken from Ring 3
    // must land on a pristine kernel stack.
    gdt::set_kernel_stack(gdt::trap_stack_top());

    // SAFETY:
    // The GDT user segments, the TSS trap stack and the IDT syscall gate
    // are initialized at boot; entry and user_sp point into pages the
    // exec layer just granted to Ring 3.
    let code = unsafe { switch_to_user_mode(entry, user_sp) } as i32;
    LAST_EXIT_CODE.store(code, Ordering::Relaxed);
    code
}

/// Exit code of the last user program that ran.
#[must_use]
pub fn last_exit_code() -> i32 {
    LAST_EXIT_CODE.load(Ordering::Relaxed)
}

/// Terminate the current user program and resume the kernel.
///
/// Called by the exit syscall handler while on the trap stack. The trap
/// frame is abandoned; execution continues in [`enter_user_mode`]'s
/// caller as if the switch had returned `code`.
pub(crate) fn exit_to_kernel(code: i32) -> ! {
    // SAFETY:
    // KERNEL_ESP was stored by `switch_to_user_mode` before the iret and
    // still points at the saved callee-saved registers: the kernel stack
    // frame it belongs to is parked, not dead.
    unsafe { restore_kernel_context(code as u32) }
}

/// Performs the actual transition from Ring 0 to Ring 3 via `iretd`.
///
/// Before building the frame, this function saves the cdecl callee-saved
/// registers (`ebx`, `esi`, `edi`, `ebp`) and the resulting ESP into
/// [`KERNEL_ESP`]. When the user process exits, [`restore_kernel_context`]
/// reloads that ESP, pops the registers and executes `ret`, causing this
/// function to return normally to its caller with the exit code in `eax`.
///
/// # Safety
///
/// The caller must guarantee that:
/// - `entry` points to valid, user-accessible code.
/// - `user_sp` points into a valid, writable, user-accessible stack.
/// - The GDT, TSS (`esp0`) and the IDT syscall gate are fully initialized.
///
/// This function blocks until the user process performs the exit syscall.
#[unsafe(naked)]
unsafe extern "C" fn switch_to_user_mode(entry: u32, user_sp: u32) -> u32 {
    // On entry (cdecl): [esp + 4] = entry, [esp + 8] = user_sp.
    // After the four pushes they sit 16 bytes further out.
    naked_asm!(
        "push ebx",
        "push esi",
        "push edi",
        "push ebp",
        "mov [{kernel_esp}], esp",
        "mov eax, [esp + 20]", // entry
        "mov edx, [esp + 24]", // user_sp
        // No interrupts between segment reload and iretd.
        "cli",
        "mov cx, {user_data}",
        "mov ds, cx",
        "mov es, cx",
        "mov fs, cx",
        "mov gs, cx",
        // iret frame: SS, ESP, EFLAGS (IF forced on), CS, EIP.
        "push {user_data}",
        "push edx",
        "pushfd",
        "pop ecx",
        "or ecx, 0x200",
        "push ecx",
        "push {user_code}",
        "push eax",
        "iretd",
        kernel_esp = sym KERNEL_ESP,
        user_data = const gdt::USER_DATA_SELECTOR,
        user_code = const gdt::USER_CODE_SELECTOR,
    );
}

/// The other half of the round trip: restore the kernel data segments,
/// reload the parked kernel stack, pop the callee-saved registers and
/// return from [`switch_to_user_mode`] with `code` in `eax`.
///
/// # Safety
///
/// [`KERNEL_ESP`] must hold the value stored by a still-parked
/// [`switch_to_user_mode`] activation.
#[unsafe(naked)]
unsafe extern "C" fn restore_kernel_context(code: u32) -> ! {
    naked_asm!(
        "mov eax, [esp + 4]",
        "mov cx, {kernel_data}",
        "mov ds, cx",
        "mov es, cx",
        "mov fs, cx",
        "mov gs, cx",
        "mov esp, [{kernel_esp}]",
        "pop ebp",
        "pop edi",
        "pop esi",
        "pop ebx",
        // The syscall gate cleared IF; the resumed kernel wants it back.
        "sti",
        "ret",
        kernel_esp = sym KERNEL_ESP,
        kernel_data = const gdt::KERNEL_DATA_SELECTOR,
    );
}
