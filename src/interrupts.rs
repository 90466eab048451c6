//! Interrupt handling module
//! This module provides the implementation of the 256-entry Interrupt
//! Descriptor Table (IDT), the naked assembly stubs for the 32 CPU
//! exceptions and the 16 hardware IRQs, the remapped 8259 PIC pair and the
//! `int 0x80` syscall gate.
//!
//! Every stub funnels into one common trampoline that materializes a
//! [`Registers`] trap frame on the kernel stack and calls the Rust
//! dispatcher. On the way out the trampoline restores the saved registers
//! and executes `iretd`.

use core::arch::naked_asm;
use core::mem::size_of;

use lazy_static::lazy_static;
use spin::Mutex;
use x86::dtables::{lidt, DescriptorTablePointer};

use crate::{gdt, println, userspace};

/// The offset for the Programmable Interrupt Controller (PIC) 1 (starting after interrupt table
/// max offset).
pub const PIC_1_OFFSET: u8 = 32;
/// The offset for the Programmable Interrupt Controller (PIC) 2.
pub const PIC_2_OFFSET: u8 = PIC_1_OFFSET + 8;

/// `int_no` value used by the shared stub backing all vectors that have no
/// dedicated stub of their own.
const UNKNOWN_VECTOR: u32 = 0x100;

/// A registered hardware interrupt handler.
pub type IrqHandler = fn(&mut Registers);

static IRQ_HANDLERS: Mutex<[Option<IrqHandler>; 16]> = Mutex::new([None; 16]);

#[derive(Debug, Clone, Copy)]
#[repr(u8)]
/// Enum for the hardware interrupt indices after remapping.
pub enum InterruptIndex {
    /// Timer interrupt index.
    Timer = PIC_1_OFFSET,
    /// Keyboard interrupt index.
    Keyboard,
}

impl InterruptIndex {
    /// Returns the index as a `u8`.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Returns the IRQ line number (0..16) behind this vector.
    #[must_use]
    pub const fn as_irq(self) -> u8 {
        self.as_u8() - PIC_1_OFFSET
    }
}

/// The trap frame built by the interrupt stubs, lowest address first.
///
/// `ds` and the eight general-purpose registers are pushed by the common
/// trampoline, `int_no`/`err_code` by the per-vector stub, and the tail
/// (`eip` through `ss`) by the CPU itself. `useresp`/`ss` are only valid
/// when the interrupt arrived from Ring 3.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct Registers {
    /// Data segment selector active when the trap fired.
    pub ds: u32,
    /// Saved general-purpose registers (`pushad` order).
    pub edi: u32,
    /// See `edi`.
    pub esi: u32,
    /// See `edi`.
    pub ebp: u32,
    /// Stack pointer before `pushad`; saved but ignored on restore.
    pub esp: u32,
    /// See `edi`.
    pub ebx: u32,
    /// See `edi`.
    pub edx: u32,
    /// See `edi`.
    pub ecx: u32,
    /// Syscall number / return-value slot.
    pub eax: u32,
    /// Interrupt vector number pushed by the stub.
    pub int_no: u32,
    /// CPU error code, or 0 for vectors that do not push one.
    pub err_code: u32,
    /// Interrupted instruction pointer.
    pub eip: u32,
    /// Interrupted code segment.
    pub cs: u32,
    /// Interrupted flags.
    pub eflags: u32,
    /// Ring 3 stack pointer (only on a privilege change).
    pub useresp: u32,
    /// Ring 3 stack segment (only on a privilege change).
    pub ss: u32,
}

const EXCEPTION_MESSAGES: [&str; 32] = [
    "Division By Zero",
    "Debug",
    "Non Maskable Interrupt",
    "Breakpoint",
    "Into Detected Overflow",
    "Out of Bounds",
    "Invalid Opcode",
    "No Coprocessor",
    "Double Fault",
    "Coprocessor Segment Overrun",
    "Bad TSS",
    "Segment Not Present",
    "Stack Fault",
    "General Protection Fault",
    "Page Fault",
    "Unknown Interrupt",
    "Coprocessor Fault",
    "Alignment Check",
    "Machine Check",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
];

/// Common trampoline shared by every stub.
///
/// On entry the stub has pushed `err_code` (real or dummy) and `int_no` on
/// top of the CPU frame. This completes the [`Registers`] layout, switches
/// to the kernel data segments, and calls [`trap_dispatch`] with a pointer
/// to the frame.
#[unsafe(naked)]
extern "C" fn interrupt_common() {
    naked_asm!(
        "pusha",
        "push ds",
        "mov ax, {kernel_data}",
        "mov ds, ax",
        "mov es, ax",
        "mov fs, ax",
        "mov gs, ax",
        "push esp",
        "call {dispatch}",
        "add esp, 4",
        "pop eax",
        "mov ds, ax",
        "mov es, ax",
        "mov fs, ax",
        "mov gs, ax",
        "popa",
        // Drop int_no and err_code.
        "add esp, 8",
        "iretd",
        kernel_data = const gdt::KERNEL_DATA_SELECTOR,
        dispatch = sym trap_dispatch,
    );
}

/// Defines a stub for a vector where the CPU pushes no error code: a dummy
/// zero keeps the frame layout uniform.
macro_rules! exception_stub {
    ($name:ident, $vector:expr) => {
        #[unsafe(naked)]
        extern "C" fn $name() {
            naked_asm!(
                "push 0",
                "push {vector}",
                "jmp {common}",
                vector = const $vector,
                common = sym interrupt_common,
            );
        }
    };
}

/// Defines a stub for a vector where the CPU pushes a real error code.
macro_rules! exception_stub_with_error {
    ($name:ident, $vector:expr) => {
        #[unsafe(naked)]
        extern "C" fn $name() {
            naked_asm!(
                "push {vector}",
                "jmp {common}",
                vector = const $vector,
                common = sym interrupt_common,
            );
        }
    };
}

exception_stub!(isr0, 0);
exception_stub!(isr1, 1);
exception_stub!(isr2, 2);
exception_stub!(isr3, 3);
exception_stub!(isr4, 4);
exception_stub!(isr5, 5);
exception_stub!(isr6, 6);
exception_stub!(isr7, 7);
exception_stub_with_error!(isr8, 8);
exception_stub!(isr9, 9);
exception_stub_with_error!(isr10, 10);
exception_stub_with_error!(isr11, 11);
exception_stub_with_error!(isr12, 12);
exception_stub_with_error!(isr13, 13);
exception_stub_with_error!(isr14, 14);
exception_stub!(isr15, 15);
exception_stub!(isr16, 16);
exception_stub_with_error!(isr17, 17);
exception_stub!(isr18, 18);
exception_stub!(isr19, 19);
exception_stub!(isr20, 20);
exception_stub!(isr21, 21);
exception_stub!(isr22, 22);
exception_stub!(isr23, 23);
exception_stub!(isr24, 24);
exception_stub!(isr25, 25);
exception_stub!(isr26, 26);
exception_stub!(isr27, 27);
exception_stub!(isr28, 28);
exception_stub!(isr29, 29);
exception_stub!(isr30, 30);
exception_stub!(isr31, 31);

exception_stub!(irq0, 32);
exception_stub!(irq1, 33);
exception_stub!(irq2, 34);
exception_stub!(irq3, 35);
exception_stub!(irq4, 36);
exception_stub!(irq5, 37);
exception_stub!(irq6, 38);
exception_stub!(irq7, 39);
exception_stub!(irq8, 40);
exception_stub!(irq9, 41);
exception_stub!(irq10, 42);
exception_stub!(irq11, 43);
exception_stub!(irq12, 44);
exception_stub!(irq13, 45);
exception_stub!(irq14, 46);
exception_stub!(irq15, 47);

exception_stub!(isr_syscall, 0x80);
exception_stub!(isr_unknown, UNKNOWN_VECTOR);

const EXCEPTION_STUBS: [extern "C" fn(); 32] = [
    isr0, isr1, isr2, isr3, isr4, isr5, isr6, isr7, isr8, isr9, isr10, isr11, isr12, isr13,
    isr14, isr15, isr16, isr17, isr18, isr19, isr20, isr21, isr22, isr23, isr24, isr25, isr26,
    isr27, isr28, isr29, isr30, isr31,
];

const IRQ_STUBS: [extern "C" fn(); 16] = [
    irq0, irq1, irq2, irq3, irq4, irq5, irq6, irq7, irq8, irq9, irq10, irq11, irq12, irq13,
    irq14, irq15,
];

/// One 8-byte interrupt gate.
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
struct IdtEntry {
    offset_low: u16,
    selector: u16,
    zero: u8,
    flags: u8,
    offset_high: u16,
}

impl IdtEntry {
    fn new(handler: extern "C" fn(), flags: u8) -> Self {
        let offset = handler as usize as u32;
        Self {
            offset_low: (offset & 0xFFFF) as u16,
            selector: gdt::KERNEL_CODE_SELECTOR,
            zero: 0,
            flags,
            offset_high: ((offset >> 16) & 0xFFFF) as u16,
        }
    }
}

/// Present, Ring 0, 32-bit interrupt gate.
const GATE_FLAGS_KERNEL: u8 = 0x8E;
/// Present, Ring 3, 32-bit interrupt gate: reachable from user code.
const GATE_FLAGS_USER: u8 = 0xEE;

struct Idt([IdtEntry; 256]);

lazy_static! {
    static ref IDT: Idt = {
        // Every slot starts out pointing at the unknown-vector stub so the
        // table is fully populated.
        let mut entries = [IdtEntry::new(isr_unknown, GATE_FLAGS_KERNEL); 256];

        for (vector, stub) in EXCEPTION_STUBS.iter().enumerate() {
            entries[vector] = IdtEntry::new(*stub, GATE_FLAGS_KERNEL);
        }
        for (line, stub) in IRQ_STUBS.iter().enumerate() {
            entries[usize::from(PIC_1_OFFSET) + line] = IdtEntry::new(*stub, GATE_FLAGS_KERNEL);
        }

        // The one gate user code may invoke directly.
        entries[usize::from(userspace::SYSCALL_INTERRUPT_INDEX)] =
            IdtEntry::new(isr_syscall, GATE_FLAGS_USER);

        Idt(entries)
    };
}

/// Initialize the Interrupt Descriptor Table and remap the PIC pair to
/// vectors 32..48.
pub fn init() {
    let pointer = DescriptorTablePointer {
        limit: (size_of::<Idt>() - 1) as u16,
        base: IDT.0.as_ptr(),
    };

    // SAFETY:
    // The IDT is a fully populated 'static table.
    unsafe { lidt(&pointer) };

    pic::remap(PIC_1_OFFSET, PIC_2_OFFSET);
}

/// Register a handler for a hardware IRQ line (0..16).
///
/// Registration is expected to happen during kernel init, before
/// interrupts are enabled.
pub fn register_irq_handler(irq: u8, handler: IrqHandler) {
    if usize::from(irq) < 16 {
        IRQ_HANDLERS.lock()[usize::from(irq)] = Some(handler);
    }
}

/// Central trap dispatcher, called by [`interrupt_common`] with the frame
/// the stubs assembled.
extern "C" fn trap_dispatch(frame: &mut Registers) {
    match frame.int_no {
        0..=31 => exception_handler(frame),
        32..=47 => irq_handler(frame),
        n if n == u32::from(userspace::SYSCALL_INTERRUPT_INDEX) => {
            userspace::syscall::handle(frame);
        }
        _ => {
            println!("EXCEPTION: unknown interrupt vector\n{:#x?}", frame);
            crate::power::halt();
        }
    }
}

/// CPU exceptions are fatal and halt, except the breakpoint trap which
/// resumes after reporting.
fn exception_handler(frame: &mut Registers) {
    if frame.int_no == 3 {
        println!("EXCEPTION: BREAKPOINT\n{:#x?}", frame);
        return;
    }

    let message = EXCEPTION_MESSAGES[frame.int_no as usize];
    println!(
        "EXCEPTION: {} (vector {}, error {:#x})",
        message, frame.int_no, frame.err_code,
    );

    if frame.int_no == 14 {
        print_page_fault_details(frame.err_code);
    }

    println!("{:#x?}", frame);
    crate::power::halt();
}

/// Decode the page fault error bitmask and the faulting address in CR2.
fn print_page_fault_details(err_code: u32) {
    let cr2: u32;
    // SAFETY:
    // Reading CR2 has no side effect; it holds the faulting linear address.
    unsafe {
        core::arch::asm!("mov {}, cr2", out(reg) cr2, options(nomem, nostack));
    }

    println!(
        "  at {:#010x}: {} during {} access from {} mode",
        cr2,
        if err_code & 1 == 0 { "non-present page" } else { "protection violation" },
        if err_code & 2 == 0 { "read" } else { "write" },
        if err_code & 4 == 0 { "supervisor" } else { "user" },
    );
}

/// Generic hardware interrupt dispatcher: look up the registered handler,
/// run it if present, then signal end-of-interrupt.
fn irq_handler(frame: &mut Registers) {
    let irq = (frame.int_no - u32::from(PIC_1_OFFSET)) as u8;

    let handler = IRQ_HANDLERS.lock()[usize::from(irq)];
    if let Some(handler) = handler {
        handler(frame);
    }

    pic::end_of_interrupt(irq);
}

/// Run a closure with hardware interrupts disabled, restoring the previous
/// interrupt flag afterwards.
pub fn without_interrupts<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    let eflags: u32;
    // SAFETY:
    // Reading EFLAGS through the stack has no side effect.
    unsafe {
        core::arch::asm!("pushfd", "pop {}", out(reg) eflags);
    }
    let were_enabled = eflags & 0x200 != 0;

    if were_enabled {
        // SAFETY:
        // Masking interrupts is always legal in Ring 0.
        unsafe { x86::irq::disable() };
    }

    let result = f();

    if were_enabled {
        // SAFETY:
        // Restores the state observed above.
        unsafe { x86::irq::enable() };
    }

    result
}

/// Driver for the chained 8259 Programmable Interrupt Controllers.
pub mod pic {
    /// The master PIC's command port.
    const MASTER_COMMAND: u16 = 0x20;
    /// The master PIC's data port.
    const MASTER_DATA: u16 = 0x21;
    /// The slave PIC's command port.
    const SLAVE_COMMAND: u16 = 0xA0;
    /// The slave PIC's data port.
    const SLAVE_DATA: u16 = 0xA1;

    /// Start initialization, ICW4 follows.
    const ICW1_INIT_ICW4: u8 = 0x11;
    /// The slave hangs off master line 2.
    const ICW3_SLAVE_ON_LINE_2: u8 = 0x04;
    /// Cascade identity for the slave.
    const ICW3_CASCADE_ID: u8 = 0x02;
    /// 8086/88 mode.
    const ICW4_8086: u8 = 0x01;

    /// The end-of-interrupt command.
    const COMMAND_EOI: u8 = 0x20;

    /// Remap the PIC pair so hardware lines 0..16 raise CPU vectors
    /// `offset1..offset1+8` and `offset2..offset2+8`, then unmask every
    /// line.
    pub(super) fn remap(offset1: u8, offset2: u8) {
        // SAFETY:
        // The canonical 8259 initialization word sequence on the standard
        // PC ports.
        unsafe {
            x86::io::outb(MASTER_COMMAND, ICW1_INIT_ICW4);
            x86::io::outb(SLAVE_COMMAND, ICW1_INIT_ICW4);

            x86::io::outb(MASTER_DATA, offset1);
            x86::io::outb(SLAVE_DATA, offset2);

            x86::io::outb(MASTER_DATA, ICW3_SLAVE_ON_LINE_2);
            x86::io::outb(SLAVE_DATA, ICW3_CASCADE_ID);

            x86::io::outb(MASTER_DATA, ICW4_8086);
            x86::io::outb(SLAVE_DATA, ICW4_8086);

            // Clear both masks: every line delivers.
            x86::io::outb(MASTER_DATA, 0x00);
            x86::io::outb(SLAVE_DATA, 0x00);
        }
    }

    /// Sends an End-Of-Interrupt for the given IRQ line, to the slave
    /// first when the line belongs to it, then always to the master.
    pub(super) fn end_of_interrupt(irq: u8) {
        // SAFETY:
        // EOI writes acknowledge the interrupt currently in service.
        unsafe {
            if irq >= 8 {
                x86::io::outb(SLAVE_COMMAND, COMMAND_EOI);
            }
            x86::io::outb(MASTER_COMMAND, COMMAND_EOI);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn test_breakpoint_exception_is_not_fatal() {
        // Vector 3 is the one exception the dispatcher lets resume, so a
        // breakpoint must come back here instead of halting.
        // SAFETY:
        // The IDT is loaded by `init` before the test runner starts.
        unsafe { core::arch::asm!("int 3") };
    }

    #[test_case]
    fn test_trap_frame_layout() {
        assert_eq!(
            core::mem::size_of::<Registers>(),
            16 * 4,
            "Frame is ds + 8 GPRs + int_no + err_code + 5 CPU words.",
        );
    }
}
