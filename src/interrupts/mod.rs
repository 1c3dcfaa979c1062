//! Interrupt management.
//!
//! A 256-entry IDT routes every installed vector through assembly stubs
//! into one common dispatcher. Exceptions (0..31) render a panic screen
//! and halt; vectors 32..47 are hardware IRQs behind the remapped PIC (or
//! the LAPIC once promoted); vector 128 is the DPL-3 syscall gate.

pub mod apic;
pub mod handlers;
pub mod pic;
pub mod timer;

use core::arch::global_asm;

use lazy_static::lazy_static;
use spin::Mutex;
use x86_64::registers::segmentation::{Segment, CS};
use x86_64::structures::DescriptorTablePointer;
use x86_64::VirtAddr;

pub const TIMER_VECTOR: u8 = 32;
pub const SYSCALL_VECTOR: u8 = 128;

/// Saved CPU state as laid out by the common stub: callee-pushed GPRs,
/// stub-pushed vector and error code, then the CPU-pushed frame.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct TrapFrame {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
    pub int_no: u64,
    pub error_code: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

// Stub generation. Vectors whose exceptions push an error code themselves
// (8, 10..14, 17, 21, 29, 30) skip the dummy push; everything else pushes
// a zero so the frame layout is uniform.
global_asm!(
    r#"
.macro trap_stub_noerr n
    .global trap_stub_\n
trap_stub_\n:
    push 0
    push \n
    jmp trap_common
.endm

.macro trap_stub_err n
    .global trap_stub_\n
trap_stub_\n:
    push \n
    jmp trap_common
.endm

trap_stub_noerr 0
trap_stub_noerr 1
trap_stub_noerr 2
trap_stub_noerr 3
trap_stub_noerr 4
trap_stub_noerr 5
trap_stub_noerr 6
trap_stub_noerr 7
trap_stub_err   8
trap_stub_noerr 9
trap_stub_err   10
trap_stub_err   11
trap_stub_err   12
trap_stub_err   13
trap_stub_err   14
trap_stub_noerr 15
trap_stub_noerr 16
trap_stub_err   17
trap_stub_noerr 18
trap_stub_noerr 19
trap_stub_noerr 20
trap_stub_err   21
trap_stub_noerr 22
trap_stub_noerr 23
trap_stub_noerr 24
trap_stub_noerr 25
trap_stub_noerr 26
trap_stub_noerr 27
trap_stub_noerr 28
trap_stub_err   29
trap_stub_err   30
trap_stub_noerr 31
trap_stub_noerr 32
trap_stub_noerr 33
trap_stub_noerr 34
trap_stub_noerr 35
trap_stub_noerr 36
trap_stub_noerr 37
trap_stub_noerr 38
trap_stub_noerr 39
trap_stub_noerr 40
trap_stub_noerr 41
trap_stub_noerr 42
trap_stub_noerr 43
trap_stub_noerr 44
trap_stub_noerr 45
trap_stub_noerr 46
trap_stub_noerr 47
trap_stub_noerr 128

trap_common:
    push rax
    push rbx
    push rcx
    push rdx
    push rsi
    push rdi
    push rbp
    push r8
    push r9
    push r10
    push r11
    push r12
    push r13
    push r14
    push r15
    mov rdi, rsp
    call trap_dispatch
    pop r15
    pop r14
    pop r13
    pop r12
    pop r11
    pop r10
    pop r9
    pop r8
    pop rbp
    pop rdi
    pop rsi
    pop rdx
    pop rcx
    pop rbx
    pop rax
    add rsp, 16
    iretq

.section .rodata
.balign 8
.global TRAP_STUB_TABLE
TRAP_STUB_TABLE:
    .quad trap_stub_0,  trap_stub_1,  trap_stub_2,  trap_stub_3
    .quad trap_stub_4,  trap_stub_5,  trap_stub_6,  trap_stub_7
    .quad trap_stub_8,  trap_stub_9,  trap_stub_10, trap_stub_11
    .quad trap_stub_12, trap_stub_13, trap_stub_14, trap_stub_15
    .quad trap_stub_16, trap_stub_17, trap_stub_18, trap_stub_19
    .quad trap_stub_20, trap_stub_21, trap_stub_22, trap_stub_23
    .quad trap_stub_24, trap_stub_25, trap_stub_26, trap_stub_27
    .quad trap_stub_28, trap_stub_29, trap_stub_30, trap_stub_31
    .quad trap_stub_32, trap_stub_33, trap_stub_34, trap_stub_35
    .quad trap_stub_36, trap_stub_37, trap_stub_38, trap_stub_39
    .quad trap_stub_40, trap_stub_41, trap_stub_42, trap_stub_43
    .quad trap_stub_44, trap_stub_45, trap_stub_46, trap_stub_47
.section .text
"#
);

extern "C" {
    static TRAP_STUB_TABLE: [u64; 48];
    fn trap_stub_128();
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct IdtEntry {
    offset_low: u16,
    selector: u16,
    ist: u8,
    type_attr: u8,
    offset_mid: u16,
    offset_high: u32,
    zero: u32,
}

const GATE_INTERRUPT: u8 = 0x8E;
const GATE_INTERRUPT_DPL3: u8 = 0xEE;

impl IdtEntry {
    const fn missing() -> Self {
        IdtEntry {
            offset_low: 0,
            selector: 0,
            ist: 0,
            type_attr: 0,
            offset_mid: 0,
            offset_high: 0,
            zero: 0,
        }
    }

    fn new(handler: u64, selector: u16, type_attr: u8) -> Self {
        IdtEntry {
            offset_low: handler as u16,
            selector,
            ist: 0,
            type_attr,
            offset_mid: (handler >> 16) as u16,
            offset_high: (handler >> 32) as u32,
            zero: 0,
        }
    }
}

#[repr(C, align(16))]
struct Idt {
    entries: [IdtEntry; 256],
}

lazy_static! {
    static ref IDT: Idt = {
        let selector = CS::get_reg().0;
        let mut entries = [IdtEntry::missing(); 256];
        // SAFETY: the stub table and syscall stub are defined by the
        // global_asm block above.
        unsafe {
            for (vector, &stub) in TRAP_STUB_TABLE.iter().enumerate() {
                entries[vector] = IdtEntry::new(stub, selector, GATE_INTERRUPT);
            }
            entries[SYSCALL_VECTOR as usize] =
                IdtEntry::new(trap_stub_128 as u64, selector, GATE_INTERRUPT_DPL3);
        }
        Idt { entries }
    };
}

type HandlerFn = fn(&mut TrapFrame);

static HANDLERS: Mutex<[Option<HandlerFn>; 256]> = Mutex::new([None; 256]);

/// Bind `handler` to a vector. Runs with interrupts disabled so the
/// dispatcher never observes a half-written table.
pub fn register_handler(vector: u8, handler: HandlerFn) {
    let were_enabled = disable();
    HANDLERS.lock()[vector as usize] = Some(handler);
    if were_enabled {
        enable();
    }
}

pub(crate) fn handler_for(vector: u64) -> Option<HandlerFn> {
    HANDLERS.lock()[vector as usize & 0xFF]
}

/// Acknowledge a hardware IRQ on whichever controller is active.
pub fn send_eoi(vector: u8) {
    if apic::enabled() {
        apic::eoi();
    } else {
        pic::eoi(vector);
    }
}

fn syscall_handler(frame: &mut TrapFrame) {
    // User mode is out of scope; the gate exists and logs.
    log_info!("syscall", "int 0x80 from rip={:#x} rax={:#x}", frame.rip, frame.rax);
}

/// Remap the PIC, install the IDT, hook the timer, then try the LAPIC.
pub fn init() {
    pic::init();

    {
        let mut handlers = HANDLERS.lock();
        handlers[TIMER_VECTOR as usize] = Some(timer::tick_handler);
        handlers[SYSCALL_VECTOR as usize] = Some(syscall_handler);
    }

    let pointer = DescriptorTablePointer {
        limit: (core::mem::size_of::<Idt>() - 1) as u16,
        base: VirtAddr::new(&IDT.entries as *const _ as u64),
    };
    // SAFETY: the IDT lives in a lazy_static and is never moved or freed.
    unsafe { x86_64::instructions::tables::lidt(&pointer) };

    apic::try_enable();
    log_ok!("interrupts", "IDT loaded, timer and syscall vectors registered");
}

/// Disable interrupts, reporting whether they were enabled before.
#[cfg(not(test))]
pub fn disable() -> bool {
    let enabled = x86_64::instructions::interrupts::are_enabled();
    x86_64::instructions::interrupts::disable();
    enabled
}

#[cfg(not(test))]
pub fn enable() {
    x86_64::instructions::interrupts::enable();
}

// Host-test builds run in user space where cli/sti would fault; the
// scheduler tests rely on these being no-ops.
#[cfg(test)]
pub fn disable() -> bool {
    false
}

#[cfg(test)]
pub fn enable() {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trap_frame_matches_stub_layout() {
        // 15 GPRs + vector + error code + 5-word CPU frame.
        assert_eq!(core::mem::size_of::<TrapFrame>(), 22 * 8);
        assert_eq!(core::mem::offset_of!(TrapFrame, int_no), 15 * 8);
        assert_eq!(core::mem::offset_of!(TrapFrame, rip), 17 * 8);
        assert_eq!(core::mem::offset_of!(TrapFrame, ss), 21 * 8);
    }

    #[test]
    fn idt_entry_packs_handler_address() {
        let entry = IdtEntry::new(0x1234_5678_9ABC_DEF0, 0x08, GATE_INTERRUPT);
        assert_eq!(core::mem::size_of::<IdtEntry>(), 16);
        assert_eq!({ entry.offset_low }, 0xDEF0);
        assert_eq!({ entry.offset_mid }, 0x9ABC);
        assert_eq!({ entry.offset_high }, 0x1234_5678);
        assert_eq!({ entry.selector }, 0x08);
        assert_eq!({ entry.type_attr }, 0x8E);
    }

    #[test]
    fn syscall_gate_has_user_dpl() {
        assert_eq!(GATE_INTERRUPT_DPL3 & 0x60, 0x60);
        assert_eq!(GATE_INTERRUPT & 0x60, 0x00);
    }
}
