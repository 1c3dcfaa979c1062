//! Trap dispatch and the fatal-exception path.

use core::fmt::{self, Write};

use crate::drivers::{console, serial};
use crate::interrupts::{self, TrapFrame};

pub const EXCEPTION_NAMES: [&str; 32] = [
    "Division By Zero",
    "Debug",
    "Non Maskable Interrupt",
    "Breakpoint",
    "Overflow",
    "Bound Range Exceeded",
    "Invalid Opcode",
    "Device Not Available",
    "Double Fault",
    "Coprocessor Segment Overrun",
    "Invalid TSS",
    "Segment Not Present",
    "Stack-Segment Fault",
    "General Protection Fault",
    "Page Fault",
    "Reserved",
    "x87 Floating-Point Exception",
    "Alignment Check",
    "Machine Check",
    "SIMD Floating-Point Exception",
    "Virtualization Exception",
    "Control Protection Exception",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Hypervisor Injection Exception",
    "VMM Communication Exception",
    "Security Exception",
    "Reserved",
];

pub fn exception_name(vector: u64) -> &'static str {
    EXCEPTION_NAMES.get(vector as usize).copied().unwrap_or("Unknown Exception")
}

/// Entered from the assembly common stub with the saved register frame.
#[no_mangle]
extern "C" fn trap_dispatch(frame: *mut TrapFrame) {
    // SAFETY: the stub passes a pointer into the live interrupt stack.
    let frame = unsafe { &mut *frame };

    if frame.int_no < 32 {
        fault_panic(frame);
    }

    let handler = interrupts::handler_for(frame.int_no);
    match handler {
        Some(h) => h(frame),
        None => log_info!("irq", "unhandled IRQ vector {}", frame.int_no),
    }

    if (32..48).contains(&frame.int_no) {
        interrupts::send_eoi(frame.int_no as u8);
    }
}

/// Writes the panic screen to the console sink and, when the mirror flag
/// is on, to the serial port.
struct PanicWriter;

impl fmt::Write for PanicWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        console::with_sink(|sink| sink.write_str(s));
        if crate::log::serial_mirror_enabled() {
            serial::with_port(|port| {
                let _ = port.write_str(s);
            });
        }
        Ok(())
    }
}

/// Render the register dump and halt forever. CPU exceptions never return.
pub fn fault_panic(frame: &TrapFrame) -> ! {
    console::with_sink(|sink| {
        sink.set_colors(0x00FF_FFFF, 0x0091_3030);
        sink.clear();
    });

    let mut w = PanicWriter;
    let _ = writeln!(w, "\n  KERNEL PANIC");
    let _ = writeln!(w, "===========================\n");
    let _ = writeln!(w, "Exception: {}", exception_name(frame.int_no));
    let _ = writeln!(w, "Exception Number: {:#x}", frame.int_no);
    let _ = writeln!(w, "Error Code: {:#x}\n", frame.error_code);

    let _ = writeln!(w, "RIP: {:#018x}   CS: {:#x}", frame.rip, frame.cs);
    let _ = writeln!(w, "RSP: {:#018x}   SS: {:#x}", frame.rsp, frame.ss);
    let _ = writeln!(w, "RFLAGS: {:#018x}", frame.rflags);

    if frame.int_no == 14 {
        let cr2 = x86_64::registers::control::Cr2::read_raw();
        let _ = writeln!(w, "CR2: {:#018x}", cr2);
    }

    let _ = writeln!(w, "RAX: {:#018x}   RBX: {:#018x}", frame.rax, frame.rbx);
    let _ = writeln!(w, "RCX: {:#018x}   RDX: {:#018x}", frame.rcx, frame.rdx);
    let _ = writeln!(w, "RSI: {:#018x}   RDI: {:#018x}", frame.rsi, frame.rdi);
    let _ = writeln!(w, "RBP: {:#018x}   R8 : {:#018x}", frame.rbp, frame.r8);
    let _ = writeln!(w, "R9 : {:#018x}   R10: {:#018x}", frame.r9, frame.r10);
    let _ = writeln!(w, "R11: {:#018x}   R12: {:#018x}", frame.r11, frame.r12);
    let _ = writeln!(w, "R13: {:#018x}   R14: {:#018x}", frame.r13, frame.r14);
    let _ = writeln!(w, "R15: {:#018x}", frame.r15);
    let _ = writeln!(w, "\nSystem Halted.");

    crate::hcf();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exception_names_cover_the_architectural_set() {
        assert_eq!(exception_name(0), "Division By Zero");
        assert_eq!(exception_name(13), "General Protection Fault");
        assert_eq!(exception_name(14), "Page Fault");
        assert_eq!(exception_name(32), "Unknown Exception");
        assert_eq!(exception_name(255), "Unknown Exception");
        assert_eq!(EXCEPTION_NAMES.len(), 32);
    }
}
