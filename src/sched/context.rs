//! Thread context and the switch primitive.

use core::arch::global_asm;

/// Callee-saved register set plus the stack pointer. Caller-saved
/// registers are the compiler's problem at the `switch_context` call site.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Context {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub rbx: u64,
    pub rbp: u64,
    pub rsp: u64,
}

// Saves the outgoing context, loads the incoming one, and returns. The
// `ret` lands on whatever return address the incoming stack holds: the
// thread trampoline on first run, the previous yield call site afterwards.
global_asm!(
    r#"
.global switch_context
switch_context:
    mov [rdi + 0x00], r15
    mov [rdi + 0x08], r14
    mov [rdi + 0x10], r13
    mov [rdi + 0x18], r12
    mov [rdi + 0x20], rbx
    mov [rdi + 0x28], rbp
    mov [rdi + 0x30], rsp
    mov r15, [rsi + 0x00]
    mov r14, [rsi + 0x08]
    mov r13, [rsi + 0x10]
    mov r12, [rsi + 0x18]
    mov rbx, [rsi + 0x20]
    mov rbp, [rsi + 0x28]
    mov rsp, [rsi + 0x30]
    ret
"#
);

extern "C" {
    /// # Safety
    ///
    /// `new` must describe a stack seeded with a valid return address, and
    /// both pointers must stay valid across the switch.
    pub fn switch_context(old: *mut Context, new: *const Context);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_layout_matches_switch_offsets() {
        assert_eq!(core::mem::size_of::<Context>(), 7 * 8);
        assert_eq!(core::mem::offset_of!(Context, r15), 0x00);
        assert_eq!(core::mem::offset_of!(Context, rbx), 0x20);
        assert_eq!(core::mem::offset_of!(Context, rsp), 0x30);
    }
}
