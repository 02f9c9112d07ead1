//! x86_64 System V context.

use core::arch::naked_asm;

use super::{EntryFn, MachineContext, bootstrap_sp};
use crate::error::Result;
use crate::stack::StackBounds;

/// Default MXCSR: all exceptions masked, round to nearest.
const MXCSR_DEFAULT: u32 = 0x1F80;
/// Default x87 control word: extended precision, exceptions masked.
const FPU_CW_DEFAULT: u16 = 0x037F;

/// Callee-saved registers plus the SSE/x87 control words, which are also
/// callee-saved under the System V ABI.
#[repr(C)]
#[derive(Debug, Clone, Default)]
pub struct Context {
    rsp: u64,
    rbp: u64,
    rbx: u64,
    r12: u64,
    r13: u64,
    r14: u64,
    r15: u64,
    mxcsr: u32,
    fpu_cw: u16,
    _pad: u16,
}

impl MachineContext for Context {
    const STACK_ALIGN: usize = 16;
    // Entry address for the first `ret`, then a null fake return address.
    const BOOTSTRAP_FRAME: usize = 16;

    fn empty() -> Self {
        Self::default()
    }

    fn init(stack: StackBounds, entry: EntryFn) -> Result<Self> {
        let sp = bootstrap_sp(stack, Self::STACK_ALIGN, Self::BOOTSTRAP_FRAME)?;
        // SAFETY: `sp` and `sp + 8` lie inside the writable stack region
        // checked by `bootstrap_sp`.
        unsafe {
            core::ptr::write(sp as *mut u64, entry as usize as u64);
            core::ptr::write((sp + 8) as *mut u64, 0);
        }
        // After `ret` pops the entry address, rsp == top - 8, which is the
        // alignment a function expects right after a `call`.
        Ok(Self {
            rsp: sp as u64,
            mxcsr: MXCSR_DEFAULT,
            fpu_cw: FPU_CW_DEFAULT,
            ..Self::default()
        })
    }

    unsafe fn switch(save: *mut Self, restore: *const Self) {
        // SAFETY: forwarded from the caller.
        unsafe { switch_context(save, restore) }
    }

    fn stack_pointer(&self) -> usize {
        self.rsp as usize
    }
}

#[unsafe(naked)]
unsafe extern "C" fn switch_context(_save: *mut Context, _restore: *const Context) {
    naked_asm!(
        "mov [rdi + 0x00], rsp",
        "mov [rdi + 0x08], rbp",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], r12",
        "mov [rdi + 0x20], r13",
        "mov [rdi + 0x28], r14",
        "mov [rdi + 0x30], r15",
        "stmxcsr dword ptr [rdi + 0x38]",
        "fnstcw word ptr [rdi + 0x3c]",
        "mov rsp, [rsi + 0x00]",
        "mov rbp, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov r12, [rsi + 0x18]",
        "mov r13, [rsi + 0x20]",
        "mov r14, [rsi + 0x28]",
        "mov r15, [rsi + 0x30]",
        "ldmxcsr dword ptr [rsi + 0x38]",
        "fldcw word ptr [rsi + 0x3c]",
        // Resumed context: back into its `switch_context` caller.
        // Fresh context: pops the entry address.
        "ret",
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_matches_assembly_offsets() {
        assert_eq!(core::mem::offset_of!(Context, rsp), 0x00);
        assert_eq!(core::mem::offset_of!(Context, r15), 0x30);
        assert_eq!(core::mem::offset_of!(Context, mxcsr), 0x38);
        assert_eq!(core::mem::offset_of!(Context, fpu_cw), 0x3c);
        assert_eq!(core::mem::size_of::<Context>(), 0x40);
    }
}
