//! AArch64 AAPCS64 context.

use core::arch::naked_asm;

use super::{EntryFn, MachineContext, bootstrap_sp};
use crate::error::Result;
use crate::stack::StackBounds;

/// x19-x28, frame pointer, link register, sp, then the low halves of v8-v15.
#[repr(C)]
#[derive(Debug, Clone, Default)]
pub struct Context {
    x: [u64; 10],
    fp: u64,
    lr: u64,
    sp: u64,
    d: [u64; 8],
}

impl MachineContext for Context {
    const STACK_ALIGN: usize = 16;
    // Zeroed frame record so unwinders stop at the thread entry.
    const BOOTSTRAP_FRAME: usize = 16;

    fn empty() -> Self {
        Self::default()
    }

    fn init(stack: StackBounds, entry: EntryFn) -> Result<Self> {
        let sp = bootstrap_sp(stack, Self::STACK_ALIGN, Self::BOOTSTRAP_FRAME)?;
        // SAFETY: the 16-byte frame at `sp` lies inside the checked region.
        unsafe { core::ptr::write_bytes(sp as *mut u8, 0, Self::BOOTSTRAP_FRAME) };
        let mut ctx = Self {
            sp: sp as u64,
            lr: bootstrap as usize as u64,
            ..Self::default()
        };
        ctx.x[0] = entry as usize as u64;
        Ok(ctx)
    }

    unsafe fn switch(save: *mut Self, restore: *const Self) {
        // SAFETY: forwarded from the caller.
        unsafe { switch_context(save, restore) }
    }

    fn stack_pointer(&self) -> usize {
        self.sp as usize
    }
}

/// First instruction of a fresh context: clear the frame chain and jump to
/// the entry point parked in x19.
#[unsafe(naked)]
unsafe extern "C" fn bootstrap() {
    naked_asm!("mov x29, xzr", "mov x30, xzr", "br x19");
}

#[unsafe(naked)]
unsafe extern "C" fn switch_context(_save: *mut Context, _restore: *const Context) {
    naked_asm!(
        "stp x19, x20, [x0, #0]",
        "stp x21, x22, [x0, #16]",
        "stp x23, x24, [x0, #32]",
        "stp x25, x26, [x0, #48]",
        "stp x27, x28, [x0, #64]",
        "stp x29, x30, [x0, #80]",
        "mov x9, sp",
        "str x9, [x0, #96]",
        "stp d8, d9, [x0, #104]",
        "stp d10, d11, [x0, #120]",
        "stp d12, d13, [x0, #136]",
        "stp d14, d15, [x0, #152]",
        "ldp x19, x20, [x1, #0]",
        "ldp x21, x22, [x1, #16]",
        "ldp x23, x24, [x1, #32]",
        "ldp x25, x26, [x1, #48]",
        "ldp x27, x28, [x1, #64]",
        "ldp x29, x30, [x1, #80]",
        "ldr x9, [x1, #96]",
        "mov sp, x9",
        "ldp d8, d9, [x1, #104]",
        "ldp d10, d11, [x1, #120]",
        "ldp d12, d13, [x1, #136]",
        "ldp d14, d15, [x1, #152]",
        "ret",
    );
}
