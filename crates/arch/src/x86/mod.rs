//! x86 / x86-64 code writer and relocator.

mod cpu;
mod relocator;
mod writer;

pub use cpu::{
    CpuContext, Xmm, CPU_CONTEXT_SIZE, CTX_GPR_OFFSET, CTX_RIP_OFFSET, CTX_RSP_OFFSET,
};
pub use relocator::{can_relocate, X86Relocator};
pub use writer::{PrologueKind, Reg, X86Writer};

/// Shortest reliable redirect on x86/x86-64: `jmp rel32`.
pub const REDIRECT_SIZE: usize = 5;

/// Branch reach of `jmp rel32`, used when placing trampolines near a target.
pub const NEAR_RANGE: usize = 0x7FFF_0000;
