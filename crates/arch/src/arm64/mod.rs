//! aarch64 code writer and relocator.
//!
//! All instructions are 32-bit little-endian words; the writer and relocator
//! assemble and decode them with plain masks rather than an external
//! disassembler.

mod cpu;
mod relocator;
mod writer;

pub use cpu::{
    CpuContext, VecReg, CPU_CONTEXT_SIZE, CTX_FP_OFFSET, CTX_NZCV_OFFSET, CTX_PC_OFFSET,
    CTX_Q_OFFSET, CTX_SP_OFFSET, CTX_X_OFFSET,
};
pub use relocator::{can_relocate, Arm64Relocator};
pub use writer::{Arm64Writer, PrologueKind, SCRATCH_REG, SCRATCH_REG_ALT};

/// Shortest reliable redirect on aarch64: a single `b imm26`.
pub const REDIRECT_SIZE: usize = 4;

/// Branch reach of `b imm26` (±128 MiB), used when placing trampolines.
pub const NEAR_RANGE: usize = 0x7FF_F000;
