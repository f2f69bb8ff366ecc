//! Architecture-specific code generation for the divert interceptor.
//!
//! Three families are supported:
//! - [`x86`] - x86 and x86-64, decoded with iced-x86
//! - [`arm64`] - aarch64 (AAPCS64), fixed-width words assembled by hand
//! - [`arm`] - ARM A32; T32 targets are reported as unsupportable
//!
//! Each family provides a *code writer* (an assembler with label fixup) and a
//! *relocator* (a copier that re-emits instructions at a new address while
//! rewriting PC-relative operands). Everything in this crate operates on plain
//! byte buffers, so it compiles and tests on any host.

pub mod arm;
pub mod arm64;
pub mod x86;

mod label;

pub use label::Label;

/// Errors shared by all writers and relocators.
#[derive(Debug, thiserror::Error)]
pub enum CodegenError {
    /// `flush()` found a branch whose label was never placed.
    #[error("unresolved label {0:?}")]
    UnresolvedLabel(Label),

    /// A branch or literal offset does not fit its encoding.
    #[error("displacement out of range: {0:#x}")]
    OutOfRange(i64),

    /// The input bytes could not be decoded as an instruction.
    #[error("invalid instruction at {0:#x}")]
    InvalidInstruction(u64),

    /// The decoded instruction has no semantics-preserving relocation.
    #[error("cannot relocate instruction at {0:#x}: {1}")]
    Unrelocatable(u64, &'static str),

    /// The writer's output buffer is full.
    #[error("code buffer exhausted ({0} bytes)")]
    BufferFull(usize),
}

pub type Result<T> = std::result::Result<T, CodegenError>;
