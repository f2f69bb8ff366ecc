//! Error types for the interceptor core.

use divert_arch::CodegenError;

/// Internal hook-machinery errors. Structural operations log these and
/// collapse them into the stable status enums below.
#[derive(Debug, thiserror::Error)]
pub enum HookError {
    /// The first bytes of the target cannot be safely relocated.
    #[error("target {0:#x} is not relocatable: {1}")]
    Unsupportable(usize, &'static str),

    /// No executable slab could be placed within branch range of the target.
    #[error("no executable memory within branch range of {0:#x}")]
    OutOfNearCodeSpace(usize),

    /// Code generation failed while building the trampolines.
    #[error("code generation failed: {0}")]
    Codegen(#[from] CodegenError),

    /// A page-protection change was refused by the OS.
    #[error("memory protection failed: {0}")]
    MemoryProtection(String),

    /// Neither RWX pages nor the dual-mapping publish are available.
    #[error("platform forbids every code patching strategy")]
    PatchingForbidden,

    /// The built trampoline does not fit the code slice.
    #[error("trampoline exceeds code slice ({0} > {1} bytes)")]
    TrampolineTooLarge(usize, usize),
}

/// Stable status surface of `attach`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AttachError {
    /// The target's entry bytes cannot be hooked.
    #[error("wrong signature")]
    WrongSignature,

    /// The listener is already attached to this target.
    #[error("already attached")]
    AlreadyAttached,

    /// A platform policy prevents patching the target.
    #[error("policy violation")]
    PolicyViolation,
}

/// Stable status surface of `replace`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ReplaceError {
    /// The target's entry bytes cannot be hooked.
    #[error("wrong signature")]
    WrongSignature,

    /// The target already has a replacement installed.
    #[error("already replaced")]
    AlreadyReplaced,
}

impl HookError {
    /// Collapse an internal error into the attach status set, logging the
    /// root cause (the caller cannot distinguish resource exhaustion from an
    /// unsupportable prologue).
    pub(crate) fn into_attach(self) -> AttachError {
        tracing::warn!(error = %self, "attach failed");
        match self {
            HookError::PatchingForbidden => AttachError::PolicyViolation,
            _ => AttachError::WrongSignature,
        }
    }

    pub(crate) fn into_replace(self) -> ReplaceError {
        tracing::warn!(error = %self, "replace failed");
        ReplaceError::WrongSignature
    }
}
