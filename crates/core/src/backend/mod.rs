//! Per-architecture trampoline backends.
//!
//! A backend builds, for one target function, the entry/leave trampolines
//! and the relocated prologue in a code slice, precomputes the redirector
//! bytes, and knows how to publish or restore the target prologue with the
//! ordering rules the architecture demands.

#[cfg(target_arch = "x86_64")]
mod x86_64;
#[cfg(target_arch = "x86_64")]
pub(crate) use x86_64::*;

#[cfg(target_arch = "aarch64")]
mod aarch64;
#[cfg(target_arch = "aarch64")]
pub(crate) use aarch64::*;

use crate::interceptor::FunctionRecord;

/// Release the record's code slice. Callers must have waited for the
/// trampoline-usage counter to drain.
pub(crate) fn destroy_trampoline(record: &mut FunctionRecord) {
    record.trampoline_slice = None;
}
