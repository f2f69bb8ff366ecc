//! ARM (A32) code writer and relocator.
//!
//! T32 (Thumb) entry points are not relocatable by this module; callers
//! detect the Thumb bit and report the target as unsupportable.

mod relocator;
mod writer;

pub use relocator::{can_relocate, ArmRelocator};
pub use writer::ArmWriter;

/// Shortest reliable redirect on A32: a single `b imm24`.
pub const REDIRECT_SIZE: usize = 4;

/// Branch reach of `b imm24` (±32 MiB).
pub const NEAR_RANGE: usize = 0x1FF_0000;

/// Whether an address carries the Thumb interworking bit.
pub fn is_thumb(address: u64) -> bool {
    address & 1 != 0
}
