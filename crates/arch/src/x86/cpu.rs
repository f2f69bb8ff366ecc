//! Saved CPU state for x86-64 invocations.

/// XMM register (128-bit SIMD)
#[repr(C, align(16))]
#[derive(Clone, Copy)]
pub struct Xmm {
    pub data: [u8; 16],
}

impl Xmm {
    /// Interpret as 2 double-precision floats
    pub fn as_f64x2(&self) -> [f64; 2] {
        let bytes: [[u8; 8]; 2] = [
            self.data[0..8].try_into().unwrap(),
            self.data[8..16].try_into().unwrap(),
        ];
        bytes.map(f64::from_le_bytes)
    }

    /// Set from 2 double-precision floats
    pub fn set_f64x2(&mut self, values: [f64; 2]) {
        for (i, v) in values.iter().enumerate() {
            self.data[i * 8..(i + 1) * 8].copy_from_slice(&v.to_le_bytes());
        }
    }

    /// Low 64 bits as an integer
    pub fn as_u64(&self) -> u64 {
        u64::from_le_bytes(self.data[0..8].try_into().unwrap())
    }
}

impl Default for Xmm {
    fn default() -> Self {
        Self { data: [0u8; 16] }
    }
}

impl std::fmt::Debug for Xmm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Xmm({:02x?})", &self.data[..])
    }
}

/// Full CPU context saved by the x86-64 entry and leave trampolines.
///
/// Layout matches the full prologue's store order exactly; the trampolines
/// treat the stack area as this struct, so mutations made through a listener's
/// `cpu_context()` are restored into the real registers.
#[repr(C)]
#[derive(Debug, Clone)]
pub struct CpuContext {
    // XMM registers, lowest addresses (stored after the GPR pushes)
    pub xmm: [Xmm; 16],

    // RFLAGS (pushfq)
    pub rflags: u64,

    // General purpose registers in reverse push order
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,

    /// Stack pointer at the interception point. At a function-entry cut this
    /// is the address of the caller's return-address slot.
    pub rsp: u64,

    /// Resume address. The prologue reserves the slot; the runtime stores the
    /// next hop here and the epilogue `ret`s through it.
    pub rip: u64,
}

/// Size of [`CpuContext`] as laid out on the trampoline stack.
pub const CPU_CONTEXT_SIZE: usize = 400;

const _: () = assert!(std::mem::size_of::<CpuContext>() == CPU_CONTEXT_SIZE);

impl Default for CpuContext {
    fn default() -> Self {
        // SAFETY: all fields are plain integers/byte arrays
        unsafe { std::mem::zeroed() }
    }
}

/// Byte offset of the `rsp` slot within the stacked context.
pub const CTX_RSP_OFFSET: i32 = 384;
/// Byte offset of the `rip` (next hop) slot within the stacked context.
pub const CTX_RIP_OFFSET: i32 = 392;
/// Byte offset of the saved GPR block (rflags first).
pub const CTX_GPR_OFFSET: i32 = 256;

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::offset_of;

    #[test]
    fn context_layout_matches_store_order() {
        assert_eq!(offset_of!(CpuContext, xmm), 0);
        assert_eq!(offset_of!(CpuContext, rflags), CTX_GPR_OFFSET as usize);
        assert_eq!(offset_of!(CpuContext, r15), 264);
        assert_eq!(offset_of!(CpuContext, r8), 320);
        assert_eq!(offset_of!(CpuContext, rdi), 328);
        assert_eq!(offset_of!(CpuContext, rax), 376);
        assert_eq!(offset_of!(CpuContext, rsp), CTX_RSP_OFFSET as usize);
        assert_eq!(offset_of!(CpuContext, rip), CTX_RIP_OFFSET as usize);
    }

    #[test]
    fn xmm_f64_roundtrip() {
        let mut x = Xmm::default();
        x.set_f64x2([1.5, -2.5]);
        let back = x.as_f64x2();
        assert_eq!(back, [1.5, -2.5]);
    }
}
