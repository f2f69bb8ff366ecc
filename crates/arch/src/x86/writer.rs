//! x86-64 instruction writer.
//!
//! Hand-assembles the small instruction vocabulary the trampoline backend and
//! relocator need: pushes/pops, moves, stack arithmetic, SIMD spills, branches
//! in near and absolute forms, and the full/minimal state-saving prologues.
//! Labels follow the usual deferred-fixup protocol: forward branches record a
//! fixup and `flush()` resolves them.

use super::cpu::{CPU_CONTEXT_SIZE, CTX_RSP_OFFSET};
use crate::label::{Label, LabelPool};
use crate::{CodegenError, Result};

/// x86-64 general purpose registers, numbered as encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reg {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Reg {
    #[inline]
    fn low3(self) -> u8 {
        self as u8 & 7
    }

    #[inline]
    fn is_ext(self) -> bool {
        self as u8 >= 8
    }

    pub fn from_index(index: u8) -> Option<Reg> {
        use Reg::*;
        const ALL: [Reg; 16] = [
            Rax, Rcx, Rdx, Rbx, Rsp, Rbp, Rsi, Rdi, R8, R9, R10, R11, R12, R13, R14, R15,
        ];
        ALL.get(index as usize).copied()
    }
}

/// How much state a generated prologue must preserve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrologueKind {
    /// Caller-save integer registers, flags and the stack pointer: enough to
    /// run C ABI code and restore state bit-identically.
    Minimal,
    /// Everything `Minimal` saves plus callee-save registers and SIMD state,
    /// laid out as a [`super::CpuContext`] so listeners may rewrite any
    /// register.
    Full,
}

#[derive(Debug)]
enum Fixup {
    /// rel8 displacement byte at `disp_at`, relative to `anchor` (offset of
    /// the next instruction).
    Rel8 { label: Label, disp_at: usize, anchor: usize },
    /// rel32 displacement dword.
    Rel32 { label: Label, disp_at: usize, anchor: usize },
}

/// An x86-64 assembler emitting into a growable buffer based at a fixed
/// virtual address.
pub struct X86Writer {
    code: Vec<u8>,
    base: u64,
    labels: LabelPool,
    fixups: Vec<Fixup>,
}

impl X86Writer {
    pub fn new(base: u64) -> Self {
        Self {
            code: Vec::with_capacity(256),
            base,
            labels: LabelPool::new(),
            fixups: Vec::new(),
        }
    }

    /// Virtual address of the next emitted byte.
    pub fn pc(&self) -> u64 {
        self.base + self.code.len() as u64
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// Resolve all recorded fixups and hand back the bytes.
    pub fn into_code(mut self) -> Result<Vec<u8>> {
        self.flush()?;
        Ok(self.code)
    }

    // --- labels ---------------------------------------------------------

    pub fn fresh_label(&mut self) -> Label {
        self.labels.fresh()
    }

    pub fn put_label(&mut self, label: Label) {
        self.labels.place(label, self.code.len());
    }

    /// Resolve deferred branch fixups. Fails with `UnresolvedLabel` if any
    /// referenced label was never placed.
    pub fn flush(&mut self) -> Result<()> {
        for fixup in self.fixups.drain(..) {
            match fixup {
                Fixup::Rel8 { label, disp_at, anchor } => {
                    let target = self
                        .labels
                        .offset_of(label)
                        .ok_or(CodegenError::UnresolvedLabel(label))?;
                    let rel = target as i64 - anchor as i64;
                    if !(-128..=127).contains(&rel) {
                        return Err(CodegenError::OutOfRange(rel));
                    }
                    self.code[disp_at] = rel as i8 as u8;
                }
                Fixup::Rel32 { label, disp_at, anchor } => {
                    let target = self
                        .labels
                        .offset_of(label)
                        .ok_or(CodegenError::UnresolvedLabel(label))?;
                    let rel = target as i64 - anchor as i64;
                    let rel = i32::try_from(rel).map_err(|_| CodegenError::OutOfRange(rel))?;
                    self.code[disp_at..disp_at + 4].copy_from_slice(&rel.to_le_bytes());
                }
            }
        }
        Ok(())
    }

    // --- raw emission ---------------------------------------------------

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.code.extend_from_slice(bytes);
    }

    #[inline]
    fn put_u8(&mut self, b: u8) {
        self.code.push(b);
    }

    #[inline]
    fn put_i32(&mut self, v: i32) {
        self.code.extend_from_slice(&v.to_le_bytes());
    }

    #[inline]
    fn put_u64(&mut self, v: u64) {
        self.code.extend_from_slice(&v.to_le_bytes());
    }

    // --- stack and moves ------------------------------------------------

    pub fn put_push_reg(&mut self, reg: Reg) {
        if reg.is_ext() {
            self.put_u8(0x41);
        }
        self.put_u8(0x50 + reg.low3());
    }

    pub fn put_pop_reg(&mut self, reg: Reg) {
        if reg.is_ext() {
            self.put_u8(0x41);
        }
        self.put_u8(0x58 + reg.low3());
    }

    pub fn put_pushfq(&mut self) {
        self.put_u8(0x9C);
    }

    pub fn put_popfq(&mut self) {
        self.put_u8(0x9D);
    }

    pub fn put_push_imm32(&mut self, imm: i32) {
        self.put_u8(0x68);
        self.put_i32(imm);
    }

    pub fn put_sub_rsp(&mut self, imm: u32) {
        if imm <= 0x7F {
            self.put_bytes(&[0x48, 0x83, 0xEC, imm as u8]);
        } else {
            self.put_bytes(&[0x48, 0x81, 0xEC]);
            self.put_i32(imm as i32);
        }
    }

    pub fn put_add_rsp(&mut self, imm: u32) {
        if imm <= 0x7F {
            self.put_bytes(&[0x48, 0x83, 0xC4, imm as u8]);
        } else {
            self.put_bytes(&[0x48, 0x81, 0xC4]);
            self.put_i32(imm as i32);
        }
    }

    pub fn put_and_rsp_i8(&mut self, imm: i8) {
        self.put_bytes(&[0x48, 0x83, 0xE4, imm as u8]);
    }

    pub fn put_mov_reg_u64(&mut self, dst: Reg, imm: u64) {
        self.put_u8(0x48 | u8::from(dst.is_ext()));
        self.put_u8(0xB8 + dst.low3());
        self.put_u64(imm);
    }

    pub fn put_mov_reg_reg(&mut self, dst: Reg, src: Reg) {
        let rex = 0x48 | (u8::from(src.is_ext()) << 2) | u8::from(dst.is_ext());
        self.put_u8(rex);
        self.put_u8(0x89);
        self.put_u8(0xC0 | (src.low3() << 3) | dst.low3());
    }

    /// `mov [rsp+offset], src`
    pub fn put_mov_rsp_offset_reg(&mut self, offset: i32, src: Reg) {
        self.put_u8(0x48 | (u8::from(src.is_ext()) << 2));
        self.put_u8(0x89);
        self.put_rsp_modrm(src.low3(), offset);
    }

    /// `mov dst, [rsp+offset]`
    pub fn put_mov_reg_rsp_offset(&mut self, dst: Reg, offset: i32) {
        self.put_u8(0x48 | (u8::from(dst.is_ext()) << 2));
        self.put_u8(0x8B);
        self.put_rsp_modrm(dst.low3(), offset);
    }

    /// `lea dst, [rsp+offset]`
    pub fn put_lea_reg_rsp_offset(&mut self, dst: Reg, offset: i32) {
        self.put_u8(0x48 | (u8::from(dst.is_ext()) << 2));
        self.put_u8(0x8D);
        self.put_rsp_modrm(dst.low3(), offset);
    }

    /// `mov dst, [base]`, with an explicit operand size of 8 or 4 bytes.
    pub fn put_mov_reg_mem(&mut self, dst: Reg, base: Reg, size: u8) {
        debug_assert!(size == 8 || size == 4);
        let mut rex = (u8::from(dst.is_ext()) << 2) | u8::from(base.is_ext());
        if size == 8 {
            rex |= 0x48;
        }
        if rex != 0 {
            self.put_u8(if size == 8 { rex } else { 0x40 | rex });
        }
        self.put_u8(0x8B);
        match base.low3() {
            // rsp/r12 need a SIB byte, rbp/r13 need an explicit disp8
            4 => self.put_bytes(&[(dst.low3() << 3) | 4, 0x24]),
            5 => self.put_bytes(&[0x40 | (dst.low3() << 3) | 5, 0x00]),
            b => self.put_u8((dst.low3() << 3) | b),
        }
    }

    fn put_rsp_modrm(&mut self, reg_field: u8, offset: i32) {
        if (-128..=127).contains(&offset) {
            self.put_bytes(&[0x44 | (reg_field << 3), 0x24, offset as i8 as u8]);
        } else {
            self.put_bytes(&[0x84 | (reg_field << 3), 0x24]);
            self.put_i32(offset);
        }
    }

    /// `movups [rsp+offset], xmmN`
    pub fn put_movups_store(&mut self, offset: i32, xmm: u8) {
        if xmm >= 8 {
            self.put_u8(0x44);
        }
        self.put_bytes(&[0x0F, 0x11]);
        self.put_rsp_modrm(xmm & 7, offset);
    }

    /// `movups xmmN, [rsp+offset]`
    pub fn put_movups_load(&mut self, xmm: u8, offset: i32) {
        if xmm >= 8 {
            self.put_u8(0x44);
        }
        self.put_bytes(&[0x0F, 0x10]);
        self.put_rsp_modrm(xmm & 7, offset);
    }

    // --- control flow ---------------------------------------------------

    pub fn put_call_reg(&mut self, reg: Reg) {
        if reg.is_ext() {
            self.put_u8(0x41);
        }
        self.put_bytes(&[0xFF, 0xD0 | reg.low3()]);
    }

    pub fn put_jmp_reg(&mut self, reg: Reg) {
        if reg.is_ext() {
            self.put_u8(0x41);
        }
        self.put_bytes(&[0xFF, 0xE0 | reg.low3()]);
    }

    /// `jmp rel32` to an absolute target; fails if out of rel32 range.
    pub fn put_jmp_near(&mut self, target: u64) -> Result<()> {
        let rel = target.wrapping_sub(self.pc() + 5) as i64;
        let rel = i32::try_from(rel).map_err(|_| CodegenError::OutOfRange(rel))?;
        self.put_u8(0xE9);
        self.put_i32(rel);
        Ok(())
    }

    /// `call rel32` to an absolute target; fails if out of rel32 range.
    pub fn put_call_near(&mut self, target: u64) -> Result<()> {
        let rel = target.wrapping_sub(self.pc() + 5) as i64;
        let rel = i32::try_from(rel).map_err(|_| CodegenError::OutOfRange(rel))?;
        self.put_u8(0xE8);
        self.put_i32(rel);
        Ok(())
    }

    /// `jcc rel32` to an absolute target. `cc` is the condition nibble.
    pub fn put_jcc_near(&mut self, cc: u8, target: u64) -> Result<()> {
        let rel = target.wrapping_sub(self.pc() + 6) as i64;
        let rel = i32::try_from(rel).map_err(|_| CodegenError::OutOfRange(rel))?;
        self.put_bytes(&[0x0F, 0x80 + (cc & 0x0F)]);
        self.put_i32(rel);
        Ok(())
    }

    /// `jmp [rip+0]` followed by the 64-bit target: reaches anywhere.
    pub fn put_jmp_abs(&mut self, target: u64) {
        self.put_bytes(&[0xFF, 0x25, 0x00, 0x00, 0x00, 0x00]);
        self.put_u64(target);
    }

    /// `call [rip+2]; jmp +8; .quad target`: an absolute call that returns to
    /// the instruction following the inline pointer.
    pub fn put_call_abs(&mut self, target: u64) {
        self.put_bytes(&[0xFF, 0x15, 0x02, 0x00, 0x00, 0x00]);
        self.put_bytes(&[0xEB, 0x08]);
        self.put_u64(target);
    }

    /// Conditional branch to an absolute target: the condition is inverted
    /// over a short skip of an absolute jump.
    pub fn put_jcc_abs(&mut self, cc: u8, target: u64) {
        let skip = self.fresh_label();
        self.put_jcc_short_label(cc ^ 1, skip);
        self.put_jmp_abs(target);
        self.put_label(skip);
    }

    pub fn put_jmp_short_label(&mut self, label: Label) {
        self.put_u8(0xEB);
        let disp_at = self.code.len();
        self.put_u8(0);
        self.fixups.push(Fixup::Rel8 { label, disp_at, anchor: self.code.len() });
    }

    pub fn put_jcc_short_label(&mut self, cc: u8, label: Label) {
        self.put_u8(0x70 + (cc & 0x0F));
        let disp_at = self.code.len();
        self.put_u8(0);
        self.fixups.push(Fixup::Rel8 { label, disp_at, anchor: self.code.len() });
    }

    pub fn put_jcc_near_label(&mut self, cc: u8, label: Label) {
        self.put_bytes(&[0x0F, 0x80 + (cc & 0x0F)]);
        let disp_at = self.code.len();
        self.put_i32(0);
        self.fixups.push(Fixup::Rel32 { label, disp_at, anchor: self.code.len() });
    }

    pub fn put_ret(&mut self) {
        self.put_u8(0xC3);
    }

    pub fn put_nop(&mut self) {
        self.put_u8(0x90);
    }

    pub fn put_int3(&mut self) {
        self.put_u8(0xCC);
    }

    pub fn put_mfence(&mut self) {
        self.put_bytes(&[0x0F, 0xAE, 0xF0]);
    }

    // --- prologue / epilogue --------------------------------------------

    /// Save machine state on the stack.
    ///
    /// `Full` lays the saved state out as a [`super::CpuContext`]: two slots
    /// are reserved above the GPR block for `rsp`/`rip`, all registers and
    /// rflags are pushed, SIMD state is spilled below, and the pre-prologue
    /// stack pointer is stored into the context's `rsp` slot. On return the
    /// stack pointer is the context base.
    pub fn put_prologue(&mut self, kind: PrologueKind) {
        use Reg::*;
        match kind {
            PrologueKind::Minimal => {
                for reg in [Rax, Rcx, Rdx, Rsi, Rdi, R8, R9, R10, R11] {
                    self.put_push_reg(reg);
                }
                self.put_pushfq();
            }
            PrologueKind::Full => {
                self.put_sub_rsp(16); // rsp + rip slots
                for reg in [
                    Rax, Rbx, Rcx, Rdx, Rbp, Rsi, Rdi, R8, R9, R10, R11, R12, R13, R14, R15,
                ] {
                    self.put_push_reg(reg);
                }
                self.put_pushfq();
                self.put_sub_rsp(256);
                for i in 0..16 {
                    self.put_movups_store(i as i32 * 16, i);
                }
                // context.rsp = stack pointer before this prologue ran
                self.put_lea_reg_rsp_offset(Rax, CPU_CONTEXT_SIZE as i32);
                self.put_mov_rsp_offset_reg(CTX_RSP_OFFSET, Rax);
            }
        }
    }

    /// Restore the state saved by the matching [`put_prologue`].
    ///
    /// For `Full`, registers are reloaded from the (possibly mutated) context
    /// and the stack pointer is left at the context's `rsp` slot; the caller
    /// decides what to do with the two reserved slots.
    pub fn put_epilogue(&mut self, kind: PrologueKind) {
        use Reg::*;
        match kind {
            PrologueKind::Minimal => {
                self.put_popfq();
                for reg in [R11, R10, R9, R8, Rdi, Rsi, Rdx, Rcx, Rax] {
                    self.put_pop_reg(reg);
                }
            }
            PrologueKind::Full => {
                for i in 0..16 {
                    self.put_movups_load(i, i as i32 * 16);
                }
                self.put_add_rsp(256);
                self.put_popfq();
                for reg in [
                    R15, R14, R13, R12, R11, R10, R9, R8, Rdi, Rsi, Rbp, Rdx, Rcx, Rbx, Rax,
                ] {
                    self.put_pop_reg(reg);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_pop_encodings() {
        let mut w = X86Writer::new(0x1000);
        w.put_push_reg(Reg::Rax);
        w.put_push_reg(Reg::R15);
        w.put_pop_reg(Reg::R8);
        w.put_pop_reg(Reg::Rbx);
        assert_eq!(w.code(), &[0x50, 0x41, 0x57, 0x41, 0x58, 0x5B]);
    }

    #[test]
    fn mov_and_lea_rsp_forms() {
        let mut w = X86Writer::new(0);
        w.put_mov_reg_reg(Reg::Rsi, Reg::Rsp);
        w.put_mov_rsp_offset_reg(0x10, Reg::Rax);
        w.put_mov_rsp_offset_reg(392, Reg::Rax);
        w.put_lea_reg_rsp_offset(Reg::Rax, 400);
        assert_eq!(
            w.code(),
            &[
                0x48, 0x89, 0xE6, // mov rsi, rsp
                0x48, 0x89, 0x44, 0x24, 0x10, // mov [rsp+0x10], rax
                0x48, 0x89, 0x84, 0x24, 0x88, 0x01, 0x00, 0x00, // mov [rsp+392], rax
                0x48, 0x8D, 0x84, 0x24, 0x90, 0x01, 0x00, 0x00, // lea rax, [rsp+400]
            ][..]
        );
    }

    #[test]
    fn mov_imm64_and_call() {
        let mut w = X86Writer::new(0);
        w.put_mov_reg_u64(Reg::Rax, 0x1122334455667788);
        w.put_call_reg(Reg::Rax);
        w.put_call_reg(Reg::R9);
        assert_eq!(
            w.code(),
            &[
                0x48, 0xB8, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11, // movabs
                0xFF, 0xD0, // call rax
                0x41, 0xFF, 0xD1, // call r9
            ][..]
        );
    }

    #[test]
    fn movups_spills() {
        let mut w = X86Writer::new(0);
        w.put_movups_store(0x20, 3);
        w.put_movups_store(0x90, 10);
        w.put_movups_load(0, 0);
        assert_eq!(
            w.code(),
            &[
                0x0F, 0x11, 0x5C, 0x24, 0x20, // movups [rsp+0x20], xmm3
                0x44, 0x0F, 0x11, 0x94, 0x24, 0x90, 0x00, 0x00, 0x00, // movups [rsp+0x90], xmm10
                0x0F, 0x10, 0x44, 0x24, 0x00, // movups xmm0, [rsp]
            ][..]
        );
    }

    #[test]
    fn jmp_abs_form() {
        let mut w = X86Writer::new(0x4000);
        w.put_jmp_abs(0xDEADBEEFCAFE);
        assert_eq!(&w.code()[..6], &[0xFF, 0x25, 0x00, 0x00, 0x00, 0x00]);
        assert_eq!(
            u64::from_le_bytes(w.code()[6..14].try_into().unwrap()),
            0xDEADBEEFCAFE
        );
    }

    #[test]
    fn jmp_near_displacement() {
        let mut w = X86Writer::new(0x1000);
        w.put_jmp_near(0x2000).unwrap();
        assert_eq!(w.code()[0], 0xE9);
        let rel = i32::from_le_bytes(w.code()[1..5].try_into().unwrap());
        assert_eq!(0x1000 + 5 + rel as i64, 0x2000);
    }

    #[test]
    fn forward_label_resolves() {
        let mut w = X86Writer::new(0);
        let skip = w.fresh_label();
        w.put_jcc_short_label(0x4, skip); // je skip
        w.put_nop();
        w.put_nop();
        w.put_label(skip);
        w.flush().unwrap();
        assert_eq!(w.code(), &[0x74, 0x02, 0x90, 0x90]);
    }

    #[test]
    fn unplaced_label_fails_flush() {
        let mut w = X86Writer::new(0);
        let dangling = w.fresh_label();
        w.put_jmp_short_label(dangling);
        assert!(matches!(
            w.flush(),
            Err(CodegenError::UnresolvedLabel(_))
        ));
    }

    #[test]
    fn jcc_abs_inverts_condition_over_skip() {
        let mut w = X86Writer::new(0);
        w.put_jcc_abs(0x4, 0x1234_5678_9ABC); // je target
        w.flush().unwrap();
        // jne +14 over the absolute jmp
        assert_eq!(w.code()[0], 0x75);
        assert_eq!(w.code()[1], 14);
        assert_eq!(&w.code()[2..8], &[0xFF, 0x25, 0x00, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn full_prologue_epilogue_shapes() {
        let mut w = X86Writer::new(0);
        w.put_prologue(PrologueKind::Full);
        let prologue_len = w.len();
        w.put_epilogue(PrologueKind::Full);
        w.flush().unwrap();
        // sub rsp,16 / 15 pushes (19 bytes) / pushfq / sub rsp,256 (7 bytes)
        assert_eq!(&w.code()[..4], &[0x48, 0x83, 0xEC, 0x10]);
        assert_eq!(w.code()[4], 0x50); // push rax first
        // prologue stores the pre-prologue rsp into the context slot
        let tail = &w.code()[prologue_len - 8..prologue_len];
        assert_eq!(tail, &[0x48, 0x89, 0x84, 0x24, 0x80, 0x01, 0x00, 0x00]);
    }
}
