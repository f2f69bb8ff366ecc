//! aarch64 instruction writer.
//!
//! Emits 32-bit words with deferred label fixup and a trailing literal pool
//! for `ldr Xt, =value` style loads. Offsets used with the load/store pair
//! and unsigned-offset forms must respect the forms' scaling.

use super::cpu::{
    CPU_CONTEXT_SIZE, CTX_FP_OFFSET, CTX_NZCV_OFFSET, CTX_Q_OFFSET, CTX_SP_OFFSET, CTX_X_OFFSET,
};
use crate::label::{Label, LabelPool};
use crate::{CodegenError, Result};

/// Inter-procedure scratch register (IP0); clobberable at branch boundaries.
pub const SCRATCH_REG: u8 = 16;
/// Second scratch (IP1), used when the primary is live in the rewritten code.
pub const SCRATCH_REG_ALT: u8 = 17;

/// How much state a generated prologue must preserve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrologueKind {
    /// Caller-save registers, flags and the stack pointer.
    Minimal,
    /// Everything, laid out as a [`super::CpuContext`].
    Full,
}

#[derive(Debug, Clone, Copy)]
enum FixupKind {
    /// b / bl imm26
    Imm26,
    /// b.cond / cbz / ldr-literal imm19
    Imm19,
    /// tbz / tbnz imm14
    Imm14,
}

#[derive(Debug)]
struct Fixup {
    label: Label,
    word_at: usize,
    kind: FixupKind,
}

#[derive(Debug)]
struct Literal {
    value: u64,
    // word offsets of the ldr-literal instructions waiting for this value
    sites: Vec<usize>,
}

/// An aarch64 assembler emitting into a growable buffer based at a fixed
/// virtual address.
pub struct Arm64Writer {
    code: Vec<u8>,
    base: u64,
    labels: LabelPool,
    fixups: Vec<Fixup>,
    literals: Vec<Literal>,
}

impl Arm64Writer {
    pub fn new(base: u64) -> Self {
        debug_assert!(base % 4 == 0);
        Self {
            code: Vec::with_capacity(256),
            base,
            labels: LabelPool::new(),
            fixups: Vec::new(),
            literals: Vec::new(),
        }
    }

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

    /// Resolve fixups, emit the literal pool, and hand back the bytes.
    pub fn into_code(mut self) -> Result<Vec<u8>> {
        self.flush()?;
        Ok(self.code)
    }

    pub fn fresh_label(&mut self) -> Label {
        self.labels.fresh()
    }

    pub fn put_label(&mut self, label: Label) {
        self.labels.place(label, self.code.len());
    }

    fn put_word(&mut self, word: u32) {
        self.code.extend_from_slice(&word.to_le_bytes());
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        debug_assert!(bytes.len() % 4 == 0);
        self.code.extend_from_slice(bytes);
    }

    /// Resolve all deferred branches and append the literal pool.
    ///
    /// The caller must make sure control cannot fall through into the pool
    /// (end with an unconditional transfer).
    pub fn flush(&mut self) -> Result<()> {
        // literal pool: 8-aligned, after the code
        if !self.literals.is_empty() {
            if self.code.len() % 8 != 0 {
                self.put_word(0xD503201F); // nop
            }
            let literals = std::mem::take(&mut self.literals);
            for lit in &literals {
                let pool_at = self.code.len();
                self.code.extend_from_slice(&lit.value.to_le_bytes());
                for &site in &lit.sites {
                    let rel = (pool_at as i64 - site as i64) >> 2;
                    self.patch_imm19(site, rel)?;
                }
            }
        }

        for fixup in std::mem::take(&mut self.fixups) {
            let target = self
                .labels
                .offset_of(fixup.label)
                .ok_or(CodegenError::UnresolvedLabel(fixup.label))?;
            let rel = (target as i64 - fixup.word_at as i64) >> 2;
            match fixup.kind {
                FixupKind::Imm26 => self.patch_imm26(fixup.word_at, rel)?,
                FixupKind::Imm19 => self.patch_imm19(fixup.word_at, rel)?,
                FixupKind::Imm14 => self.patch_imm14(fixup.word_at, rel)?,
            }
        }
        Ok(())
    }

    fn patch_word(&mut self, at: usize, bits: u32) {
        let word = u32::from_le_bytes(self.code[at..at + 4].try_into().unwrap()) | bits;
        self.code[at..at + 4].copy_from_slice(&word.to_le_bytes());
    }

    fn patch_imm26(&mut self, at: usize, rel: i64) -> Result<()> {
        if !(-(1 << 25)..1 << 25).contains(&rel) {
            return Err(CodegenError::OutOfRange(rel << 2));
        }
        self.patch_word(at, (rel as u32) & 0x03FF_FFFF);
        Ok(())
    }

    fn patch_imm19(&mut self, at: usize, rel: i64) -> Result<()> {
        if !(-(1 << 18)..1 << 18).contains(&rel) {
            return Err(CodegenError::OutOfRange(rel << 2));
        }
        self.patch_word(at, ((rel as u32) & 0x7FFFF) << 5);
        Ok(())
    }

    fn patch_imm14(&mut self, at: usize, rel: i64) -> Result<()> {
        if !(-(1 << 13)..1 << 13).contains(&rel) {
            return Err(CodegenError::OutOfRange(rel << 2));
        }
        self.patch_word(at, ((rel as u32) & 0x3FFF) << 5);
        Ok(())
    }

    // --- moves and arithmetic -------------------------------------------

    /// `mov Xd, Xm` (orr with xzr)
    pub fn put_mov_reg(&mut self, rd: u8, rm: u8) {
        self.put_word(0xAA00_03E0 | ((rm as u32) << 16) | rd as u32);
    }

    /// Materialise a 64-bit immediate with movz/movk, skipping zero halves.
    pub fn put_mov_imm64(&mut self, rd: u8, imm: u64) {
        if imm == 0 {
            self.put_word(0xD280_0000 | rd as u32);
            return;
        }
        let mut first = true;
        for hw in 0..4u32 {
            let half = ((imm >> (hw * 16)) & 0xFFFF) as u32;
            if half == 0 {
                continue;
            }
            let op = if first { 0xD280_0000 } else { 0xF280_0000 };
            self.put_word(op | (hw << 21) | (half << 5) | rd as u32);
            first = false;
        }
    }

    /// `sub sp, sp, #imm` (imm < 4096)
    pub fn put_sub_sp_imm(&mut self, imm: u32) {
        debug_assert!(imm < 4096);
        self.put_word(0xD100_03FF | (imm << 10));
    }

    /// `add sp, sp, #imm`
    pub fn put_add_sp_imm(&mut self, imm: u32) {
        debug_assert!(imm < 4096);
        self.put_word(0x9100_03FF | (imm << 10));
    }

    /// `add Xd, sp, #imm`
    pub fn put_add_reg_sp_imm(&mut self, rd: u8, imm: u32) {
        debug_assert!(imm < 4096);
        self.put_word(0x9100_03E0 | (imm << 10) | rd as u32);
    }

    // --- loads and stores -----------------------------------------------

    /// `stp Xt1, Xt2, [sp, #offset]`
    pub fn put_stp_x_sp_offset(&mut self, rt1: u8, rt2: u8, offset: i32) {
        let imm7 = ((offset / 8) as u32) & 0x7F;
        self.put_word(0xA900_0000 | (imm7 << 15) | ((rt2 as u32) << 10) | (31 << 5) | rt1 as u32);
    }

    /// `ldp Xt1, Xt2, [sp, #offset]`
    pub fn put_ldp_x_sp_offset(&mut self, rt1: u8, rt2: u8, offset: i32) {
        let imm7 = ((offset / 8) as u32) & 0x7F;
        self.put_word(0xA940_0000 | (imm7 << 15) | ((rt2 as u32) << 10) | (31 << 5) | rt1 as u32);
    }

    /// `str Xt, [sp, #offset]`
    pub fn put_str_x_sp_offset(&mut self, rt: u8, offset: u32) {
        self.put_word(0xF900_0000 | ((offset / 8) << 10) | (31 << 5) | rt as u32);
    }

    /// `ldr Xt, [sp, #offset]`
    pub fn put_ldr_x_sp_offset(&mut self, rt: u8, offset: u32) {
        self.put_word(0xF940_0000 | ((offset / 8) << 10) | (31 << 5) | rt as u32);
    }

    /// `ldr Xt, [Xn]` (and the narrower widths used by the relocator)
    pub fn put_ldr_reg_reg(&mut self, rt: u8, rn: u8) {
        self.put_word(0xF940_0000 | ((rn as u32) << 5) | rt as u32);
    }

    pub fn put_ldr_w_reg_reg(&mut self, rt: u8, rn: u8) {
        self.put_word(0xB940_0000 | ((rn as u32) << 5) | rt as u32);
    }

    pub fn put_ldrsw_reg_reg(&mut self, rt: u8, rn: u8) {
        self.put_word(0xB980_0000 | ((rn as u32) << 5) | rt as u32);
    }

    pub fn put_ldr_s_reg_reg(&mut self, rt: u8, rn: u8) {
        self.put_word(0xBD40_0000 | ((rn as u32) << 5) | rt as u32);
    }

    pub fn put_ldr_d_reg_reg(&mut self, rt: u8, rn: u8) {
        self.put_word(0xFD40_0000 | ((rn as u32) << 5) | rt as u32);
    }

    pub fn put_ldr_q_reg_reg(&mut self, rt: u8, rn: u8) {
        self.put_word(0x3DC0_0000 | ((rn as u32) << 5) | rt as u32);
    }

    /// `stp Qt1, Qt2, [sp, #offset]`
    pub fn put_stp_q_sp_offset(&mut self, qt1: u8, qt2: u8, offset: i32) {
        let imm7 = ((offset / 16) as u32) & 0x7F;
        self.put_word(0xAD00_0000 | (imm7 << 15) | ((qt2 as u32) << 10) | (31 << 5) | qt1 as u32);
    }

    /// `ldp Qt1, Qt2, [sp, #offset]`
    pub fn put_ldp_q_sp_offset(&mut self, qt1: u8, qt2: u8, offset: i32) {
        let imm7 = ((offset / 16) as u32) & 0x7F;
        self.put_word(0xAD40_0000 | (imm7 << 15) | ((qt2 as u32) << 10) | (31 << 5) | qt1 as u32);
    }

    /// `ldr Xt, =value` against the trailing literal pool.
    pub fn put_ldr_lit(&mut self, rt: u8, value: u64) {
        let site = self.code.len();
        if let Some(lit) = self.literals.iter_mut().find(|l| l.value == value) {
            lit.sites.push(site);
        } else {
            self.literals.push(Literal { value, sites: vec![site] });
        }
        self.put_word(0x5800_0000 | rt as u32);
    }

    // --- system ---------------------------------------------------------

    pub fn put_mrs_nzcv(&mut self, rt: u8) {
        self.put_word(0xD53B_4200 | rt as u32);
    }

    pub fn put_msr_nzcv(&mut self, rt: u8) {
        self.put_word(0xD51B_4200 | rt as u32);
    }

    pub fn put_dsb_ish(&mut self) {
        self.put_word(0xD503_3B9F);
    }

    pub fn put_isb(&mut self) {
        self.put_word(0xD503_3FDF);
    }

    pub fn put_nop(&mut self) {
        self.put_word(0xD503_201F);
    }

    pub fn put_brk(&mut self, imm: u16) {
        self.put_word(0xD420_0000 | ((imm as u32) << 5));
    }

    // --- control flow ---------------------------------------------------

    /// `b target`; fails without emitting when out of ±128 MiB range.
    pub fn put_b(&mut self, target: u64) -> Result<()> {
        let rel = (target as i64 - self.pc() as i64) >> 2;
        if !(-(1 << 25)..1 << 25).contains(&rel) {
            return Err(CodegenError::OutOfRange(rel << 2));
        }
        self.put_word(0x1400_0000 | ((rel as u32) & 0x03FF_FFFF));
        Ok(())
    }

    /// `bl target`; fails without emitting when out of range.
    pub fn put_bl(&mut self, target: u64) -> Result<()> {
        let rel = (target as i64 - self.pc() as i64) >> 2;
        if !(-(1 << 25)..1 << 25).contains(&rel) {
            return Err(CodegenError::OutOfRange(rel << 2));
        }
        self.put_word(0x9400_0000 | ((rel as u32) & 0x03FF_FFFF));
        Ok(())
    }

    pub fn put_b_label(&mut self, label: Label) {
        let word_at = self.code.len();
        self.put_word(0x1400_0000);
        self.fixups.push(Fixup { label, word_at, kind: FixupKind::Imm26 });
    }

    /// `b.cond label`; `cond` is the standard condition nibble.
    pub fn put_bcond_label(&mut self, cond: u8, label: Label) {
        let word_at = self.code.len();
        self.put_word(0x5400_0000 | (cond as u32 & 0xF));
        self.fixups.push(Fixup { label, word_at, kind: FixupKind::Imm19 });
    }

    /// `cbz`/`cbnz` to a label. `sf` selects the 64-bit form.
    pub fn put_cbz_label(&mut self, sf: bool, nonzero: bool, rt: u8, label: Label) {
        let word_at = self.code.len();
        let mut word = 0x3400_0000 | rt as u32;
        if sf {
            word |= 1 << 31;
        }
        if nonzero {
            word |= 1 << 24;
        }
        self.put_word(word);
        self.fixups.push(Fixup { label, word_at, kind: FixupKind::Imm19 });
    }

    /// `tbz`/`tbnz` to a label.
    pub fn put_tbz_label(&mut self, nonzero: bool, rt: u8, bit: u8, label: Label) {
        let word_at = self.code.len();
        let mut word = if nonzero { 0x3700_0000 } else { 0x3600_0000 } | rt as u32;
        word |= ((bit as u32 & 0x20) >> 5) << 31;
        word |= (bit as u32 & 0x1F) << 19;
        self.put_word(word);
        self.fixups.push(Fixup { label, word_at, kind: FixupKind::Imm14 });
    }

    pub fn put_br(&mut self, rn: u8) {
        self.put_word(0xD61F_0000 | ((rn as u32) << 5));
    }

    pub fn put_blr(&mut self, rn: u8) {
        self.put_word(0xD63F_0000 | ((rn as u32) << 5));
    }

    pub fn put_ret(&mut self) {
        self.put_word(0xD65F_03C0);
    }

    /// Branch to an arbitrary 64-bit address through the scratch register.
    pub fn put_branch_abs(&mut self, target: u64) {
        self.put_ldr_lit(SCRATCH_REG, target);
        self.put_br(SCRATCH_REG);
    }

    /// Call an arbitrary 64-bit address through the scratch register.
    pub fn put_call_abs(&mut self, target: u64) {
        self.put_ldr_lit(SCRATCH_REG, target);
        self.put_blr(SCRATCH_REG);
    }

    // --- prologue / epilogue --------------------------------------------

    /// Save machine state below `sp`, laid out as a [`super::CpuContext`]
    /// for `Full`. On return `sp` is the context base; the pre-prologue
    /// stack pointer is stored in the context's `sp` slot and `x16` has been
    /// clobbered.
    pub fn put_prologue(&mut self, kind: PrologueKind) {
        match kind {
            PrologueKind::Minimal => {
                self.put_sub_sp_imm(176);
                for i in (0..18u8).step_by(2) {
                    self.put_stp_x_sp_offset(i, i + 1, i as i32 * 8);
                }
                self.put_str_x_sp_offset(30, 144);
                self.put_mrs_nzcv(SCRATCH_REG);
                self.put_str_x_sp_offset(SCRATCH_REG, 152);
            }
            PrologueKind::Full => {
                self.put_sub_sp_imm(CPU_CONTEXT_SIZE as u32);
                for i in (0..28u8).step_by(2) {
                    self.put_stp_x_sp_offset(i, i + 1, CTX_X_OFFSET as i32 + i as i32 * 8);
                }
                self.put_str_x_sp_offset(28, CTX_X_OFFSET + 28 * 8);
                self.put_stp_x_sp_offset(29, 30, CTX_FP_OFFSET as i32);
                for i in (0..32u8).step_by(2) {
                    self.put_stp_q_sp_offset(i, i + 1, CTX_Q_OFFSET as i32 + i as i32 * 16);
                }
                // x0/x1 are already saved; reuse them for flags and sp
                self.put_mrs_nzcv(0);
                self.put_str_x_sp_offset(0, CTX_NZCV_OFFSET);
                self.put_add_reg_sp_imm(0, CPU_CONTEXT_SIZE as u32);
                self.put_str_x_sp_offset(0, CTX_SP_OFFSET);
            }
        }
    }

    /// Restore the state saved by the matching [`put_prologue`]. For `Full`
    /// the context's `pc` slot is left untouched for the caller to branch
    /// through; `sp` is restored to the context base (not popped).
    pub fn put_epilogue(&mut self, kind: PrologueKind) {
        match kind {
            PrologueKind::Minimal => {
                self.put_ldr_x_sp_offset(SCRATCH_REG, 152);
                self.put_msr_nzcv(SCRATCH_REG);
                self.put_ldr_x_sp_offset(30, 144);
                for i in (0..18u8).step_by(2) {
                    self.put_ldp_x_sp_offset(i, i + 1, i as i32 * 8);
                }
                self.put_add_sp_imm(176);
            }
            PrologueKind::Full => {
                self.put_ldr_x_sp_offset(0, CTX_NZCV_OFFSET);
                self.put_msr_nzcv(0);
                for i in (0..32u8).step_by(2) {
                    self.put_ldp_q_sp_offset(i, i + 1, CTX_Q_OFFSET as i32 + i as i32 * 16);
                }
                self.put_ldp_x_sp_offset(29, 30, CTX_FP_OFFSET as i32);
                self.put_ldr_x_sp_offset(28, CTX_X_OFFSET + 28 * 8);
                for i in (0..28u8).step_by(2) {
                    self.put_ldp_x_sp_offset(i, i + 1, CTX_X_OFFSET as i32 + i as i32 * 8);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(code: &[u8]) -> Vec<u32> {
        code.chunks(4)
            .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
            .collect()
    }

    #[test]
    fn mov_and_branch_register_forms() {
        let mut w = Arm64Writer::new(0x1000);
        w.put_mov_reg(16, 0);
        w.put_br(16);
        w.put_blr(17);
        w.put_ret();
        assert_eq!(
            words(w.code()),
            vec![0xAA00_03F0, 0xD61F_0200, 0xD63F_0220, 0xD65F_03C0]
        );
    }

    #[test]
    fn mov_imm64_skips_zero_halves() {
        let mut w = Arm64Writer::new(0);
        w.put_mov_imm64(0, 0x0000_0001_0000_BEEF);
        let ws = words(w.code());
        // movz x0, #0xbeef ; movk x0, #1, lsl #32
        assert_eq!(ws[0], 0xD280_0000 | (0xBEEF << 5));
        assert_eq!(ws[1], 0xF280_0000 | (2 << 21) | (1 << 5));
        assert_eq!(ws.len(), 2);
    }

    #[test]
    fn mov_imm64_zero() {
        let mut w = Arm64Writer::new(0);
        w.put_mov_imm64(3, 0);
        assert_eq!(words(w.code()), vec![0xD280_0003]);
    }

    #[test]
    fn stack_pair_offsets_are_scaled() {
        let mut w = Arm64Writer::new(0);
        w.put_stp_x_sp_offset(0, 1, 24);
        w.put_stp_q_sp_offset(0, 1, 272);
        // imm7 = 3 for the x pair, 17 for the q pair
        let ws = words(w.code());
        assert_eq!(ws[0], 0xA900_0000 | (3 << 15) | (1 << 10) | (31 << 5));
        assert_eq!(ws[1], 0xAD00_0000 | (17 << 15) | (1 << 10) | (31 << 5));
    }

    #[test]
    fn direct_branch_encodes_relative_words() {
        let mut w = Arm64Writer::new(0x1000);
        w.put_b(0x2000).unwrap();
        let ws = words(w.code());
        assert_eq!(ws[0], 0x1400_0000 | ((0x1000 >> 2) as u32));
    }

    #[test]
    fn branch_out_of_range_fails() {
        let mut w = Arm64Writer::new(0x1000);
        assert!(w.put_b(0x1000_0000_0000).is_err());
    }

    #[test]
    fn literal_pool_lands_after_code() {
        let mut w = Arm64Writer::new(0x1000);
        w.put_branch_abs(0x1234_5678_9ABC_DEF0);
        let code = w.into_code().unwrap();
        // ldr x16, #8 ; br x16 ; .quad value
        let ws = words(&code[..8]);
        assert_eq!(ws[0], 0x5800_0000 | ((8 >> 2) << 5) | 16);
        assert_eq!(ws[1], 0xD61F_0200);
        assert_eq!(
            u64::from_le_bytes(code[8..16].try_into().unwrap()),
            0x1234_5678_9ABC_DEF0
        );
    }

    #[test]
    fn shared_literal_is_emitted_once() {
        let mut w = Arm64Writer::new(0);
        w.put_ldr_lit(0, 0xAABB);
        w.put_ldr_lit(1, 0xAABB);
        w.put_ret();
        let code = w.into_code().unwrap();
        // 3 instructions + one nop pad + one 8-byte literal
        assert_eq!(code.len(), 3 * 4 + 4 + 8);
    }

    #[test]
    fn forward_label_resolves() {
        let mut w = Arm64Writer::new(0);
        let skip = w.fresh_label();
        w.put_cbz_label(true, false, 3, skip);
        w.put_nop();
        w.put_label(skip);
        w.put_ret();
        w.flush().unwrap();
        let ws = words(w.code());
        // cbz x3, #+8
        assert_eq!(ws[0], 0xB400_0000 | (2 << 5) | 3);
    }

    #[test]
    fn unplaced_label_fails_flush() {
        let mut w = Arm64Writer::new(0);
        let dangling = w.fresh_label();
        w.put_b_label(dangling);
        assert!(matches!(w.flush(), Err(CodegenError::UnresolvedLabel(_))));
    }

    #[test]
    fn full_prologue_starts_with_frame_reservation() {
        let mut w = Arm64Writer::new(0);
        w.put_prologue(PrologueKind::Full);
        let ws = words(w.code());
        assert_eq!(ws[0], 0xD100_03FF | ((CPU_CONTEXT_SIZE as u32) << 10));
        // first pair lands at the x-register block
        assert_eq!(ws[1], 0xA900_0000 | (3 << 15) | (1 << 10) | (31 << 5));
    }
}
