//! A32 instruction relocator.
//!
//! Handles the PC-relative forms a compiler emits in function prologues:
//! `b`/`bl` with immediate offsets, `ldr Rt, [pc, #imm]` literal loads, and
//! `add`/`sub Rd, pc, #imm` address computations. Any other use of the PC is
//! unpredictable once moved and is reported as unrelocatable.

use std::collections::VecDeque;

use super::writer::{ArmWriter, REG_IP, REG_PC};
use super::REDIRECT_SIZE;
use crate::{CodegenError, Result};

const COND_AL: u32 = 0xE;

#[derive(Debug, Clone, Copy)]
struct Insn {
    word: u32,
    pc: u64,
}

pub struct ArmRelocator<'a> {
    input: &'a [u8],
    input_base: u64,
    read_offset: usize,
    pending: VecDeque<Insn>,
    eob: bool,
    eoi: bool,
}

impl<'a> ArmRelocator<'a> {
    pub fn new(input: &'a [u8], input_base: u64) -> Self {
        debug_assert!(input_base % 4 == 0);
        Self {
            input,
            input_base,
            read_offset: 0,
            pending: VecDeque::new(),
            eob: false,
            eoi: false,
        }
    }

    pub fn eob(&self) -> bool {
        self.eob
    }

    pub fn eoi(&self) -> bool {
        self.eoi
    }

    pub fn read_one(&mut self) -> Result<usize> {
        let pc = self.input_base + self.read_offset as u64;
        let bytes = self
            .input
            .get(self.read_offset..self.read_offset + 4)
            .ok_or(CodegenError::InvalidInstruction(pc))?;
        let word = u32::from_le_bytes(bytes.try_into().unwrap());

        let cond = word >> 28;
        if is_branch_imm(word) && word & (1 << 24) == 0 {
            // b: unconditional ends the stream, conditional only the block
            self.eob = true;
            self.eoi = cond == COND_AL;
        } else if is_bx_lr(word) || is_mov_pc_lr(word) || is_pop_with_pc(word) || writes_pc_load(word)
        {
            self.eob = true;
            self.eoi = true;
        } else {
            self.eob = false;
        }

        self.read_offset += 4;
        self.pending.push_back(Insn { word, pc });
        Ok(self.read_offset)
    }

    pub fn write_one(&mut self, writer: &mut ArmWriter) -> bool {
        let insn = match self.pending.pop_front() {
            Some(insn) => insn,
            None => return false,
        };
        match self.rewrite(insn, writer) {
            Ok(()) => true,
            Err(err) => {
                tracing::debug!(pc = insn.pc, %err, "instruction not relocatable");
                false
            }
        }
    }

    pub fn write_all(&mut self, writer: &mut ArmWriter) -> bool {
        while !self.pending.is_empty() {
            if !self.write_one(writer) {
                return false;
            }
        }
        true
    }

    fn rewrite(&self, insn: Insn, writer: &mut ArmWriter) -> Result<()> {
        let word = insn.word;
        let cond = word >> 28;
        let reads_pc_8 = insn.pc.wrapping_add(8);

        if is_branch_imm(word) {
            let link = word & (1 << 24) != 0;
            let rel = sign_extend(word & 0x00FF_FFFF, 24) << 2;
            let target = (reads_pc_8 as i64 + rel) as u64;
            let patched = self.input_base..self.input_base + REDIRECT_SIZE as u64;
            if !link && patched.contains(&target) {
                return Err(CodegenError::Unrelocatable(
                    insn.pc,
                    "branch into displaced prologue",
                ));
            }
            if cond == COND_AL {
                if link {
                    writer.put_call_abs(target as u32);
                } else {
                    writer.put_branch_abs(target as u32);
                }
            } else if cond == 0xF {
                return Err(CodegenError::Unrelocatable(insn.pc, "blx immediate"));
            } else {
                // invert the condition over the widened branch
                let skip = writer.fresh_label();
                writer.put_bcond_label((cond ^ 1) as u8, skip);
                if link {
                    writer.put_call_abs(target as u32);
                } else {
                    writer.put_branch_abs(target as u32);
                }
                writer.put_label(skip);
            }
            return Ok(());
        }

        if let Some((rt, ea)) = decode_ldr_pc_imm(word, reads_pc_8) {
            if cond != COND_AL {
                return Err(CodegenError::Unrelocatable(insn.pc, "conditional pc load"));
            }
            if rt == REG_PC {
                // branch through the original literal slot
                writer.put_ldr_lit(REG_IP, ea as u32);
                writer.put_ldr_reg_reg(REG_PC, REG_IP);
            } else {
                writer.put_ldr_lit(rt, ea as u32);
                writer.put_ldr_reg_reg(rt, rt);
            }
            return Ok(());
        }

        if let Some((rd, ea)) = decode_adr(word, reads_pc_8) {
            if cond != COND_AL {
                return Err(CodegenError::Unrelocatable(insn.pc, "conditional adr"));
            }
            writer.put_mov_imm32(rd, ea as u32);
            return Ok(());
        }

        if uses_pc_unpredictably(word) {
            return Err(CodegenError::Unrelocatable(insn.pc, "pc-relative operand"));
        }

        writer.put_bytes(&word.to_le_bytes());
        Ok(())
    }
}

/// Probe how many bytes starting at `input_base` can be relocated.
pub fn can_relocate(input: &[u8], input_base: u64, min_bytes: usize) -> usize {
    let mut relocator = ArmRelocator::new(input, input_base);
    let mut writer = ArmWriter::new(input_base.wrapping_add(0x10_0000) & !3);
    let mut reachable = 0usize;
    loop {
        match relocator.read_one() {
            Ok(total) => {
                if !relocator.write_one(&mut writer) {
                    return reachable;
                }
                reachable = total;
            }
            Err(_) => return reachable,
        }
        if reachable >= min_bytes || relocator.eoi() {
            return reachable;
        }
    }
}

// --- decode helpers -----------------------------------------------------

fn sign_extend(value: u32, bits: u32) -> i64 {
    let shift = 64 - bits;
    ((value as i64) << shift) >> shift
}

fn is_branch_imm(word: u32) -> bool {
    word & 0x0E00_0000 == 0x0A00_0000
}

fn is_bx_lr(word: u32) -> bool {
    word & 0x0FFF_FFFF == 0x012F_FF1E
}

fn is_mov_pc_lr(word: u32) -> bool {
    word & 0x0FFF_FFFF == 0x01A0_F00E
}

fn is_pop_with_pc(word: u32) -> bool {
    word & 0x0FFF_8000 == 0x08BD_8000
}

fn writes_pc_load(word: u32) -> bool {
    // single-word ldr with rd == pc
    word & 0x0C50_F000 == 0x0410_F000
}

/// `ldr Rt, [pc, #±imm]` -> (rt, effective address)
fn decode_ldr_pc_imm(word: u32, pc: u64) -> Option<(u8, u64)> {
    let masked = word & 0x0F7F_0000;
    if masked != 0x059F_0000 && masked != 0x051F_0000 {
        return None;
    }
    let rt = ((word >> 12) & 0xF) as u8;
    let imm = (word & 0xFFF) as u64;
    let ea = if word & (1 << 23) != 0 { pc + imm } else { pc - imm };
    Some((rt, ea))
}

/// `add/sub Rd, pc, #rotimm` -> (rd, effective address)
fn decode_adr(word: u32, pc: u64) -> Option<(u8, u64)> {
    let masked = word & 0x0FFF_0000;
    let add = match masked {
        0x028F_0000 => true,
        0x024F_0000 => false,
        _ => return None,
    };
    let rd = ((word >> 12) & 0xF) as u8;
    let imm12 = word & 0xFFF;
    let rotate = ((imm12 >> 8) * 2) as u32;
    let value = (imm12 & 0xFF).rotate_right(rotate) as u64;
    let ea = if add { pc + value } else { pc - value };
    Some((rd, ea))
}

/// Catches the remaining forms where moving the instruction changes what the
/// PC reads as: pc in a data-processing operand or a load/store base/offset.
fn uses_pc_unpredictably(word: u32) -> bool {
    let class = (word >> 26) & 0x3;
    match class {
        // data processing: rn or rm == pc (rd == pc is a branch-by-alu, also out)
        0b00 => {
            let rn = (word >> 16) & 0xF;
            let rd = (word >> 12) & 0xF;
            let rm_is_pc = word & (1 << 25) == 0 && word & 0xF == 0xF;
            rn == 0xF || rd == 0xF || rm_is_pc
        }
        // loads/stores: pc base was handled above, pc offset is unpredictable
        0b01 => {
            let rn = (word >> 16) & 0xF;
            let rm_is_pc = word & (1 << 25) != 0 && word & 0xF == 0xF;
            rn == 0xF || rm_is_pc
        }
        _ => false,
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

    fn relocate(input_words: &[u32], input_base: u64, output_base: u64) -> Vec<u8> {
        let input: Vec<u8> = input_words.iter().flat_map(|w| w.to_le_bytes()).collect();
        let mut relocator = ArmRelocator::new(&input, input_base);
        let mut writer = ArmWriter::new(output_base);
        for _ in 0..input_words.len() {
            relocator.read_one().unwrap();
            assert!(relocator.write_one(&mut writer));
        }
        writer.into_code().unwrap()
    }

    #[test]
    fn push_and_mov_copy_verbatim() {
        // push {r4, r11, lr} ; mov r4, r0
        let input = [0xE92D_4810, 0xE1A0_4000];
        let out = relocate(&input, 0x1000, 0x9000);
        assert_eq!(words(&out), input);
    }

    #[test]
    fn branch_recomputes_absolute_target() {
        // b #+0x20 at 0x1000: target = 0x1000 + 8 + 0x20 = 0x1028
        let word = 0xEA00_0000 | (0x20 >> 2);
        let out = relocate(&[word], 0x1000, 0x9000);
        let ws = words(&out);
        assert_eq!(ws[0], 0xE51F_F004); // ldr pc, [pc, #-4]
        assert_eq!(u32::from_le_bytes(out[4..8].try_into().unwrap()), 0x1028);
    }

    #[test]
    fn bl_links_and_reaches_target() {
        let word = 0xEB00_0000 | (0x40 >> 2);
        let out = relocate(&[word], 0x1000, 0x9000);
        let ws = words(&out);
        assert_eq!(ws[0], 0xE1A0_E00F); // mov lr, pc
        assert_eq!(ws[1], 0xE51F_F004); // ldr pc, =0x1048
        assert_eq!(u32::from_le_bytes(out[8..12].try_into().unwrap()), 0x1048);
    }

    #[test]
    fn pc_literal_load_goes_through_pool() {
        // ldr r3, [pc, #0x10]: literal at 0x1000 + 8 + 0x10
        let word = 0xE59F_3010;
        let out = relocate(&[word], 0x1000, 0x9000);
        let ws = words(&out);
        // ldr r3, =0x1018 ; ldr r3, [r3]
        assert_eq!(ws[0] & 0xFFFF_F000, 0xE59F_3000);
        assert_eq!(ws[1], 0xE593_3000);
        assert_eq!(u32::from_le_bytes(out[8..12].try_into().unwrap()), 0x1018);
    }

    #[test]
    fn adr_becomes_movw_movt() {
        // add r2, pc, #0x10
        let word = 0xE28F_2010;
        let out = relocate(&[word], 0x1000, 0x9000);
        let ws = words(&out);
        // movw r2, #0x1018 (high half zero, movt omitted)
        assert_eq!(ws[0], 0xE300_0000 | (0x1 << 16) | (2 << 12) | 0x018);
        assert_eq!(ws.len(), 1);
    }

    #[test]
    fn conditional_branch_inverts_over_widened_form() {
        // beq #+0x10 at 0x1000 -> target 0x1018
        let word = 0x0A00_0000 | (0x10 >> 2);
        let out = relocate(&[word], 0x1000, 0x9000);
        let ws = words(&out);
        // bne over the ldr pc form
        assert_eq!(ws[0] >> 28, 0x1);
        assert_eq!(ws[1], 0xE51F_F004);
        assert_eq!(u32::from_le_bytes(out[8..12].try_into().unwrap()), 0x1018);
    }

    #[test]
    fn data_processing_on_pc_is_rejected() {
        // mov r0, pc
        let input: Vec<u8> = 0xE1A0_000Fu32.to_le_bytes().to_vec();
        let mut relocator = ArmRelocator::new(&input, 0x1000);
        let mut writer = ArmWriter::new(0x9000);
        relocator.read_one().unwrap();
        assert!(!relocator.write_one(&mut writer));
    }

    #[test]
    fn can_relocate_stops_at_bx_lr() {
        let input: Vec<u8> = 0xE12F_FF1Eu32.to_le_bytes().to_vec();
        assert_eq!(can_relocate(&input, 0x1000, 8), 4);
    }
}
