//! x86 / x86-64 instruction relocator.
//!
//! Decodes instructions with iced-x86 and re-emits them at a new address.
//! Position-independent instructions are copied verbatim; near branches are
//! widened to absolute forms; RIP-relative memory operands are re-displaced
//! when the new location is in range, or materialised through the destination
//! register when it is not.

use std::collections::VecDeque;

use iced_x86::{Decoder, DecoderOptions, FlowControl, Instruction, Mnemonic, OpKind, Register};

use super::writer::{Reg, X86Writer};
use super::REDIRECT_SIZE;
use crate::{CodegenError, Result};

pub struct X86Relocator<'a> {
    bitness: u32,
    input: &'a [u8],
    input_base: u64,
    read_offset: usize,
    pending: VecDeque<Instruction>,
    eob: bool,
    eoi: bool,
}

impl<'a> X86Relocator<'a> {
    /// `input` holds the bytes at virtual address `input_base`. `bitness` is
    /// 32 or 64.
    pub fn new(bitness: u32, input: &'a [u8], input_base: u64) -> Self {
        debug_assert!(bitness == 32 || bitness == 64);
        Self {
            bitness,
            input,
            input_base,
            read_offset: 0,
            pending: VecDeque::new(),
            eob: false,
            eoi: false,
        }
    }

    /// "End of basic block": the last instruction read was a branch.
    pub fn eob(&self) -> bool {
        self.eob
    }

    /// "End of instructions": nothing meaningful can follow what was read.
    pub fn eoi(&self) -> bool {
        self.eoi
    }

    /// Decode one instruction at the read cursor. Returns the total number of
    /// bytes consumed so far.
    pub fn read_one(&mut self) -> Result<usize> {
        let ip = self.input_base + self.read_offset as u64;
        let mut decoder = Decoder::with_ip(
            self.bitness,
            &self.input[self.read_offset..],
            ip,
            DecoderOptions::NONE,
        );
        let insn = decoder.decode();
        if insn.is_invalid() {
            return Err(CodegenError::InvalidInstruction(ip));
        }

        match insn.flow_control() {
            FlowControl::ConditionalBranch => {
                self.eob = true;
                self.eoi = false;
            }
            FlowControl::UnconditionalBranch
            | FlowControl::IndirectBranch
            | FlowControl::Return => {
                self.eob = true;
                self.eoi = true;
            }
            _ => {
                self.eob = false;
            }
        }

        self.read_offset += insn.len();
        self.pending.push_back(insn);
        Ok(self.read_offset)
    }

    /// Emit the oldest not-yet-written instruction through `writer`,
    /// rewriting anything whose semantics depend on its original address.
    /// Returns `false` when the instruction has no safe relocation.
    pub fn write_one(&mut self, writer: &mut X86Writer) -> bool {
        let insn = match self.pending.pop_front() {
            Some(insn) => insn,
            None => return false,
        };
        match self.rewrite(&insn, writer) {
            Ok(()) => true,
            Err(err) => {
                tracing::debug!(ip = insn.ip(), %err, "instruction not relocatable");
                false
            }
        }
    }

    /// Drain every pending instruction through `writer`.
    pub fn write_all(&mut self, writer: &mut X86Writer) -> bool {
        while !self.pending.is_empty() {
            if !self.write_one(writer) {
                return false;
            }
        }
        true
    }

    fn raw_bytes(&self, insn: &Instruction) -> &[u8] {
        let start = (insn.ip() - self.input_base) as usize;
        &self.input[start..start + insn.len()]
    }

    fn rewrite(&self, insn: &Instruction, writer: &mut X86Writer) -> Result<()> {
        match insn.mnemonic() {
            // Short-range-only loops cannot be widened
            Mnemonic::Loop
            | Mnemonic::Loope
            | Mnemonic::Loopne
            | Mnemonic::Jcxz
            | Mnemonic::Jecxz
            | Mnemonic::Jrcxz => {
                return Err(CodegenError::Unrelocatable(insn.ip(), "short-only branch"));
            }
            _ => {}
        }

        if insn.is_ip_rel_memory_operand() {
            return self.rewrite_ip_relative(insn, writer);
        }

        match insn.flow_control() {
            FlowControl::UnconditionalBranch if self.is_near_branch(insn) => {
                let target = insn.near_branch_target();
                self.check_not_internal(insn, target)?;
                if self.bitness == 64 {
                    writer.put_jmp_abs(target);
                } else {
                    writer.put_push_imm32(target as u32 as i32);
                    writer.put_ret();
                }
                Ok(())
            }
            FlowControl::ConditionalBranch if self.is_near_branch(insn) => {
                let target = insn.near_branch_target();
                self.check_not_internal(insn, target)?;
                let cc = condition_nibble(insn)?;
                if self.bitness == 64 {
                    writer.put_jcc_abs(cc, target);
                    writer.flush()?;
                } else {
                    let rel = (target as u32).wrapping_sub(writer.pc() as u32 + 6) as i32;
                    writer.put_bytes(&[0x0F, 0x80 + cc]);
                    writer.put_bytes(&rel.to_le_bytes());
                }
                Ok(())
            }
            FlowControl::Call if self.is_near_branch(insn) => {
                let target = insn.near_branch_target();
                if self.bitness == 64 {
                    writer.put_call_abs(target);
                } else {
                    let rel = (target as u32).wrapping_sub(writer.pc() as u32 + 5) as i32;
                    writer.put_bytes(&[0xE8]);
                    writer.put_bytes(&rel.to_le_bytes());
                }
                Ok(())
            }
            FlowControl::XbeginXabortXend => {
                Err(CodegenError::Unrelocatable(insn.ip(), "transactional branch"))
            }
            // Indirect transfers through registers, returns and everything
            // else without a PC dependence keep their original bytes.
            _ => {
                writer.put_bytes(self.raw_bytes(insn));
                Ok(())
            }
        }
    }

    fn is_near_branch(&self, insn: &Instruction) -> bool {
        matches!(
            insn.op0_kind(),
            OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64
        )
    }

    /// Branch targets inside the region the redirector overwrites would land
    /// on patched bytes.
    fn check_not_internal(&self, insn: &Instruction, target: u64) -> Result<()> {
        let patched = self.input_base..self.input_base + REDIRECT_SIZE as u64;
        if patched.contains(&target) {
            return Err(CodegenError::Unrelocatable(
                insn.ip(),
                "branch into displaced prologue",
            ));
        }
        Ok(())
    }

    fn rewrite_ip_relative(&self, insn: &Instruction, writer: &mut X86Writer) -> Result<()> {
        let target = insn.ip_rel_memory_address();

        // Re-encoding at the new IP recomputes the displacement; this covers
        // every RIP-relative form as long as the target stays in rel32 range.
        let mut encoder = iced_x86::Encoder::new(self.bitness);
        if encoder.encode(insn, writer.pc()).is_ok() {
            writer.put_bytes(&encoder.take_buffer());
            return Ok(());
        }

        // Too far for a displacement. Loads and address materialisations can
        // go through the destination register instead.
        let dst = match insn.op0_kind() {
            OpKind::Register => reg_from_iced(insn.op0_register()),
            _ => None,
        };
        let dst = dst.ok_or(CodegenError::Unrelocatable(
            insn.ip(),
            "rip-relative operand out of range",
        ))?;

        match insn.mnemonic() {
            Mnemonic::Lea => {
                writer.put_mov_reg_u64(dst, target);
                Ok(())
            }
            Mnemonic::Mov if insn.op1_kind() == OpKind::Memory => {
                let size = match insn.memory_size().size() {
                    8 => 8,
                    4 => 4,
                    _ => {
                        return Err(CodegenError::Unrelocatable(
                            insn.ip(),
                            "unsupported rip-relative load width",
                        ))
                    }
                };
                writer.put_mov_reg_u64(dst, target);
                writer.put_mov_reg_mem(dst, dst, size);
                Ok(())
            }
            _ => Err(CodegenError::Unrelocatable(
                insn.ip(),
                "rip-relative operand out of range",
            )),
        }
    }
}

/// Probe how many bytes starting at `input_base` can be relocated. A target
/// is hookable iff the result is at least the redirect size.
pub fn can_relocate(bitness: u32, input: &[u8], input_base: u64, min_bytes: usize) -> usize {
    let mut relocator = X86Relocator::new(bitness, input, input_base);
    // A plausible nearby trampoline address for the dry run
    let mut writer = X86Writer::new(input_base.wrapping_add(0x10_0000));
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

fn condition_nibble(insn: &Instruction) -> Result<u8> {
    let cc = insn.condition_code() as u8;
    if cc == 0 {
        return Err(CodegenError::Unrelocatable(insn.ip(), "not a jcc"));
    }
    Ok(cc - 1)
}

fn reg_from_iced(reg: Register) -> Option<Reg> {
    let full = reg.full_register();
    let base = Register::RAX as u32;
    let idx = (full as u32).checked_sub(base)?;
    if idx < 16 {
        Reg::from_index(idx as u8)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn relocate(input: &[u8], input_base: u64, output_base: u64) -> Vec<u8> {
        let mut relocator = X86Relocator::new(64, input, input_base);
        let mut writer = X86Writer::new(output_base);
        let mut consumed = 0;
        while consumed < input.len() {
            consumed = relocator.read_one().unwrap();
            assert!(relocator.write_one(&mut writer));
            if relocator.eoi() {
                break;
            }
        }
        writer.into_code().unwrap()
    }

    fn decode_at(code: &[u8], ip: u64) -> Vec<Instruction> {
        let mut decoder = Decoder::with_ip(64, code, ip, DecoderOptions::NONE);
        let mut out = Vec::new();
        while decoder.can_decode() {
            out.push(decoder.decode());
        }
        out
    }

    #[test]
    fn position_independent_bytes_copy_verbatim() {
        // mov rax, rbx ; ret
        let input = [0x48, 0x89, 0xD8, 0xC3];
        let out = relocate(&input, 0x1000, 0x9000);
        assert_eq!(out, input);
    }

    #[test]
    fn call_rel32_becomes_absolute() {
        // call 0x3000 (from 0x1000)
        let rel = (0x3000u32 - 0x1005) as i32;
        let mut input = vec![0xE8];
        input.extend_from_slice(&rel.to_le_bytes());
        input.push(0xC3);

        let out = relocate(&input, 0x1000, 0x7FFF_0000);
        assert_eq!(&out[..6], &[0xFF, 0x15, 0x02, 0x00, 0x00, 0x00]);
        assert_eq!(&out[6..8], &[0xEB, 0x08]);
        assert_eq!(u64::from_le_bytes(out[8..16].try_into().unwrap()), 0x3000);
        assert_eq!(out[16], 0xC3);
    }

    #[test]
    fn jmp_rel32_becomes_absolute() {
        let rel = (0x4000u32 - 0x1005) as i32;
        let mut input = vec![0xE9];
        input.extend_from_slice(&rel.to_le_bytes());

        let out = relocate(&input, 0x1000, 0x9000);
        assert_eq!(&out[..6], &[0xFF, 0x25, 0x00, 0x00, 0x00, 0x00]);
        assert_eq!(u64::from_le_bytes(out[6..14].try_into().unwrap()), 0x4000);
    }

    #[test]
    fn short_jcc_is_widened_to_absolute() {
        // je +0x20 (short), then ret
        let input = [0x74, 0x20, 0xC3];
        let mut relocator = X86Relocator::new(64, &input, 0x1000);
        let mut writer = X86Writer::new(0x9000);
        relocator.read_one().unwrap();
        assert!(relocator.eob());
        assert!(!relocator.eoi());
        assert!(relocator.write_one(&mut writer));
        writer.flush().unwrap();

        let insns = decode_at(writer.code(), 0x9000);
        // inverted jne over an absolute jmp to 0x1022
        assert_eq!(insns[0].mnemonic(), Mnemonic::Jne);
        assert_eq!(insns[0].near_branch_target(), insns[1].next_ip() + 8);
        assert_eq!(insns[1].mnemonic(), Mnemonic::Jmp);
        let target_at = (insns[1].next_ip() - 0x9000) as usize;
        assert_eq!(
            u64::from_le_bytes(writer.code()[target_at..target_at + 8].try_into().unwrap()),
            0x1022
        );
    }

    #[test]
    fn rip_relative_load_is_redisplaced_in_range() {
        // mov rax, [rip+0x10] at 0x1000 -> absolute 0x1017
        let input = [0x48, 0x8B, 0x05, 0x10, 0x00, 0x00, 0x00];
        let out = relocate(&input, 0x1000, 0x2000);
        let insns = decode_at(&out, 0x2000);
        assert_eq!(insns[0].mnemonic(), Mnemonic::Mov);
        assert!(insns[0].is_ip_rel_memory_operand());
        assert_eq!(insns[0].ip_rel_memory_address(), 0x1017);
    }

    #[test]
    fn rip_relative_load_out_of_range_goes_through_register() {
        let input = [0x48, 0x8B, 0x05, 0x10, 0x00, 0x00, 0x00];
        let out = relocate(&input, 0x1000, 0x7000_0000_0000);
        // movabs rax, 0x1017 ; mov rax, [rax]
        assert_eq!(&out[..2], &[0x48, 0xB8]);
        assert_eq!(u64::from_le_bytes(out[2..10].try_into().unwrap()), 0x1017);
        assert_eq!(&out[10..], &[0x48, 0x8B, 0x00]);
    }

    #[test]
    fn lea_rip_relative_out_of_range_becomes_movabs() {
        // lea rax, [rip+0x20]
        let input = [0x48, 0x8D, 0x05, 0x20, 0x00, 0x00, 0x00];
        let out = relocate(&input, 0x1000, 0x7000_0000_0000);
        assert_eq!(&out[..2], &[0x48, 0xB8]);
        assert_eq!(u64::from_le_bytes(out[2..10].try_into().unwrap()), 0x1027);
    }

    #[test]
    fn branch_into_displaced_prologue_is_rejected() {
        // jmp short to input_base+2, inside the redirect region
        let input = [0xEB, 0x00, 0x90, 0x90, 0x90];
        let mut relocator = X86Relocator::new(64, &input, 0x1000);
        let mut writer = X86Writer::new(0x9000);
        relocator.read_one().unwrap();
        assert!(!relocator.write_one(&mut writer));
    }

    #[test]
    fn loop_is_rejected() {
        let input = [0xE2, 0xFE]; // loop $
        let mut relocator = X86Relocator::new(64, &input, 0x1000);
        let mut writer = X86Writer::new(0x9000);
        relocator.read_one().unwrap();
        assert!(!relocator.write_one(&mut writer));
    }

    #[test]
    fn can_relocate_stops_at_early_return() {
        // xor eax, eax ; ret -- only 3 bytes before the function ends
        let input = [0x31, 0xC0, 0xC3, 0x90, 0x90];
        assert_eq!(can_relocate(64, &input, 0x1000, REDIRECT_SIZE), 3);
    }

    #[test]
    fn can_relocate_reports_enough_for_typical_prologue() {
        // push rbp ; mov rbp, rsp ; sub rsp, 0x20
        let input = [0x55, 0x48, 0x89, 0xE5, 0x48, 0x83, 0xEC, 0x20];
        assert!(can_relocate(64, &input, 0x1000, REDIRECT_SIZE) >= REDIRECT_SIZE);
    }

    #[test]
    fn thirty_two_bit_jmp_uses_push_ret() {
        let rel = (0x4000u32).wrapping_sub(0x1005) as i32;
        let mut input = vec![0xE9];
        input.extend_from_slice(&rel.to_le_bytes());

        let mut relocator = X86Relocator::new(32, &input, 0x1000);
        let mut writer = X86Writer::new(0x9000);
        relocator.read_one().unwrap();
        assert!(relocator.write_one(&mut writer));
        let code = writer.into_code().unwrap();
        assert_eq!(code[0], 0x68); // push imm32
        assert_eq!(i32::from_le_bytes(code[1..5].try_into().unwrap()), 0x4000);
        assert_eq!(code[5], 0xC3);
    }
}
