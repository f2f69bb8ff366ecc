//! x86-64 trampoline backend.
//!
//! The entry and leave trampolines share one shape: save the full CPU
//! context on the stack, hand `(record, context)` to the runtime, stash the
//! returned next-hop address in the context's `rip` slot, restore the
//! (possibly mutated) context and `ret` through the slot. The stacked
//! context doubles as the dispatch frame the runtime and listeners see.

use std::sync::atomic::{fence, Ordering};

use divert_arch::x86::{
    self, PrologueKind, Reg, X86Relocator, X86Writer, CTX_RIP_OFFSET,
};

use crate::alloc::{CodeAllocator, NearSpec};
use crate::error::HookError;
use crate::interceptor::{divert_begin_invocation, divert_end_invocation, FunctionRecord};

pub(crate) const REDIRECT_SIZE: usize = x86::REDIRECT_SIZE;

/// Lookahead window when probing a prologue.
const PROLOGUE_PEEK: usize = 32;

pub(crate) fn can_relocate_target(address: usize) -> usize {
    let input = unsafe { std::slice::from_raw_parts(address as *const u8, PROLOGUE_PEEK) };
    x86::can_relocate(64, input, address as u64, REDIRECT_SIZE)
}

pub(crate) fn create_trampoline(
    record: &mut FunctionRecord,
    allocator: &CodeAllocator,
) -> Result<(), HookError> {
    let target = record.function_address;
    let slice = allocator.alloc_slice(Some(NearSpec {
        near: target,
        range: x86::NEAR_RANGE,
    }))?;
    let base = slice.address() as u64;
    let mut writer = X86Writer::new(base);

    let on_enter_offset = writer.len();
    emit_invocation_stub(
        &mut writer,
        record as *const FunctionRecord as u64,
        divert_begin_invocation as usize as u64,
    );

    let on_leave_offset = writer.len();
    emit_invocation_stub(
        &mut writer,
        record as *const FunctionRecord as u64,
        divert_end_invocation as usize as u64,
    );

    // relocated prologue, falling through to the rest of the function
    let on_invoke_offset = writer.len();
    let input = unsafe { std::slice::from_raw_parts(target as *const u8, PROLOGUE_PEEK) };
    let mut relocator = X86Relocator::new(64, input, target as u64);
    let mut displaced;
    loop {
        displaced = relocator.read_one()?;
        if displaced >= REDIRECT_SIZE || relocator.eoi() {
            break;
        }
    }
    if displaced < REDIRECT_SIZE {
        return Err(HookError::Unsupportable(target, "function ends before the redirect fits"));
    }
    if !relocator.write_all(&mut writer) {
        return Err(HookError::Unsupportable(target, "prologue not relocatable"));
    }
    if !relocator.eoi() {
        writer.put_jmp_abs((target + displaced) as u64);
    }

    let code = writer.into_code()?;
    if code.len() > slice.len() {
        return Err(HookError::TrampolineTooLarge(code.len(), slice.len()));
    }
    unsafe {
        std::ptr::copy_nonoverlapping(code.as_ptr(), slice.as_mut_ptr(), code.len());
    }

    record.overwritten_prologue[..displaced].copy_from_slice(&input[..displaced]);
    record.overwritten_prologue_len = displaced;
    record.on_enter_trampoline = (base as usize + on_enter_offset) as *const u8;
    record.on_leave_trampoline = (base as usize + on_leave_offset) as *const u8;
    record.on_invoke_trampoline = (base as usize + on_invoke_offset) as *const u8;

    // redirector: jmp rel32 into the entry trampoline, nop-filled
    let rel = (base as i64 + on_enter_offset as i64) - (target as i64 + 5);
    let rel = i32::try_from(rel).map_err(|_| HookError::OutOfNearCodeSpace(target))?;
    record.redirect_code[0] = 0xE9;
    record.redirect_code[1..5].copy_from_slice(&rel.to_le_bytes());
    record.redirect_code[5..displaced].fill(0x90);
    record.redirect_len = displaced;

    record.trampoline_slice = Some(slice);
    Ok(())
}

fn emit_invocation_stub(writer: &mut X86Writer, record: u64, handler: u64) {
    writer.put_prologue(PrologueKind::Full);

    // handler(record, context)
    #[cfg(not(windows))]
    {
        writer.put_mov_reg_u64(Reg::Rdi, record);
        writer.put_mov_reg_reg(Reg::Rsi, Reg::Rsp);
    }
    #[cfg(windows)]
    {
        writer.put_mov_reg_u64(Reg::Rcx, record);
        writer.put_mov_reg_reg(Reg::Rdx, Reg::Rsp);
    }

    writer.put_mov_reg_reg(Reg::Rbp, Reg::Rsp);
    writer.put_and_rsp_i8(-16);
    #[cfg(windows)]
    writer.put_sub_rsp(32); // shadow space
    writer.put_mov_reg_u64(Reg::Rax, handler);
    writer.put_call_reg(Reg::Rax);
    writer.put_mov_reg_reg(Reg::Rsp, Reg::Rbp);

    // the returned next hop rides in the context's rip slot
    writer.put_mov_rsp_offset_reg(CTX_RIP_OFFSET, Reg::Rax);
    writer.put_epilogue(PrologueKind::Full);
    writer.put_add_rsp(8); // skip the rsp slot
    writer.put_ret(); // pops the next hop
}

pub(crate) fn activate(record: &FunctionRecord, prologue: *mut u8, live: bool) {
    write_prologue_bytes(
        prologue,
        &record.redirect_code[..record.redirect_len],
        live,
    );
}

pub(crate) fn deactivate(record: &FunctionRecord, prologue: *mut u8, live: bool) {
    write_prologue_bytes(
        prologue,
        &record.overwritten_prologue[..record.overwritten_prologue_len],
        live,
    );
}

/// Publish new prologue bytes.
///
/// A 5-byte branch is not fetched atomically, so the live path parks a trap
/// on the first byte, writes the tail, and only then installs the real first
/// byte. A thread fetching mid-patch sees either old bytes, the trap, or the
/// finished sequence, never a torn branch.
fn write_prologue_bytes(dst: *mut u8, code: &[u8], live: bool) {
    unsafe {
        if !live {
            std::ptr::copy_nonoverlapping(code.as_ptr(), dst, code.len());
            return;
        }
        let _guard = crate::trap::begin_patch(dst as usize, code.len());
        std::ptr::write_volatile(dst, 0xCC);
        fence(Ordering::SeqCst);
        for (i, &byte) in code.iter().enumerate().skip(1) {
            std::ptr::write_volatile(dst.add(i), byte);
        }
        fence(Ordering::SeqCst);
        std::ptr::write_volatile(dst, code[0]);
    }
}

/// Follow a redirect already present at `address`, ours or foreign.
pub(crate) fn resolve_redirect(address: usize) -> Option<usize> {
    let bytes = unsafe { std::slice::from_raw_parts(address as *const u8, 14) };
    match bytes[0] {
        0xE9 => {
            let rel = i32::from_le_bytes(bytes[1..5].try_into().unwrap());
            Some((address + 5).wrapping_add_signed(rel as isize))
        }
        0xEB => {
            let rel = bytes[1] as i8;
            Some((address + 2).wrapping_add_signed(rel as isize))
        }
        0xFF if bytes[1] == 0x25 => {
            let disp = i32::from_le_bytes(bytes[2..6].try_into().unwrap());
            let slot = (address + 6).wrapping_add_signed(disp as isize);
            Some(unsafe { *(slot as *const usize) })
        }
        _ => None,
    }
}
