//! aarch64 trampoline backend.
//!
//! Same protocol as the x86-64 backend, adapted to a link-register ABI: the
//! caller return address lives in `x30` rather than on the stack, and the
//! redirector is a single `b` that publishes with one aligned word store.

use divert_arch::arm64::{
    self, Arm64Relocator, Arm64Writer, PrologueKind, CPU_CONTEXT_SIZE, CTX_PC_OFFSET, SCRATCH_REG,
};

use crate::alloc::{CodeAllocator, NearSpec};
use crate::error::HookError;
use crate::interceptor::{divert_begin_invocation, divert_end_invocation, FunctionRecord};
use crate::segment;

pub(crate) const REDIRECT_SIZE: usize = arm64::REDIRECT_SIZE;

const PROLOGUE_PEEK: usize = 32;

pub(crate) fn can_relocate_target(address: usize) -> usize {
    if address % 4 != 0 {
        return 0;
    }
    let input = unsafe { std::slice::from_raw_parts(address as *const u8, PROLOGUE_PEEK) };
    arm64::can_relocate(input, address as u64, REDIRECT_SIZE)
}

pub(crate) fn create_trampoline(
    record: &mut FunctionRecord,
    allocator: &CodeAllocator,
) -> Result<(), HookError> {
    let target = record.function_address;
    let slice = allocator.alloc_slice(Some(NearSpec {
        near: target,
        range: arm64::NEAR_RANGE,
    }))?;
    let base = slice.address() as u64;
    let mut writer = Arm64Writer::new(base);

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

    let on_invoke_offset = writer.len();
    let input = unsafe { std::slice::from_raw_parts(target as *const u8, PROLOGUE_PEEK) };
    let mut relocator = Arm64Relocator::new(input, target as u64);
    let mut displaced;
    loop {
        displaced = relocator.read_one()?;
        if displaced >= REDIRECT_SIZE || relocator.eoi() {
            break;
        }
    }
    if !relocator.write_all(&mut writer) {
        return Err(HookError::Unsupportable(target, "prologue not relocatable"));
    }
    if !relocator.eoi() {
        let resume = (target + displaced) as u64;
        if writer.put_b(resume).is_err() {
            writer.put_branch_abs(resume);
        }
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

    // redirector: one b instruction; the allocator kept the slice in range
    let enter = base as i64 + on_enter_offset as i64;
    let rel = (enter - target as i64) >> 2;
    if !(-(1 << 25)..1 << 25).contains(&rel) {
        return Err(HookError::OutOfNearCodeSpace(target));
    }
    let word = 0x1400_0000u32 | ((rel as u32) & 0x03FF_FFFF);
    record.redirect_code[..4].copy_from_slice(&word.to_le_bytes());
    record.redirect_len = 4;

    record.trampoline_slice = Some(slice);
    Ok(())
}

fn emit_invocation_stub(writer: &mut Arm64Writer, record: u64, handler: u64) {
    writer.put_prologue(PrologueKind::Full);

    // handler(record, context)
    writer.put_mov_imm64(0, record);
    writer.put_add_reg_sp_imm(1, 0);
    writer.put_mov_imm64(SCRATCH_REG, handler);
    writer.put_blr(SCRATCH_REG);

    // next hop rides in the context's pc slot across the register restore
    writer.put_str_x_sp_offset(0, CTX_PC_OFFSET);
    writer.put_epilogue(PrologueKind::Full);
    writer.put_ldr_x_sp_offset(SCRATCH_REG, CTX_PC_OFFSET);
    writer.put_add_sp_imm(CPU_CONTEXT_SIZE as u32);
    writer.put_br(SCRATCH_REG);
}

pub(crate) fn activate(record: &FunctionRecord, prologue: *mut u8, live: bool) {
    write_redirect_word(prologue, &record.redirect_code[..4], live);
}

pub(crate) fn deactivate(record: &FunctionRecord, prologue: *mut u8, live: bool) {
    write_redirect_word(prologue, &record.overwritten_prologue[..4], live);
}

/// A 4-byte aligned word store is atomic with respect to instruction fetch;
/// the icache flush issues the required barriers.
fn write_redirect_word(dst: *mut u8, code: &[u8], live: bool) {
    let word = u32::from_le_bytes(code.try_into().expect("redirect word"));
    unsafe {
        std::ptr::write_volatile(dst as *mut u32, word);
    }
    if live {
        segment::flush_icache(dst, 4);
    }
}

/// Follow a redirect already present at `address`.
pub(crate) fn resolve_redirect(address: usize) -> Option<usize> {
    if address % 4 != 0 {
        return None;
    }
    let word = unsafe { *(address as *const u32) };
    // b imm26, not bl
    if word & 0xFC00_0000 == 0x1400_0000 {
        let rel = (((word & 0x03FF_FFFF) as i64) << 38) >> 36;
        return Some((address as i64 + rel) as usize);
    }
    None
}
