//! Dynamic stack allocation and scope translators (component G, §4.G table):
//! `StackAlloc`, `PushScope`, `PopScope`.
//!
//! Grounded on `source/codegen/opt-system-v-amd64/code/{stack_alloc,scope}.c`.
//! That `stack_alloc.c` loads its alignment operand into a register and
//! computes `max(alignment, 16)` with a runtime `cmp`/`cmovl`, because its IR
//! carries alignment as a value that could in principle vary at runtime; this
//! IR's `Operands::StackAlloc` instead carries `alignment` as a plain `u32`,
//! so the max is just taken in Rust and folded into a single
//! `and rsp, -eff_align` immediate. `scope.c`'s `pop_scope` also
//! carries a commented-out alternate rsp-restoration path and a commented-out
//! alignment `cmovl` dance; neither was ever live, and neither is ported here.

use crate::emit::{AssemblyEmitter, MemOperand, Operand};
use crate::error::{err_invalid_state, CodegenResult};
use crate::ir::{Instruction, Operands, Value};
use crate::reg::{Gpr, Reg, Width};
use crate::select::{acquire_result_register, operand_of, store_from, FunctionCodegen};

fn dynamic_scope_cell(cx: &FunctionCodegen) -> MemOperand {
    MemOperand {
        base: Some(Gpr::Rbp),
        disp: cx.frame.dynamic_scope_offset,
        width: Some(Width::Qword),
        ..Default::default()
    }
}

/// `StackAlloc`: subtract `size` from `rsp`, then align it down to
/// `max(alignment, 16)`. Allocations made outside any `PushScope`/`PopScope`
/// pair first zero the dynamic-scope cell, so an enclosing `PopScope` further
/// up the call chain sees "nothing to unwind" rather than a stale handle.
pub(crate) fn translate_stack_alloc(
    cx: &mut FunctionCodegen,
    emitter: &mut dyn AssemblyEmitter,
    value: Value,
    inst: &Instruction,
) -> CodegenResult<()> {
    let (size, alignment, within_scope) = match inst.operands {
        Operands::StackAlloc { size, alignment, within_scope } => (size, alignment, within_scope),
        _ => return Err(err_invalid_state("expected a StackAlloc operand")),
    };

    if !within_scope {
        let handle = cx.ledger.any_gpr(None, emitter)?;
        let reg = handle.reg();
        emitter.raw("xor", &[Operand::reg64(reg), Operand::reg64(reg)])?;
        emitter.mov_mem_reg(dynamic_scope_cell(cx), reg, Width::Qword)?;
        cx.ledger.release(handle, emitter)?;
    }

    let size_operand = operand_of(cx, size, Width::Qword)?;
    emitter.raw("sub", &[Operand::reg64(Reg::Gpr(Gpr::Rsp)), size_operand])?;

    let eff_align = (alignment.max(16)) as i64;
    emitter.and_imm(Reg::Gpr(Gpr::Rsp), -eff_align)?;

    store_from(cx, emitter, value, Reg::Gpr(Gpr::Rsp), Width::Qword)
}

/// `PushScope`: open a 16-byte stack slot, link it onto the dynamic-scope
/// list (store the current head into the slot, then set the head to the new
/// `rsp`), and hand the new head back as the instruction's own result -- the
/// handle a matching `PopScope` will later consume.
pub(crate) fn translate_push_scope(
    cx: &mut FunctionCodegen,
    emitter: &mut dyn AssemblyEmitter,
    value: Value,
    inst: &Instruction,
) -> CodegenResult<()> {
    match inst.operands {
        Operands::Scope { handle: None } => {}
        _ => return Err(err_invalid_state("expected a handle-less Scope operand for PushScope")),
    }

    emitter.sub_imm(Reg::Gpr(Gpr::Rsp), 16)?;

    let result_alloc = cx.alloc_of(value).clone();
    let handle = acquire_result_register(cx, emitter, &result_alloc, false, None)?;
    let reg = handle.reg();
    // Eviction pushes onto the slot just opened above, shifting its storage
    // up by 8 bytes relative to the (now lower) `rsp`.
    let pad = if handle.evicted() { 8 } else { 0 };

    emitter.mov_reg_mem(reg, dynamic_scope_cell(cx), Width::Qword)?;
    emitter.mov_mem_reg(
        MemOperand { base: Some(Gpr::Rsp), disp: pad, width: Some(Width::Qword), ..Default::default() },
        reg,
        Width::Qword,
    )?;
    cx.ledger.release(handle, emitter)?;

    store_from(cx, emitter, value, Reg::Gpr(Gpr::Rsp), Width::Qword)?;
    emitter.mov_mem_reg(dynamic_scope_cell(cx), Reg::Gpr(Gpr::Rsp), Width::Qword)
}

/// `PopScope`: a no-op unwind if the dynamic-scope head is currently zero
/// (nothing live to restore); otherwise restores `rsp` to the handle's saved
/// value, unlinks by writing the slot's saved previous head back into the
/// scope cell, and releases the 16-byte slot.
pub(crate) fn translate_pop_scope(
    cx: &mut FunctionCodegen,
    emitter: &mut dyn AssemblyEmitter,
    value: Value,
    inst: &Instruction,
) -> CodegenResult<()> {
    let arg = match inst.operands {
        Operands::Scope { handle: Some(arg) } => arg,
        _ => return Err(err_invalid_state("expected a Scope operand with a handle for PopScope")),
    };

    let skip_label = cx.intra_block_label(inst.block, value.index() as u32);
    emitter.raw("cmp", &[Operand::Mem(dynamic_scope_cell(cx)), Operand::Imm(0)])?;
    emitter.jcc("e", &skip_label)?;

    crate::select::load_into(cx, emitter, arg, Reg::Gpr(Gpr::Rsp), Width::Qword)?;

    let arg_alloc = cx.alloc_of(arg).clone();
    let handle = acquire_result_register(cx, emitter, &arg_alloc, false, None)?;
    let reg = handle.reg();
    let pad = if handle.evicted() { 8 } else { 0 };

    emitter.mov_reg_mem(
        reg,
        MemOperand { base: Some(Gpr::Rsp), disp: pad, width: Some(Width::Qword), ..Default::default() },
        Width::Qword,
    )?;
    emitter.mov_mem_reg(dynamic_scope_cell(cx), reg, Width::Qword)?;
    cx.ledger.release(handle, emitter)?;

    emitter.add_imm(Reg::Gpr(Gpr::Rsp), 16)?;
    emitter.emit_label(&skip_label)
}
