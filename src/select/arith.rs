//! Integer arithmetic, shifts, division/modulo, comparisons, and boolean
//! combinators (§4.G table rows for `IntAdd/Sub/Mul/And/Or/Xor`,
//! `IntLShift/RShift/ARShift`, `IntDiv/UDiv/Mod/UMod`,
//! `IntEq/Greater/Lesser/Above/Below`, `BoolAnd/BoolOr`).
//!
//! Grounded on `source/codegen/opt-system-v-amd64/code/{binary_op,bitshift,
//! div_mod,comparison}.c`.

use crate::emit::{AssemblyEmitter, Operand};
use crate::error::{err_invalid_state, CodegenResult};
use crate::ir::{Instruction, Operands, Opcode, Value};
use crate::reg::{Gpr, Reg, Width};
use crate::select::{acquire_result_register, finish_result, load_into, operand_of, FunctionCodegen};

fn binary_operands(inst: &Instruction) -> CodegenResult<(Value, Value)> {
    match inst.operands {
        Operands::Binary(a, b) => Ok((a, b)),
        _ => Err(err_invalid_state("expected a binary operand pair")),
    }
}

fn reject_float_arg2(cx: &FunctionCodegen, arg2: Value) -> CodegenResult<()> {
    if cx.alloc_of(arg2).as_register().map(|r| r.is_float()).unwrap_or(false) {
        return Err(err_invalid_state(
            "floating-point allocation is not valid as the second argument of an integral operation",
        ));
    }
    Ok(())
}

/// `IntAdd/Sub/Mul/And/Or/Xor`: result into a borrowed GPR initialised from
/// arg1, second argument supplied directly (register or memory).
pub(crate) fn translate_binary(
    cx: &mut FunctionCodegen,
    emitter: &mut dyn AssemblyEmitter,
    value: Value,
    inst: &Instruction,
) -> CodegenResult<()> {
    let (arg1, arg2) = binary_operands(inst)?;
    reject_float_arg2(cx, arg2)?;

    let result_alloc = cx.alloc_of(value).clone();
    let avoid = cx.alloc_of(arg2).as_register();
    let handle = acquire_result_register(cx, emitter, &result_alloc, false, avoid)?;
    let result_reg = handle.reg();

    load_into(cx, emitter, arg1, result_reg, Width::Qword)?;
    let rhs = operand_of(cx, arg2, Width::Qword)?;

    let mnemonic = match inst.opcode {
        Opcode::IntAdd => "add",
        Opcode::IntSub => "sub",
        Opcode::IntMul => "imul",
        Opcode::IntAnd => "and",
        Opcode::IntOr => "or",
        Opcode::IntXor => "xor",
        _ => return Err(err_invalid_state("unexpected opcode reached translate_binary")),
    };
    emitter.binop(mnemonic, result_reg, rhs)?;

    finish_result(cx, emitter, value, &handle, Width::Qword)?;
    cx.ledger.release(handle, emitter)
}

/// `IntLShift/RShift/ARShift`: the shift count must occupy `RCX`; the result
/// register is obtained excluding `RCX`; arg1 is loaded into the result
/// register first.
pub(crate) fn translate_shift(
    cx: &mut FunctionCodegen,
    emitter: &mut dyn AssemblyEmitter,
    value: Value,
    inst: &Instruction,
) -> CodegenResult<()> {
    let (arg1, count) = binary_operands(inst)?;
    reject_float_arg2(cx, count)?;

    let rcx = Reg::Gpr(Gpr::Rcx);
    let count_handle = cx.ledger.specific(rcx, emitter)?;
    load_into(cx, emitter, count, rcx, Width::Qword)?;

    let result_alloc = cx.alloc_of(value).clone();
    let handle = acquire_result_register(cx, emitter, &result_alloc, false, Some(rcx))?;
    let result_reg = handle.reg();
    load_into(cx, emitter, arg1, result_reg, Width::Qword)?;

    let mnemonic = match inst.opcode {
        Opcode::IntLShift => "shl",
        Opcode::IntRShift => "shr",
        Opcode::IntARShift => "sar",
        _ => return Err(err_invalid_state("unexpected opcode reached translate_shift")),
    };
    emitter.shift(mnemonic, result_reg)?;

    cx.ledger.release(count_handle, emitter)?;
    finish_result(cx, emitter, value, &handle, Width::Qword)?;
    cx.ledger.release(handle, emitter)
}

/// `IntDiv/UDiv/Mod/UMod`: `RAX` holds the dividend, `RDX` is cleared
/// (unsigned) or sign-extended via `cqo` (signed); the divisor is arg2
/// (register or memory); result is `RAX` for div, `RDX` for mod.
pub(crate) fn translate_div_mod(
    cx: &mut FunctionCodegen,
    emitter: &mut dyn AssemblyEmitter,
    value: Value,
    inst: &Instruction,
) -> CodegenResult<()> {
    let (arg1, arg2) = binary_operands(inst)?;
    reject_float_arg2(cx, arg2)?;

    let rax = Reg::Gpr(Gpr::Rax);
    let rdx = Reg::Gpr(Gpr::Rdx);
    let quotient = cx.ledger.specific(rax, emitter)?;
    let remainder = cx.ledger.specific(rdx, emitter)?;

    load_into(cx, emitter, arg1, rax, Width::Qword)?;
    let divisor = operand_of(cx, arg2, Width::Qword)?;

    let result_reg = match inst.opcode {
        Opcode::IntDiv => {
            emitter.cqo()?;
            emitter.unary("idiv", divisor)?;
            rax
        }
        Opcode::IntUDiv => {
            emitter.raw("xor", &[Operand::reg64(rdx), Operand::reg64(rdx)])?;
            emitter.unary("div", divisor)?;
            rax
        }
        Opcode::IntMod => {
            emitter.cqo()?;
            emitter.unary("idiv", divisor)?;
            rdx
        }
        Opcode::IntUMod => {
            emitter.raw("xor", &[Operand::reg64(rdx), Operand::reg64(rdx)])?;
            emitter.unary("div", divisor)?;
            rdx
        }
        _ => return Err(err_invalid_state("unexpected opcode reached translate_div_mod")),
    };

    if result_reg == rax {
        finish_result(cx, emitter, value, &quotient, Width::Qword)?;
    } else {
        finish_result(cx, emitter, value, &remainder, Width::Qword)?;
    }

    cx.ledger.release(remainder, emitter)?;
    cx.ledger.release(quotient, emitter)
}

/// `IntEq/Greater/Lesser/Above/Below`: XOR-clear the result register, `cmp
/// arg1, arg2` (arg2 may be memory), `setcc` on the low byte, zero-extend to
/// 64 bits implicitly via the clearing XOR.
pub(crate) fn translate_int_compare(
    cx: &mut FunctionCodegen,
    emitter: &mut dyn AssemblyEmitter,
    value: Value,
    inst: &Instruction,
) -> CodegenResult<()> {
    let (arg1, arg2) = binary_operands(inst)?;

    let result_alloc = cx.alloc_of(value).clone();
    let avoid = cx.alloc_of(arg2).as_register();
    let handle = acquire_result_register(cx, emitter, &result_alloc, false, avoid)?;
    let result_reg = handle.reg();

    emitter.raw("xor", &[Operand::reg64(result_reg), Operand::reg64(result_reg)])?;

    let arg1_alloc = cx.alloc_of(arg1).clone();
    let lhs_handle = acquire_result_register(cx, emitter, &arg1_alloc, false, None)?;
    load_into(cx, emitter, arg1, lhs_handle.reg(), Width::Qword)?;
    let rhs = operand_of(cx, arg2, Width::Qword)?;
    emitter.cmp(lhs_handle.reg(), rhs)?;
    cx.ledger.release(lhs_handle, emitter)?;

    let cc = match inst.opcode {
        Opcode::IntEq => "e",
        Opcode::IntGreater => "g",
        Opcode::IntLesser => "l",
        Opcode::IntAbove => "a",
        Opcode::IntBelow => "b",
        _ => return Err(err_invalid_state("unexpected opcode reached translate_int_compare")),
    };
    emitter.setcc(cc, result_reg)?;

    finish_result(cx, emitter, value, &handle, Width::Qword)?;
    cx.ledger.release(handle, emitter)
}

/// `BoolAnd/BoolOr`: materialise both operands as 0/1 booleans via
/// `test`/`setne`, then combine with `and`/`or`, zero-extending into the
/// result register.
pub(crate) fn translate_bool_combine(
    cx: &mut FunctionCodegen,
    emitter: &mut dyn AssemblyEmitter,
    value: Value,
    inst: &Instruction,
) -> CodegenResult<()> {
    let (arg1, arg2) = binary_operands(inst)?;
    reject_float_arg2(cx, arg2)?;

    let result_alloc = cx.alloc_of(value).clone();
    let avoid = cx.alloc_of(arg2).as_register();
    let handle = acquire_result_register(cx, emitter, &result_alloc, false, avoid)?;
    let result_reg = handle.reg();

    load_into(cx, emitter, arg1, result_reg, Width::Qword)?;
    emitter.test(result_reg, Operand::reg64(result_reg))?;
    emitter.setcc("ne", result_reg)?;

    let tmp = cx.ledger.any_gpr(None, emitter)?;
    match cx.alloc_of(arg2).as_register() {
        Some(r) if r.is_integer() => {
            emitter.test(r, Operand::reg64(r))?;
        }
        _ => {
            load_into(cx, emitter, arg2, tmp.reg(), Width::Qword)?;
            emitter.test(tmp.reg(), Operand::reg64(tmp.reg()))?;
        }
    }
    emitter.setcc("ne", tmp.reg())?;

    let mnemonic = match inst.opcode {
        Opcode::BoolAnd => "and",
        Opcode::BoolOr => "or",
        _ => return Err(err_invalid_state("unexpected opcode reached translate_bool_combine")),
    };
    emitter.raw(
        mnemonic,
        &[
            Operand::Reg(result_reg, Width::Byte),
            Operand::Reg(tmp.reg(), Width::Byte),
        ],
    )?;
    cx.ledger.release(tmp, emitter)?;

    // Zero-extend the low byte back into the full register.
    emitter.raw(
        "movzx",
        &[Operand::reg64(result_reg), Operand::Reg(result_reg, Width::Byte)],
    )?;

    finish_result(cx, emitter, value, &handle, Width::Qword)?;
    cx.ledger.release(handle, emitter)
}
