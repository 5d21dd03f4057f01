//! Scalar float, NaN-aware float comparison, integer/float conversion, and
//! x87 long-double arithmetic (§4.G table rows for `Float32/64
//! Add/Sub/Mul/Div`, `Float32/64Neg`, `FloatEq/Greater/Lesser`,
//! `IntToFloat/UIntToFloat/FloatToInt/Float32ToFloat64/Float64ToFloat32`,
//! `LongDoubleAdd/Sub/Mul/Div/Neg`, `LongDoubleStore`).
//!
//! Grounded on `source/codegen/opt-system-v-amd64/code/{float_binary_op,
//! float_unary_op,float_comparison,float_conv,long_double}.c`.

use crate::alloc::StorageLocation;
use crate::emit::{AssemblyEmitter, MemOperand, Operand};
use crate::error::{err_invalid_state, CodegenResult};
use crate::ir::{Instruction, Opcode, Operands, Type, TypeId, Value};
use crate::reg::{Reg, Width};
use crate::select::{
    acquire_result_register, finish_result, load_into, operand_of, FunctionCodegen, RodataConstant,
};
use crate::storage::BorrowHandle;

fn binary_operands(inst: &Instruction) -> CodegenResult<(Value, Value)> {
    match inst.operands {
        Operands::Binary(a, b) => Ok((a, b)),
        _ => Err(err_invalid_state("expected a binary operand pair")),
    }
}

fn unary_operand(inst: &Instruction) -> CodegenResult<Value> {
    match inst.operands {
        Operands::Unary(v) => Ok(v),
        _ => Err(err_invalid_state("expected a unary operand")),
    }
}

fn width_of_type(cx: &FunctionCodegen, ty: Option<TypeId>) -> CodegenResult<Width> {
    match ty.map(|t| cx.func.ty(t)) {
        Some(Type::Float32) => Ok(Width::Dword),
        Some(Type::Float64) => Ok(Width::Qword),
        _ => Err(err_invalid_state("expected a floating-point operand type")),
    }
}

fn float_width(cx: &FunctionCodegen, v: Value) -> CodegenResult<Width> {
    width_of_type(cx, cx.func.inst(v).result_type)
}

fn ss_sd(width: Width) -> &'static str {
    if width == Width::Dword {
        "ss"
    } else {
        "sd"
    }
}

/// A GPR holding a long-double pointer, read back as `tbyte ptr [reg]`.
fn tbyte_indirect(reg: Reg) -> CodegenResult<MemOperand> {
    let base = reg
        .as_gpr()
        .ok_or_else(|| err_invalid_state("expected a general-purpose pointer register"))?;
    Ok(MemOperand {
        base: Some(base),
        width: Some(Width::Tbyte),
        ..Default::default()
    })
}

/// Where a `LongDouble`-typed SSA value's own 10-byte storage lives. Unlike
/// the original, where the destination arrives as a separate pointer operand
/// materialised into a register, this selector addresses it directly through
/// the result's own frame-relative allocation (long-double values are never
/// register-resident, only ever spilled).
fn long_double_location(cx: &FunctionCodegen, value: Value) -> CodegenResult<MemOperand> {
    StorageLocation::from_allocation(cx.alloc_of(value), &cx.frame)
        .mem_operand(Width::Tbyte)
        .ok_or_else(|| err_invalid_state("a long-double value must be memory-resident"))
}

/// Acquires `alloc`'s own register if it's free and distinct from `avoid`,
/// otherwise falls back to any free XMM register excluding `avoid` (§4.G:
/// float comparison's arg1 acquisition excludes arg2's register even on the
/// any-register fallback, unlike the plain integer result-register policy).
fn acquire_float_excluding(
    cx: &mut FunctionCodegen,
    emitter: &mut dyn AssemblyEmitter,
    alloc: &crate::alloc::RegisterAllocation,
    avoid: Option<Reg>,
) -> CodegenResult<BorrowHandle> {
    if let Some(reg) = alloc.as_register() {
        if !cx.ledger.is_borrowed(reg) && Some(reg) != avoid {
            return cx.ledger.acquire(reg, emitter);
        }
    }
    match avoid.and_then(|r| r.as_xmm()) {
        Some(x) => cx
            .ledger
            .any_xmm(Some(&|candidate: crate::reg::Xmm| candidate != x), emitter),
        None => cx.ledger.any_xmm(None, emitter),
    }
}

/// `Float32/64 Add/Sub/Mul/Div`: load arg1 into the XMM result register,
/// apply the corresponding scalar SSE op against arg2 (register or memory).
pub(crate) fn translate_binary(
    cx: &mut FunctionCodegen,
    emitter: &mut dyn AssemblyEmitter,
    value: Value,
    inst: &Instruction,
) -> CodegenResult<()> {
    let (arg1, arg2) = binary_operands(inst)?;
    use Opcode::*;
    let width = match inst.opcode {
        Float32Add | Float32Sub | Float32Mul | Float32Div => Width::Dword,
        Float64Add | Float64Sub | Float64Mul | Float64Div => Width::Qword,
        _ => return Err(err_invalid_state("unexpected opcode reached translate_binary")),
    };
    let suffix = ss_sd(width);
    let op = match inst.opcode {
        Float32Add | Float64Add => "add",
        Float32Sub | Float64Sub => "sub",
        Float32Mul | Float64Mul => "mul",
        Float32Div | Float64Div => "div",
        _ => unreachable!(),
    };
    let mnemonic = format!("{op}{suffix}");

    let result_alloc = cx.alloc_of(value).clone();
    let avoid = cx.alloc_of(arg2).as_register();
    let handle = acquire_float_excluding(cx, emitter, &result_alloc, avoid)?;
    let result_reg = handle.reg();

    load_into(cx, emitter, arg1, result_reg, width)?;
    let rhs = operand_of(cx, arg2, width)?;
    emitter.sse_binop(&mnemonic, result_reg, rhs)?;

    finish_result(cx, emitter, value, &handle, width)?;
    cx.ledger.release(handle, emitter)
}

/// `Float32/64Neg`: XOR the result register against a module-wide rodata
/// sign-mask constant, recording the constant as required so the
/// module-level driver places it in `.rodata`.
pub(crate) fn translate_neg(
    cx: &mut FunctionCodegen,
    emitter: &mut dyn AssemblyEmitter,
    value: Value,
    inst: &Instruction,
) -> CodegenResult<()> {
    let arg1 = unary_operand(inst)?;
    let (width, mnemonic, constant) = match inst.opcode {
        Opcode::Float32Neg => (Width::Dword, "xorps", RodataConstant::Float32SignMask),
        Opcode::Float64Neg => (Width::Qword, "xorpd", RodataConstant::Float64SignMask),
        _ => return Err(err_invalid_state("unexpected opcode reached translate_neg")),
    };

    let result_alloc = cx.alloc_of(value).clone();
    let handle = acquire_result_register(cx, emitter, &result_alloc, true, None)?;
    let result_reg = handle.reg();
    load_into(cx, emitter, arg1, result_reg, width)?;

    cx.module_state.required_constants.insert(constant);
    emitter.sse_binop(mnemonic, result_reg, Operand::Mem(MemOperand::symbol(constant.label())))?;

    finish_result(cx, emitter, value, &handle, width)?;
    cx.ledger.release(handle, emitter)
}

/// `FloatEq/Greater/Lesser`: equality is NaN-safe via the unordered compare
/// plus `setnp`/`cmovne` dance; greater/lesser use the ordered compare plus
/// `seta`/`setb` directly (a NaN operand makes both false, which is correct
/// C semantics for `>`/`<` against NaN).
pub(crate) fn translate_compare(
    cx: &mut FunctionCodegen,
    emitter: &mut dyn AssemblyEmitter,
    value: Value,
    inst: &Instruction,
) -> CodegenResult<()> {
    let (arg1, arg2) = binary_operands(inst)?;
    let width = float_width(cx, arg1)?;

    let result_alloc = cx.alloc_of(value).clone();
    let avoid = cx.alloc_of(arg2).as_register();
    let handle = acquire_result_register(cx, emitter, &result_alloc, false, avoid)?;
    let result_reg = handle.reg();

    let arg1_alloc = cx.alloc_of(arg1).clone();
    let lhs_handle = acquire_float_excluding(cx, emitter, &arg1_alloc, avoid)?;
    load_into(cx, emitter, arg1, lhs_handle.reg(), width)?;
    let rhs = operand_of(cx, arg2, width)?;

    match inst.opcode {
        Opcode::FloatEq => {
            let tmp = cx.ledger.any_gpr(None, emitter)?;
            emitter.raw("xor", &[Operand::reg64(result_reg), Operand::reg64(result_reg)])?;
            emitter.raw("xor", &[Operand::reg64(tmp.reg()), Operand::reg64(tmp.reg())])?;
            let mnemonic = if width == Width::Dword { "ucomiss" } else { "ucomisd" };
            emitter.sse_binop(mnemonic, lhs_handle.reg(), rhs)?;
            emitter.setcc("np", result_reg)?;
            emitter.raw("cmovne", &[Operand::reg64(result_reg), Operand::reg64(tmp.reg())])?;
            cx.ledger.release(tmp, emitter)?;
        }
        Opcode::FloatGreater | Opcode::FloatLesser => {
            emitter.raw("xor", &[Operand::reg64(result_reg), Operand::reg64(result_reg)])?;
            let mnemonic = if width == Width::Dword { "comiss" } else { "comisd" };
            emitter.sse_binop(mnemonic, lhs_handle.reg(), rhs)?;
            let cc = if matches!(inst.opcode, Opcode::FloatGreater) { "a" } else { "b" };
            emitter.setcc(cc, result_reg)?;
        }
        _ => return Err(err_invalid_state("unexpected opcode reached translate_compare")),
    }

    cx.ledger.release(lhs_handle, emitter)?;
    finish_result(cx, emitter, value, &handle, Width::Qword)?;
    cx.ledger.release(handle, emitter)
}

/// `IntToFloat/UIntToFloat/FloatToInt/Float32ToFloat64/Float64ToFloat32`:
/// `cvtsi2ss/sd`, `cvttss/sd2si`, `cvtss2sd`/`cvtsd2ss`; `UIntToFloat` splits
/// out into [`translate_uint_to_float`] since it needs a conditional branch.
pub(crate) fn translate_convert(
    cx: &mut FunctionCodegen,
    emitter: &mut dyn AssemblyEmitter,
    value: Value,
    inst: &Instruction,
) -> CodegenResult<()> {
    let arg1 = unary_operand(inst)?;

    match inst.opcode {
        Opcode::IntToFloat => {
            let width = width_of_type(cx, inst.result_type)?;
            let mnemonic = if width == Width::Dword { "cvtsi2ss" } else { "cvtsi2sd" };
            let result_alloc = cx.alloc_of(value).clone();
            let handle = acquire_result_register(cx, emitter, &result_alloc, true, None)?;
            let operand = operand_of(cx, arg1, Width::Qword)?;
            emitter.cvt(mnemonic, handle.reg(), operand)?;
            finish_result(cx, emitter, value, &handle, width)?;
            cx.ledger.release(handle, emitter)
        }
        Opcode::FloatToInt => {
            let width = float_width(cx, arg1)?;
            let mnemonic = if width == Width::Dword { "cvttss2si" } else { "cvttsd2si" };
            let result_alloc = cx.alloc_of(value).clone();
            let handle = acquire_result_register(cx, emitter, &result_alloc, false, None)?;
            let operand = operand_of(cx, arg1, width)?;
            emitter.cvt(mnemonic, handle.reg(), operand)?;
            finish_result(cx, emitter, value, &handle, Width::Qword)?;
            cx.ledger.release(handle, emitter)
        }
        Opcode::Float32ToFloat64 => {
            let result_alloc = cx.alloc_of(value).clone();
            let handle = acquire_result_register(cx, emitter, &result_alloc, true, None)?;
            let operand = operand_of(cx, arg1, Width::Dword)?;
            emitter.cvt("cvtss2sd", handle.reg(), operand)?;
            finish_result(cx, emitter, value, &handle, Width::Qword)?;
            cx.ledger.release(handle, emitter)
        }
        Opcode::Float64ToFloat32 => {
            let result_alloc = cx.alloc_of(value).clone();
            let handle = acquire_result_register(cx, emitter, &result_alloc, true, None)?;
            let operand = operand_of(cx, arg1, Width::Qword)?;
            emitter.cvt("cvtsd2ss", handle.reg(), operand)?;
            finish_result(cx, emitter, value, &handle, Width::Dword)?;
            cx.ledger.release(handle, emitter)
        }
        Opcode::UIntToFloat => translate_uint_to_float(cx, emitter, value, inst, arg1),
        _ => Err(err_invalid_state("unexpected opcode reached translate_convert")),
    }
}

/// `UIntToFloat`: if the sign bit is clear, a plain signed `cvtsi2ss/sd`
/// already rounds correctly. Otherwise halve the value first (`(x>>1) |
/// (x&1)`, to preserve the sticky rounding bit), convert, and double the
/// result, avoiding the need for a 65-bit-wide signed conversion.
fn translate_uint_to_float(
    cx: &mut FunctionCodegen,
    emitter: &mut dyn AssemblyEmitter,
    value: Value,
    inst: &Instruction,
    arg1: Value,
) -> CodegenResult<()> {
    let width = width_of_type(cx, inst.result_type)?;
    let suffix = ss_sd(width);
    let cvt_mnemonic = format!("cvtsi2{suffix}");
    let add_mnemonic = format!("add{suffix}");

    let arg_handle = cx.ledger.any_gpr(None, emitter)?;
    load_into(cx, emitter, arg1, arg_handle.reg(), Width::Qword)?;

    let result_alloc = cx.alloc_of(value).clone();
    let handle = acquire_float_excluding(cx, emitter, &result_alloc, Some(arg_handle.reg()))?;
    let result_reg = handle.reg();

    emitter.raw("pxor", &[Operand::reg64(result_reg), Operand::reg64(result_reg)])?;
    emitter.test(arg_handle.reg(), Operand::reg64(arg_handle.reg()))?;

    let n = value.index() as u32 * 2;
    let sign_label = cx.intra_block_label(inst.block, n);
    let nosign_label = cx.intra_block_label(inst.block, n + 1);

    emitter.jcc("s", &sign_label)?;
    emitter.cvt(&cvt_mnemonic, result_reg, Operand::reg64(arg_handle.reg()))?;
    emitter.jmp_label(&nosign_label)?;

    emitter.emit_label(&sign_label)?;
    let tmp = cx.ledger.any_gpr(None, emitter)?;
    emitter.mov_reg_reg(tmp.reg(), arg_handle.reg())?;
    emitter.and_imm(arg_handle.reg(), 1)?;
    emitter.shift_imm("shr", tmp.reg(), 1)?;
    emitter.binop("or", tmp.reg(), Operand::reg64(arg_handle.reg()))?;
    emitter.cvt(&cvt_mnemonic, result_reg, Operand::reg64(tmp.reg()))?;
    emitter.sse_binop(&add_mnemonic, result_reg, Operand::reg64(result_reg))?;
    cx.ledger.release(tmp, emitter)?;

    emitter.emit_label(&nosign_label)?;
    cx.ledger.release(arg_handle, emitter)?;

    finish_result(cx, emitter, value, &handle, width)?;
    cx.ledger.release(handle, emitter)
}

/// `LongDoubleAdd/Sub/Mul/Div`: `fld` arg2 then arg1 (mirroring the
/// original's push order, which matters for the non-commutative sub/div
/// pairs), apply the paired x87 op, `fstp` into the result's own storage.
pub(crate) fn translate_long_double_binary(
    cx: &mut FunctionCodegen,
    emitter: &mut dyn AssemblyEmitter,
    value: Value,
    inst: &Instruction,
) -> CodegenResult<()> {
    let (arg1, arg2) = binary_operands(inst)?;

    let arg2_alloc = cx.alloc_of(arg2).clone();
    let arg2_handle = acquire_result_register(cx, emitter, &arg2_alloc, false, None)?;
    load_into(cx, emitter, arg2, arg2_handle.reg(), Width::Qword)?;
    emitter.x87("fld", Some(Operand::Mem(tbyte_indirect(arg2_handle.reg())?)))?;
    cx.ledger.release(arg2_handle, emitter)?;

    let arg1_alloc = cx.alloc_of(arg1).clone();
    let arg1_handle = acquire_result_register(cx, emitter, &arg1_alloc, false, None)?;
    load_into(cx, emitter, arg1, arg1_handle.reg(), Width::Qword)?;
    emitter.x87("fld", Some(Operand::Mem(tbyte_indirect(arg1_handle.reg())?)))?;
    cx.ledger.release(arg1_handle, emitter)?;

    let mnemonic = match inst.opcode {
        Opcode::LongDoubleAdd => "faddp",
        Opcode::LongDoubleSub => "fsubp",
        Opcode::LongDoubleMul => "fmulp",
        Opcode::LongDoubleDiv => "fdivp",
        _ => return Err(err_invalid_state("unexpected opcode reached translate_long_double_binary")),
    };
    emitter.x87(mnemonic, None)?;

    let dest = long_double_location(cx, value)?;
    emitter.x87("fstp", Some(Operand::Mem(dest)))
}

/// `LongDoubleNeg`: `fld` the operand, `fchs`, `fstp` into the result.
pub(crate) fn translate_long_double_neg(
    cx: &mut FunctionCodegen,
    emitter: &mut dyn AssemblyEmitter,
    value: Value,
    inst: &Instruction,
) -> CodegenResult<()> {
    let arg1 = unary_operand(inst)?;

    let arg_alloc = cx.alloc_of(arg1).clone();
    let arg_handle = acquire_result_register(cx, emitter, &arg_alloc, false, None)?;
    load_into(cx, emitter, arg1, arg_handle.reg(), Width::Qword)?;
    emitter.x87("fld", Some(Operand::Mem(tbyte_indirect(arg_handle.reg())?)))?;
    cx.ledger.release(arg_handle, emitter)?;

    match inst.opcode {
        Opcode::LongDoubleNeg => emitter.x87("fchs", None)?,
        _ => return Err(err_invalid_state("unexpected opcode reached translate_long_double_neg")),
    }

    let dest = long_double_location(cx, value)?;
    emitter.x87("fstp", Some(Operand::Mem(dest)))
}

/// `LongDoubleStore`: source and target are both pointers; `fld` from
/// source, `fstp` to target, with the target register acquired excluding
/// whichever register the source ended up in.
pub(crate) fn translate_long_double_store(
    cx: &mut FunctionCodegen,
    emitter: &mut dyn AssemblyEmitter,
    _value: Value,
    inst: &Instruction,
) -> CodegenResult<()> {
    let (source, target) = binary_operands(inst)?;

    let source_alloc = cx.alloc_of(source).clone();
    let target_alloc = cx.alloc_of(target).clone();

    let source_handle = acquire_result_register(cx, emitter, &source_alloc, false, target_alloc.as_register())?;
    let target_handle = acquire_result_register(cx, emitter, &target_alloc, false, None)?;

    load_into(cx, emitter, source, source_handle.reg(), Width::Qword)?;
    load_into(cx, emitter, target, target_handle.reg(), Width::Qword)?;

    emitter.x87("fld", Some(Operand::Mem(tbyte_indirect(source_handle.reg())?)))?;
    emitter.x87("fstp", Some(Operand::Mem(tbyte_indirect(target_handle.reg())?)))?;

    cx.ledger.release(target_handle, emitter)?;
    cx.ledger.release(source_handle, emitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::RegisterAllocation;
    use crate::config::{Config, Syntax};
    use crate::emit::TextEmitter;
    use crate::frame::{FrameSizes, StackFrameMap};
    use crate::ir::{BlockData, Function, Opcode, ParamId, ReturnKind};
    use crate::reg::Xmm;
    use crate::select::{FunctionCodegen, ModuleState};
    use crate::storage::StorageLedger;
    use cranelift_entity::{EntityRef, PrimaryMap, SecondaryMap};

    fn empty_module() -> crate::ir::Module {
        crate::ir::Module {
            functions: PrimaryMap::new(),
            string_literals: PrimaryMap::new(),
            inline_asm: PrimaryMap::new(),
            data_storage: Default::default(),
            visibility: Default::default(),
            globals: Default::default(),
        }
    }

    // Builds a function with two placeholder instructions (matching
    // `Value::new(0)`/`Value::new(1)`) so `Function::inst` lookups used by
    // float comparison resolve a real `Float64` result type.
    fn build_with_float_operands() -> (Function, Config, TypeId) {
        let mut types = PrimaryMap::new();
        let float_ty = types.push(Type::Float64);
        let mut blocks = PrimaryMap::new();
        let entry = blocks.push(BlockData { phis: Vec::new(), instructions: Vec::new() });

        let mut instructions = PrimaryMap::new();
        for _ in 0..2 {
            instructions.push(Instruction {
                opcode: Opcode::GetLocal,
                operands: Operands::Symbol { global: crate::ir::GlobalId::new(0), offset: 0 },
                result_type: Some(float_ty),
                block: entry,
            });
        }

        let func = Function {
            name: "f".to_string(),
            params: PrimaryMap::<ParamId, _>::new(),
            return_kind: ReturnKind::Void,
            variadic: false,
            types,
            blocks,
            instructions,
            block_order: vec![entry],
            reachable: std::iter::once(entry).collect(),
            entry,
        };
        (func, Config::builder().build(), float_ty)
    }

    fn cx<'a>(func: &'a Function, module: &'a crate::ir::Module, config: &'a Config, state: &'a mut ModuleState) -> FunctionCodegen<'a> {
        let sizes = FrameSizes::default();
        FunctionCodegen {
            module,
            func,
            config,
            frame: StackFrameMap::compute(&sizes, config),
            ledger: StorageLedger::new(),
            allocations: SecondaryMap::with_default(RegisterAllocation::None),
            module_state: state,
            epilogue_label: "f_epilogue".to_string(),
            function_label_prefix: "f".to_string(),
        }
    }

    #[test]
    fn float64_add_uses_the_scalar_double_mnemonic() {
        let (func, config, float_ty) = build_with_float_operands();
        let module = empty_module();
        let mut state = ModuleState::default();
        let mut fc = cx(&func, &module, &config, &mut state);

        let arg1 = Value::new(0);
        let arg2 = Value::new(1);
        let result = Value::new(2);
        fc.allocations[arg1] = RegisterAllocation::Fpr(Xmm::Xmm0);
        fc.allocations[arg2] = RegisterAllocation::Fpr(Xmm::Xmm1);
        fc.allocations[result] = RegisterAllocation::Fpr(Xmm::Xmm2);

        let inst = Instruction {
            opcode: Opcode::Float64Add,
            operands: Operands::Binary(arg1, arg2),
            result_type: Some(float_ty),
            block: fc.func.entry,
        };
        let mut em = TextEmitter::new(Syntax::X86_64Att);
        translate_binary(&mut fc, &mut em, result, &inst).unwrap();

        assert!(em.buffer.contains("addsd"));
        assert!(!fc.ledger.has_borrowed());
    }

    // Scenario: `Float32Neg` xors against the module-wide sign-mask rodata
    // constant and registers it as required.
    #[test]
    fn float32_neg_registers_the_sign_mask_constant() {
        let (func, config, _float_ty) = build_with_float_operands();
        let module = empty_module();
        let mut state = ModuleState::default();
        let mut fc = cx(&func, &module, &config, &mut state);

        let arg1 = Value::new(0);
        let result = Value::new(2);
        fc.allocations[arg1] = RegisterAllocation::Fpr(Xmm::Xmm0);
        fc.allocations[result] = RegisterAllocation::Fpr(Xmm::Xmm1);

        let inst = Instruction {
            opcode: Opcode::Float32Neg,
            operands: Operands::Unary(arg1),
            result_type: Some(_float_ty),
            block: fc.func.entry,
        };
        let mut em = TextEmitter::new(Syntax::X86_64Att);
        translate_neg(&mut fc, &mut em, result, &inst).unwrap();

        assert!(em.buffer.contains("xorps"));
        assert!(fc.module_state.required_constants.contains(&RodataConstant::Float32SignMask));
        assert!(!fc.ledger.has_borrowed());
    }

    #[test]
    fn float_eq_is_nan_safe_via_unordered_compare_and_cmovne() {
        let (func, config, float_ty) = build_with_float_operands();
        let module = empty_module();
        let mut state = ModuleState::default();
        let mut fc = cx(&func, &module, &config, &mut state);

        let arg1 = Value::new(0);
        let arg2 = Value::new(1);
        let result = Value::new(2);
        fc.allocations[arg1] = RegisterAllocation::Fpr(Xmm::Xmm0);
        fc.allocations[arg2] = RegisterAllocation::Fpr(Xmm::Xmm1);
        fc.allocations[result] = RegisterAllocation::Gpr(crate::reg::Gpr::Rax);

        let inst = Instruction {
            opcode: Opcode::FloatEq,
            operands: Operands::Binary(arg1, arg2),
            result_type: Some(float_ty),
            block: fc.func.entry,
        };
        let mut em = TextEmitter::new(Syntax::X86_64Att);
        translate_compare(&mut fc, &mut em, result, &inst).unwrap();

        assert!(em.buffer.contains("ucomisd"));
        assert!(em.buffer.contains("setnp"));
        assert!(em.buffer.contains("cmovne"));
        assert!(!fc.ledger.has_borrowed());
    }

    // Scenario E: long-double multiplication via the x87 stack.
    #[test]
    fn long_double_mul_pushes_arg2_then_arg1_and_pops_into_result() {
        let (func, config, _float_ty) = build_with_float_operands();
        let module = empty_module();
        let mut state = ModuleState::default();
        let mut fc = cx(&func, &module, &config, &mut state);

        let arg1 = Value::new(0);
        let arg2 = Value::new(1);
        let result = Value::new(2);
        fc.allocations[arg1] = RegisterAllocation::Gpr(Gpr::Rax);
        fc.allocations[arg2] = RegisterAllocation::Gpr(Gpr::Rbx);
        fc.allocations[result] = RegisterAllocation::SpillSlot { index: 0, param_qwords: None };

        let inst = Instruction {
            opcode: Opcode::LongDoubleMul,
            operands: Operands::Binary(arg1, arg2),
            result_type: None,
            block: fc.func.entry,
        };
        let mut em = TextEmitter::new(Syntax::X86_64Att);
        translate_long_double_binary(&mut fc, &mut em, result, &inst).unwrap();

        assert_eq!(em.buffer.matches("fld").count(), 2);
        assert!(em.buffer.contains("fmulp"));
        assert!(em.buffer.contains("fstp"));
    }
}
