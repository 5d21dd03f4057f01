//! Calling-convention engine (component H): lowering of `Invoke` and
//! `Return` under the System V AMD64 ABI (§4.H).
//!
//! Grounded on `source/codegen/opt-system-v-amd64/code/{invoke,return}.c`.
//! Argument/return eightbyte classification itself lives in [`crate::abi`];
//! this module is purely the control flow that walks a classification and
//! emits the surrounding prologue/epilogue.

use smallvec::SmallVec;

use crate::abi::{classify_value, ClassAllocator, ClassifiedValue, EightbyteClass, Placement};
use crate::alloc::StorageLocation;
use crate::emit::{AssemblyEmitter, MemOperand, Operand};
use crate::error::{err_invalid_state, err_not_supported, CodegenResult};
use crate::ir::{CallTarget, Instruction, Operands, ReturnKind, Type, Value};
use crate::reg::{Gpr, Reg, Width, Xmm, CALLER_SAVED_GPR};
use crate::select::FunctionCodegen;
use crate::storage::transform::StorageTransform;
use crate::storage::BorrowHandle;

/// Integer/SSE return registers, in priority order (mirrors
/// `KEFIR_ABI_SYSV_AMD64_RETURN_{INTEGER,SSE}_REGISTERS`).
const RETURN_INTEGER_REGISTERS: [Gpr; 2] = [Gpr::Rax, Gpr::Rdx];
const RETURN_SSE_REGISTERS: [Xmm; 2] = [Xmm::Xmm0, Xmm::Xmm1];

/// Classifies the value a type yields as a function/call result, reusing the
/// same eightbyte table argument classification uses (§4.H: "call and return
/// share one classification"). Used when a callee's own [`ReturnKind`] isn't
/// directly available, i.e. for an indirect call.
fn return_kind_of(ty: &Type) -> ReturnKind {
    match ty {
        Type::Float32 | Type::Float64 => ReturnKind::Float,
        Type::LongDouble => ReturnKind::LongDouble,
        Type::Aggregate { size, classes, .. } => {
            if *size > 16 || classes.iter().any(|c| *c == EightbyteClass::Memory) {
                ReturnKind::Memory
            } else {
                ReturnKind::Register(classes.iter().copied().take(2).collect())
            }
        }
        _ => ReturnKind::Integer,
    }
}

fn value_type<'a>(cx: &'a FunctionCodegen, v: Value) -> CodegenResult<&'a Type> {
    let t = cx
        .func
        .inst(v)
        .result_type
        .ok_or_else(|| err_invalid_state(format!("{v:?} has no result type")))?;
    Ok(cx.func.ty(t))
}

fn arg_location(cx: &FunctionCodegen, v: Value) -> StorageLocation {
    StorageLocation::from_allocation(cx.alloc_of(v), &cx.frame)
}

fn invoke_operands(inst: &Instruction) -> CodegenResult<(CallTarget, SmallVec<[Value; 8]>, bool)> {
    match &inst.operands {
        Operands::Invoke { callee, args, variadic } => Ok((callee.clone(), args.clone(), *variadic)),
        _ => Err(err_invalid_state("expected Invoke operands")),
    }
}

/// `Invoke` (§4.H "Call", steps 1-10).
pub(crate) fn translate_invoke(
    cx: &mut FunctionCodegen,
    emitter: &mut dyn AssemblyEmitter,
    value: Value,
    inst: &Instruction,
) -> CodegenResult<()> {
    let (callee, args, variadic) = invoke_operands(inst)?;

    let mut class_alloc = ClassAllocator::new();
    let mut arg_classes = Vec::with_capacity(args.len());
    for &arg in &args {
        let ty = value_type(cx, arg)?;
        arg_classes.push(classify_value(ty, &mut class_alloc));
    }
    let stack_arg_bytes = class_alloc.stack_bytes();

    let result_reg = cx.alloc_of(value).as_register();

    // Step 1: stack_increment.
    let mut save_regs: Vec<Gpr> = Vec::new();
    for reg in CALLER_SAVED_GPR {
        if Some(Reg::Gpr(reg)) == result_reg {
            continue;
        }
        if cx.ledger.is_occupied(Reg::Gpr(reg)) {
            save_regs.push(reg);
        }
    }
    let mut stack_increment = stack_arg_bytes + (save_regs.len() as i64) * 8;
    stack_increment = (stack_increment + 15) / 16 * 16;

    // Step 2: prologue.
    if stack_increment > 0 {
        emitter.sub_imm(Reg::Gpr(Gpr::Rsp), stack_increment)?;
    }

    // Step 3: save occupied caller-saves (not the result) past the
    // stack-argument area.
    let mut offset = stack_arg_bytes;
    for &reg in &save_regs {
        emitter.mov_mem_reg(
            MemOperand { base: Some(Gpr::Rsp), disp: offset, width: Some(Width::Qword), ..Default::default() },
            Reg::Gpr(reg),
            Width::Qword,
        )?;
        offset += 8;
    }

    // Step 4: storage transform for all non-memory-aggregate arguments; plain
    // `rep movsb` for memory aggregates.
    let mut transform = StorageTransform::new();
    let mut register_aggregates: Vec<ClassifiedValue> = Vec::new();
    for (i, &arg) in args.iter().enumerate() {
        let ty = value_type(cx, arg)?;
        let classified = arg_classes[i].clone();
        if ty.is_aggregate() {
            match classified.placements.first() {
                Some(Placement::Memory { stack_offset }) => {
                    copy_memory_aggregate(cx, emitter, arg, ty, *stack_offset)?;
                }
                _ => {
                    for placement in &classified.placements {
                        match placement {
                            Placement::IntegerRegister(g) => transform.add(
                                StorageLocation::Register(Reg::Gpr(*g)),
                                arg_location(cx, arg),
                                Width::Qword,
                            ),
                            Placement::SseRegister(_) => {
                                return Err(err_not_supported(
                                    "SSE-classified register-aggregate call argument",
                                ))
                            }
                            Placement::X87 | Placement::Memory { .. } => {
                                return Err(err_invalid_state(
                                    "mixed memory/register placement within one aggregate argument",
                                ))
                            }
                        }
                    }
                    register_aggregates.push(classified);
                }
            }
        } else {
            match &classified.placements[0] {
                Placement::IntegerRegister(g) => transform.add(
                    StorageLocation::Register(Reg::Gpr(*g)),
                    arg_location(cx, arg),
                    Width::Qword,
                ),
                Placement::SseRegister(x) => transform.add(
                    StorageLocation::Register(Reg::Xmm(*x)),
                    arg_location(cx, arg),
                    Width::Qword,
                ),
                Placement::Memory { stack_offset } => transform.add(
                    StorageLocation::Memory { base: Gpr::Rsp, offset: *stack_offset },
                    arg_location(cx, arg),
                    Width::Qword,
                ),
                Placement::X87 => return Err(err_not_supported("x87-classified scalar call argument")),
            }
        }
    }
    transform.perform(&mut cx.ledger, emitter)?;

    // Step 5: re-load register-aggregate pieces by dereferencing the pointer
    // each integer register was just loaded with.
    for classified in &register_aggregates {
        for (i, placement) in classified.placements.iter().enumerate() {
            if let Placement::IntegerRegister(g) = placement {
                emitter.mov_reg_mem(
                    Reg::Gpr(*g),
                    MemOperand {
                        base: Some(*g),
                        disp: (i as i64) * 8,
                        width: Some(Width::Qword),
                        ..Default::default()
                    },
                    Width::Qword,
                )?;
            }
        }
    }

    let ret_kind = match &callee {
        CallTarget::Direct(g) => cx.module.functions[*g].return_kind.clone(),
        CallTarget::Indirect(_) => match inst.result_type {
            Some(t) => return_kind_of(cx.func.ty(t)),
            None => ReturnKind::Void,
        },
    };

    // Step 6: implicit return-buffer pointer for a memory-returning callee.
    if matches!(ret_kind, ReturnKind::Memory) {
        emitter.lea(
            Reg::Gpr(Gpr::Rdi),
            MemOperand { base: Some(Gpr::Rbp), disp: cx.frame.temporary_area_offset, ..Default::default() },
        )?;
    }

    // Step 7: variadic callee -> `al` holds the SSE register count.
    if variadic {
        emitter.mov_imm(Reg::Gpr(Gpr::Rax), class_alloc.consumed_sse() as i64)?;
    }

    // Step 8: the call itself.
    match &callee {
        CallTarget::Direct(g) => emitter.call_symbol(cx.module.global_symbol(*g))?,
        CallTarget::Indirect(ptr) => {
            let handle = load_call_target(cx, emitter, *ptr)?;
            emitter.call_reg(handle.reg())?;
            cx.ledger.release(handle, emitter)?;
        }
    }

    // Step 9: store the return value.
    store_call_result(cx, emitter, value, &ret_kind)?;

    // Step 10: restore caller-saves, release the stack increment.
    let mut offset = stack_arg_bytes;
    for &reg in &save_regs {
        emitter.mov_reg_mem(
            Reg::Gpr(reg),
            MemOperand { base: Some(Gpr::Rsp), disp: offset, width: Some(Width::Qword), ..Default::default() },
            Width::Qword,
        )?;
        offset += 8;
    }
    if stack_increment > 0 {
        emitter.add_imm(Reg::Gpr(Gpr::Rsp), stack_increment)?;
    }
    Ok(())
}

/// Copies one memory-classified aggregate argument onto the outgoing stack
/// argument area, saving/restoring `rdi`/`rsi`/`rcx` around the `rep movsb`
/// regardless of whether they are presently occupied (grounded on
/// `invoke.c`'s `memory_aggregate_argument`, which does the same
/// unconditionally rather than consulting the ledger).
fn copy_memory_aggregate(
    cx: &FunctionCodegen,
    emitter: &mut dyn AssemblyEmitter,
    arg: Value,
    ty: &Type,
    stack_offset: i64,
) -> CodegenResult<()> {
    if ty.size() == 0 {
        return Ok(());
    }
    emitter.push_reg(Reg::Gpr(Gpr::Rdi))?;
    emitter.push_reg(Reg::Gpr(Gpr::Rsi))?;
    emitter.push_reg(Reg::Gpr(Gpr::Rcx))?;

    crate::select::load_into(cx, emitter, arg, Reg::Gpr(Gpr::Rsi), Width::Qword)?;
    emitter.mov_imm(Reg::Gpr(Gpr::Rcx), ty.size() as i64)?;
    emitter.lea(
        Reg::Gpr(Gpr::Rdi),
        MemOperand { base: Some(Gpr::Rsp), disp: 3 * 8 + stack_offset, ..Default::default() },
    )?;
    emitter.cld()?;
    emitter.rep_movsb()?;

    emitter.pop_reg(Reg::Gpr(Gpr::Rcx))?;
    emitter.pop_reg(Reg::Gpr(Gpr::Rsi))?;
    emitter.pop_reg(Reg::Gpr(Gpr::Rdi))?;
    Ok(())
}

fn load_call_target(
    cx: &mut FunctionCodegen,
    emitter: &mut dyn AssemblyEmitter,
    ptr: Value,
) -> CodegenResult<BorrowHandle> {
    let handle = cx.ledger.any_gpr(None, emitter)?;
    crate::select::load_into(cx, emitter, ptr, handle.reg(), Width::Qword)?;
    Ok(handle)
}

/// Stores a call's result into its allocation, dispatching on the callee's
/// [`ReturnKind`] the way `invoke.c`'s `save_return_value` visitors do.
fn store_call_result(
    cx: &FunctionCodegen,
    emitter: &mut dyn AssemblyEmitter,
    value: Value,
    ret_kind: &ReturnKind,
) -> CodegenResult<()> {
    let result_alloc = cx.alloc_of(value).clone();
    if result_alloc.is_none() {
        return Ok(());
    }
    match ret_kind {
        ReturnKind::Void => {}
        ReturnKind::Integer | ReturnKind::Memory => {
            crate::select::store_from(cx, emitter, value, Reg::Gpr(Gpr::Rax), Width::Qword)?;
        }
        ReturnKind::Float => {
            crate::select::store_from(cx, emitter, value, Reg::Xmm(Xmm::Xmm0), Width::Qword)?;
        }
        ReturnKind::LongDouble => {
            let loc = StorageLocation::from_allocation(&result_alloc, &cx.frame);
            let mem = loc
                .mem_operand(Width::Tbyte)
                .ok_or_else(|| err_invalid_state("long double call result must be memory-resident"))?;
            emitter.x87("fstp", Some(Operand::Mem(mem)))?;
        }
        ReturnKind::Register(classes) => {
            let loc = StorageLocation::from_allocation(&result_alloc, &cx.frame);
            let (base, base_offset) = match loc {
                StorageLocation::Memory { base, offset } => (base, offset),
                StorageLocation::Register(_) => {
                    return Err(err_invalid_state("register-aggregate call result must be memory-resident"))
                }
            };
            lay_out_register_classes(emitter, classes, base, base_offset, true)?;
        }
    }
    Ok(())
}

/// Walks a `Register(classes)` classification, shared between a call's
/// result and the enclosing function's own `Return`. `from_registers` selects
/// the direction: `true` stores `rax/rdx`/`xmm0/xmm1`/x87 into `[base+offset]`
/// (consuming a call's register-aggregate result into its buffer), `false`
/// loads `[base+offset]` into them (preparing this function's own `Return`
/// value from its aggregate buffer).
fn lay_out_register_classes(
    emitter: &mut dyn AssemblyEmitter,
    classes: &[EightbyteClass],
    base: Gpr,
    base_offset: i64,
    from_registers: bool,
) -> CodegenResult<()> {
    let mut int_idx = 0usize;
    let mut sse_idx = 0usize;
    let mut i = 0usize;
    while i < classes.len() {
        let mem = MemOperand {
            base: Some(base),
            disp: base_offset + (i as i64) * 8,
            width: Some(Width::Qword),
            ..Default::default()
        };
        match classes[i] {
            EightbyteClass::Integer => {
                let reg = *RETURN_INTEGER_REGISTERS
                    .get(int_idx)
                    .ok_or_else(|| err_not_supported("aggregate exceeds available integer return registers"))?;
                int_idx += 1;
                if from_registers {
                    emitter.mov_mem_reg(mem, Reg::Gpr(reg), Width::Qword)?;
                } else {
                    emitter.mov_reg_mem(Reg::Gpr(reg), mem, Width::Qword)?;
                }
                i += 1;
            }
            EightbyteClass::Sse => {
                let reg = *RETURN_SSE_REGISTERS
                    .get(sse_idx)
                    .ok_or_else(|| err_not_supported("aggregate exceeds available SSE return registers"))?;
                sse_idx += 1;
                if from_registers {
                    emitter.raw("movq", &[Operand::Mem(mem), Operand::reg64(Reg::Xmm(reg))])?;
                } else {
                    emitter.raw("movq", &[Operand::reg64(Reg::Xmm(reg)), Operand::Mem(mem)])?;
                }
                i += 1;
            }
            EightbyteClass::X87 => {
                if classes.get(i + 1).copied() != Some(EightbyteClass::X87Up) {
                    return Err(err_invalid_state("X87 eightbyte must be directly followed by X87Up"));
                }
                let tbyte_mem = MemOperand { width: Some(Width::Tbyte), ..mem };
                let mnemonic = if from_registers { "fstp" } else { "fld" };
                emitter.x87(mnemonic, Some(Operand::Mem(tbyte_mem)))?;
                i += 2;
            }
            EightbyteClass::X87Up => {
                return Err(err_invalid_state("X87Up eightbyte without a preceding X87"))
            }
            EightbyteClass::Memory | EightbyteClass::NoClass => i += 1,
        }
    }
    Ok(())
}

/// `Return` (§4.H "Return"): dispatch on the enclosing function's own result
/// kind, then the matched epilogue and `ret`.
pub(crate) fn translate_return(
    cx: &mut FunctionCodegen,
    emitter: &mut dyn AssemblyEmitter,
    value: Value,
) -> CodegenResult<()> {
    let operands = cx.func.inst(value).operands.clone();
    match operands {
        Operands::Nullary => {}
        Operands::Unary(result) => {
            let ret_kind = cx.func.return_kind.clone();
            emit_return_value(cx, emitter, result, &ret_kind)?;
        }
        _ => return Err(err_invalid_state("expected Return operands")),
    }
    cx.frame.emit_epilogue(emitter)?;
    emitter.ret()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::RegisterAllocation;
    use crate::config::{Config, Syntax};
    use crate::emit::TextEmitter;
    use crate::frame::{FrameSizes, StackFrameMap};
    use crate::ir::{BlockData, Function, Opcode, ParamId};
    use crate::select::{FunctionCodegen, ModuleState};
    use crate::storage::StorageLedger;
    use cranelift_entity::{PrimaryMap, SecondaryMap};

    fn leaf_function(name: &str, return_kind: ReturnKind, variadic: bool) -> Function {
        let mut blocks = PrimaryMap::new();
        let entry = blocks.push(BlockData { phis: Vec::new(), instructions: Vec::new() });
        Function {
            name: name.to_string(),
            params: PrimaryMap::<ParamId, _>::new(),
            return_kind,
            variadic,
            types: PrimaryMap::new(),
            blocks,
            instructions: PrimaryMap::new(),
            block_order: vec![entry],
            reachable: std::iter::once(entry).collect(),
            entry,
        }
    }

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

    fn cx<'a>(
        func: &'a Function,
        module: &'a crate::ir::Module,
        config: &'a Config,
        state: &'a mut ModuleState,
    ) -> FunctionCodegen<'a> {
        let sizes = FrameSizes { spill_slots: 1, temporary_bytes: 16, ..Default::default() };
        FunctionCodegen {
            module,
            func,
            config,
            frame: StackFrameMap::compute(&sizes, config),
            ledger: StorageLedger::new(),
            allocations: SecondaryMap::with_default(RegisterAllocation::None),
            module_state: state,
            epilogue_label: "caller_epilogue".to_string(),
            function_label_prefix: "caller".to_string(),
        }
    }

    // Scenario C: a variadic call with two ints and one double places
    // arguments in rdi, rsi, xmm0 and sets `al` to the SSE argument count.
    #[test]
    fn variadic_call_sets_al_to_sse_register_count() {
        let mut module = empty_module();
        let callee_id = module.functions.push(leaf_function("callee", ReturnKind::Void, true));
        module.globals.insert(callee_id, "callee".to_string());

        let mut func = leaf_function("caller", ReturnKind::Void, false);
        let int_ty = func.types.push(Type::Int64);
        let float_ty = func.types.push(Type::Float64);
        let a0 = func.instructions.push(Instruction {
            opcode: Opcode::GetArgument,
            operands: Operands::Nullary,
            result_type: Some(int_ty),
            block: func.entry,
        });
        let a1 = func.instructions.push(Instruction {
            opcode: Opcode::GetArgument,
            operands: Operands::Nullary,
            result_type: Some(int_ty),
            block: func.entry,
        });
        let a2 = func.instructions.push(Instruction {
            opcode: Opcode::GetArgument,
            operands: Operands::Nullary,
            result_type: Some(float_ty),
            block: func.entry,
        });
        let invoke = func.instructions.push(Instruction {
            opcode: Opcode::Invoke,
            operands: Operands::Invoke {
                callee: CallTarget::Direct(callee_id),
                args: smallvec::smallvec![a0, a1, a2],
                variadic: true,
            },
            result_type: None,
            block: func.entry,
        });

        let config = Config::builder().build();
        let mut state = ModuleState::default();
        let mut fc = cx(&func, &module, &config, &mut state);
        fc.allocations[a0] = RegisterAllocation::Gpr(Gpr::Rax);
        fc.allocations[a1] = RegisterAllocation::Gpr(Gpr::Rbx);
        fc.allocations[a2] = RegisterAllocation::Fpr(Xmm::Xmm3);
        fc.allocations[invoke] = RegisterAllocation::None;

        let mut em = TextEmitter::new(Syntax::X86_64Att);
        translate_invoke(&mut fc, &mut em, invoke, &func.instructions[invoke]).unwrap();

        assert!(em.buffer.contains("rax"), "vararg SSE count must load into rax/al:\n{}", em.buffer);
        assert!(em.buffer.contains("call"));
        assert!(em.buffer.contains("rdi"));
        assert!(em.buffer.contains("rsi"));
        assert!(em.buffer.to_lowercase().contains("xmm0"));
        assert!(!fc.ledger.has_borrowed());
    }

    #[test]
    fn register_aggregate_return_walks_integer_then_sse_classes() {
        let mut em = TextEmitter::new(Syntax::X86_64Att);
        let classes = [EightbyteClass::Integer, EightbyteClass::Sse];
        lay_out_register_classes(&mut em, &classes, Gpr::Rbp, -16, false).unwrap();
        assert!(em.buffer.contains("rax"));
        assert!(em.buffer.to_lowercase().contains("xmm0"));
    }

    #[test]
    fn x87_pair_emits_a_single_fld() {
        let mut em = TextEmitter::new(Syntax::X86_64Att);
        let classes = [EightbyteClass::X87, EightbyteClass::X87Up];
        lay_out_register_classes(&mut em, &classes, Gpr::Rbp, -16, false).unwrap();
        assert_eq!(em.buffer.matches("fld").count(), 1);
    }

    // A function returning a register-aggregate must LOAD its buffer into
    // the ABI return registers (and `fld` the x87 pair), never STORE into
    // it -- storing would hand the caller back whatever garbage happened to
    // already be in rax/rdx/x87 instead of the function's actual result.
    #[test]
    fn returning_a_register_aggregate_loads_the_buffer_into_return_registers() {
        let return_kind = ReturnKind::Register(smallvec::smallvec![
            EightbyteClass::Integer,
            EightbyteClass::X87,
            EightbyteClass::X87Up,
        ]);
        let mut func = leaf_function("f", return_kind, false);
        let ptr = func.instructions.push(Instruction {
            opcode: Opcode::GetArgument,
            operands: Operands::Nullary,
            result_type: None,
            block: func.entry,
        });
        let ret = func.instructions.push(Instruction {
            opcode: Opcode::Return,
            operands: Operands::Unary(ptr),
            result_type: None,
            block: func.entry,
        });

        let module = empty_module();
        let config = Config::builder().build();
        let mut state = ModuleState::default();
        let mut fc = cx(&func, &module, &config, &mut state);
        fc.allocations[ptr] = RegisterAllocation::Gpr(Gpr::Rax);

        let mut em = TextEmitter::new(Syntax::X86_64Att);
        translate_return(&mut fc, &mut em, ret).unwrap();

        assert!(em.buffer.contains("rsi"), "the aggregate pointer must be loaded into rsi:\n{}", em.buffer);
        assert!(em.buffer.contains("mov"));
        assert_eq!(em.buffer.matches("fld").count(), 1, "x87 pair must fld, not fstp:\n{}", em.buffer);
        assert!(!em.buffer.contains("fstp"), "returning must never fstp into its own buffer:\n{}", em.buffer);
    }
}

fn emit_return_value(
    cx: &FunctionCodegen,
    emitter: &mut dyn AssemblyEmitter,
    result: Value,
    ret_kind: &ReturnKind,
) -> CodegenResult<()> {
    match ret_kind {
        ReturnKind::Void => {}
        ReturnKind::Integer => {
            crate::select::load_into(cx, emitter, result, Reg::Gpr(Gpr::Rax), Width::Qword)?;
        }
        ReturnKind::Float => {
            crate::select::load_into(cx, emitter, result, Reg::Xmm(Xmm::Xmm0), Width::Qword)?;
        }
        ReturnKind::LongDouble => {
            crate::select::load_into(cx, emitter, result, Reg::Gpr(Gpr::Rax), Width::Qword)?;
            emitter.x87(
                "fld",
                Some(Operand::Mem(MemOperand {
                    base: Some(Gpr::Rax),
                    disp: 0,
                    width: Some(Width::Tbyte),
                    ..Default::default()
                })),
            )?;
        }
        ReturnKind::Memory => {
            crate::select::load_into(cx, emitter, result, Reg::Gpr(Gpr::Rsi), Width::Qword)?;
            emitter.mov_reg_mem(
                Reg::Gpr(Gpr::Rdi),
                MemOperand {
                    base: Some(Gpr::Rbp),
                    disp: cx.frame.implicit_parameter_offset,
                    width: Some(Width::Qword),
                    ..Default::default()
                },
                Width::Qword,
            )?;
            emitter.mov_reg_reg(Reg::Gpr(Gpr::Rax), Reg::Gpr(Gpr::Rdi))?;
            let size = value_type(cx, result)?.size();
            emitter.mov_imm(Reg::Gpr(Gpr::Rcx), size as i64)?;
            emitter.cld()?;
            emitter.rep_movsb()?;
        }
        ReturnKind::Register(classes) => {
            crate::select::load_into(cx, emitter, result, Reg::Gpr(Gpr::Rsi), Width::Qword)?;
            lay_out_register_classes(emitter, classes, Gpr::Rsi, 0, false)?;
        }
    }
    Ok(())
}
