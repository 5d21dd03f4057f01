//! Vararg intrinsic translators (component G, §4.G table): `VarArgStart`,
//! `VarArgCopy`, `VarArgGet`.
//!
//! Grounded on `source/codegen/opt-system-v-amd64/code/{vararg,vararg_get}.c`.
//! That source reaches `VarArgGet`'s three cases by dispatching an IR type
//! visitor over the read type's tag; this IR instead classifies the type up
//! front (`abi::classify_scalar`, or the aggregate's precomputed `classes`),
//! so the three shapes below are plain match arms rather than registered
//! visitor callbacks. Register-classified aggregate varargs have no visitor
//! case there either (a bare "not supported" stub), so that shape stays
//! unsupported here too.

use crate::abi::EightbyteClass;
use crate::emit::{AssemblyEmitter, MemOperand};
use crate::error::{err_invalid_state, err_not_supported, CodegenResult};
use crate::ir::{Instruction, Operands, Type, Value};
use crate::reg::{Gpr, Reg, Width, Xmm};
use crate::select::{finish_result, load_into, FunctionCodegen};
use crate::storage::BorrowHandle;

const LOAD_INTEGER_VARARG_RUNTIME: &str = "__kefir_runtime_load_integer_vararg";
const LOAD_SSE_VARARG_RUNTIME: &str = "__kefir_runtime_load_sse_vararg";

/// `va_list`'s four fields, as byte offsets from the pointer value (§3: a
/// 24-byte structure `{gp_offset:u32, fp_offset:u32, overflow_arg_area:ptr,
/// reg_save_area:ptr}`).
const GP_OFFSET: i64 = 0;
const FP_OFFSET: i64 = 4;
const OVERFLOW_ARG_AREA: i64 = 8;
const REG_SAVE_AREA: i64 = 16;

fn dword_mem(base: Gpr, disp: i64) -> MemOperand {
    MemOperand { base: Some(base), disp, width: Some(Width::Dword), ..Default::default() }
}

fn qword_mem(base: Gpr, disp: i64) -> MemOperand {
    MemOperand { base: Some(base), disp, width: Some(Width::Qword), ..Default::default() }
}

/// `VarArgStart`: writes the two consumed-register counts (scaled to byte
/// offsets into the register-save area), then the `overflow_arg_area`/
/// `reg_save_area` pointers computed from the frame layout.
pub(crate) fn translate_start(
    cx: &mut FunctionCodegen,
    emitter: &mut dyn AssemblyEmitter,
    _value: Value,
    inst: &Instruction,
) -> CodegenResult<()> {
    let (list_ptr, consumed_int, consumed_sse) = match inst.operands {
        Operands::VarArgStart { list_ptr, consumed_int, consumed_sse } => {
            (list_ptr, consumed_int, consumed_sse)
        }
        _ => return Err(err_invalid_state("expected a VarArgStart operand")),
    };

    let list_alloc = cx.alloc_of(list_ptr).clone();
    let list_handle = cx.ledger.exclusive_allocated(&list_alloc, false, emitter)?;
    let list_reg = list_handle
        .reg()
        .as_gpr()
        .ok_or_else(|| err_invalid_state("va_list pointer must occupy a GPR"))?;
    load_into(cx, emitter, list_ptr, Reg::Gpr(list_reg), Width::Qword)?;

    let tmp = cx.ledger.any_gpr(Some(&|g: Gpr| g != list_reg), emitter)?;
    let tmp_reg = tmp.reg();

    // Integer args fill 6 eightbyte slots, SSE args fill 8 sixteen-byte
    // slots starting 48 bytes into the register-save area (§4.G: "the GPR
    // save slots precede the XMM save slots").
    emitter.mov_imm(tmp_reg, (consumed_int as i64) * 8)?;
    emitter.mov_mem_reg(dword_mem(list_reg, GP_OFFSET), tmp_reg, Width::Dword)?;
    emitter.mov_imm(tmp_reg, 48 + (consumed_sse as i64) * 16)?;
    emitter.mov_mem_reg(dword_mem(list_reg, FP_OFFSET), tmp_reg, Width::Dword)?;

    emitter.lea(
        tmp_reg,
        MemOperand::based(Gpr::Rbp, cx.frame.implicit_parameter_offset + cx.frame.incoming_stack_arg_bytes),
    )?;
    emitter.mov_mem_reg(qword_mem(list_reg, OVERFLOW_ARG_AREA), tmp_reg, Width::Qword)?;

    emitter.lea(tmp_reg, MemOperand::based(Gpr::Rbp, cx.frame.register_save_area_offset))?;
    emitter.mov_mem_reg(qword_mem(list_reg, REG_SAVE_AREA), tmp_reg, Width::Qword)?;

    cx.ledger.release(tmp, emitter)?;
    cx.ledger.release(list_handle, emitter)
}

/// `VarArgCopy`: three 8-byte field copies from `src`'s `va_list` to
/// `dest`'s, through a scratch GPR.
pub(crate) fn translate_copy(
    cx: &mut FunctionCodegen,
    emitter: &mut dyn AssemblyEmitter,
    _value: Value,
    inst: &Instruction,
) -> CodegenResult<()> {
    let (dest, src) = match inst.operands {
        Operands::VarArgCopy { dest, src } => (dest, src),
        _ => return Err(err_invalid_state("expected a VarArgCopy operand")),
    };

    let dest_alloc = cx.alloc_of(dest).clone();
    let src_alloc = cx.alloc_of(src).clone();
    let dest_handle = cx.ledger.exclusive_allocated(&dest_alloc, false, emitter)?;
    let dest_reg = dest_handle
        .reg()
        .as_gpr()
        .ok_or_else(|| err_invalid_state("va_list pointer must occupy a GPR"))?;
    let src_handle = cx.ledger.exclusive_allocated(&src_alloc, false, emitter)?;
    let src_reg = src_handle
        .reg()
        .as_gpr()
        .ok_or_else(|| err_invalid_state("va_list pointer must occupy a GPR"))?;
    let tmp = cx.ledger.any_gpr(Some(&|g: Gpr| g != dest_reg && g != src_reg), emitter)?;
    let tmp_reg = tmp.reg();

    load_into(cx, emitter, dest, Reg::Gpr(dest_reg), Width::Qword)?;
    load_into(cx, emitter, src, Reg::Gpr(src_reg), Width::Qword)?;

    for offset in [0i64, 8, 16] {
        emitter.mov_reg_mem(tmp_reg, qword_mem(src_reg, offset), Width::Qword)?;
        emitter.mov_mem_reg(qword_mem(dest_reg, offset), tmp_reg, Width::Qword)?;
    }

    cx.ledger.release(tmp, emitter)?;
    cx.ledger.release(src_handle, emitter)?;
    cx.ledger.release(dest_handle, emitter)
}

/// `VarArgGet`: dispatches on the read type's ABI class.
pub(crate) fn translate_get(
    cx: &mut FunctionCodegen,
    emitter: &mut dyn AssemblyEmitter,
    value: Value,
    inst: &Instruction,
) -> CodegenResult<()> {
    let (list_ptr, ty_id) = match inst.operands {
        Operands::VarArgGet { list_ptr, ty } => (list_ptr, ty),
        _ => return Err(err_invalid_state("expected a VarArgGet operand")),
    };
    let ty = cx.func.ty(ty_id).clone();

    match &ty {
        Type::Aggregate { classes, .. } if classes.iter().any(|c| *c == EightbyteClass::Memory) => {
            get_memory_aggregate(cx, emitter, value, list_ptr, &ty)
        }
        Type::Aggregate { .. } => {
            Err(err_not_supported("register-classified vararg aggregates are not supported"))
        }
        Type::LongDouble => Err(err_not_supported("long double varargs are not supported")),
        scalar if scalar.is_floating() => get_sse(cx, emitter, value, list_ptr),
        _ => get_integer(cx, emitter, value, list_ptr),
    }
}

/// Integer class: `rdi` holds the `va_list` pointer, the result comes back in
/// `rax` from a runtime helper that advances `gp_offset` (or falls back to
/// `overflow_arg_area` once the register-save area is exhausted).
fn get_integer(
    cx: &mut FunctionCodegen,
    emitter: &mut dyn AssemblyEmitter,
    value: Value,
    list_ptr: Value,
) -> CodegenResult<()> {
    let result_handle = cx.ledger.specific(Reg::Gpr(Gpr::Rax), emitter)?;
    let param_handle = cx.ledger.specific(Reg::Gpr(Gpr::Rdi), emitter)?;

    load_into(cx, emitter, list_ptr, param_handle.reg(), Width::Qword)?;
    emitter.call_symbol(LOAD_INTEGER_VARARG_RUNTIME)?;
    cx.module_state.required_runtime_functions.insert(LOAD_INTEGER_VARARG_RUNTIME);

    cx.ledger.release(param_handle, emitter)?;
    finish_and_release(cx, emitter, value, result_handle, Width::Qword)
}

/// SSE class: identical shape, but the result lands in `xmm0` and the
/// `va_list` pointer still travels through `rdi`, matching the SSE loader's
/// own calling convention in the original.
fn get_sse(
    cx: &mut FunctionCodegen,
    emitter: &mut dyn AssemblyEmitter,
    value: Value,
    list_ptr: Value,
) -> CodegenResult<()> {
    let result_handle = cx.ledger.specific(Reg::Xmm(Xmm::Xmm0), emitter)?;
    let param_handle = cx.ledger.specific(Reg::Gpr(Gpr::Rdi), emitter)?;

    load_into(cx, emitter, list_ptr, param_handle.reg(), Width::Qword)?;
    emitter.call_symbol(LOAD_SSE_VARARG_RUNTIME)?;
    cx.module_state.required_runtime_functions.insert(LOAD_SSE_VARARG_RUNTIME);

    cx.ledger.release(param_handle, emitter)?;
    finish_and_release(cx, emitter, value, result_handle, Width::Qword)
}

/// Memory-classified aggregate: align `overflow_arg_area` up to the type's
/// alignment if it exceeds 8 bytes, read the (now-aligned) pointer as the
/// result, then advance `overflow_arg_area` past the padded size. No
/// runtime call -- the original performs this case with plain pointer
/// arithmetic.
fn get_memory_aggregate(
    cx: &mut FunctionCodegen,
    emitter: &mut dyn AssemblyEmitter,
    value: Value,
    list_ptr: Value,
    ty: &Type,
) -> CodegenResult<()> {
    let result_alloc = cx.alloc_of(value).clone();
    let list_alloc = cx.alloc_of(list_ptr).clone();

    let result_handle = cx.ledger.exclusive_allocated(&result_alloc, false, emitter)?;
    let result_reg = result_handle
        .reg()
        .as_gpr()
        .ok_or_else(|| err_invalid_state("vararg memory-aggregate result must occupy a GPR"))?;
    let param_handle = cx.ledger.exclusive_allocated(&list_alloc, false, emitter)?;
    let param_reg = param_handle
        .reg()
        .as_gpr()
        .ok_or_else(|| err_invalid_state("va_list pointer must occupy a GPR"))?;
    let tmp = cx.ledger.any_gpr(Some(&|g: Gpr| g != result_reg && g != param_reg), emitter)?;

    load_into(cx, emitter, list_ptr, Reg::Gpr(param_reg), Width::Qword)?;

    let overflow_mem = qword_mem(param_reg, OVERFLOW_ARG_AREA);
    emitter.mov_reg_mem(Reg::Gpr(result_reg), overflow_mem.clone(), Width::Qword)?;

    let align = ty.align() as i64;
    if align > 8 {
        emitter.add_imm(Reg::Gpr(result_reg), align - 1)?;
        emitter.and_imm(Reg::Gpr(result_reg), -align)?;
    }

    let padded_size = ((ty.size() as i64) + 7) / 8 * 8;
    emitter.lea(tmp.reg(), MemOperand::based(result_reg, padded_size))?;
    emitter.mov_mem_reg(overflow_mem, tmp.reg(), Width::Qword)?;

    cx.ledger.release(tmp, emitter)?;
    cx.ledger.release(param_handle, emitter)?;
    finish_and_release(cx, emitter, value, result_handle, Width::Qword)
}

fn finish_and_release(
    cx: &mut FunctionCodegen,
    emitter: &mut dyn AssemblyEmitter,
    value: Value,
    handle: BorrowHandle,
    width: Width,
) -> CodegenResult<()> {
    finish_result(cx, emitter, value, &handle, width)?;
    cx.ledger.release(handle, emitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::RegisterAllocation;
    use crate::config::{Config, Syntax};
    use crate::emit::TextEmitter;
    use crate::frame::{FrameSizes, StackFrameMap};
    use crate::ir::{BlockData, Function, Opcode, ParamId, ReturnKind};
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

    fn build() -> (Function, Config) {
        let mut types = PrimaryMap::new();
        types.push(Type::Pointer);
        let mut blocks = PrimaryMap::new();
        let entry = blocks.push(BlockData { phis: Vec::new(), instructions: Vec::new() });
        let func = Function {
            name: "f".to_string(),
            params: PrimaryMap::<ParamId, _>::new(),
            return_kind: ReturnKind::Void,
            variadic: true,
            types,
            blocks,
            instructions: PrimaryMap::new(),
            block_order: vec![entry],
            reachable: std::iter::once(entry).collect(),
            entry,
        };
        (func, Config::builder().build())
    }

    fn cx<'a>(
        func: &'a Function,
        module: &'a crate::ir::Module,
        config: &'a Config,
        state: &'a mut ModuleState,
    ) -> FunctionCodegen<'a> {
        let sizes = FrameSizes { uses_vararg: true, ..Default::default() };
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
    fn vararg_copy_moves_three_qwords_through_a_scratch_register() {
        let (func, config) = build();
        let module = empty_module();
        let mut state = ModuleState::default();
        let mut fc = cx(&func, &module, &config, &mut state);
        let mut em = TextEmitter::new(Syntax::X86_64Att);

        let dest = Value::new(0);
        let src = Value::new(1);
        fc.allocations[dest] = RegisterAllocation::Gpr(Gpr::Rdi);
        fc.allocations[src] = RegisterAllocation::Gpr(Gpr::Rsi);

        let inst = Instruction {
            opcode: Opcode::VarArgCopy,
            operands: Operands::VarArgCopy { dest, src },
            result_type: None,
            block: fc.func.entry,
        };
        translate_copy(&mut fc, &mut em, Value::new(2), &inst).unwrap();
        assert_eq!(em.buffer.matches("mov").count(), 6);
        assert!(!fc.ledger.has_borrowed());
    }

    #[test]
    fn integer_vararg_get_calls_the_runtime_loader() {
        let (func, config) = build();
        let module = empty_module();
        let mut state = ModuleState::default();
        let mut fc = cx(&func, &module, &config, &mut state);
        let mut em = TextEmitter::new(Syntax::X86_64Att);

        let list_ptr = Value::new(0);
        fc.allocations[list_ptr] = RegisterAllocation::Gpr(Gpr::Rbx);
        let result = Value::new(1);
        fc.allocations[result] = RegisterAllocation::Gpr(Gpr::Rbx);
        let ty = fc.func.types.clone().push(Type::Int64);

        let inst = Instruction {
            opcode: Opcode::VarArgGet,
            operands: Operands::VarArgGet { list_ptr, ty },
            result_type: Some(ty),
            block: fc.func.entry,
        };
        translate_get(&mut fc, &mut em, result, &inst).unwrap();
        assert!(em.buffer.contains("call"));
        assert!(fc.module_state.required_runtime_functions.contains(LOAD_INTEGER_VARARG_RUNTIME));
        assert!(!fc.ledger.has_borrowed());
    }

    #[test]
    fn memory_aggregate_vararg_get_advances_overflow_area_without_a_runtime_call() {
        let mut types = PrimaryMap::new();
        types.push(Type::Pointer);
        let agg_ty = types.push(Type::Aggregate {
            size: 24,
            align: 8,
            classes: smallvec::smallvec![
                crate::abi::EightbyteClass::Memory,
                crate::abi::EightbyteClass::Memory,
                crate::abi::EightbyteClass::Memory
            ],
        });

        let mut blocks = PrimaryMap::new();
        let entry = blocks.push(BlockData { phis: Vec::new(), instructions: Vec::new() });
        let func = Function {
            name: "f".to_string(),
            params: PrimaryMap::<ParamId, _>::new(),
            return_kind: ReturnKind::Void,
            variadic: true,
            types,
            blocks,
            instructions: PrimaryMap::new(),
            block_order: vec![entry],
            reachable: std::iter::once(entry).collect(),
            entry,
        };
        let config = Config::builder().build();
        let module = empty_module();
        let mut state = ModuleState::default();
        let mut fc = cx(&func, &module, &config, &mut state);
        let mut em = TextEmitter::new(Syntax::X86_64Att);

        let list_ptr = Value::new(0);
        fc.allocations[list_ptr] = RegisterAllocation::Gpr(Gpr::Rbx);
        let result = Value::new(1);
        fc.allocations[result] = RegisterAllocation::Gpr(Gpr::Rcx);

        let inst = Instruction {
            opcode: Opcode::VarArgGet,
            operands: Operands::VarArgGet { list_ptr, ty: agg_ty },
            result_type: Some(agg_ty),
            block: fc.func.entry,
        };
        translate_get(&mut fc, &mut em, result, &inst).unwrap();
        assert!(!em.buffer.contains("call"));
        assert!(!fc.ledger.has_borrowed());
    }
}
