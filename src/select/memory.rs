//! Memory access translators (component G): scalar loads/stores, local and
//! global address materialization, argument-spill preamble, and bulk
//! copy/zero (§4.G table rows for `Int*Load*/Int*Store`, `GetLocal`,
//! `GetGlobal`, `GetArgument`, `MemoryCopy`, `ZeroMemory`).
//!
//! Grounded on `source/codegen/opt-system-v-amd64/code/{memory,
//! get_argument,data_access}.c`.

use crate::emit::{AssemblyEmitter, MemOperand, Operand};
use crate::error::{err_invalid_state, err_not_supported, CodegenResult};
use crate::ir::{Instruction, Opcode, Operands, Value};
use crate::reg::{Gpr, Reg, Width};
use crate::select::{
    acquire_result_register, finish_result, load_into, require_register, result_is_float,
    FunctionCodegen,
};

fn unary_operand(inst: &Instruction) -> CodegenResult<Value> {
    match inst.operands {
        Operands::Unary(v) => Ok(v),
        _ => Err(err_invalid_state("expected a unary pointer operand")),
    }
}

fn load_shape(opcode: Opcode) -> (Width, bool) {
    use Opcode::*;
    match opcode {
        Int8LoadSigned => (Width::Byte, true),
        Int8LoadUnsigned => (Width::Byte, false),
        Int16LoadSigned => (Width::Word, true),
        Int16LoadUnsigned => (Width::Word, false),
        Int32LoadSigned => (Width::Dword, true),
        Int32LoadUnsigned => (Width::Dword, false),
        Int64Load => (Width::Qword, false),
        _ => unreachable!("not a load opcode"),
    }
}

fn store_width(opcode: Opcode) -> Width {
    use Opcode::*;
    match opcode {
        Int8Store => Width::Byte,
        Int16Store => Width::Word,
        Int32Store => Width::Dword,
        Int64Store => Width::Qword,
        _ => unreachable!("not a store opcode"),
    }
}

/// `Int{8,16,32,64}Load{Signed,Unsigned}`: dereference the pointer operand
/// straight into the result register, zero- or sign-extending sub-qword
/// widths.
pub(crate) fn translate_load(
    cx: &mut FunctionCodegen,
    emitter: &mut dyn AssemblyEmitter,
    value: Value,
    inst: &Instruction,
) -> CodegenResult<()> {
    let ptr = unary_operand(inst)?;
    let (width, signed) = load_shape(inst.opcode);
    let ptr_reg = require_register(cx, ptr)?;

    let result_alloc = cx.alloc_of(value).clone();
    let is_float = result_is_float(cx, inst);
    let handle = acquire_result_register(cx, emitter, &result_alloc, is_float, Some(ptr_reg))?;
    let result_reg = handle.reg();

    let mem = MemOperand { base: ptr_reg.as_gpr(), width: Some(width), ..Default::default() };
    match width {
        Width::Qword => emitter.mov_reg_mem(result_reg, mem, width)?,
        _ if signed => emitter.movsx(result_reg, mem, width)?,
        _ => emitter.movzx(result_reg, mem, width)?,
    }

    finish_result(cx, emitter, value, &handle, Width::Qword)?;
    cx.ledger.release(handle, emitter)
}

/// `Int{8,16,32,64}Store`: materialise the value operand into a scratch GPR
/// (if not already in one) and store it through the pointer operand.
pub(crate) fn translate_store(
    cx: &mut FunctionCodegen,
    emitter: &mut dyn AssemblyEmitter,
    _value: Value,
    inst: &Instruction,
) -> CodegenResult<()> {
    let (ptr, src) = match inst.operands {
        Operands::Binary(a, b) => (a, b),
        _ => return Err(err_invalid_state("expected pointer/value operand pair for a store")),
    };
    let width = store_width(inst.opcode);
    let ptr_reg = require_register(cx, ptr)?;

    let src_reg = match cx.alloc_of(src).as_register() {
        Some(r) if !cx.ledger.is_borrowed(r) => r,
        _ => {
            let handle = cx.ledger.any_gpr(None, emitter)?;
            load_into(cx, emitter, src, handle.reg(), width)?;
            let reg = handle.reg();
            cx.ledger.release(handle, emitter)?;
            reg
        }
    };

    let mem = MemOperand { base: ptr_reg.as_gpr(), width: Some(width), ..Default::default() };
    emitter.mov_mem_reg(mem, src_reg, width)
}

/// `GetLocal`: `lea result, [rbp + locals_area_offset + offset]`, where
/// `offset` is the byte offset already resolved within the locals area
/// (mirroring `data_access.c`'s lookup into its locals layout table, folded
/// here into a direct byte offset since this IR carries it that way).
pub(crate) fn translate_get_local(
    cx: &mut FunctionCodegen,
    emitter: &mut dyn AssemblyEmitter,
    value: Value,
    inst: &Instruction,
) -> CodegenResult<()> {
    let offset = match inst.operands {
        Operands::Symbol { offset, .. } => offset,
        _ => return Err(err_invalid_state("expected a Symbol operand for GetLocal")),
    };

    let result_alloc = cx.alloc_of(value).clone();
    let handle = acquire_result_register(cx, emitter, &result_alloc, false, None)?;
    let addr = MemOperand::based(Gpr::Rbp, cx.frame.locals_area_offset + offset);
    emitter.lea(handle.reg(), addr)?;

    finish_result(cx, emitter, value, &handle, Width::Qword)?;
    cx.ledger.release(handle, emitter)
}

/// `GetGlobal`: `lea result, [symbol(rip)]`, with an extra `add` for a
/// non-zero offset since a rip-relative `lea` cannot carry both a symbol and
/// a displacement in the same operand (§3 storage-location union).
pub(crate) fn translate_get_global(
    cx: &mut FunctionCodegen,
    emitter: &mut dyn AssemblyEmitter,
    value: Value,
    inst: &Instruction,
) -> CodegenResult<()> {
    let (global, offset) = match inst.operands {
        Operands::Symbol { global, offset } => (global, offset),
        _ => return Err(err_invalid_state("expected a Symbol operand for GetGlobal")),
    };
    let symbol = cx.module.global_symbol(global).to_string();

    let result_alloc = cx.alloc_of(value).clone();
    let handle = acquire_result_register(cx, emitter, &result_alloc, false, None)?;
    emitter.lea(handle.reg(), MemOperand::symbol(symbol))?;
    if offset != 0 {
        emitter.add_imm(handle.reg(), offset)?;
    }

    finish_result(cx, emitter, value, &handle, Width::Qword)?;
    cx.ledger.release(handle, emitter)
}

/// `GetArgument`: a no-op unless the result allocation is a spill slot
/// backed by a parameter's ABI classification (`get_argument.c`); in that
/// case, materialise every eightbyte from the register it arrived in.
pub(crate) fn translate_get_argument(
    cx: &mut FunctionCodegen,
    emitter: &mut dyn AssemblyEmitter,
    value: Value,
    _inst: &Instruction,
) -> CodegenResult<()> {
    let alloc = cx.alloc_of(value).clone();
    let (index, qwords) = match &alloc {
        crate::alloc::RegisterAllocation::SpillSlot { index, param_qwords: Some(qwords) } => {
            (*index, qwords.clone())
        }
        _ => return Ok(()),
    };

    for (i, qword) in qwords.iter().enumerate() {
        let offset = cx.frame.spill_slot_offset(index + i as u32);
        let mem = MemOperand::based(Gpr::Rbp, offset);
        match qword {
            crate::alloc::ParameterQword::Integer(gpr) => {
                emitter.mov_mem_reg(
                    MemOperand { width: Some(Width::Qword), ..mem },
                    Reg::Gpr(*gpr),
                    Width::Qword,
                )?;
            }
            crate::alloc::ParameterQword::Sse(xmm) => {
                emitter.pextrq(
                    Operand::Mem(MemOperand { width: Some(Width::Qword), ..mem }),
                    Reg::Xmm(*xmm),
                    0,
                )?;
            }
            crate::alloc::ParameterQword::Memory { .. } => {
                return Err(err_not_supported(
                    "aggregates with a memory-classified eightbyte among register-passed members are not supported",
                ));
            }
        }
    }
    Ok(())
}

/// `MemoryCopy`/`ZeroMemory` shared setup: place `dest`/`src` into
/// `rdi`/`rsi` through a storage transform so a cycle between the two
/// (e.g. a swap-like copy) is broken the same way argument placement is.
fn place_copy_pointers(
    cx: &mut FunctionCodegen,
    emitter: &mut dyn AssemblyEmitter,
    dest: Value,
    src: Option<Value>,
) -> CodegenResult<()> {
    use crate::alloc::StorageLocation;
    use crate::storage::transform::StorageTransform;

    let mut transform = StorageTransform::new();
    let dest_loc = StorageLocation::from_allocation(cx.alloc_of(dest), &cx.frame);
    transform.add(StorageLocation::Register(Reg::Gpr(Gpr::Rdi)), dest_loc, Width::Qword);
    if let Some(src) = src {
        let src_loc = StorageLocation::from_allocation(cx.alloc_of(src), &cx.frame);
        transform.add(StorageLocation::Register(Reg::Gpr(Gpr::Rsi)), src_loc, Width::Qword);
    }
    transform.perform(&mut cx.ledger, emitter)
}

/// `MemoryCopy`: `rdi`/`rsi` hold destination/source, `rcx` the byte count
/// (a runtime SSA value here, rather than a statically known type-layout
/// size as in `memory.c`); `cld; rep movsb`.
pub(crate) fn translate_memory_copy(
    cx: &mut FunctionCodegen,
    emitter: &mut dyn AssemblyEmitter,
    _value: Value,
    inst: &Instruction,
) -> CodegenResult<()> {
    let (dest, src, count) = match inst.operands {
        Operands::MemOp { dest, src: Some(src), count } => (dest, src, count),
        _ => return Err(err_invalid_state("expected a MemOp with a source for MemoryCopy")),
    };

    let rdi = cx.ledger.specific(Reg::Gpr(Gpr::Rdi), emitter)?;
    let rsi = cx.ledger.specific(Reg::Gpr(Gpr::Rsi), emitter)?;
    place_copy_pointers(cx, emitter, dest, Some(src))?;

    let rcx = cx.ledger.specific(Reg::Gpr(Gpr::Rcx), emitter)?;
    load_into(cx, emitter, count, Reg::Gpr(Gpr::Rcx), Width::Qword)?;

    emitter.cld()?;
    emitter.rep_movsb()?;

    cx.ledger.release(rcx, emitter)?;
    cx.ledger.release(rsi, emitter)?;
    cx.ledger.release(rdi, emitter)
}

/// `ZeroMemory`: `rdi` holds the destination, `rcx` the byte count, `al` is
/// cleared; `cld; rep stosb`.
pub(crate) fn translate_zero_memory(
    cx: &mut FunctionCodegen,
    emitter: &mut dyn AssemblyEmitter,
    _value: Value,
    inst: &Instruction,
) -> CodegenResult<()> {
    let (dest, count) = match inst.operands {
        Operands::MemOp { dest, src: None, count } => (dest, count),
        _ => return Err(err_invalid_state("expected a source-less MemOp for ZeroMemory")),
    };

    let rdi = cx.ledger.specific(Reg::Gpr(Gpr::Rdi), emitter)?;
    place_copy_pointers(cx, emitter, dest, None)?;

    let rax = cx.ledger.specific(Reg::Gpr(Gpr::Rax), emitter)?;
    emitter.raw("xor", &[Operand::reg64(Reg::Gpr(Gpr::Rax)), Operand::reg64(Reg::Gpr(Gpr::Rax))])?;

    let rcx = cx.ledger.specific(Reg::Gpr(Gpr::Rcx), emitter)?;
    load_into(cx, emitter, count, Reg::Gpr(Gpr::Rcx), Width::Qword)?;

    emitter.cld()?;
    emitter.rep_stosb()?;

    cx.ledger.release(rcx, emitter)?;
    cx.ledger.release(rax, emitter)?;
    cx.ledger.release(rdi, emitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::RegisterAllocation;
    use crate::config::{Config, Syntax};
    use crate::emit::TextEmitter;
    use crate::frame::{FrameSizes, StackFrameMap};
    use crate::ir::{BlockData, Function, ParamId, ReturnKind, Type};
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
        let types = PrimaryMap::new();
        let mut blocks = PrimaryMap::new();
        let entry = blocks.push(BlockData { phis: Vec::new(), instructions: Vec::new() });
        let func = Function {
            name: "f".to_string(),
            params: PrimaryMap::<ParamId, _>::new(),
            return_kind: ReturnKind::Void,
            variadic: false,
            types,
            blocks,
            instructions: PrimaryMap::new(),
            block_order: vec![entry],
            reachable: std::iter::once(entry).collect(),
            entry,
        };
        (func, Config::builder().build())
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

    // Scenario B: signed 8-bit load, sign-extended into the full register.
    #[test]
    fn signed_byte_load_uses_movsx() {
        let (func, config) = build();
        let module = empty_module();
        let mut state = ModuleState::default();
        let mut fc = cx(&func, &module, &config, &mut state);

        let ptr = crate::ir::Value::new(0);
        let result = crate::ir::Value::new(1);
        fc.allocations[ptr] = RegisterAllocation::Gpr(Gpr::Rdi);
        fc.allocations[result] = RegisterAllocation::Gpr(Gpr::Rax);

        let inst = Instruction {
            opcode: Opcode::Int8LoadSigned,
            operands: Operands::Unary(ptr),
            result_type: Some(Type::Int8),
            block: fc.func.entry,
        };
        let mut em = TextEmitter::new(Syntax::X86_64Att);
        translate_load(&mut fc, &mut em, result, &inst).unwrap();

        assert!(em.buffer.contains("movsx") || em.buffer.contains("movsb"));
        assert!(!fc.ledger.has_borrowed());
    }

    #[test]
    fn unsigned_byte_load_uses_movzx() {
        let (func, config) = build();
        let module = empty_module();
        let mut state = ModuleState::default();
        let mut fc = cx(&func, &module, &config, &mut state);

        let ptr = crate::ir::Value::new(0);
        let result = crate::ir::Value::new(1);
        fc.allocations[ptr] = RegisterAllocation::Gpr(Gpr::Rdi);
        fc.allocations[result] = RegisterAllocation::Gpr(Gpr::Rax);

        let inst = Instruction {
            opcode: Opcode::Int8LoadUnsigned,
            operands: Operands::Unary(ptr),
            result_type: Some(Type::Int8),
            block: fc.func.entry,
        };
        let mut em = TextEmitter::new(Syntax::X86_64Att);
        translate_load(&mut fc, &mut em, result, &inst).unwrap();

        assert!(em.buffer.contains("movzx") || em.buffer.contains("movzb"));
        assert!(!fc.ledger.has_borrowed());
    }

    #[test]
    fn qword_load_is_a_plain_mov() {
        let (func, config) = build();
        let module = empty_module();
        let mut state = ModuleState::default();
        let mut fc = cx(&func, &module, &config, &mut state);

        let ptr = crate::ir::Value::new(0);
        let result = crate::ir::Value::new(1);
        fc.allocations[ptr] = RegisterAllocation::Gpr(Gpr::Rdi);
        fc.allocations[result] = RegisterAllocation::Gpr(Gpr::Rax);

        let inst = Instruction {
            opcode: Opcode::Int64Load,
            operands: Operands::Unary(ptr),
            result_type: Some(Type::Int64),
            block: fc.func.entry,
        };
        let mut em = TextEmitter::new(Syntax::X86_64Att);
        translate_load(&mut fc, &mut em, result, &inst).unwrap();

        assert!(em.buffer.contains("mov"));
        assert!(!em.buffer.contains("movsx"));
        assert!(!em.buffer.contains("movzx"));
    }

    // Scenario F: memcpy lowering through rdi/rsi/rcx + rep movsb.
    #[test]
    fn memory_copy_places_pointers_and_count_then_rep_movsb() {
        let (func, config) = build();
        let module = empty_module();
        let mut state = ModuleState::default();
        let mut fc = cx(&func, &module, &config, &mut state);

        let dest = crate::ir::Value::new(0);
        let src = crate::ir::Value::new(1);
        let count = crate::ir::Value::new(2);
        fc.allocations[dest] = RegisterAllocation::Gpr(Gpr::Rax);
        fc.allocations[src] = RegisterAllocation::Gpr(Gpr::Rbx);
        fc.allocations[count] = RegisterAllocation::Gpr(Gpr::Rdx);

        let inst = Instruction {
            opcode: Opcode::MemoryCopy,
            operands: Operands::MemOp { dest, src: Some(src), count },
            result_type: None,
            block: fc.func.entry,
        };
        let mut em = TextEmitter::new(Syntax::X86_64Att);
        translate_memory_copy(&mut fc, &mut em, crate::ir::Value::new(3), &inst).unwrap();

        assert!(em.buffer.contains("rdi"));
        assert!(em.buffer.contains("rsi"));
        assert!(em.buffer.contains("rep") || em.buffer.contains("movsb"));
        assert!(!fc.ledger.has_borrowed());
    }

    #[test]
    fn zero_memory_clears_al_before_rep_stosb() {
        let (func, config) = build();
        let module = empty_module();
        let mut state = ModuleState::default();
        let mut fc = cx(&func, &module, &config, &mut state);

        let dest = crate::ir::Value::new(0);
        let count = crate::ir::Value::new(1);
        fc.allocations[dest] = RegisterAllocation::Gpr(Gpr::Rax);
        fc.allocations[count] = RegisterAllocation::Gpr(Gpr::Rdx);

        let inst = Instruction {
            opcode: Opcode::ZeroMemory,
            operands: Operands::MemOp { dest, src: None, count },
            result_type: None,
            block: fc.func.entry,
        };
        let mut em = TextEmitter::new(Syntax::X86_64Att);
        translate_zero_memory(&mut fc, &mut em, crate::ir::Value::new(2), &inst).unwrap();

        assert!(em.buffer.contains("xor"));
        assert!(em.buffer.contains("stosb") || em.buffer.contains("rep"));
        assert!(!fc.ledger.has_borrowed());
    }
}
