//! Bitfield extraction and insertion (§4.G table rows for
//! `BitsExtractSigned/Unsigned`, `BitsInsert`).
//!
//! Grounded on `source/codegen/opt-system-v-amd64/code/{extract_bits,
//! insert_bits}.c`.

use crate::emit::AssemblyEmitter;
use crate::error::{err_invalid_state, CodegenResult};
use crate::ir::{BitField, Instruction, Opcode, Operands, Value};
use crate::select::{acquire_result_register, finish_result, load_into, FunctionCodegen};

fn bitfield_operands(inst: &Instruction) -> CodegenResult<(Value, BitField, Option<Value>)> {
    match inst.operands {
        Operands::Bitfield { base, field, insert } => Ok((base, field, insert)),
        _ => Err(err_invalid_state("expected a bitfield operand")),
    }
}

/// `BitsExtractSigned/Unsigned`: load `base` into the result register, shift
/// the field up to the register's top bit, then shift back down arithmetic
/// (signed) or logical (unsigned) to sign/zero-extend it.
pub(crate) fn translate_extract(
    cx: &mut FunctionCodegen,
    emitter: &mut dyn AssemblyEmitter,
    value: Value,
    inst: &Instruction,
) -> CodegenResult<()> {
    let (base, field, _) = bitfield_operands(inst)?;

    let result_alloc = cx.alloc_of(value).clone();
    let handle = acquire_result_register(cx, emitter, &result_alloc, false, None)?;
    let result_reg = handle.reg();

    load_into(cx, emitter, base, result_reg, crate::reg::Width::Qword)?;

    let left = 64 - (field.length as u32 + field.offset as u32);
    emitter.shift_imm("shl", result_reg, left as u8)?;

    let mnemonic = match inst.opcode {
        Opcode::BitsExtractSigned => "sar",
        Opcode::BitsExtractUnsigned => "shr",
        _ => return Err(err_invalid_state("unexpected opcode reached translate_extract")),
    };
    let right = 64 - field.length as u32;
    emitter.shift_imm(mnemonic, result_reg, right as u8)?;

    finish_result(cx, emitter, value, &handle, crate::reg::Width::Qword)?;
    cx.ledger.release(handle, emitter)
}

/// `BitsInsert`: mask the field out of `base` with a precomputed `movabs`
/// constant, align the inserted value into the field via a shift-left then
/// shift-right pair, and `or` the two together.
pub(crate) fn translate_insert(
    cx: &mut FunctionCodegen,
    emitter: &mut dyn AssemblyEmitter,
    value: Value,
    inst: &Instruction,
) -> CodegenResult<()> {
    let (base, field, insert) = bitfield_operands(inst)?;
    let insert = insert.ok_or_else(|| err_invalid_state("BitsInsert requires an inserted value"))?;

    let result_alloc = cx.alloc_of(value).clone();
    let base_alloc = cx.alloc_of(base).clone();
    let result_handle = acquire_result_register(cx, emitter, &result_alloc, false, None)?;
    let base_handle = acquire_result_register(cx, emitter, &base_alloc, false, None)?;
    let tmp = cx.ledger.any_gpr(None, emitter)?;

    load_into(cx, emitter, insert, result_handle.reg(), crate::reg::Width::Qword)?;
    load_into(cx, emitter, base, base_handle.reg(), crate::reg::Width::Qword)?;

    let mask = !(((1u64 << field.length) - 1) << field.offset);
    emitter.movabs(tmp.reg(), mask)?;
    emitter.binop("and", base_handle.reg(), crate::emit::Operand::reg64(tmp.reg()))?;

    let left = 64 - field.length as u32;
    emitter.shift_imm("shl", result_handle.reg(), left as u8)?;
    let right = 64 - (field.length as u32 + field.offset as u32);
    emitter.shift_imm("shr", result_handle.reg(), right as u8)?;

    emitter.binop(
        "or",
        result_handle.reg(),
        crate::emit::Operand::reg64(base_handle.reg()),
    )?;

    cx.ledger.release(tmp, emitter)?;
    cx.ledger.release(base_handle, emitter)?;

    finish_result(cx, emitter, value, &result_handle, crate::reg::Width::Qword)?;
    cx.ledger.release(result_handle, emitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::RegisterAllocation;
    use crate::config::{Config, Syntax};
    use crate::emit::TextEmitter;
    use crate::frame::{FrameSizes, StackFrameMap};
    use crate::ir::{BlockData, Function, ParamId, ReturnKind, Type};
    use crate::reg::Gpr;
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

    #[test]
    fn signed_extract_uses_arithmetic_shift_right() {
        let (func, config) = build();
        let module = empty_module();
        let mut state = ModuleState::default();
        let mut fc = cx(&func, &module, &config, &mut state);

        let base = crate::ir::Value::new(0);
        let result = crate::ir::Value::new(1);
        fc.allocations[base] = RegisterAllocation::Gpr(Gpr::Rax);
        fc.allocations[result] = RegisterAllocation::Gpr(Gpr::Rbx);

        let inst = Instruction {
            opcode: Opcode::BitsExtractSigned,
            operands: Operands::Bitfield { base, field: BitField { offset: 4, length: 8 }, insert: None },
            result_type: Some(Type::Int64),
            block: fc.func.entry,
        };
        let mut em = TextEmitter::new(Syntax::X86_64Att);
        translate_extract(&mut fc, &mut em, result, &inst).unwrap();

        assert!(em.buffer.contains("shl"));
        assert!(em.buffer.contains("sar"));
        assert!(!fc.ledger.has_borrowed());
    }

    #[test]
    fn unsigned_extract_uses_logical_shift_right() {
        let (func, config) = build();
        let module = empty_module();
        let mut state = ModuleState::default();
        let mut fc = cx(&func, &module, &config, &mut state);

        let base = crate::ir::Value::new(0);
        let result = crate::ir::Value::new(1);
        fc.allocations[base] = RegisterAllocation::Gpr(Gpr::Rax);
        fc.allocations[result] = RegisterAllocation::Gpr(Gpr::Rbx);

        let inst = Instruction {
            opcode: Opcode::BitsExtractUnsigned,
            operands: Operands::Bitfield { base, field: BitField { offset: 0, length: 16 }, insert: None },
            result_type: Some(Type::Int64),
            block: fc.func.entry,
        };
        let mut em = TextEmitter::new(Syntax::X86_64Att);
        translate_extract(&mut fc, &mut em, result, &inst).unwrap();

        assert!(em.buffer.contains("shr"));
        assert!(!em.buffer.contains("sar"));
        assert!(!fc.ledger.has_borrowed());
    }

    #[test]
    fn insert_masks_base_then_ors_the_aligned_field() {
        let (func, config) = build();
        let module = empty_module();
        let mut state = ModuleState::default();
        let mut fc = cx(&func, &module, &config, &mut state);

        let base = crate::ir::Value::new(0);
        let insert_value = crate::ir::Value::new(1);
        let result = crate::ir::Value::new(2);
        fc.allocations[base] = RegisterAllocation::Gpr(Gpr::Rax);
        fc.allocations[insert_value] = RegisterAllocation::Gpr(Gpr::Rbx);
        fc.allocations[result] = RegisterAllocation::Gpr(Gpr::Rcx);

        let inst = Instruction {
            opcode: Opcode::BitsInsert,
            operands: Operands::Bitfield {
                base,
                field: BitField { offset: 8, length: 8 },
                insert: Some(insert_value),
            },
            result_type: Some(Type::Int64),
            block: fc.func.entry,
        };
        let mut em = TextEmitter::new(Syntax::X86_64Att);
        translate_insert(&mut fc, &mut em, result, &inst).unwrap();

        assert!(em.buffer.contains("movabs"));
        assert!(em.buffer.contains("and"));
        assert!(em.buffer.contains("or"));
        assert!(!fc.ledger.has_borrowed());
    }

    #[test]
    fn missing_insert_value_is_rejected() {
        let (func, config) = build();
        let module = empty_module();
        let mut state = ModuleState::default();
        let mut fc = cx(&func, &module, &config, &mut state);

        let base = crate::ir::Value::new(0);
        let result = crate::ir::Value::new(1);
        fc.allocations[base] = RegisterAllocation::Gpr(Gpr::Rax);
        fc.allocations[result] = RegisterAllocation::Gpr(Gpr::Rcx);

        let inst = Instruction {
            opcode: Opcode::BitsInsert,
            operands: Operands::Bitfield { base, field: BitField { offset: 8, length: 8 }, insert: None },
            result_type: Some(Type::Int64),
            block: fc.func.entry,
        };
        let mut em = TextEmitter::new(Syntax::X86_64Att);
        let err = translate_insert(&mut fc, &mut em, result, &inst).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidState);
    }
}
