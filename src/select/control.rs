//! Control-flow translators (component G, §4.G): `Jump`, `Branch`, `IJump`,
//! and the phi-mapping performed on every inter-block edge.
//!
//! Grounded on `source/codegen/opt-system-v-amd64/code/jump.c`, with one
//! deliberate simplification: rather than replicating that file's bespoke
//! index-sorted register-mapping algorithm, phi mapping here is expressed as
//! a batch [`crate::storage::transform::StorageTransform`] (the same
//! cycle-breaking engine call-argument placement and memory-copy pointer
//! setup already use), since both solve the identical "realise N destination
//! <- source pairs simultaneously" problem.

use crate::emit::AssemblyEmitter;
use crate::error::{err_invalid_state, CodegenResult};
use crate::ir::{Block, Instruction, Operands, Type, Value};
use crate::reg::Width;
use crate::select::{acquire_result_register, load_into, operand_of, FunctionCodegen};

fn locations_equal(a: &crate::alloc::StorageLocation, b: &crate::alloc::StorageLocation) -> bool {
    use crate::alloc::StorageLocation::*;
    match (a, b) {
        (Register(x), Register(y)) => x == y,
        (Memory { base: bx, offset: ox }, Memory { base: by, offset: oy }) => bx == by && ox == oy,
        _ => false,
    }
}

/// A long-double-typed phi's locations are always 10-byte x87 memory
/// operands; moving one is a bare `fld`/`fstp` pair rather than a qword
/// register/memory transfer, so it is realised directly instead of being
/// folded into the batch transform.
fn move_long_double(
    cx: &FunctionCodegen,
    emitter: &mut dyn AssemblyEmitter,
    dest: Value,
    src: Value,
) -> CodegenResult<()> {
    use crate::alloc::StorageLocation;

    let dest_loc = StorageLocation::from_allocation(cx.alloc_of(dest), &cx.frame);
    let src_loc = StorageLocation::from_allocation(cx.alloc_of(src), &cx.frame);
    if locations_equal(&dest_loc, &src_loc) {
        return Ok(());
    }
    let src_mem = src_loc
        .mem_operand(Width::Tbyte)
        .ok_or_else(|| err_invalid_state("long double phi source must be a memory location"))?;
    let dest_mem = dest_loc
        .mem_operand(Width::Tbyte)
        .ok_or_else(|| err_invalid_state("long double phi destination must be a memory location"))?;
    emitter.x87("fld", Some(crate::emit::Operand::Mem(src_mem)))?;
    emitter.x87("fstp", Some(crate::emit::Operand::Mem(dest_mem)))
}

/// Realises every phi of `target` whose incoming edge is `source`, moving
/// each incoming value into the phi result's allocation. Also used by
/// inline-asm jump trampolines (§4.I), which land on a declared jump-target
/// block exactly like any other edge and must map its phis the same way.
pub(crate) fn map_registers(
    cx: &mut FunctionCodegen,
    emitter: &mut dyn AssemblyEmitter,
    source: Block,
    target: Block,
) -> CodegenResult<()> {
    use crate::alloc::StorageLocation;
    use crate::storage::transform::StorageTransform;

    let mut transform = StorageTransform::new();
    for phi in &cx.func.blocks[target].phis {
        let Some(&(_, incoming)) = phi.incoming.iter().find(|(b, _)| *b == source) else {
            continue;
        };
        if matches!(cx.func.ty(phi.result_type), Type::LongDouble) {
            move_long_double(cx, emitter, phi.result, incoming)?;
            continue;
        }
        let dest_loc = StorageLocation::from_allocation(cx.alloc_of(phi.result), &cx.frame);
        let src_loc = StorageLocation::from_allocation(cx.alloc_of(incoming), &cx.frame);
        transform.add(dest_loc, src_loc, Width::Qword);
    }
    transform.perform(&mut cx.ledger, emitter)
}

/// True if any phi on the `source -> target` edge actually moves a value
/// (source and destination locations differ); used to decide whether a
/// conditional branch's "not taken" edge needs its own trampoline block
/// rather than falling straight through to `target`'s label.
fn has_mapped_registers(cx: &FunctionCodegen, source: Block, target: Block) -> bool {
    use crate::alloc::StorageLocation;

    cx.func.blocks[target].phis.iter().any(|phi| {
        phi.incoming.iter().find(|(b, _)| *b == source).is_some_and(|&(_, incoming)| {
            let dest_loc = StorageLocation::from_allocation(cx.alloc_of(phi.result), &cx.frame);
            let src_loc = StorageLocation::from_allocation(cx.alloc_of(incoming), &cx.frame);
            !locations_equal(&dest_loc, &src_loc)
        })
    })
}

fn jump_operands(inst: &Instruction) -> CodegenResult<Block> {
    match inst.operands {
        Operands::Jump { target } => Ok(target),
        _ => Err(err_invalid_state("expected a Jump operand")),
    }
}

/// `Jump`: map phis into the target block, then jump unless the target is
/// the immediately following block in linear layout order (a fallthrough).
pub(crate) fn translate_jump(
    cx: &mut FunctionCodegen,
    emitter: &mut dyn AssemblyEmitter,
    _value: Value,
    inst: &Instruction,
) -> CodegenResult<()> {
    let target = jump_operands(inst)?;
    map_registers(cx, emitter, inst.block, target)?;
    if cx.func.linear_successor(inst.block) != Some(target) {
        emitter.jmp_label(&cx.block_label(target))?;
    }
    Ok(())
}

/// `Branch`: materialise the condition into a borrowed GPR, `test reg, reg`,
/// then take the taken/not-taken edges. If the not-taken edge has its own
/// phi mapping to perform (or evicting the condition register required a
/// `push` that must be undone before either edge's mapping runs), the two
/// edges cannot share straight-line code: the not-taken edge gets its own
/// trampoline label after the taken edge's mapping and jump.
pub(crate) fn translate_branch(
    cx: &mut FunctionCodegen,
    emitter: &mut dyn AssemblyEmitter,
    value: Value,
    inst: &Instruction,
) -> CodegenResult<()> {
    let (cond, target, alternative) = match inst.operands {
        Operands::Branch { cond, target, alternative } => (cond, target, alternative),
        _ => return Err(err_invalid_state("expected a Branch operand")),
    };

    let cond_alloc = cx.alloc_of(cond).clone();
    let handle = acquire_result_register(cx, emitter, &cond_alloc, false, None)?;
    let reg = handle.reg();
    load_into(cx, emitter, cond, reg, Width::Qword)?;
    emitter.test(reg, crate::emit::Operand::reg64(reg))?;

    let separate_alternative = has_mapped_registers(cx, inst.block, alternative) || handle.evicted();
    cx.ledger.release(handle, emitter)?;

    // `value` (the Branch instruction's own key) is unique within the
    // block, so it doubles as the trampoline label's disambiguator without
    // needing a fresh counter.
    let alternative_label =
        if separate_alternative { Some(cx.intra_block_label(inst.block, value.index() as u32)) } else { None };

    match &alternative_label {
        Some(label) => emitter.jcc("z", label)?,
        None => emitter.jcc("z", &cx.block_label(alternative))?,
    }

    map_registers(cx, emitter, inst.block, target)?;
    if separate_alternative || cx.func.linear_successor(inst.block) != Some(target) {
        emitter.jmp_label(&cx.block_label(target))?;
    }

    if let Some(label) = alternative_label {
        emitter.emit_label(&label)?;
        map_registers(cx, emitter, inst.block, alternative)?;
        if cx.func.linear_successor(inst.block) != Some(alternative) {
            emitter.jmp_label(&cx.block_label(alternative))?;
        }
    }
    Ok(())
}

/// `IJump`: an unconditional jump through a computed address, register or
/// memory.
pub(crate) fn translate_ijump(
    cx: &mut FunctionCodegen,
    emitter: &mut dyn AssemblyEmitter,
    _value: Value,
    inst: &Instruction,
) -> CodegenResult<()> {
    let target = match inst.operands {
        Operands::IJump { target } => target,
        _ => return Err(err_invalid_state("expected an IJump operand")),
    };
    let operand = operand_of(cx, target, Width::Qword)?;
    emitter.raw("jmp", &[operand])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::RegisterAllocation;
    use crate::config::{Config, Syntax};
    use crate::emit::TextEmitter;
    use crate::frame::{FrameSizes, StackFrameMap};
    use crate::ir::{BlockData, Function, Opcode, ParamId, Phi, ReturnKind, Type};
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

    // Two blocks, `entry -> target`, with one phi whose incoming value on
    // the `entry` edge needs a real move (source and destination differ).
    fn build_two_blocks_with_phi() -> (Function, Block, Block, crate::ir::Value, crate::ir::Value) {
        let mut types = PrimaryMap::new();
        let int_ty = types.push(Type::Int64);

        let mut blocks = PrimaryMap::new();
        let target = blocks.push(BlockData { phis: Vec::new(), instructions: Vec::new() });
        let entry = blocks.push(BlockData { phis: Vec::new(), instructions: Vec::new() });

        let incoming_value = crate::ir::Value::new(0);
        let phi_result = crate::ir::Value::new(1);
        blocks[target].phis.push(Phi {
            result: phi_result,
            result_type: int_ty,
            incoming: vec![(entry, incoming_value)],
        });

        let func = Function {
            name: "f".to_string(),
            params: PrimaryMap::<ParamId, _>::new(),
            return_kind: ReturnKind::Void,
            variadic: false,
            types,
            blocks,
            instructions: PrimaryMap::new(),
            block_order: vec![entry, target],
            reachable: [entry, target].into_iter().collect(),
            entry,
        };
        (func, entry, target, incoming_value, phi_result)
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

    // Property 9: phi mapping preserves values across an edge whose source
    // and destination locations differ.
    #[test]
    fn phi_mapping_moves_the_incoming_value_into_the_result_location() {
        let (func, entry, target, incoming, phi_result) = build_two_blocks_with_phi();
        let config = Config::builder().build();
        let module = empty_module();
        let mut state = ModuleState::default();
        let mut fc = cx(&func, &module, &config, &mut state);
        fc.allocations[incoming] = RegisterAllocation::Gpr(Gpr::Rax);
        fc.allocations[phi_result] = RegisterAllocation::Gpr(Gpr::Rbx);

        let mut em = TextEmitter::new(Syntax::X86_64Att);
        map_registers(&mut fc, &mut em, entry, target).unwrap();

        assert!(em.buffer.contains("mov"));
        assert!(!fc.ledger.has_borrowed());
    }

    #[test]
    fn identical_phi_locations_emit_no_moves() {
        let (func, entry, target, incoming, phi_result) = build_two_blocks_with_phi();
        let config = Config::builder().build();
        let module = empty_module();
        let mut state = ModuleState::default();
        let mut fc = cx(&func, &module, &config, &mut state);
        fc.allocations[incoming] = RegisterAllocation::Gpr(Gpr::Rax);
        fc.allocations[phi_result] = RegisterAllocation::Gpr(Gpr::Rax);

        let mut em = TextEmitter::new(Syntax::X86_64Att);
        map_registers(&mut fc, &mut em, entry, target).unwrap();

        assert!(em.buffer.is_empty());
        assert!(!fc.ledger.has_borrowed());
    }

    #[test]
    fn jump_to_non_linear_successor_emits_an_explicit_jmp() {
        let (func, entry, target, incoming, phi_result) = build_two_blocks_with_phi();
        let config = Config::builder().build();
        let module = empty_module();
        let mut state = ModuleState::default();
        let mut fc = cx(&func, &module, &config, &mut state);
        fc.allocations[incoming] = RegisterAllocation::Gpr(Gpr::Rax);
        fc.allocations[phi_result] = RegisterAllocation::Gpr(Gpr::Rax);

        let inst = Instruction {
            opcode: Opcode::Jump,
            operands: Operands::Jump { target },
            result_type: None,
            block: entry,
        };
        let mut em = TextEmitter::new(Syntax::X86_64Att);
        translate_jump(&mut fc, &mut em, crate::ir::Value::new(2), &inst).unwrap();

        // `entry`'s linear successor is `target` here (block_order puts
        // target second), so no explicit jmp should have been emitted.
        assert!(!em.buffer.contains("jmp"));
    }
}
