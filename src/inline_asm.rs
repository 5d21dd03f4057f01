//! Inline assembly lowering (component I, §4.I): GNU-style template
//! parsing, parameter constraint satisfaction, clobber/state preservation,
//! and jump-target trampolines.
//!
//! Grounded on `source/codegen/opt-system-v-amd64/code/inline_assembly/
//! {allocate_parameters,prepare_state,store_outputs,jump}.c` and the shared
//! header `codegen/opt-system-v-amd64/inline_assembly.h` in the original
//! implementation, plus the legacy template scanner's `match_parameter`/
//! `format_template` in `codegen/amd64/system-v/inline_assembly.c` for the
//! `%`-escape grammar (the optimizer-pipeline formatter itself was not
//! present in the retrieved source tree, only its header declaration).
//!
//! One deliberate simplification runs through this module: this IR binds
//! exactly one SSA value per declared parameter
//! (`Operands::InlineAsm::params`), where the original carries a separate
//! `read_ref`/`load_store_ref` pair for read-store parameters. Here a
//! `ReadStore` parameter is a `LoadStore` that additionally accepts a
//! `read_width` narrower than its natural size for the initial dereference,
//! satisfying the same "separate read/write props" requirement without a
//! second SSA ref. Matching ("tied") constraints, where one operand's
//! allocation is forced to reuse an earlier operand's register, are assumed
//! resolved upstream of this boundary; see `DESIGN.md`.

use rustc_hash::FxHashSet;
use smallvec::SmallVec;

use crate::alloc::StorageLocation;
use crate::config::Syntax;
use crate::emit::{AssemblyEmitter, MemOperand, Operand};
use crate::error::{err_invalid_request, err_invalid_state, err_not_found, err_not_supported, CodegenResult};
use crate::ir::{Block, Instruction, Operands, StringLiteralId, Type, Value};
use crate::reg::{width, Gpr, Reg, Width, Xmm, CALLEE_SAVED_GPR, CALLER_SAVED_GPR};
use crate::select::FunctionCodegen;
use crate::storage::transform::StorageTransform;

// ---------------------------------------------------------------------------
// Static fragment: module-scope IR data the (out-of-scope) front end builds.
// ---------------------------------------------------------------------------

/// How a declared parameter's operand may be satisfied (§3, §4.I step 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Constraint {
    Register,
    RegisterMemory,
    Memory,
    Immediate,
}

/// Whether the template sees the parameter's value directly, or an address
/// it reads and/or writes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamClass {
    /// Plain input: the bound value is used as-is.
    Read,
    /// The bound value is an address the template reads through once.
    Load,
    /// The bound value is an address the template writes through; no
    /// initial content is materialised.
    Store,
    /// The bound value is an address read before the template runs and
    /// written back afterwards.
    LoadStore,
    /// Like `LoadStore`, but the initial read may use a narrower width
    /// than the write-back (`read_width`).
    ReadStore,
}

impl ParamClass {
    fn is_output(self) -> bool {
        matches!(self, ParamClass::Store | ParamClass::LoadStore | ParamClass::ReadStore)
    }

    /// True unless the bound value is consumed directly (`Read`) -- i.e.
    /// the template operates through an address rather than on the value.
    fn is_addressed(self) -> bool {
        !matches!(self, ParamClass::Read)
    }
}

/// Payload for a `Constraint::Immediate` parameter.
#[derive(Debug, Clone)]
pub enum ImmediateValue {
    Integer(i64),
    /// A literal-based immediate: `label + offset`, where `label` names a
    /// module string literal.
    StringLiteral { literal: StringLiteralId, offset: i64 },
}

/// One declared template parameter.
#[derive(Debug, Clone)]
pub struct ParameterDecl {
    pub identifier: String,
    pub constraint: Constraint,
    pub klass: ParamClass,
    /// The operand's own type -- for an addressed class this is the
    /// *pointee* type, not the pointer type of the bound SSA value.
    pub ty: Type,
    /// Narrower read width for `ReadStore`'s initial dereference; `None`
    /// means the read uses `ty`'s own size (§3: "parameter_read_props").
    pub read_width: Option<Width>,
    /// Payload when `constraint == Immediate`; `None` otherwise.
    pub immediate: Option<ImmediateValue>,
}

/// A GNU-style inline assembly fragment: template text, clobber names, and
/// declared parameters/jump targets. Stored at module scope
/// (`Module::inline_asm`) and referenced by `Operands::InlineAsm::fragment`.
#[derive(Debug, Clone, Default)]
pub struct Fragment {
    pub template: String,
    /// Clobber names as written in the source asm statement (register
    /// names or `"cc"`); unrecognised names are silently ignored (§4.I step
    /// 1).
    pub clobbers: Vec<String>,
    pub parameters: Vec<ParameterDecl>,
    /// Jump-target identifiers, aligned by index with
    /// `Operands::InlineAsm::jump_targets`.
    pub jump_target_names: Vec<String>,
}

// ---------------------------------------------------------------------------
// Runtime allocation (§3 "Inline-assembly parameter entry" / "context").
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
enum AllocationType {
    Register(Gpr),
    RegisterIndirect(Gpr),
    /// Index into the shared stack-input-parameter area (only ever chosen
    /// for scalar, read-only parameters; see `allocate_memory`).
    Stack(u32),
}

struct ParamAlloc {
    allocation_type: AllocationType,
    register_aggregate: bool,
    /// Index into the stack-output-parameter area holding the preserved
    /// destination address, when this entry's allocation needs one (§3:
    /// "output_address_vreg"). Only ever `Some` alongside `Register`
    /// allocations -- `RegisterIndirect` already holds the address itself,
    /// and `Stack` is never chosen for an output-class parameter.
    output_address_slot: Option<u32>,
}

struct StackMap {
    input_parameter_offset: i64,
    output_parameter_offset: i64,
}

enum Matched {
    Parameter(usize),
    JumpTarget(usize),
}

// ---------------------------------------------------------------------------
// Entry point.
// ---------------------------------------------------------------------------

pub fn translate(
    cx: &mut FunctionCodegen,
    emitter: &mut dyn AssemblyEmitter,
    _value: Value,
    inst: &Instruction,
) -> CodegenResult<()> {
    let (fragment_id, params, jump_targets) = match &inst.operands {
        Operands::InlineAsm { fragment, params, jump_targets } => {
            (*fragment, params.clone(), jump_targets.clone())
        }
        _ => return Err(err_invalid_state("expected an InlineAsm operand")),
    };

    let fragment = cx.module.inline_asm[fragment_id].clone();
    if fragment.parameters.len() != params.len() {
        return Err(err_invalid_state("inline assembly parameter/operand count mismatch"));
    }
    if fragment.jump_target_names.len() != jump_targets.len() {
        return Err(err_invalid_state("inline assembly jump-target count mismatch"));
    }

    log::trace!(
        "lowering inline assembly fragment {:?}: {} parameter(s), {} jump target(s)",
        fragment_id,
        params.len(),
        jump_targets.len()
    );

    // Step 1: mark_clobbers.
    let (mut stash, dirty_cc) = mark_clobbers(&fragment);

    // Step 2: allocate_parameters.
    let (allocs, input_slot_count, output_slot_count, stack_input_base) =
        allocate_parameters(cx, &fragment, &mut stash)?;
    log::trace!(
        "inline assembly parameters allocated: {} input slot(s), {} output slot(s)",
        input_slot_count,
        output_slot_count
    );

    // Step 3: preserve_state.
    let (stack_map, preserved_reg_offset) = prepare_state(
        cx,
        emitter,
        &fragment,
        &params,
        &allocs,
        &stash,
        dirty_cc,
        input_slot_count,
        output_slot_count,
        stack_input_base,
    )?;

    // Step 4: format and emit the template text verbatim.
    let instance_id = cx.module_state.next_inline_asm_id();
    let trampoline_labels: Vec<String> =
        (0..jump_targets.len()).map(|i| trampoline_label(cx, inst.block, _value, i)).collect();
    let formatted = format_template(
        cx.config.syntax,
        &fragment,
        &allocs,
        &stack_map,
        stack_input_base,
        instance_id,
        &trampoline_labels,
    )?;
    for line in formatted.lines() {
        if !line.is_empty() {
            emitter.directive(line)?;
        }
    }

    // Steps 5-6: the default, fallthrough continuation.
    store_outputs(cx, emitter, &fragment, &params, &allocs, &stash, &stack_map, stack_input_base)?;
    restore_state(cx, emitter, &stash, dirty_cc, preserved_reg_offset)?;

    // Step 7: jump_trampolines.
    for (idx, &target) in jump_targets.iter().enumerate() {
        emitter.emit_label(&trampoline_labels[idx])?;
        store_outputs(cx, emitter, &fragment, &params, &allocs, &stash, &stack_map, stack_input_base)?;
        restore_state(cx, emitter, &stash, dirty_cc, preserved_reg_offset)?;
        crate::select::control::map_registers(cx, emitter, inst.block, target)?;
        emitter.jmp_label(&cx.block_label(target))?;
    }

    Ok(())
}

fn trampoline_label(cx: &FunctionCodegen, block: Block, inst_value: Value, jump_index: usize) -> String {
    cx.intra_block_label(block, inst_value.index() as u32 * 8 + jump_index as u32)
}

// ---------------------------------------------------------------------------
// Step 1: mark_clobbers.
// ---------------------------------------------------------------------------

fn mark_clobbers(fragment: &Fragment) -> (Vec<Reg>, bool) {
    let mut stash = Vec::new();
    let mut dirty_cc = false;
    for name in &fragment.clobbers {
        if name == "cc" || name == "flags" {
            dirty_cc = true;
        } else if let Some(reg) = reg_by_name(name) {
            stash_insert(&mut stash, reg);
        }
        // Unrecognised clobber names are silently ignored.
    }
    (stash, dirty_cc)
}

fn stash_insert(stash: &mut Vec<Reg>, reg: Reg) {
    if !stash.contains(&reg) {
        stash.push(reg);
    }
}

fn reg_by_name(name: &str) -> Option<Reg> {
    use Gpr::*;
    let gpr = match name {
        "rax" | "eax" | "ax" | "al" => Rax,
        "rbx" | "ebx" | "bx" | "bl" => Rbx,
        "rcx" | "ecx" | "cx" | "cl" => Rcx,
        "rdx" | "edx" | "dx" | "dl" => Rdx,
        "rsi" | "esi" | "si" | "sil" => Rsi,
        "rdi" | "edi" | "di" | "dil" => Rdi,
        "rbp" | "ebp" | "bp" | "bpl" => Rbp,
        "rsp" | "esp" | "sp" | "spl" => Rsp,
        "r8" | "r8d" | "r8w" | "r8b" => R8,
        "r9" | "r9d" | "r9w" | "r9b" => R9,
        "r10" | "r10d" | "r10w" | "r10b" => R10,
        "r11" | "r11d" | "r11w" | "r11b" => R11,
        "r12" | "r12d" | "r12w" | "r12b" => R12,
        "r13" | "r13d" | "r13w" | "r13b" => R13,
        "r14" | "r14d" | "r14w" | "r14b" => R14,
        "r15" | "r15d" | "r15w" | "r15b" => R15,
        _ => return xmm_by_name(name).map(Reg::Xmm),
    };
    Some(Reg::Gpr(gpr))
}

fn xmm_by_name(name: &str) -> Option<Xmm> {
    use Xmm::*;
    Some(match name {
        "xmm0" => Xmm0,
        "xmm1" => Xmm1,
        "xmm2" => Xmm2,
        "xmm3" => Xmm3,
        "xmm4" => Xmm4,
        "xmm5" => Xmm5,
        "xmm6" => Xmm6,
        "xmm7" => Xmm7,
        "xmm8" => Xmm8,
        "xmm9" => Xmm9,
        "xmm10" => Xmm10,
        "xmm11" => Xmm11,
        "xmm12" => Xmm12,
        "xmm13" => Xmm13,
        "xmm14" => Xmm14,
        "xmm15" => Xmm15,
        _ => return None,
    })
}

// ---------------------------------------------------------------------------
// Step 2: allocate_parameters.
// ---------------------------------------------------------------------------

/// Builds the available-register queue: ABI caller-saved then callee-saved
/// GPRs, excluding anything already stashed, free registers offered before
/// occupied ones (an occupied candidate is still usable -- `preserve_state`
/// will push it -- but a genuinely free register is always preferred).
fn build_available_queue(cx: &FunctionCodegen, stash: &[Reg]) -> Vec<Gpr> {
    let excluded: FxHashSet<Gpr> = stash.iter().filter_map(|r| r.as_gpr()).collect();
    let candidates: Vec<Gpr> = CALLER_SAVED_GPR
        .iter()
        .chain(CALLEE_SAVED_GPR.iter())
        .copied()
        .filter(|g| !excluded.contains(g))
        .collect();
    let mut queue: Vec<Gpr> =
        candidates.iter().copied().filter(|g| !cx.ledger.is_occupied(Reg::Gpr(*g))).collect();
    queue.extend(candidates.into_iter().filter(|g| cx.ledger.is_occupied(Reg::Gpr(*g))));
    queue
}

fn obtain_register(queue: &mut Vec<Gpr>, stash: &mut Vec<Reg>) -> CodegenResult<Gpr> {
    if queue.is_empty() {
        return Err(err_invalid_request(
            "no available register to satisfy an inline assembly constraint",
        ));
    }
    let reg = queue.remove(0);
    stash_insert(stash, Reg::Gpr(reg));
    Ok(reg)
}

fn allocate_parameters(
    cx: &FunctionCodegen,
    fragment: &Fragment,
    stash: &mut Vec<Reg>,
) -> CodegenResult<(Vec<ParamAlloc>, u32, u32, Option<Gpr>)> {
    let mut queue = build_available_queue(cx, stash);
    let mut allocs = Vec::with_capacity(fragment.parameters.len());
    let mut input_slot_count = 0u32;
    let mut output_slot_count = 0u32;
    let mut stack_input_base: Option<Gpr> = None;

    for decl in &fragment.parameters {
        if decl.constraint == Constraint::Immediate {
            allocs.push(ParamAlloc {
                allocation_type: AllocationType::Register(Gpr::Rax), // never consulted
                register_aggregate: false,
                output_address_slot: None,
            });
            continue;
        }

        let is_aggregate = decl.ty.is_aggregate();
        let size = decl.ty.size();

        let allocation_type = match decl.constraint {
            Constraint::Register => {
                if is_aggregate && size > 8 {
                    return Err(err_invalid_request(
                        "a register argument wider than 8 bytes is not supported",
                    ));
                }
                AllocationType::Register(obtain_register(&mut queue, stash)?)
            }
            Constraint::RegisterMemory => {
                if (!is_aggregate || size <= 8) && queue.len() > 1 {
                    AllocationType::Register(obtain_register(&mut queue, stash)?)
                } else {
                    allocate_memory(decl, &mut queue, stash, &mut input_slot_count, &mut stack_input_base)?
                }
            }
            Constraint::Memory => {
                allocate_memory(decl, &mut queue, stash, &mut input_slot_count, &mut stack_input_base)?
            }
            Constraint::Immediate => unreachable!(),
        };

        let register_aggregate = is_aggregate && matches!(allocation_type, AllocationType::Register(_));
        let output_address_slot = if decl.klass.is_output()
            && !matches!(allocation_type, AllocationType::RegisterIndirect(_))
        {
            let slot = output_slot_count;
            output_slot_count += 1;
            Some(slot)
        } else {
            None
        };

        allocs.push(ParamAlloc { allocation_type, register_aggregate, output_address_slot });
    }

    Ok((allocs, input_slot_count, output_slot_count, stack_input_base))
}

/// A `memory` constraint (or a `register_memory` constraint that fell back
/// to memory) allocates a genuine stack slot holding the *value* only for
/// scalar, read-only parameters; every other case needs a register holding
/// the *address*, since the asm body (or the store-back step) will write
/// through it.
fn allocate_memory(
    decl: &ParameterDecl,
    queue: &mut Vec<Gpr>,
    stash: &mut Vec<Reg>,
    input_slot_count: &mut u32,
    stack_input_base: &mut Option<Gpr>,
) -> CodegenResult<AllocationType> {
    let is_read_only_scalar = !decl.ty.is_aggregate() && matches!(decl.klass, ParamClass::Read);
    if is_read_only_scalar {
        if stack_input_base.is_none() {
            *stack_input_base = Some(obtain_register(queue, stash)?);
        }
        let index = *input_slot_count;
        *input_slot_count += 1;
        Ok(AllocationType::Stack(index))
    } else {
        Ok(AllocationType::RegisterIndirect(obtain_register(queue, stash)?))
    }
}

fn width_for_size(size: u32) -> CodegenResult<Width> {
    Ok(match size {
        1 => Width::Byte,
        2 => Width::Word,
        3 | 4 => Width::Dword,
        5..=8 => Width::Qword,
        _ => {
            return Err(err_invalid_request(
                "an inline assembly operand wider than 8 bytes cannot occupy a register",
            ))
        }
    })
}

fn pad_aligned(value: i64, align: i64) -> i64 {
    (value + align - 1) / align * align
}

// ---------------------------------------------------------------------------
// Step 3: prepare_state.
// ---------------------------------------------------------------------------

fn preserve_dirty_registers(
    cx: &FunctionCodegen,
    emitter: &mut dyn AssemblyEmitter,
    stash: &[Reg],
) -> CodegenResult<i64> {
    let mut bytes = 0i64;
    for &reg in stash {
        if !cx.ledger.is_occupied(reg) {
            continue;
        }
        if reg.is_float() {
            emitter.sub_imm(Reg::Gpr(Gpr::Rsp), 8)?;
            let slot = MemOperand { width: Some(Width::Qword), ..MemOperand::based(Gpr::Rsp, 0) };
            emitter.raw("movq", &[Operand::Mem(slot), Operand::reg64(reg)])?;
        } else {
            emitter.push_reg(reg)?;
        }
        bytes += 8;
    }
    Ok(bytes)
}

fn restore_dirty_registers(
    cx: &FunctionCodegen,
    emitter: &mut dyn AssemblyEmitter,
    stash: &[Reg],
) -> CodegenResult<()> {
    for &reg in stash.iter().rev() {
        if !cx.ledger.is_occupied(reg) {
            continue;
        }
        if reg.is_float() {
            let slot = MemOperand { width: Some(Width::Qword), ..MemOperand::based(Gpr::Rsp, 0) };
            emitter.raw("movq", &[Operand::reg64(reg), Operand::Mem(slot)])?;
            emitter.add_imm(Reg::Gpr(Gpr::Rsp), 8)?;
        } else {
            emitter.pop_reg(reg)?;
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn prepare_state(
    cx: &mut FunctionCodegen,
    emitter: &mut dyn AssemblyEmitter,
    fragment: &Fragment,
    params: &[Value],
    allocs: &[ParamAlloc],
    stash: &[Reg],
    dirty_cc: bool,
    input_slot_count: u32,
    output_slot_count: u32,
    stack_input_base: Option<Gpr>,
) -> CodegenResult<(StackMap, i64)> {
    let mut preserved_bytes = preserve_dirty_registers(cx, emitter, stash)?;
    if dirty_cc {
        emitter.pushfq()?;
        preserved_bytes += 8;
    }

    let input_bytes = (input_slot_count as i64) * 8;
    let output_bytes = (output_slot_count as i64) * 8;
    let total = pad_aligned(preserved_bytes + input_bytes + output_bytes, 16);
    let input_parameter_offset = 0i64;
    let output_parameter_offset = input_bytes;
    let preserved_reg_offset = total - preserved_bytes;
    if preserved_reg_offset > 0 {
        emitter.sub_imm(Reg::Gpr(Gpr::Rsp), preserved_reg_offset)?;
    }
    let stack_map = StackMap { input_parameter_offset, output_parameter_offset };

    // Preserve output addresses: the asm body may clobber the register the
    // destination pointer currently lives in, so stash it first.
    let mut addr_transform = StorageTransform::new();
    for (alloc, &param) in allocs.iter().zip(params) {
        let Some(slot) = alloc.output_address_slot else { continue };
        let src = StorageLocation::from_allocation(cx.alloc_of(param), &cx.frame);
        let dest = StorageLocation::Memory {
            base: Gpr::Rsp,
            offset: output_parameter_offset + (slot as i64) * 8,
        };
        addr_transform.add(dest, src, Width::Qword);
    }
    addr_transform.perform(&mut cx.ledger, emitter)?;

    // Load inputs: a pure write-only register/stack `Store` parameter gets
    // nothing loaded (its slot starts empty, populated by the asm body);
    // every other non-immediate parameter moves its bound value/address
    // into its allocated location.
    let mut input_transform = StorageTransform::new();
    for (decl, (alloc, &param)) in fragment.parameters.iter().zip(allocs.iter().zip(params)) {
        if decl.constraint == Constraint::Immediate {
            continue;
        }
        if matches!(decl.klass, ParamClass::Store)
            && !matches!(alloc.allocation_type, AllocationType::RegisterIndirect(_))
        {
            continue;
        }
        let src = StorageLocation::from_allocation(cx.alloc_of(param), &cx.frame);
        let dest = match alloc.allocation_type {
            AllocationType::Register(r) | AllocationType::RegisterIndirect(r) => {
                StorageLocation::Register(Reg::Gpr(r))
            }
            AllocationType::Stack(index) => StorageLocation::Memory {
                base: Gpr::Rsp,
                offset: input_parameter_offset + (index as i64) * 8,
            },
        };
        input_transform.add(dest, src, Width::Qword);
    }
    input_transform.perform(&mut cx.ledger, emitter)?;

    // Dereference in place: `Register`/`Stack` allocations of an addressed
    // class presently hold the *address*; turn it into the value the
    // template actually operates on. `RegisterIndirect` is left untouched
    // (the template dereferences `[reg]` explicitly).
    for (decl, alloc) in fragment.parameters.iter().zip(allocs.iter()) {
        if decl.constraint == Constraint::Immediate || !decl.klass.is_addressed() {
            continue;
        }
        if matches!(decl.klass, ParamClass::Store)
            && !matches!(alloc.allocation_type, AllocationType::RegisterIndirect(_))
        {
            continue;
        }
        match alloc.allocation_type {
            AllocationType::RegisterIndirect(_) => {}
            AllocationType::Register(reg) => {
                let w = match decl.read_width {
                    Some(rw) => rw,
                    None => width_for_size(decl.ty.size().min(8))?,
                };
                let mem = MemOperand { width: Some(w), ..MemOperand::based(reg, 0) };
                emitter.mov_reg_mem(Reg::Gpr(reg), mem, w)?;
            }
            AllocationType::Stack(index) => {
                if decl.ty.is_aggregate() {
                    return Err(err_not_supported(
                        "an aggregate inline assembly operand cannot be bound to a stack slot",
                    ));
                }
                let base = stack_input_base.ok_or_else(|| {
                    err_invalid_state("a stack-bound inline assembly parameter has no base register")
                })?;
                let w = match decl.read_width {
                    Some(rw) => rw,
                    None => width_for_size(decl.ty.size())?,
                };
                let slot = MemOperand {
                    width: Some(Width::Qword),
                    ..MemOperand::based(base, input_parameter_offset + (index as i64) * 8)
                };
                emitter.mov_reg_mem(Reg::Gpr(base), slot.clone(), Width::Qword)?;
                let deref = MemOperand { width: Some(w), ..MemOperand::based(base, 0) };
                emitter.mov_reg_mem(Reg::Gpr(base), deref, w)?;
                emitter.mov_mem_reg(slot, Reg::Gpr(base), Width::Qword)?;
            }
        }
    }

    if let Some(base) = stack_input_base {
        emitter.mov_reg_reg(Reg::Gpr(base), Reg::Gpr(Gpr::Rsp))?;
    }

    Ok((stack_map, preserved_reg_offset))
}

// ---------------------------------------------------------------------------
// Step 4: format.
// ---------------------------------------------------------------------------

fn match_parameter(fragment: &Fragment, input: &str) -> CodegenResult<(usize, Matched)> {
    let mut best_len = 0usize;
    let mut best: Option<Matched> = None;
    for (idx, decl) in fragment.parameters.iter().enumerate() {
        if decl.identifier.len() > best_len && input.starts_with(decl.identifier.as_str()) {
            best_len = decl.identifier.len();
            best = Some(Matched::Parameter(idx));
        }
    }
    for (idx, name) in fragment.jump_target_names.iter().enumerate() {
        if name.len() > best_len && input.starts_with(name.as_str()) {
            best_len = name.len();
            best = Some(Matched::JumpTarget(idx));
        }
    }
    match best {
        Some(m) => Ok((best_len, m)),
        None => Err(err_not_found(
            "no inline assembly parameter or jump target matches the template reference",
        )),
    }
}

#[allow(clippy::too_many_arguments)]
fn format_template(
    syntax: Syntax,
    fragment: &Fragment,
    allocs: &[ParamAlloc],
    stack_map: &StackMap,
    stack_input_base: Option<Gpr>,
    instance_id: u64,
    trampoline_labels: &[String],
) -> CodegenResult<String> {
    let chars: Vec<char> = fragment.template.chars().collect();
    let mut out = String::new();
    let mut i = 0usize;

    while i < chars.len() {
        if chars[i] != '%' {
            out.push(chars[i]);
            i += 1;
            continue;
        }
        let next = *chars
            .get(i + 1)
            .ok_or_else(|| err_invalid_state("inline assembly template ends with a dangling '%'"))?;

        match next {
            '%' | '{' | '|' | '}' => {
                out.push(next);
                i += 2;
            }
            '=' => {
                out.push_str(&instance_id.to_string());
                i += 2;
            }
            'l' => {
                let scan_start = i + 2;
                let rest: String = chars[scan_start..].iter().collect();
                let (len, matched) = match_parameter(fragment, &rest)?;
                push_matched(
                    &mut out, syntax, fragment, allocs, stack_map, stack_input_base, matched, None,
                    trampoline_labels,
                )?;
                i = scan_start + len;
            }
            'b' | 'w' | 'd' | 'q' => {
                let override_width = match next {
                    'b' => Width::Byte,
                    'w' => Width::Word,
                    'd' => Width::Dword,
                    'q' => Width::Qword,
                    _ => unreachable!(),
                };
                let scan_start = i + 2;
                let rest: String = chars[scan_start..].iter().collect();
                let (len, matched) = match_parameter(fragment, &rest)?;
                push_matched(
                    &mut out, syntax, fragment, allocs, stack_map, stack_input_base, matched,
                    Some(override_width), trampoline_labels,
                )?;
                i = scan_start + len;
            }
            _ => {
                let scan_start = i + 1;
                let rest: String = chars[scan_start..].iter().collect();
                let (len, matched) = match_parameter(fragment, &rest)?;
                push_matched(
                    &mut out, syntax, fragment, allocs, stack_map, stack_input_base, matched, None,
                    trampoline_labels,
                )?;
                i = scan_start + len;
            }
        }
    }

    Ok(out)
}

#[allow(clippy::too_many_arguments)]
fn push_matched(
    out: &mut String,
    syntax: Syntax,
    fragment: &Fragment,
    allocs: &[ParamAlloc],
    stack_map: &StackMap,
    stack_input_base: Option<Gpr>,
    matched: Matched,
    override_width: Option<Width>,
    trampoline_labels: &[String],
) -> CodegenResult<()> {
    match matched {
        Matched::JumpTarget(idx) => out.push_str(&trampoline_labels[idx]),
        Matched::Parameter(idx) => {
            let rendered =
                render_parameter(syntax, fragment, allocs, stack_map, stack_input_base, idx, override_width)?;
            out.push_str(&rendered);
        }
    }
    Ok(())
}

fn render_parameter(
    syntax: Syntax,
    fragment: &Fragment,
    allocs: &[ParamAlloc],
    stack_map: &StackMap,
    stack_input_base: Option<Gpr>,
    idx: usize,
    override_width: Option<Width>,
) -> CodegenResult<String> {
    let decl = &fragment.parameters[idx];
    if decl.constraint == Constraint::Immediate {
        let imm = decl
            .immediate
            .as_ref()
            .ok_or_else(|| err_invalid_state("an immediate inline assembly parameter has no value"))?;
        return Ok(render_immediate(syntax, imm));
    }

    let alloc = &allocs[idx];
    match alloc.allocation_type {
        AllocationType::Register(reg) => {
            let w = match override_width {
                Some(w) => w,
                None => width_for_size(decl.ty.size().min(8))?,
            };
            Ok(render_register_operand(syntax, Reg::Gpr(reg), w))
        }
        AllocationType::RegisterIndirect(reg) => {
            let prefix_width = match override_width {
                Some(w) => Some(w),
                None if matches!(decl.ty, Type::LongDouble) => Some(Width::Tbyte),
                None if decl.ty.is_aggregate() => None,
                None => Some(width_for_size(decl.ty.size().min(8)).unwrap_or(Width::Qword)),
            };
            Ok(render_memory_operand(syntax, reg, 0, prefix_width))
        }
        AllocationType::Stack(index) => {
            let base = stack_input_base.ok_or_else(|| {
                err_invalid_state("a stack-bound inline assembly parameter has no base register")
            })?;
            let w = match override_width {
                Some(w) => w,
                None => width_for_size(decl.ty.size())?,
            };
            let disp = stack_map.input_parameter_offset + (index as i64) * 8;
            Ok(render_memory_operand(syntax, base, disp, Some(w)))
        }
    }
}

fn render_register_operand(syntax: Syntax, reg: Reg, w: Width) -> String {
    let sized = width(reg, w);
    if syntax == Syntax::X86_64Att {
        format!("%{sized}")
    } else {
        sized.to_string()
    }
}

fn render_bare_gpr64(syntax: Syntax, g: Gpr) -> String {
    render_register_operand(syntax, Reg::Gpr(g), Width::Qword)
}

fn render_memory_operand(syntax: Syntax, base: Gpr, disp: i64, width_hint: Option<Width>) -> String {
    let base_str = render_bare_gpr64(syntax, base);
    match syntax {
        Syntax::X86_64Att => {
            if disp != 0 {
                format!("{disp}({base_str})")
            } else {
                format!("({base_str})")
            }
        }
        _ => {
            let prefix = width_hint.map(|w| format!("{} ptr ", w.ptr_keyword())).unwrap_or_default();
            if disp > 0 {
                format!("{prefix}[{base_str} + {disp}]")
            } else if disp < 0 {
                format!("{prefix}[{base_str} - {}]", -disp)
            } else {
                format!("{prefix}[{base_str}]")
            }
        }
    }
}

fn render_immediate(syntax: Syntax, imm: &ImmediateValue) -> String {
    let text = match imm {
        ImmediateValue::Integer(v) => v.to_string(),
        ImmediateValue::StringLiteral { literal, offset } => {
            let label = string_literal_label(*literal);
            match offset {
                0 => label,
                o if *o > 0 => format!("{label}+{o}"),
                o => format!("{label}{o}"),
            }
        }
    };
    if syntax == Syntax::X86_64Att {
        format!("${text}")
    } else {
        text
    }
}

fn string_literal_label(id: StringLiteralId) -> String {
    format!(".L.str.{}", id.index())
}

// ---------------------------------------------------------------------------
// Steps 5/6: store_outputs / restore_state.
// ---------------------------------------------------------------------------

/// Chooses (lazily pushing, at most once) a scratch register used to hold a
/// preserved output address while storing a result back through it. Never
/// collides with `own_reg` (the entry's own allocated register) or with the
/// stash/stack-input-base set; rotates away from a stale choice that would
/// now collide, popping it back first. A simplified rotation relative to
/// the original's bespoke rax/rcx/rdx juggling, but the same invariant.
fn pick_scratch(
    scratch: &mut Option<Gpr>,
    cx: &FunctionCodegen,
    emitter: &mut dyn AssemblyEmitter,
    excluded: &FxHashSet<Gpr>,
    own_reg: Gpr,
) -> CodegenResult<Gpr> {
    if let Some(current) = *scratch {
        if current != own_reg {
            return Ok(current);
        }
        emitter.pop_reg(Reg::Gpr(current))?;
        *scratch = None;
    }
    let next = [Gpr::Rax, Gpr::Rcx, Gpr::Rdx]
        .into_iter()
        .find(|g| *g != own_reg && !excluded.contains(g))
        .ok_or_else(|| {
            err_invalid_request("unable to find a scratch register for inline assembly output store-back")
        })?;
    if cx.ledger.is_occupied(Reg::Gpr(next)) {
        emitter.push_reg(Reg::Gpr(next))?;
    }
    *scratch = Some(next);
    Ok(next)
}

#[allow(clippy::too_many_arguments)]
fn store_outputs(
    cx: &mut FunctionCodegen,
    emitter: &mut dyn AssemblyEmitter,
    fragment: &Fragment,
    _params: &[Value],
    allocs: &[ParamAlloc],
    stash: &[Reg],
    stack_map: &StackMap,
    stack_input_base: Option<Gpr>,
) -> CodegenResult<()> {
    let excluded: FxHashSet<Gpr> =
        stash.iter().filter_map(|r| r.as_gpr()).chain(stack_input_base).collect();
    let mut scratch: Option<Gpr> = None;

    for (decl, alloc) in fragment.parameters.iter().zip(allocs.iter()) {
        let Some(slot) = alloc.output_address_slot else { continue };
        if alloc.register_aggregate {
            continue;
        }
        let AllocationType::Register(own_reg) = alloc.allocation_type else {
            return Err(err_invalid_state(
                "an inline assembly output-address slot requires a register-allocated parameter",
            ));
        };

        let chosen = pick_scratch(&mut scratch, cx, emitter, &excluded, own_reg)?;
        let addr_slot = MemOperand {
            width: Some(Width::Qword),
            ..MemOperand::based(Gpr::Rsp, stack_map.output_parameter_offset + (slot as i64) * 8)
        };
        emitter.mov_reg_mem(Reg::Gpr(chosen), addr_slot, Width::Qword)?;

        let w = width_for_size(decl.ty.size().min(8))?;
        let dest = MemOperand { width: Some(w), ..MemOperand::based(chosen, 0) };
        emitter.mov_mem_reg(dest, Reg::Gpr(own_reg), w)?;
    }

    if let Some(reg) = scratch {
        emitter.pop_reg(Reg::Gpr(reg))?;
    }

    // A separate final pass for register-aggregate outputs, each staged
    // through its own freshly borrowed address register (§4.I step 5).
    for alloc in allocs.iter() {
        if !alloc.register_aggregate {
            continue;
        }
        let Some(slot) = alloc.output_address_slot else { continue };
        let AllocationType::Register(own_reg) = alloc.allocation_type else { continue };

        let handle = cx.ledger.any_gpr(Some(&|g| g != own_reg), emitter)?;
        let addr_reg = handle.reg();
        let addr_slot = MemOperand {
            width: Some(Width::Qword),
            ..MemOperand::based(Gpr::Rsp, stack_map.output_parameter_offset + (slot as i64) * 8)
        };
        emitter.mov_reg_mem(Reg::Gpr(addr_reg), addr_slot, Width::Qword)?;
        let dest = MemOperand { width: Some(Width::Qword), ..MemOperand::based(addr_reg, 0) };
        emitter.mov_mem_reg(dest, Reg::Gpr(own_reg), Width::Qword)?;
        cx.ledger.release(handle, emitter)?;
    }

    Ok(())
}

fn restore_state(
    cx: &FunctionCodegen,
    emitter: &mut dyn AssemblyEmitter,
    stash: &[Reg],
    dirty_cc: bool,
    preserved_reg_offset: i64,
) -> CodegenResult<()> {
    if preserved_reg_offset > 0 {
        emitter.add_imm(Reg::Gpr(Gpr::Rsp), preserved_reg_offset)?;
    }
    if dirty_cc {
        emitter.popfq()?;
    }
    restore_dirty_registers(cx, emitter, stash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::RegisterAllocation;
    use crate::config::{Config, Syntax as Stx};
    use crate::emit::TextEmitter;
    use crate::frame::{FrameSizes, StackFrameMap};
    use crate::ir::{Block, BlockData, Function, Opcode, ParamId, ReturnKind, Type};
    use crate::select::{FunctionCodegen, ModuleState};
    use crate::storage::StorageLedger;
    use cranelift_entity::{EntityRef, PrimaryMap, SecondaryMap};

    fn empty_module_with(inline_asm: PrimaryMap<crate::ir::InlineAsmId, Fragment>) -> crate::ir::Module {
        crate::ir::Module {
            functions: PrimaryMap::new(),
            string_literals: PrimaryMap::new(),
            inline_asm,
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

    fn cx<'a>(
        func: &'a Function,
        module: &'a crate::ir::Module,
        config: &'a Config,
        state: &'a mut ModuleState,
    ) -> FunctionCodegen<'a> {
        let sizes = FrameSizes { uses_dynamic_scope: true, ..Default::default() };
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

    fn scalar_decl(identifier: &str, constraint: Constraint, klass: ParamClass) -> ParameterDecl {
        ParameterDecl { identifier: identifier.to_string(), constraint, klass, ty: Type::Int64, read_width: None, immediate: None }
    }

    #[test]
    fn longest_prefix_identifier_matching() {
        let fragment = Fragment {
            template: String::new(),
            clobbers: Vec::new(),
            parameters: vec![
                scalar_decl("a", Constraint::Register, ParamClass::Read),
                scalar_decl("ab", Constraint::Register, ParamClass::Read),
            ],
            jump_target_names: Vec::new(),
        };
        let (len, matched) = match_parameter(&fragment, "ab rest").unwrap();
        assert_eq!(len, 2);
        assert!(matches!(matched, Matched::Parameter(1)));
    }

    #[test]
    fn unmatched_reference_is_not_found() {
        let fragment = Fragment::default();
        let err = match_parameter(&fragment, "zzz").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
    }

    #[test]
    fn register_only_constraint_rejects_wide_aggregate() {
        let decl = ParameterDecl {
            identifier: "0".to_string(),
            constraint: Constraint::Register,
            klass: ParamClass::Read,
            ty: Type::Aggregate { size: 16, align: 8, classes: SmallVec::new() },
            read_width: None,
            immediate: None,
        };
        let fragment = Fragment { parameters: vec![decl], ..Fragment::default() };
        let (func, config) = build();
        let module = empty_module_with(PrimaryMap::new());
        let mut state = ModuleState::default();
        let mut fc = cx(&func, &module, &config, &mut state);
        let mut stash = Vec::new();
        let err = allocate_parameters(&mut fc, &fragment, &mut stash).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidRequest);
    }

    #[test]
    fn instance_id_is_unique_per_statement() {
        let mut state = ModuleState::default();
        let a = state.next_inline_asm_id();
        let b = state.next_inline_asm_id();
        assert_ne!(a, b);
    }

    #[test]
    fn two_input_params_allocate_distinct_registers() {
        let fragment = Fragment {
            template: "addq %1, %0".to_string(),
            clobbers: Vec::new(),
            parameters: vec![
                scalar_decl("0", Constraint::Register, ParamClass::LoadStore),
                scalar_decl("1", Constraint::Register, ParamClass::Read),
            ],
            jump_target_names: Vec::new(),
        };
        let (func, config) = build();
        let module = empty_module_with(PrimaryMap::new());
        let mut state = ModuleState::default();
        let mut fc = cx(&func, &module, &config, &mut state);
        let mut stash = Vec::new();
        let (allocs, _, output_slots, _) = allocate_parameters(&mut fc, &fragment, &mut stash).unwrap();
        let AllocationType::Register(r0) = allocs[0].allocation_type else { panic!("expected register") };
        let AllocationType::Register(r1) = allocs[1].allocation_type else { panic!("expected register") };
        assert_ne!(r0, r1);
        assert_eq!(output_slots, 1);
        assert!(allocs[0].output_address_slot.is_some());
        assert!(allocs[1].output_address_slot.is_none());
    }

    #[test]
    fn immediate_constraint_consumes_no_register() {
        let decl = ParameterDecl {
            identifier: "0".to_string(),
            constraint: Constraint::Immediate,
            klass: ParamClass::Read,
            ty: Type::Int32,
            read_width: None,
            immediate: Some(ImmediateValue::Integer(7)),
        };
        let fragment = Fragment { parameters: vec![decl], ..Fragment::default() };
        let (func, config) = build();
        let module = empty_module_with(PrimaryMap::new());
        let mut state = ModuleState::default();
        let mut fc = cx(&func, &module, &config, &mut state);
        let mut stash = Vec::new();
        let (allocs, input_slots, output_slots, base) =
            allocate_parameters(&mut fc, &fragment, &mut stash).unwrap();
        assert!(stash.is_empty());
        assert_eq!(input_slots, 0);
        assert_eq!(output_slots, 0);
        assert!(base.is_none());
        assert!(allocs[0].output_address_slot.is_none());

        let rendered =
            render_parameter(Stx::X86_64Att, &fragment, &allocs, &StackMap { input_parameter_offset: 0, output_parameter_offset: 0 }, None, 0, None)
                .unwrap();
        assert_eq!(rendered, "$7");
    }

    #[test]
    fn att_register_operand_has_percent_sigil() {
        let rendered = render_register_operand(Stx::X86_64Att, Reg::Gpr(Gpr::Rax), Width::Dword);
        assert_eq!(rendered, "%eax");
        let rendered = render_register_operand(Stx::X86_64IntelNoPrefix, Reg::Gpr(Gpr::Rax), Width::Dword);
        assert_eq!(rendered, "eax");
    }

    #[test]
    fn indirect_memory_operand_renders_address_only() {
        let rendered = render_memory_operand(Stx::X86_64Att, Gpr::Rdi, 0, None);
        assert_eq!(rendered, "(%rdi)");
    }

    #[test]
    fn end_to_end_read_store_round_trip_emits_balanced_prologue_epilogue() {
        // `"+r"(a)`-style single read-store operand: load a, run the asm,
        // store the result back through the preserved address.
        let fragment = Fragment {
            template: "incq %0".to_string(),
            clobbers: Vec::new(),
            parameters: vec![scalar_decl("0", Constraint::Register, ParamClass::LoadStore)],
            jump_target_names: Vec::new(),
        };
        let mut inline_asm = PrimaryMap::new();
        let fragment_id = inline_asm.push(fragment);
        let module = empty_module_with(inline_asm);

        let mut types = PrimaryMap::new();
        let ptr_ty = types.push(Type::Pointer);
        let mut blocks = PrimaryMap::new();
        let entry = blocks.push(BlockData { phis: Vec::new(), instructions: Vec::new() });
        let addr_value = crate::ir::Value::new(0);
        let asm_value = crate::ir::Value::new(1);
        let mut instructions = PrimaryMap::new();
        instructions.push(Instruction {
            opcode: Opcode::GetLocal,
            operands: Operands::Symbol { global: crate::ir::GlobalId::new(0), offset: 0 },
            result_type: Some(ptr_ty),
            block: entry,
        });
        let asm_inst = Instruction {
            opcode: Opcode::InlineAssembly,
            operands: Operands::InlineAsm {
                fragment: fragment_id,
                params: SmallVec::from_slice(&[addr_value]),
                jump_targets: SmallVec::new(),
            },
            result_type: None,
            block: entry,
        };
        instructions.push(asm_inst.clone());

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

        let config = Config::builder().build();
        let mut state = ModuleState::default();
        let mut fc = cx(&func, &module, &config, &mut state);
        fc.allocations[addr_value] = RegisterAllocation::Gpr(Gpr::Rbx);

        let mut em = TextEmitter::new(Stx::X86_64Att);
        translate(&mut fc, &mut em, asm_value, &asm_inst).unwrap();

        assert!(em.buffer.contains("incq"));
        assert_eq!(em.buffer.matches("push").count(), em.buffer.matches("pop").count());
        assert!(!fc.ledger.has_borrowed());
    }
}
