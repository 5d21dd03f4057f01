//! Instruction selector (component G): the per-opcode dispatch table, and
//! the per-function translation context every translator closes over.

mod arith;
mod bits;
pub(crate) mod control;
mod float;
mod memory;
mod stack;
mod tls;
mod vararg;

use cranelift_entity::SecondaryMap;
use rustc_hash::FxHashSet;

use crate::alloc::RegisterAllocation;
use crate::config::Config;
use crate::emit::AssemblyEmitter;
use crate::error::{err_invalid_state, CodegenResult};
use crate::frame::StackFrameMap;
use crate::ir::{Function, Module, Opcode, Value};
use crate::storage::StorageLedger;

/// Module-level state that accumulates append-only during translation: the
/// set of rodata float-conversion/sign-mask constants actually referenced,
/// and the runtime helper symbols actually called (§5: "module-level state
/// ... is append-only during translation").
#[derive(Default)]
pub struct ModuleState {
    pub required_constants: FxHashSet<RodataConstant>,
    pub required_runtime_functions: FxHashSet<&'static str>,
    /// Monotonic counter handed out for each inline-asm instance's `%=`
    /// expansion (§4.I, §8 property 8: distinct instances get distinct
    /// integers within one emitted function).
    pub inline_asm_sequence: u64,
}

impl ModuleState {
    pub fn next_inline_asm_id(&mut self) -> u64 {
        let id = self.inline_asm_sequence;
        self.inline_asm_sequence += 1;
        id
    }
}

/// Named rodata constants the float translators may need to emit (§4.G:
/// `Float{32,64}Neg` sign masks, the uint-to-float/float-to-uint helper
/// constants). The module-level driver (out of scope) is responsible for
/// actually placing these in `.rodata`; the selector only records which
/// ones it used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RodataConstant {
    Float32SignMask,
    Float64SignMask,
    Float32ToUint64Bias,
    Float64ToUint64Bias,
}

impl RodataConstant {
    /// Symbol the module-level driver is expected to place this constant
    /// under in `.rodata`.
    pub fn label(self) -> &'static str {
        match self {
            RodataConstant::Float32SignMask => "__kefir_opt_float32_neg",
            RodataConstant::Float64SignMask => "__kefir_opt_float64_neg",
            RodataConstant::Float32ToUint64Bias => "__kefir_opt_float32_uint_bias",
            RodataConstant::Float64ToUint64Bias => "__kefir_opt_float64_uint_bias",
        }
    }
}

/// Everything a translator needs for one function: the IR view, the
/// precomputed frame layout and register allocation, the mutable storage
/// ledger, and a handle to the shared module-level state.
pub struct FunctionCodegen<'a> {
    pub module: &'a Module,
    pub func: &'a Function,
    pub config: &'a Config,
    pub frame: StackFrameMap,
    pub ledger: StorageLedger,
    pub allocations: SecondaryMap<Value, RegisterAllocation>,
    pub module_state: &'a mut ModuleState,
    /// Label of the function's epilogue, used by `Return` and any inline-asm
    /// trampoline that falls out of the function entirely.
    pub epilogue_label: String,
    pub function_label_prefix: String,
}

impl<'a> FunctionCodegen<'a> {
    pub fn alloc_of(&self, v: Value) -> &RegisterAllocation {
        &self.allocations[v]
    }

    pub fn block_label(&self, block: crate::ir::Block) -> String {
        format!("_kefir_func_{}_block{}", self.function_label_prefix, block.index())
    }

    pub fn intra_block_label(&self, block: crate::ir::Block, n: u32) -> String {
        format!(
            "_kefir_func_{}_block{}_label{}",
            self.function_label_prefix,
            block.index(),
            n
        )
    }
}

/// Dispatches one SSA instruction to its translator. Each translator is
/// free to consult `cx.module`/`cx.func` for operand allocations (via
/// `cx.alloc_of`), borrow scratch through `cx.ledger`, and emit through
/// `emitter`.
pub fn translate_instruction(
    cx: &mut FunctionCodegen,
    emitter: &mut dyn AssemblyEmitter,
    value: Value,
) -> CodegenResult<()> {
    let inst = cx.func.inst(value).clone();
    log::trace!("translating {:?}: {:?}", value, inst.opcode);
    use Opcode::*;
    match inst.opcode {
        IntAdd | IntSub | IntMul | IntAnd | IntOr | IntXor => {
            arith::translate_binary(cx, emitter, value, &inst)
        }
        IntLShift | IntRShift | IntARShift => arith::translate_shift(cx, emitter, value, &inst),
        IntDiv | IntUDiv | IntMod | IntUMod => arith::translate_div_mod(cx, emitter, value, &inst),
        IntEq | IntGreater | IntLesser | IntAbove | IntBelow => {
            arith::translate_int_compare(cx, emitter, value, &inst)
        }
        BoolAnd | BoolOr => arith::translate_bool_combine(cx, emitter, value, &inst),
        BitsExtractSigned | BitsExtractUnsigned => bits::translate_extract(cx, emitter, value, &inst),
        BitsInsert => bits::translate_insert(cx, emitter, value, &inst),
        Float32Add | Float32Sub | Float32Mul | Float32Div | Float64Add | Float64Sub
        | Float64Mul | Float64Div => float::translate_binary(cx, emitter, value, &inst),
        Float32Neg | Float64Neg => float::translate_neg(cx, emitter, value, &inst),
        FloatEq | FloatGreater | FloatLesser => float::translate_compare(cx, emitter, value, &inst),
        IntToFloat | UIntToFloat | FloatToInt | Float32ToFloat64 | Float64ToFloat32 => {
            float::translate_convert(cx, emitter, value, &inst)
        }
        LongDoubleAdd | LongDoubleSub | LongDoubleMul | LongDoubleDiv => {
            float::translate_long_double_binary(cx, emitter, value, &inst)
        }
        LongDoubleNeg => float::translate_long_double_neg(cx, emitter, value, &inst),
        LongDoubleStore => float::translate_long_double_store(cx, emitter, value, &inst),
        Int8LoadSigned | Int8LoadUnsigned | Int16LoadSigned | Int16LoadUnsigned
        | Int32LoadSigned | Int32LoadUnsigned | Int64Load => {
            memory::translate_load(cx, emitter, value, &inst)
        }
        Int8Store | Int16Store | Int32Store | Int64Store => {
            memory::translate_store(cx, emitter, value, &inst)
        }
        GetLocal => memory::translate_get_local(cx, emitter, value, &inst),
        GetGlobal => memory::translate_get_global(cx, emitter, value, &inst),
        GetArgument => memory::translate_get_argument(cx, emitter, value, &inst),
        MemoryCopy => memory::translate_memory_copy(cx, emitter, value, &inst),
        ZeroMemory => memory::translate_zero_memory(cx, emitter, value, &inst),
        StackAlloc => stack::translate_stack_alloc(cx, emitter, value, &inst),
        PushScope => stack::translate_push_scope(cx, emitter, value, &inst),
        PopScope => stack::translate_pop_scope(cx, emitter, value, &inst),
        ThreadLocalStorage => tls::translate(cx, emitter, value, &inst),
        Invoke => crate::call::translate_invoke(cx, emitter, value, &inst),
        Jump => control::translate_jump(cx, emitter, value, &inst),
        Branch => control::translate_branch(cx, emitter, value, &inst),
        IJump => control::translate_ijump(cx, emitter, value, &inst),
        Return => crate::call::translate_return(cx, emitter, value),
        VarArgStart => vararg::translate_start(cx, emitter, value, &inst),
        VarArgCopy => vararg::translate_copy(cx, emitter, value, &inst),
        VarArgGet => vararg::translate_get(cx, emitter, value, &inst),
        InlineAssembly => crate::inline_asm::translate(cx, emitter, value, &inst),
    }
}

/// Helper shared by most arithmetic/memory translators: fetch the
/// allocation-bound register for `v`, requiring it actually be a register
/// (not spilled), used when an opcode's contract demands operand 2 arrive
/// pre-materialised rather than accepting a memory operand.
pub(crate) fn require_register(
    cx: &FunctionCodegen,
    v: Value,
) -> CodegenResult<crate::reg::Reg> {
    cx.alloc_of(v)
        .as_register()
        .ok_or_else(|| err_invalid_state(format!("{v:?} is not bound to a register")))
}

pub(crate) fn result_is_float(cx: &FunctionCodegen, inst: &crate::ir::Instruction) -> bool {
    inst.result_type
        .map(|t| cx.func.ty(t).is_floating())
        .unwrap_or(false)
}

/// Projects `v`'s allocation into an [`crate::emit::Operand`] suitable as a
/// direct second-operand source: a width-projected register, or a sized
/// memory reference through the stack-frame map. Used whenever an opcode's
/// contract allows the second argument to be "register or memory" rather
/// than demanding it be pre-materialised in a register.
pub(crate) fn operand_of(
    cx: &FunctionCodegen,
    v: Value,
    width: crate::reg::Width,
) -> CodegenResult<crate::emit::Operand> {
    let alloc = cx.alloc_of(v);
    if let Some(reg) = alloc.as_register() {
        return Ok(crate::emit::Operand::Reg(reg, width));
    }
    let loc = crate::alloc::StorageLocation::from_allocation(alloc, &cx.frame);
    loc.mem_operand(width)
        .map(crate::emit::Operand::Mem)
        .ok_or_else(|| err_invalid_state(format!("{v:?} has no direct operand form")))
}

/// Loads `v`'s value into `dst`, regardless of whether it is presently a
/// register or a spilled memory location. A no-op when `v` already lives in
/// `dst`.
pub(crate) fn load_into(
    cx: &FunctionCodegen,
    emitter: &mut dyn AssemblyEmitter,
    v: Value,
    dst: crate::reg::Reg,
    width: crate::reg::Width,
) -> CodegenResult<()> {
    let alloc = cx.alloc_of(v);
    if alloc.as_register() == Some(dst) {
        return Ok(());
    }
    match crate::alloc::StorageLocation::from_allocation(alloc, &cx.frame) {
        crate::alloc::StorageLocation::Register(src) => emitter.mov_reg_reg(dst, src),
        crate::alloc::StorageLocation::Memory { base, offset } => emitter.mov_reg_mem(
            dst,
            crate::emit::MemOperand {
                base: Some(base),
                disp: offset,
                width: Some(width),
                ..Default::default()
            },
            width,
        ),
    }
}

/// Stores `src` back into `v`'s allocation, unless `v` is already allocated
/// to exactly `src` (in which case the value is already in place).
pub(crate) fn store_from(
    cx: &FunctionCodegen,
    emitter: &mut dyn AssemblyEmitter,
    v: Value,
    src: crate::reg::Reg,
    width: crate::reg::Width,
) -> CodegenResult<()> {
    let alloc = cx.alloc_of(v);
    if alloc.as_register() == Some(src) {
        return Ok(());
    }
    match crate::alloc::StorageLocation::from_allocation(alloc, &cx.frame) {
        crate::alloc::StorageLocation::Register(dst) => emitter.mov_reg_reg(dst, src),
        crate::alloc::StorageLocation::Memory { base, offset } => emitter.mov_mem_reg(
            crate::emit::MemOperand {
                base: Some(base),
                disp: offset,
                width: Some(width),
                ..Default::default()
            },
            src,
            width,
        ),
    }
}

/// Acquires a scratch/result register for `alloc`, by the same policy as
/// [`crate::storage::StorageLedger::exclusive_allocated`], except that the
/// "any free register" fallback excludes `avoid` when given. Binary-op
/// translators use this to guarantee the register picked to hold the result
/// is never the one the second operand is still allocated to, even when that
/// second operand's register happens to be the fallback's only unborrowed
/// candidate (§4.G binary-op contract, mirroring `filter_regs_allocation`).
pub(crate) fn acquire_result_register(
    cx: &mut FunctionCodegen,
    emitter: &mut dyn AssemblyEmitter,
    alloc: &RegisterAllocation,
    is_float: bool,
    avoid: Option<crate::reg::Reg>,
) -> CodegenResult<crate::storage::BorrowHandle> {
    if let Some(reg) = alloc.as_register() {
        if !cx.ledger.is_borrowed(reg) {
            return cx.ledger.acquire(reg, emitter);
        }
    }
    if is_float {
        cx.ledger.any_xmm(None, emitter)
    } else {
        match avoid.and_then(|r| r.as_gpr()) {
            Some(g) => cx
                .ledger
                .any_gpr(Some(&|candidate: crate::reg::Gpr| candidate != g), emitter),
            None => cx.ledger.any_gpr(None, emitter),
        }
    }
}

/// Stores the result of a translator back into its allocation if the
/// register it ended up computed in (`handle`) differs from the allocation's
/// own register (i.e. the allocation is a spill/aggregate slot, or a
/// distinct register had to be substituted).
pub(crate) fn finish_result(
    cx: &FunctionCodegen,
    emitter: &mut dyn AssemblyEmitter,
    value: Value,
    handle: &crate::storage::BorrowHandle,
    width: crate::reg::Width,
) -> CodegenResult<()> {
    store_from(cx, emitter, value, handle.reg(), width)
}
