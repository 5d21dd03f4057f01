//! A minimal model of the externally-owned SSA container this backend
//! consumes. The real front-end/optimizer's IR is out of scope (see the
//! module docs for [`crate`]); what's captured here is exactly the surface
//! the instruction selector dereferences: opcodes, operand tuples, and
//! types, addressed through arena indices rather than owning pointers so
//! that predecessors/phis/back-edges don't need unsafe graph plumbing.

use cranelift_entity::{entity_impl, PrimaryMap};
use smallvec::SmallVec;

/// Reference to an SSA instruction (and, for instructions that produce a
/// value, to that value -- this IR is single-assignment so the two coincide).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Value(u32);
entity_impl!(Value, "v");

/// Reference to a basic block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Block(u32);
entity_impl!(Block, "block");

/// Reference to a type table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId(u32);
entity_impl!(TypeId, "t");

/// Reference to a named global data object or function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GlobalId(u32);
entity_impl!(GlobalId, "g");

/// Reference to an interned string literal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StringLiteralId(u32);
entity_impl!(StringLiteralId, "str");

/// Reference to a parameter of the enclosing function, in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParamId(u32);
entity_impl!(ParamId, "arg");

/// IR type entry: enough shape information for ABI classification and for
/// the selector's per-opcode width decisions. Aggregates carry their own
/// System V classification precomputed by the (out-of-scope) front end,
/// since reclassifying on every lowering would duplicate §4.H's table.
#[derive(Debug, Clone, PartialEq)]
pub enum Type {
    Int8,
    Int16,
    Int32,
    Int64,
    Float32,
    Float64,
    LongDouble,
    Pointer,
    /// A struct/union/array passed or returned by value. `size`/`align` in
    /// bytes; `classes` is the System V eightbyte classification, one entry
    /// per 8-byte chunk (possibly empty only for zero-sized types).
    Aggregate {
        size: u32,
        align: u32,
        classes: SmallVec<[crate::abi::EightbyteClass; 4]>,
    },
}

impl Type {
    pub fn size(&self) -> u32 {
        match self {
            Type::Int8 => 1,
            Type::Int16 => 2,
            Type::Int32 => 4,
            Type::Int64 | Type::Pointer | Type::Float64 => 8,
            Type::Float32 => 4,
            Type::LongDouble => 16,
            Type::Aggregate { size, .. } => *size,
        }
    }

    pub fn align(&self) -> u32 {
        match self {
            Type::Aggregate { align, .. } => *align,
            Type::LongDouble => 16,
            other => other.size().max(1),
        }
    }

    pub fn is_floating(&self) -> bool {
        matches!(self, Type::Float32 | Type::Float64 | Type::LongDouble)
    }

    pub fn is_aggregate(&self) -> bool {
        matches!(self, Type::Aggregate { .. })
    }
}

/// Storage class of a named data object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageClass {
    Global,
    GlobalReadonly,
    ThreadLocal,
}

/// Visibility of an external/imported/exported identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Default,
    Hidden,
    Internal,
    Protected,
}

/// Bitfield descriptor used by `BitsExtract{Signed,Unsigned}` / `BitsInsert`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitField {
    pub offset: u8,
    pub length: u8,
}

/// The operand tuple carried by an instruction: refs, immediates, type ids,
/// block ids, and the handful of opcode-specific fields (bitfield
/// offset/length, branch targets).
#[derive(Debug, Clone)]
pub enum Operands {
    Nullary,
    Unary(Value),
    Binary(Value, Value),
    /// `GetLocal`, `GetGlobal`: a symbol plus an optional byte offset.
    Symbol { global: GlobalId, offset: i64 },
    /// A literal integer immediate.
    Immediate(i64),
    /// `BitsExtract*` / `BitsInsert`: base value, field, and (for insert)
    /// the value being inserted.
    Bitfield {
        base: Value,
        field: BitField,
        insert: Option<Value>,
    },
    /// `Jump`: unconditional edge.
    Jump { target: Block },
    /// `Branch`: a condition value plus the taken/not-taken edges.
    Branch {
        cond: Value,
        target: Block,
        alternative: Block,
    },
    /// `IJump`: computed-address jump.
    IJump { target: Value },
    /// `Invoke`: callee symbol (or indirect pointer value), argument list,
    /// and whether the callee is variadic.
    Invoke {
        callee: CallTarget,
        args: SmallVec<[Value; 8]>,
        variadic: bool,
    },
    /// Memory copy / zero: destination, (copy only) source, byte count.
    MemOp {
        dest: Value,
        src: Option<Value>,
        count: Value,
    },
    /// `StackAlloc`: requested size and alignment.
    StackAlloc { size: Value, alignment: u32, within_scope: bool },
    /// `PushScope` / `PopScope`: the scope handle value (absent for push,
    /// which produces it instead of consuming it).
    Scope { handle: Option<Value> },
    /// `ThreadLocalStorage`: the TLS symbol being accessed.
    Tls { symbol: GlobalId },
    /// `VarArgStart`: the `va_list` pointer plus parameter counts already
    /// consumed by named parameters.
    VarArgStart {
        list_ptr: Value,
        consumed_int: u32,
        consumed_sse: u32,
    },
    /// `VarArgCopy`: destination and source `va_list` pointers.
    VarArgCopy { dest: Value, src: Value },
    /// `VarArgGet`: the `va_list` pointer and the type being read.
    VarArgGet { list_ptr: Value, ty: TypeId },
    /// `InlineAssembly`: reference into the module's inline-asm fragment
    /// table, plus the SSA values bound to its parameters in declaration
    /// order.
    InlineAsm {
        fragment: InlineAsmId,
        params: SmallVec<[Value; 4]>,
        jump_targets: SmallVec<[Block; 2]>,
    },
}

#[derive(Debug, Clone)]
pub enum CallTarget {
    Direct(GlobalId),
    Indirect(Value),
}

/// Reference to an inline-asm fragment declared at module scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InlineAsmId(u32);
entity_impl!(InlineAsmId, "asm");

/// The ~40-member opcode set the selector dispatches over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    IntAdd,
    IntSub,
    IntMul,
    IntAnd,
    IntOr,
    IntXor,
    IntLShift,
    IntRShift,
    IntARShift,
    IntEq,
    IntGreater,
    IntLesser,
    IntAbove,
    IntBelow,
    BoolAnd,
    BoolOr,
    IntDiv,
    IntUDiv,
    IntMod,
    IntUMod,
    BitsExtractSigned,
    BitsExtractUnsigned,
    BitsInsert,
    Float32Add,
    Float32Sub,
    Float32Mul,
    Float32Div,
    Float64Add,
    Float64Sub,
    Float64Mul,
    Float64Div,
    Float32Neg,
    Float64Neg,
    FloatEq,
    FloatGreater,
    FloatLesser,
    IntToFloat,
    UIntToFloat,
    FloatToInt,
    Float32ToFloat64,
    Float64ToFloat32,
    LongDoubleAdd,
    LongDoubleSub,
    LongDoubleMul,
    LongDoubleDiv,
    LongDoubleNeg,
    LongDoubleStore,
    Int8LoadSigned,
    Int8LoadUnsigned,
    Int16LoadSigned,
    Int16LoadUnsigned,
    Int32LoadSigned,
    Int32LoadUnsigned,
    Int64Load,
    Int8Store,
    Int16Store,
    Int32Store,
    Int64Store,
    GetLocal,
    GetGlobal,
    GetArgument,
    MemoryCopy,
    ZeroMemory,
    StackAlloc,
    PushScope,
    PopScope,
    ThreadLocalStorage,
    Invoke,
    Jump,
    Branch,
    IJump,
    Return,
    VarArgStart,
    VarArgCopy,
    VarArgGet,
    InlineAssembly,
}

/// A single SSA instruction: opcode, operand tuple, and result type (if any).
#[derive(Debug, Clone)]
pub struct Instruction {
    pub opcode: Opcode,
    pub operands: Operands,
    pub result_type: Option<TypeId>,
    pub block: Block,
}

/// A phi node: per-predecessor-block source value, materialised into a
/// unified allocation in the successor (see `select::control`).
#[derive(Debug, Clone)]
pub struct Phi {
    pub result: Value,
    pub result_type: TypeId,
    pub incoming: Vec<(Block, Value)>,
}

/// One basic block: its phis (if it has predecessors with divergent
/// incoming values) and its instructions in emission order.
#[derive(Debug, Clone, Default)]
pub struct BlockData {
    pub phis: Vec<Phi>,
    pub instructions: Vec<Value>,
}

/// ABI classification of a function's result type, precomputed by the
/// (out-of-scope) front end exactly like an aggregate parameter's classes.
#[derive(Debug, Clone)]
pub enum ReturnKind {
    Void,
    Integer,
    Float,
    LongDouble,
    Register(SmallVec<[crate::abi::EightbyteClass; 2]>),
    Memory,
}

/// One function: its typed parameter list, code, and per-function analysis
/// (block linear order + reachability) the register-allocation consumer and
/// selector both rely on.
pub struct Function {
    pub name: String,
    pub params: PrimaryMap<ParamId, TypeId>,
    pub return_kind: ReturnKind,
    pub variadic: bool,
    pub types: PrimaryMap<TypeId, Type>,
    pub blocks: PrimaryMap<Block, BlockData>,
    pub instructions: PrimaryMap<Value, Instruction>,
    /// Linear emission order of blocks, as computed by the (out-of-scope)
    /// layout pass. `block_order[i+1]` is the fallthrough successor of
    /// `block_order[i]` when applicable.
    pub block_order: Vec<Block>,
    /// Blocks reachable from entry; unreachable blocks are not emitted and
    /// their phi mappings are skipped.
    pub reachable: rustc_hash::FxHashSet<Block>,
    pub entry: Block,
}

impl Function {
    pub fn inst(&self, v: Value) -> &Instruction {
        &self.instructions[v]
    }

    pub fn ty(&self, t: TypeId) -> &Type {
        &self.types[t]
    }

    pub fn is_reachable(&self, b: Block) -> bool {
        self.reachable.contains(&b)
    }

    /// The block immediately following `b` in linear layout order, if any --
    /// used to decide whether a branch target falls through.
    pub fn linear_successor(&self, b: Block) -> Option<Block> {
        let idx = self.block_order.iter().position(|&x| x == b)?;
        self.block_order.get(idx + 1).copied()
    }
}

/// A named string literal, with its element width (1/2/4 bytes for
/// multibyte/UTF-16/UTF-32 respectively) and raw bytes.
pub struct StringLiteral {
    pub element_width: u32,
    pub bytes: Vec<u8>,
}

/// The IR module: named functions, types, data objects, string literals,
/// inline-asm fragments, and external declarations.
pub struct Module {
    pub functions: PrimaryMap<GlobalId, Function>,
    pub string_literals: PrimaryMap<StringLiteralId, StringLiteral>,
    pub inline_asm: PrimaryMap<InlineAsmId, crate::inline_asm::Fragment>,
    pub data_storage: rustc_hash::FxHashMap<GlobalId, StorageClass>,
    pub visibility: rustc_hash::FxHashMap<GlobalId, Visibility>,
    /// Linkage name of every global identifier, function and data object
    /// alike (§2: "a keyed collection of named functions ... named data
    /// objects"). Functions additionally carry their own `name` for
    /// diagnostics/label-prefixing, but `GetGlobal`/`Invoke`/TLS lowering all
    /// address a bare `GlobalId` and need this table to resolve it to a
    /// symbol.
    pub globals: rustc_hash::FxHashMap<GlobalId, String>,
}

impl Module {
    pub fn global_symbol(&self, id: GlobalId) -> &str {
        self.globals
            .get(&id)
            .map(String::as_str)
            .unwrap_or_else(|| self.functions[id].name.as_str())
    }
}
