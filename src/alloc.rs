//! Register allocation consumer (component D) and the storage-location
//! union it projects into (§3: "Storage location").

use crate::emit::MemOperand;
use crate::frame::StackFrameMap;
use crate::reg::{Gpr, Reg, Width};

/// One eightbyte of a parameter's ABI classification, as produced by the
/// calling-convention engine for a spilled parameter (§3: "a pointer to the
/// parameter's ABI classification qwords so the preamble can materialise it
/// from integer/SSE argument registers").
#[derive(Debug, Clone, Copy)]
pub enum ParameterQword {
    Integer(Gpr),
    Sse(crate::reg::Xmm),
    /// This eightbyte of the aggregate was itself passed in memory.
    Memory { stack_offset: i64 },
}

/// Precomputed binding of one SSA instruction to a location, handed to the
/// selector by the (out-of-scope) register allocator. Immutable for the
/// duration of the function translation (§3 invariant).
#[derive(Debug, Clone)]
pub enum RegisterAllocation {
    /// The instruction produces no value.
    None,
    Gpr(Gpr),
    Fpr(crate::reg::Xmm),
    /// Lives at `rbp + spill_area_base + index*8`. `param_qwords`, when
    /// present, lets the prologue materialise the value from the ABI
    /// parameter registers rather than reading garbage off the stack.
    SpillSlot {
        index: u32,
        param_qwords: Option<Vec<ParameterQword>>,
    },
    /// A stack slot reserved for a register-passed aggregate, at
    /// `rbp + aggregate_area_base + index*8`.
    RegisterAggregate { index: u32 },
    /// Lives at `[base_reg + offset]` -- used for pointer-indirect spills.
    Indirect { base: Gpr, offset: i64 },
}

impl RegisterAllocation {
    pub fn is_none(&self) -> bool {
        matches!(self, RegisterAllocation::None)
    }

    pub fn as_register(&self) -> Option<Reg> {
        match self {
            RegisterAllocation::Gpr(g) => Some(Reg::Gpr(*g)),
            RegisterAllocation::Fpr(x) => Some(Reg::Xmm(*x)),
            _ => None,
        }
    }
}

/// A storage location: either a physical register or a memory reference.
/// Constructed from a [`RegisterAllocation`] via the stack-frame map.
#[derive(Debug, Clone)]
pub enum StorageLocation {
    Register(Reg),
    Memory { base: Gpr, offset: i64 },
}

impl StorageLocation {
    pub fn from_allocation(alloc: &RegisterAllocation, frame: &StackFrameMap) -> StorageLocation {
        match alloc {
            RegisterAllocation::None => {
                unreachable!("caller must check `is_none` before projecting a location")
            }
            RegisterAllocation::Gpr(g) => StorageLocation::Register(Reg::Gpr(*g)),
            RegisterAllocation::Fpr(x) => StorageLocation::Register(Reg::Xmm(*x)),
            RegisterAllocation::SpillSlot { index, .. } => StorageLocation::Memory {
                base: Gpr::Rbp,
                offset: frame.spill_slot_offset(*index),
            },
            RegisterAllocation::RegisterAggregate { index } => StorageLocation::Memory {
                base: Gpr::Rbp,
                offset: frame.register_aggregate_offset(*index),
            },
            RegisterAllocation::Indirect { base, offset } => {
                StorageLocation::Memory { base: *base, offset: *offset }
            }
        }
    }

    pub fn as_register(&self) -> Option<Reg> {
        match self {
            StorageLocation::Register(r) => Some(*r),
            StorageLocation::Memory { .. } => None,
        }
    }

    pub fn mem_operand(&self, width: Width) -> Option<MemOperand> {
        match self {
            StorageLocation::Memory { base, offset } => {
                Some(MemOperand { base: Some(*base), disp: *offset, width: Some(width), ..Default::default() })
            }
            StorageLocation::Register(_) => None,
        }
    }
}
