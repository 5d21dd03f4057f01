//! System V AMD64 argument/return classification and register assignment.
//!
//! This is component H's data model: the eightbyte classification table
//! (§3) and the register sequences types are assigned to. The call/return
//! lowering itself (the control flow that *uses* this classification) lives
//! in [`crate::call`].

use smallvec::SmallVec;

use crate::ir::Type;
use crate::reg::{Gpr, Xmm, INTEGER_PARAMETER_REGISTERS, SSE_PARAMETER_REGISTERS};

/// System V AMD64 eightbyte classification. `X87`/`X87Up` only ever appear
/// as a pair describing a single `long double` eightbyte-pair; `NoClass`
/// eightbytes are skipped when assigning registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EightbyteClass {
    Integer,
    Sse,
    X87,
    X87Up,
    Memory,
    NoClass,
}

/// Where a value (argument or return) of a given classification ultimately
/// lives once lowered.
#[derive(Debug, Clone)]
pub enum Placement {
    IntegerRegister(Gpr),
    SseRegister(Xmm),
    X87,
    /// Passed/returned through memory; `stack_offset` is relative to the
    /// argument area (for arguments) and meaningless for returns (which use
    /// the implicit-parameter pointer instead).
    Memory { stack_offset: i64 },
}

/// The result of classifying one value (argument or return) for the System
/// V AMD64 ABI: one placement per live eightbyte, in order.
#[derive(Debug, Clone, Default)]
pub struct ClassifiedValue {
    pub placements: SmallVec<[Placement; 2]>,
}

/// Classifies a scalar type directly; aggregates use their precomputed
/// `classes` field (§3: "the front end already computed the System V
/// eightbyte classification"), since reclassifying a struct layout from
/// scratch would duplicate work the (out-of-scope) front end already did.
pub fn classify_scalar(ty: &Type) -> EightbyteClass {
    match ty {
        Type::Int8 | Type::Int16 | Type::Int32 | Type::Int64 | Type::Pointer => {
            EightbyteClass::Integer
        }
        Type::Float32 | Type::Float64 => EightbyteClass::Sse,
        Type::LongDouble => EightbyteClass::X87,
        Type::Aggregate { .. } => EightbyteClass::Memory,
    }
}

/// Sequential register-class allocator: hands out the next free integer or
/// SSE parameter register, or falls back to memory once a class is
/// exhausted. Shared between argument placement (§4.H step 4) and the
/// register-aggregate re-materialisation that follows it.
#[derive(Default)]
pub struct ClassAllocator {
    next_int: usize,
    next_sse: usize,
    stack_offset: i64,
}

impl ClassAllocator {
    pub fn new() -> Self {
        ClassAllocator::default()
    }

    pub fn consumed_int(&self) -> u32 {
        self.next_int as u32
    }

    pub fn consumed_sse(&self) -> u32 {
        self.next_sse as u32
    }

    /// Place one eightbyte of the given class, or `None` if no class
    /// registers remain for the *whole* classified value (the caller then
    /// restarts the value as MEMORY per the ABI "once any eightbyte fails to
    /// classify into a register, the whole aggregate goes to memory" rule).
    pub fn try_place_integer(&mut self) -> Option<Gpr> {
        let reg = INTEGER_PARAMETER_REGISTERS.get(self.next_int).copied()?;
        self.next_int += 1;
        Some(reg)
    }

    pub fn try_place_sse(&mut self) -> Option<Xmm> {
        let reg = SSE_PARAMETER_REGISTERS.get(self.next_sse).copied()?;
        self.next_sse += 1;
        Some(reg)
    }

    pub fn remaining_int(&self) -> usize {
        INTEGER_PARAMETER_REGISTERS.len().saturating_sub(self.next_int)
    }

    pub fn remaining_sse(&self) -> usize {
        SSE_PARAMETER_REGISTERS.len().saturating_sub(self.next_sse)
    }

    pub fn push_stack_slot(&mut self, size: i64, align: i64) -> i64 {
        let align = align.max(8);
        self.stack_offset = (self.stack_offset + align - 1) / align * align;
        let offset = self.stack_offset;
        self.stack_offset += size;
        offset
    }

    pub fn stack_bytes(&self) -> i64 {
        (self.stack_offset + 15) / 16 * 16
    }
}

/// Classifies one argument or return value into its eightbyte placements.
/// Returns `None` placements collapsed to `Memory` when register classes
/// ran out mid-aggregate, matching the ABI's whole-aggregate-to-memory
/// fallback.
pub fn classify_value(ty: &Type, alloc: &mut ClassAllocator) -> ClassifiedValue {
    match ty {
        Type::Aggregate { size, align, classes } => {
            if *size > 16 || classes.iter().any(|c| *c == EightbyteClass::Memory) {
                let offset = alloc.push_stack_slot(*size as i64, *align as i64);
                return ClassifiedValue {
                    placements: smallvec::smallvec![Placement::Memory { stack_offset: offset }],
                };
            }
            // Try to place every eightbyte in registers; an aggregate is
            // atomic here (all-or-nothing), so we allocate against a
            // scratch copy of the counters and commit only on full success.
            let needed_int = classes.iter().filter(|c| **c == EightbyteClass::Integer).count();
            let needed_sse = classes.iter().filter(|c| **c == EightbyteClass::Sse).count();
            let has_x87 = classes.iter().any(|c| *c == EightbyteClass::X87);
            if !has_x87 && needed_int <= alloc.remaining_int() && needed_sse <= alloc.remaining_sse()
            {
                let mut placements = SmallVec::new();
                for class in classes.iter() {
                    match class {
                        EightbyteClass::Integer => {
                            placements.push(Placement::IntegerRegister(
                                alloc.try_place_integer().expect("checked above"),
                            ));
                        }
                        EightbyteClass::Sse => {
                            placements.push(Placement::SseRegister(
                                alloc.try_place_sse().expect("checked above"),
                            ));
                        }
                        EightbyteClass::NoClass => {}
                        EightbyteClass::X87 | EightbyteClass::X87Up | EightbyteClass::Memory => {
                            unreachable!("filtered above")
                        }
                    }
                }
                ClassifiedValue { placements }
            } else if has_x87 {
                let offset = alloc.push_stack_slot(*size as i64, (*align).max(16) as i64);
                ClassifiedValue {
                    placements: smallvec::smallvec![Placement::Memory { stack_offset: offset }],
                }
            } else {
                let offset = alloc.push_stack_slot(*size as i64, *align as i64);
                ClassifiedValue {
                    placements: smallvec::smallvec![Placement::Memory { stack_offset: offset }],
                }
            }
        }
        Type::LongDouble => {
            let offset = alloc.push_stack_slot(16, 16);
            ClassifiedValue {
                placements: smallvec::smallvec![Placement::Memory { stack_offset: offset }],
            }
        }
        scalar => match classify_scalar(scalar) {
            EightbyteClass::Integer => match alloc.try_place_integer() {
                Some(r) => ClassifiedValue {
                    placements: smallvec::smallvec![Placement::IntegerRegister(r)],
                },
                None => {
                    let offset = alloc.push_stack_slot(8, 8);
                    ClassifiedValue {
                        placements: smallvec::smallvec![Placement::Memory { stack_offset: offset }],
                    }
                }
            },
            EightbyteClass::Sse => match alloc.try_place_sse() {
                Some(r) => ClassifiedValue {
                    placements: smallvec::smallvec![Placement::SseRegister(r)],
                },
                None => {
                    let offset = alloc.push_stack_slot(8, 8);
                    ClassifiedValue {
                        placements: smallvec::smallvec![Placement::Memory { stack_offset: offset }],
                    }
                }
            },
            _ => unreachable!("scalar classification never yields X87/Memory/NoClass"),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_integers_fill_registers_then_stack() {
        let mut alloc = ClassAllocator::new();
        for _ in 0..6 {
            let v = classify_value(&Type::Int64, &mut alloc);
            assert!(matches!(v.placements[0], Placement::IntegerRegister(_)));
        }
        let overflow = classify_value(&Type::Int64, &mut alloc);
        assert!(matches!(overflow.placements[0], Placement::Memory { .. }));
    }

    #[test]
    fn floats_use_sse_bank_independent_of_integers() {
        let mut alloc = ClassAllocator::new();
        let i = classify_value(&Type::Int64, &mut alloc);
        let f = classify_value(&Type::Float64, &mut alloc);
        assert!(matches!(i.placements[0], Placement::IntegerRegister(Gpr::Rdi)));
        assert!(matches!(f.placements[0], Placement::SseRegister(_)));
    }
}
