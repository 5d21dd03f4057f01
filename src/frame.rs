//! Per-function stack frame map: byte offsets from `rbp` to each area, and
//! prologue/epilogue emission. Populated once per function before any
//! translator runs (§3, "Stack frame map").

use crate::config::Config;
use crate::emit::AssemblyEmitter;
use crate::error::CodegenResult;
use crate::reg::{CALLEE_SAVED_GPR, Gpr};

/// Sizing inputs the (out-of-scope) register allocator and frame-layout
/// pass hand us once per function.
#[derive(Debug, Clone, Default)]
pub struct FrameSizes {
    pub locals_bytes: u32,
    pub spill_slots: u32,
    pub register_aggregate_slots: u32,
    pub temporary_bytes: u32,
    pub uses_dynamic_scope: bool,
    pub uses_vararg: bool,
    pub stack_arg_bytes: u32,
}

/// Byte offsets from `rbp` to each frame area. All areas grow *down* from
/// `rbp` (negative offsets) except the implicit-parameter slot and the
/// incoming stack-argument area, which live *above* `rbp` (positive, at
/// `rbp + 16 + k` past the saved `rbp`/return address pair).
#[derive(Debug, Clone, Copy)]
pub struct StackFrameMap {
    pub locals_area_offset: i64,
    pub spill_area_offset: i64,
    pub register_save_area_offset: i64,
    pub implicit_parameter_offset: i64,
    pub dynamic_scope_offset: i64,
    pub temporary_area_offset: i64,
    pub register_aggregate_area_offset: i64,
    /// Bytes of named stack-passed arguments sitting just above the implicit
    /// parameter slot. `VarArgStart` needs this to place `overflow_arg_area`
    /// past the named arguments rather than on top of them.
    pub incoming_stack_arg_bytes: i64,
    pub frame_size: i64,
    pub omit_frame_pointer: bool,
}

const REGISTER_SAVE_AREA_BYTES: i64 = 6 * 8 + 8 * 16; // 6 GPR + 8 XMM save slots.

impl StackFrameMap {
    /// Lays out every area bottom-up from `rbp`, aligning the final frame
    /// size to 16 bytes as the ABI requires at `call` boundaries.
    pub fn compute(sizes: &FrameSizes, config: &Config) -> StackFrameMap {
        let mut cursor: i64 = 0;

        let locals_area_offset = -{
            cursor += sizes.locals_bytes as i64;
            cursor
        };

        let spill_area_offset = -{
            cursor += (sizes.spill_slots as i64) * 8;
            cursor
        };

        let register_aggregate_area_offset = -{
            cursor += (sizes.register_aggregate_slots as i64) * 8;
            cursor
        };

        let register_save_area_offset = if sizes.uses_vararg {
            -{
                cursor += REGISTER_SAVE_AREA_BYTES;
                cursor
            }
        } else {
            0
        };

        let dynamic_scope_offset = if sizes.uses_dynamic_scope {
            -{
                cursor += 8;
                cursor
            }
        } else {
            0
        };

        let temporary_area_offset = -{
            cursor += sizes.temporary_bytes as i64;
            cursor
        };

        let frame_size = (cursor + 15) / 16 * 16;
        log::debug!(
            "frame layout: locals={} spill={} register_aggregate={} frame_size={}",
            sizes.locals_bytes,
            sizes.spill_slots,
            sizes.register_aggregate_slots,
            frame_size
        );

        StackFrameMap {
            locals_area_offset,
            spill_area_offset,
            register_aggregate_area_offset,
            register_save_area_offset,
            dynamic_scope_offset,
            temporary_area_offset,
            // Implicit parameter (the caller's return-aggregate pointer) sits
            // just above the saved rbp/return-address pair.
            implicit_parameter_offset: 16,
            incoming_stack_arg_bytes: sizes.stack_arg_bytes as i64,
            frame_size,
            omit_frame_pointer: config.omit_frame_pointer,
        }
    }

    pub fn spill_slot_offset(&self, index: u32) -> i64 {
        self.spill_area_offset + (index as i64) * 8
    }

    pub fn register_aggregate_offset(&self, index: u32) -> i64 {
        self.register_aggregate_area_offset + (index as i64) * 8
    }

    /// Emits `push rbp; mov rbp, rsp; sub rsp, frame_size`, plus
    /// callee-saved register preservation when requested by the ambient
    /// caller (most calling-convention lowering preserves these lazily via
    /// the storage ledger instead; the frame map only owns the fixed part).
    pub fn emit_prologue(&self, emitter: &mut dyn AssemblyEmitter) -> CodegenResult<()> {
        if !self.omit_frame_pointer {
            emitter.push_reg(Gpr::Rbp.into())?;
            emitter.mov_reg_reg(Gpr::Rbp.into(), Gpr::Rsp.into())?;
        }
        if self.frame_size > 0 {
            emitter.sub_imm(Gpr::Rsp.into(), self.frame_size)?;
        }
        Ok(())
    }

    pub fn emit_epilogue(&self, emitter: &mut dyn AssemblyEmitter) -> CodegenResult<()> {
        if !self.omit_frame_pointer {
            emitter.mov_reg_reg(Gpr::Rsp.into(), Gpr::Rbp.into())?;
            emitter.pop_reg(Gpr::Rbp.into())?;
        } else if self.frame_size > 0 {
            emitter.add_imm(Gpr::Rsp.into(), self.frame_size)?;
        }
        Ok(())
    }

    pub fn callee_saved_in_use<'a>(&self, used: &'a [Gpr]) -> impl Iterator<Item = Gpr> + 'a {
        used.iter().copied().filter(|r| CALLEE_SAVED_GPR.contains(r))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn frame_size_rounds_up_to_16_bytes() {
        let sizes = FrameSizes { locals_bytes: 12, spill_slots: 1, ..Default::default() };
        let map = StackFrameMap::compute(&sizes, &Config::builder().build());
        assert_eq!(map.frame_size % 16, 0);
        assert!(map.frame_size >= 20);
    }

    #[test]
    fn areas_are_laid_out_bottom_up_without_overlap() {
        let sizes = FrameSizes {
            locals_bytes: 16,
            spill_slots: 2,
            register_aggregate_slots: 1,
            temporary_bytes: 8,
            uses_dynamic_scope: true,
            uses_vararg: true,
            stack_arg_bytes: 0,
        };
        let map = StackFrameMap::compute(&sizes, &Config::builder().build());
        // Every area lives strictly below rbp and areas are ordered locals,
        // spill, register-aggregate, register-save, dynamic-scope, temporary.
        assert!(map.locals_area_offset < 0);
        assert!(map.spill_area_offset < map.locals_area_offset);
        assert!(map.register_aggregate_area_offset < map.spill_area_offset);
        assert!(map.register_save_area_offset < map.register_aggregate_area_offset);
        assert!(map.dynamic_scope_offset < map.register_save_area_offset);
        assert!(map.temporary_area_offset < map.dynamic_scope_offset);
    }

    #[test]
    fn unused_optional_areas_stay_at_zero() {
        let sizes = FrameSizes { locals_bytes: 8, ..Default::default() };
        let map = StackFrameMap::compute(&sizes, &Config::builder().build());
        assert_eq!(map.register_save_area_offset, 0);
        assert_eq!(map.dynamic_scope_offset, 0);
    }

    #[test]
    fn spill_slots_are_8_bytes_apart() {
        let sizes = FrameSizes { spill_slots: 4, ..Default::default() };
        let map = StackFrameMap::compute(&sizes, &Config::builder().build());
        assert_eq!(map.spill_slot_offset(1) - map.spill_slot_offset(0), 8);
        assert_eq!(map.spill_slot_offset(3), map.spill_area_offset + 24);
    }

    #[test]
    fn implicit_parameter_sits_above_saved_rbp_and_return_address() {
        let sizes = FrameSizes::default();
        let map = StackFrameMap::compute(&sizes, &Config::builder().build());
        assert_eq!(map.implicit_parameter_offset, 16);
    }
}
