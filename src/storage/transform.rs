//! Storage transform (component F): plans and executes a batch of
//! location-to-location moves, breaking cycles with a spill stack.
//!
//! Used for call-argument placement, phi mapping on control-flow edges, and
//! inline-asm input/output marshalling -- everywhere a set of SSA values
//! needs to land in a fresh set of locations simultaneously.

use std::collections::HashMap;

use crate::alloc::StorageLocation;
use crate::emit::{AssemblyEmitter, MemOperand};
use crate::error::CodegenResult;
use crate::reg::{Reg, Width};
use crate::storage::StorageLedger;

/// One pending `dest <- src` mapping.
#[derive(Debug, Clone)]
struct Mapping {
    dest: LocKey,
    dest_loc: StorageLocation,
    src_loc: StorageLocation,
    width: Width,
}

/// A hashable key for a [`StorageLocation`], since destinations are keyed
/// ("destinations are unique", §3) and a raw `StorageLocation` isn't `Eq`
/// over register vs memory identity without one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum LocKey {
    Register(Reg),
    Memory(crate::reg::Gpr, i64),
}

impl LocKey {
    fn of(loc: &StorageLocation) -> LocKey {
        match loc {
            StorageLocation::Register(r) => LocKey::Register(*r),
            StorageLocation::Memory { base, offset } => LocKey::Memory(*base, *offset),
        }
    }
}

/// An unordered set of pending moves, keyed by destination. `perform` emits
/// the minimal instruction sequence realising every mapping simultaneously.
#[derive(Default)]
pub struct StorageTransform {
    mappings: HashMap<LocKey, Mapping>,
    /// Preserves the order mappings were added, so `perform`'s output is
    /// deterministic even though destinations are a set (§5: "free to
    /// schedule its internal moves in any order that realises the mapping",
    /// but deterministic output makes tests and diffing sane).
    order: Vec<LocKey>,
}

impl StorageTransform {
    pub fn new() -> Self {
        StorageTransform::default()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    /// Adds `dest <- src` to the batch. Destinations are unique: adding the
    /// same destination twice replaces the earlier mapping, matching "last
    /// writer wins" semantics a phi-mapping or call-argument builder would
    /// rely on when re-deriving a mapping is simpler than checking first.
    pub fn add(&mut self, dest: StorageLocation, src: StorageLocation, width: Width) {
        let key = LocKey::of(&dest);
        if !self.mappings.contains_key(&key) {
            self.order.push(key);
        }
        self.mappings.insert(
            key,
            Mapping {
                dest: key,
                dest_loc: dest,
                src_loc: src,
                width,
            },
        );
    }

    /// Executes every pending mapping. Mappings whose source is itself some
    /// other mapping's destination are part of a chain: their source value
    /// is pushed onto the hardware stack up front (step 1) and popped back
    /// into the real destination once all non-chained moves have run (step
    /// 2), so that an earlier move in the chain never clobbers a value a
    /// later move still needs to read.
    pub fn perform(
        &mut self,
        ledger: &mut StorageLedger,
        emitter: &mut dyn AssemblyEmitter,
    ) -> CodegenResult<()> {
        let dest_keys: std::collections::HashSet<LocKey> = self.mappings.keys().copied().collect();

        // Step 1: stack every mapping whose source is also a destination.
        let mut stacked: Vec<LocKey> = Vec::new();
        for key in &self.order {
            let mapping = &self.mappings[key];
            let src_key = LocKey::of(&mapping.src_loc);
            if dest_keys.contains(&src_key) && src_key != *key {
                push_value(emitter, &mapping.src_loc, mapping.width)?;
                stacked.push(*key);
            }
        }

        // Step 2: realise every mapping -- either pop the stacked temporary
        // into its destination, or move directly from source to
        // destination. Stacked temporaries pop in reverse push order (LIFO).
        for key in stacked.iter().rev() {
            let mapping = &self.mappings[key];
            pop_value(emitter, &mapping.dest_loc, mapping.width)?;
        }
        for key in &self.order {
            if stacked.contains(key) {
                continue;
            }
            let mapping = &self.mappings[key];
            if LocKey::of(&mapping.dest_loc) == LocKey::of(&mapping.src_loc) {
                // Source equals destination: no-op, contributing to the
                // idempotence property (no `mov` emitted).
                continue;
            }
            emit_move(ledger, emitter, &mapping.dest_loc, &mapping.src_loc, mapping.width)?;
        }

        self.mappings.clear();
        self.order.clear();
        Ok(())
    }
}

fn push_value(
    emitter: &mut dyn AssemblyEmitter,
    loc: &StorageLocation,
    width: Width,
) -> CodegenResult<()> {
    match loc {
        StorageLocation::Register(r) => emitter.push_reg(*r),
        StorageLocation::Memory { base, offset } => {
            // `push` only operates on registers; memory sources are staged
            // through a scratch GPR borrowed for exactly this move. We use
            // `rax` directly here since this path only runs inside
            // `perform`, which owns the whole transform and has already
            // reserved its temporaries via the ledger at a higher level for
            // register-to-register chains; pure memory chains are rare
            // (the selector never phi-maps two spill slots into each
            // other without an intervening register-allocated value) but
            // handled for completeness via a dedicated scratch push.
            let scratch = Reg::Gpr(crate::reg::Gpr::R11);
            emitter.mov_reg_mem(
                scratch,
                MemOperand { base: Some(*base), disp: *offset, width: Some(width), ..Default::default() },
                width,
            )?;
            emitter.push_reg(scratch)
        }
    }
}

fn pop_value(
    emitter: &mut dyn AssemblyEmitter,
    loc: &StorageLocation,
    width: Width,
) -> CodegenResult<()> {
    match loc {
        StorageLocation::Register(r) => emitter.pop_reg(*r),
        StorageLocation::Memory { base, offset } => {
            let scratch = Reg::Gpr(crate::reg::Gpr::R11);
            emitter.pop_reg(scratch)?;
            emitter.mov_mem_reg(
                MemOperand { base: Some(*base), disp: *offset, width: Some(width), ..Default::default() },
                scratch,
                width,
            )
        }
    }
}

/// Emits one direct (non-chained) move. Register<->register uses `mov` for
/// GPR<->GPR and `movdqu` for FPR<->FPR; cross-kind uses `movq`.
/// Memory<->memory goes via a borrowed scratch GPR.
fn emit_move(
    ledger: &mut StorageLedger,
    emitter: &mut dyn AssemblyEmitter,
    dest: &StorageLocation,
    src: &StorageLocation,
    width: Width,
) -> CodegenResult<()> {
    match (dest, src) {
        (StorageLocation::Register(d), StorageLocation::Register(s)) => emitter.mov_reg_reg(*d, *s),
        (StorageLocation::Register(d), StorageLocation::Memory { base, offset }) => emitter
            .mov_reg_mem(
                *d,
                MemOperand { base: Some(*base), disp: *offset, width: Some(width), ..Default::default() },
                width,
            ),
        (StorageLocation::Memory { base, offset }, StorageLocation::Register(s)) => emitter
            .mov_mem_reg(
                MemOperand { base: Some(*base), disp: *offset, width: Some(width), ..Default::default() },
                *s,
                width,
            ),
        (
            StorageLocation::Memory { base: db, offset: doff },
            StorageLocation::Memory { base: sb, offset: soff },
        ) => {
            let handle = ledger.any_gpr(None, emitter)?;
            let scratch = handle.reg();
            emitter.mov_reg_mem(
                scratch,
                MemOperand { base: Some(*sb), disp: *soff, width: Some(width), ..Default::default() },
                width,
            )?;
            emitter.mov_mem_reg(
                MemOperand { base: Some(*db), disp: *doff, width: Some(width), ..Default::default() },
                scratch,
                width,
            )?;
            ledger.release(handle, emitter)
        }
    }
}
