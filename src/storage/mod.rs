//! Storage ledger (component E): the per-function occupancy/borrow
//! bookkeeping translators consult before touching a physical register.
//!
//! See [`crate::storage::transform`] for the companion batch-move planner
//! (component F), which is the main consumer of borrowed scratch registers.

pub mod transform;

use rustc_hash::FxHashSet;

use crate::alloc::RegisterAllocation;
use crate::emit::AssemblyEmitter;
use crate::error::{err_invalid_request, CodegenResult};
use crate::reg::{is_allocatable, Gpr, Reg, Xmm, ALL_GPR, ALL_XMM};

/// Proof that a register is currently lent as scratch. Releasing it is a
/// method that consumes the handle -- the type system enforces "you can't
/// use a borrow after releasing it" statically; it cannot enforce *LIFO
/// order* across distinct handles, so [`StorageLedger::release`] still
/// checks that at runtime (§9, design note on borrow handles).
#[derive(Debug)]
pub struct BorrowHandle {
    reg: Reg,
    evicted: bool,
    released: bool,
}

impl BorrowHandle {
    pub fn reg(&self) -> Reg {
        self.reg
    }

    pub fn evicted(&self) -> bool {
        self.evicted
    }
}

impl Drop for BorrowHandle {
    fn drop(&mut self) {
        if !self.released {
            // A handle must always be threaded to `release`, including on
            // error paths (§5: "failure propagation must not leak borrow
            // handles"). Reaching this means a translator short-circuited
            // without releasing -- a bug we'd rather catch in debug builds
            // than silently leave the ledger's bookkeeping stale.
            debug_assert!(
                self.released,
                "borrow handle for {:?} dropped without release",
                self.reg
            );
        }
    }
}

/// Outcome of [`StorageLedger::shared_allocated`]: either the value can be
/// read directly out of its already-allocated, unborrowed register (no
/// borrow taken, nothing to release), or a borrow was required as a
/// fallback and must be released like any other.
pub enum SharedAccess {
    Direct(Reg),
    Borrowed(BorrowHandle),
}

impl SharedAccess {
    pub fn reg(&self) -> Reg {
        match self {
            SharedAccess::Direct(r) => *r,
            SharedAccess::Borrowed(h) => h.reg,
        }
    }
}

/// Per-function mutable occupancy/borrow state (§3: "Storage ledger").
#[derive(Default)]
pub struct StorageLedger {
    occupied: FxHashSet<Reg>,
    borrowed: FxHashSet<Reg>,
    borrow_stack: Vec<Reg>,
}

impl StorageLedger {
    pub fn new() -> Self {
        StorageLedger::default()
    }

    pub fn is_occupied(&self, reg: Reg) -> bool {
        self.occupied.contains(&normalize(reg))
    }

    pub fn is_borrowed(&self, reg: Reg) -> bool {
        self.borrowed.contains(&normalize(reg))
    }

    pub fn has_borrowed(&self) -> bool {
        !self.borrow_stack.is_empty()
    }

    /// Declares that `reg` now holds a live-across-instructions SSA value.
    /// Fails if the register is already marked used or is currently
    /// borrowed.
    pub fn mark_used(&mut self, reg: Reg) -> CodegenResult<()> {
        check_allocatable(reg)?;
        let reg = normalize(reg);
        if self.occupied.contains(&reg) {
            return Err(err_invalid_request(format!(
                "{reg:?} is already marked used"
            )));
        }
        if self.borrowed.contains(&reg) {
            return Err(err_invalid_request(format!(
                "{reg:?} is currently borrowed and cannot be marked used"
            )));
        }
        self.occupied.insert(reg);
        Ok(())
    }

    pub fn mark_unused(&mut self, reg: Reg) -> CodegenResult<()> {
        check_allocatable(reg)?;
        let reg = normalize(reg);
        if !self.occupied.contains(&reg) {
            return Err(err_invalid_request(format!("{reg:?} is not marked used")));
        }
        if self.borrowed.contains(&reg) {
            return Err(err_invalid_request(format!(
                "{reg:?} is currently borrowed and cannot be marked unused"
            )));
        }
        self.occupied.remove(&reg);
        Ok(())
    }

    /// Borrows `reg` as scratch. If it's occupied (live-across), its value
    /// is evicted by pushing it onto the hardware stack first; the handle
    /// records that a matching pop is required at release.
    pub fn acquire(
        &mut self,
        reg: Reg,
        emitter: &mut dyn AssemblyEmitter,
    ) -> CodegenResult<BorrowHandle> {
        check_allocatable(reg)?;
        let reg = normalize(reg);
        if self.borrowed.contains(&reg) {
            return Err(err_invalid_request(format!(
                "{reg:?} is already borrowed"
            )));
        }
        let evicted = self.occupied.contains(&reg);
        if evicted {
            emitter.push_reg(reg)?;
        }
        self.borrowed.insert(reg);
        self.borrow_stack.push(reg);
        Ok(BorrowHandle {
            reg,
            evicted,
            released: false,
        })
    }

    /// Releases a borrow. Fails if `handle` is not the top of the borrow
    /// stack (LIFO violation). The handle is always marked released before
    /// returning -- including on error -- so its `Drop` impl never fires a
    /// spurious double-report on top of the `InvalidRequest` the caller
    /// already sees.
    pub fn release(
        &mut self,
        mut handle: BorrowHandle,
        emitter: &mut dyn AssemblyEmitter,
    ) -> CodegenResult<()> {
        let result = (|| -> CodegenResult<()> {
            match self.borrow_stack.last() {
                Some(top) if *top == handle.reg => {}
                _ => {
                    return Err(err_invalid_request(format!(
                        "release of {:?} is not LIFO with the current borrow stack",
                        handle.reg
                    )))
                }
            }
            self.borrow_stack.pop();
            self.borrowed.remove(&handle.reg);
            if handle.evicted {
                emitter.pop_reg(handle.reg)?;
            }
            Ok(())
        })();
        handle.released = true;
        result
    }

    // -- acquisition policies (§4.E) -----------------------------------------

    /// Policy 1: borrow the register named by `alloc`'s allocation if it's
    /// free to borrow; otherwise fall back to policy 3 (any register of the
    /// matching class).
    pub fn exclusive_allocated(
        &mut self,
        alloc: &RegisterAllocation,
        is_float: bool,
        emitter: &mut dyn AssemblyEmitter,
    ) -> CodegenResult<BorrowHandle> {
        if let Some(reg) = alloc.as_register() {
            if !self.is_borrowed(reg) {
                return self.acquire(reg, emitter);
            }
        }
        if is_float {
            self.any_xmm(None, emitter)
        } else {
            self.any_gpr(None, emitter)
        }
    }

    /// Policy 2: like `exclusive_allocated`, but when the allocated register
    /// is usable as-is, returns it *without* taking a borrow (the value is
    /// only being read, not held across further scratch use).
    pub fn shared_allocated(
        &mut self,
        alloc: &RegisterAllocation,
        is_float: bool,
        emitter: &mut dyn AssemblyEmitter,
    ) -> CodegenResult<SharedAccess> {
        if let Some(reg) = alloc.as_register() {
            if !self.is_borrowed(reg) {
                return Ok(SharedAccess::Direct(reg));
            }
        }
        let handle = if is_float {
            self.any_xmm(None, emitter)?
        } else {
            self.any_gpr(None, emitter)?
        };
        Ok(SharedAccess::Borrowed(handle))
    }

    /// Policy 3: first try an unoccupied, unborrowed register passing
    /// `filter`; otherwise evict any unborrowed register.
    pub fn any_gpr(
        &mut self,
        filter: Option<&dyn Fn(Gpr) -> bool>,
        emitter: &mut dyn AssemblyEmitter,
    ) -> CodegenResult<BorrowHandle> {
        let candidates = ALL_GPR.iter().copied().filter(|g| is_allocatable(*g));
        if let Some(g) = candidates.clone().find(|g| {
            let r = Reg::Gpr(*g);
            !self.is_occupied(r) && !self.is_borrowed(r) && filter.map_or(true, |f| f(*g))
        }) {
            return self.acquire(Reg::Gpr(g), emitter);
        }
        let fallback = candidates
            .filter(|g| !self.is_borrowed(Reg::Gpr(*g)))
            .next()
            .ok_or_else(|| crate::error::err_out_of_space("no free general-purpose register"))?;
        self.acquire(Reg::Gpr(fallback), emitter)
    }

    pub fn any_xmm(
        &mut self,
        filter: Option<&dyn Fn(Xmm) -> bool>,
        emitter: &mut dyn AssemblyEmitter,
    ) -> CodegenResult<BorrowHandle> {
        if let Some(x) = ALL_XMM.iter().copied().find(|x| {
            let r = Reg::Xmm(*x);
            !self.is_occupied(r) && !self.is_borrowed(r) && filter.map_or(true, |f| f(*x))
        }) {
            return self.acquire(Reg::Xmm(x), emitter);
        }
        let fallback = ALL_XMM
            .iter()
            .copied()
            .find(|x| !self.is_borrowed(Reg::Xmm(*x)))
            .ok_or_else(|| crate::error::err_out_of_space("no free XMM register"))?;
        self.acquire(Reg::Xmm(fallback), emitter)
    }

    /// Policy 4: borrow a specific register. Evicts if occupied-and-free;
    /// fails if already borrowed.
    pub fn specific(
        &mut self,
        reg: Reg,
        emitter: &mut dyn AssemblyEmitter,
    ) -> CodegenResult<BorrowHandle> {
        self.acquire(reg, emitter)
    }
}

fn normalize(reg: Reg) -> Reg {
    // The ledger tracks whole registers only; callers never see a
    // sub-register width here (§4.E: "the ledger never sees sub-registers").
    reg
}

fn check_allocatable(reg: Reg) -> CodegenResult<()> {
    match reg {
        Reg::Gpr(g) if !is_allocatable(g) => Err(err_invalid_request(format!(
            "{g:?} is reserved by the ABI and is never eligible for allocation"
        ))),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emit::TextEmitter;

    fn emitter() -> TextEmitter {
        TextEmitter::new(crate::config::Syntax::X86_64Att)
    }

    #[test]
    fn borrow_lifo_enforced() {
        let mut ledger = StorageLedger::new();
        let mut em = emitter();
        let h1 = ledger.acquire(Reg::Gpr(Gpr::Rax), &mut em).unwrap();
        let h2 = ledger.acquire(Reg::Gpr(Gpr::Rcx), &mut em).unwrap();
        // Releasing h1 first (not the top of the stack) must fail.
        let err = ledger.release(h1, &mut em).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidRequest);
        ledger.release(h2, &mut em).unwrap();
    }

    #[test]
    fn occupied_and_borrowed_are_disjoint_at_acquire_time() {
        let mut ledger = StorageLedger::new();
        let mut em = emitter();
        ledger.mark_used(Reg::Gpr(Gpr::Rbx)).unwrap();
        assert!(ledger.is_occupied(Reg::Gpr(Gpr::Rbx)));
        let handle = ledger.acquire(Reg::Gpr(Gpr::Rbx), &mut em).unwrap();
        assert!(handle.evicted());
        assert!(ledger.is_borrowed(Reg::Gpr(Gpr::Rbx)));
        ledger.release(handle, &mut em).unwrap();
        assert!(!ledger.is_borrowed(Reg::Gpr(Gpr::Rbx)));
        assert!(ledger.is_occupied(Reg::Gpr(Gpr::Rbx)));
    }

    #[test]
    fn double_borrow_rejected() {
        let mut ledger = StorageLedger::new();
        let mut em = emitter();
        let h = ledger.acquire(Reg::Gpr(Gpr::Rdx), &mut em).unwrap();
        let err = ledger.acquire(Reg::Gpr(Gpr::Rdx), &mut em).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidRequest);
        ledger.release(h, &mut em).unwrap();
    }

    #[test]
    fn rsp_rbp_never_eligible() {
        let mut ledger = StorageLedger::new();
        let mut em = emitter();
        assert!(ledger.acquire(Reg::Gpr(Gpr::Rsp), &mut em).is_err());
        assert!(ledger.acquire(Reg::Gpr(Gpr::Rbp), &mut em).is_err());
    }

    #[test]
    fn eviction_balances_the_hardware_stack() {
        let mut ledger = StorageLedger::new();
        let mut em = emitter();
        ledger.mark_used(Reg::Gpr(Gpr::Rsi)).unwrap();
        let before = em.buffer.len();
        let handle = ledger.acquire(Reg::Gpr(Gpr::Rsi), &mut em).unwrap();
        assert!(em.buffer.len() > before, "eviction must emit a push");
        ledger.release(handle, &mut em).unwrap();
        assert!(em.buffer.ends_with("pop\t%rsi\n"));
    }
}
