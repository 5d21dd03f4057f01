//! Physical register file: the union of general-purpose, XMM, and the
//! implicit x87 top-of-stack, plus width projections and ABI role queries.

use core::fmt;

/// Operand width in bytes. Only the four SSA-visible integer widths exist;
/// the ledger and transform always normalise to `Q` (64-bit) before touching
/// a `Gpr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Width {
    Byte = 1,
    Word = 2,
    Dword = 4,
    Qword = 8,
    /// 80-bit x87 extended precision operand (`tbyte ptr`/`fld`'s memory
    /// form). Never used to project a GPR; only meaningful as a memory
    /// operand size for long-double translators.
    Tbyte = 10,
}

impl Width {
    pub fn bytes(self) -> u32 {
        self as u32
    }

    /// Intel-syntax `ptr` size keyword.
    pub fn ptr_keyword(self) -> &'static str {
        match self {
            Width::Byte => "byte",
            Width::Word => "word",
            Width::Dword => "dword",
            Width::Qword => "qword",
            Width::Tbyte => "tbyte",
        }
    }

    /// AT&T mnemonic suffix letter.
    pub fn att_suffix(self) -> char {
        match self {
            Width::Byte => 'b',
            Width::Word => 'w',
            Width::Dword => 'l',
            Width::Qword => 'q',
            Width::Tbyte => 't',
        }
    }
}

/// A general-purpose 64-bit register, named by its widest (`r64`) form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[allow(non_camel_case_types)]
pub enum Gpr {
    Rax,
    Rcx,
    Rdx,
    Rbx,
    Rsp,
    Rbp,
    Rsi,
    Rdi,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
}

pub const ALL_GPR: [Gpr; 16] = [
    Gpr::Rax,
    Gpr::Rcx,
    Gpr::Rdx,
    Gpr::Rbx,
    Gpr::Rsp,
    Gpr::Rbp,
    Gpr::Rsi,
    Gpr::Rdi,
    Gpr::R8,
    Gpr::R9,
    Gpr::R10,
    Gpr::R11,
    Gpr::R12,
    Gpr::R13,
    Gpr::R14,
    Gpr::R15,
];

/// An XMM vector register. Only the scalar low 64/32 bits are meaningful to
/// this backend; we never lower to wider SIMD ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[allow(non_camel_case_types)]
pub enum Xmm {
    Xmm0,
    Xmm1,
    Xmm2,
    Xmm3,
    Xmm4,
    Xmm5,
    Xmm6,
    Xmm7,
    Xmm8,
    Xmm9,
    Xmm10,
    Xmm11,
    Xmm12,
    Xmm13,
    Xmm14,
    Xmm15,
}

pub const ALL_XMM: [Xmm; 16] = [
    Xmm::Xmm0,
    Xmm::Xmm1,
    Xmm::Xmm2,
    Xmm::Xmm3,
    Xmm::Xmm4,
    Xmm::Xmm5,
    Xmm::Xmm6,
    Xmm::Xmm7,
    Xmm::Xmm8,
    Xmm::Xmm9,
    Xmm::Xmm10,
    Xmm::Xmm11,
    Xmm::Xmm12,
    Xmm::Xmm13,
    Xmm::Xmm14,
    Xmm::Xmm15,
];

/// A physical register: the tagged union of GPR, XMM, and the x87 implicit
/// top-of-stack (used only by long-double translators, which never name a
/// specific x87 register directly; `X87Top` is a marker for those call sites
/// that need to talk about "the top of the FP stack" as a location).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reg {
    Gpr(Gpr),
    Xmm(Xmm),
    X87Top,
}

impl From<Gpr> for Reg {
    fn from(g: Gpr) -> Reg {
        Reg::Gpr(g)
    }
}

impl From<Xmm> for Reg {
    fn from(x: Xmm) -> Reg {
        Reg::Xmm(x)
    }
}

impl Reg {
    pub fn is_float(self) -> bool {
        matches!(self, Reg::Xmm(_) | Reg::X87Top)
    }

    pub fn is_integer(self) -> bool {
        matches!(self, Reg::Gpr(_))
    }

    pub fn as_gpr(self) -> Option<Gpr> {
        match self {
            Reg::Gpr(g) => Some(g),
            _ => None,
        }
    }

    pub fn as_xmm(self) -> Option<Xmm> {
        match self {
            Reg::Xmm(x) => Some(x),
            _ => None,
        }
    }

    /// ABI role of this register under the System V AMD64 calling convention.
    pub fn role(self) -> AbiRole {
        match self {
            Reg::Gpr(Gpr::Rsp) => AbiRole::StackPointer,
            Reg::Gpr(Gpr::Rbp) => AbiRole::BasePointer,
            Reg::Gpr(g) if CALLEE_SAVED_GPR.contains(&g) => AbiRole::CalleeSaved,
            Reg::Gpr(_) => AbiRole::CallerSaved,
            Reg::Xmm(_) => AbiRole::CallerSaved,
            Reg::X87Top => AbiRole::CallerSaved,
        }
    }

    /// Render this register's 64-bit (GPR) or full (XMM) name, ignoring any
    /// width override. Used by the text emitter and the inline-asm template
    /// formatter when no explicit size suffix applies.
    pub fn widest_name(self) -> &'static str {
        match self {
            Reg::Gpr(g) => gpr_name(g, Width::Qword),
            Reg::Xmm(x) => xmm_name(x),
            Reg::X87Top => "st(0)",
        }
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.widest_name())
    }
}

/// ABI role: whether a register is preserved across calls, clobbered by
/// them, or reserved by the frame layout entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbiRole {
    CallerSaved,
    CalleeSaved,
    StackPointer,
    BasePointer,
}

/// Registers the callee must restore before returning, per the System V
/// AMD64 ABI.
pub const CALLEE_SAVED_GPR: [Gpr; 5] = [Gpr::Rbx, Gpr::R12, Gpr::R13, Gpr::R14, Gpr::R15];

/// Registers a call may clobber; everything not callee-saved or reserved.
pub const CALLER_SAVED_GPR: [Gpr; 9] = [
    Gpr::Rax,
    Gpr::Rcx,
    Gpr::Rdx,
    Gpr::Rsi,
    Gpr::Rdi,
    Gpr::R8,
    Gpr::R9,
    Gpr::R10,
    Gpr::R11,
];

/// Integer argument registers, in System V AMD64 classification order.
pub const INTEGER_PARAMETER_REGISTERS: [Gpr; 6] =
    [Gpr::Rdi, Gpr::Rsi, Gpr::Rdx, Gpr::Rcx, Gpr::R8, Gpr::R9];

/// SSE argument registers, in System V AMD64 classification order.
pub const SSE_PARAMETER_REGISTERS: [Xmm; 8] = [
    Xmm::Xmm0,
    Xmm::Xmm1,
    Xmm::Xmm2,
    Xmm::Xmm3,
    Xmm::Xmm4,
    Xmm::Xmm5,
    Xmm::Xmm6,
    Xmm::Xmm7,
];

/// `Gpr` is never eligible for generic allocation beyond these two; the
/// ledger asserts against this list directly rather than trusting every
/// caller to check `role()`.
pub fn is_allocatable(reg: Gpr) -> bool {
    !matches!(reg, Gpr::Rsp | Gpr::Rbp)
}

fn gpr_name(g: Gpr, width: Width) -> &'static str {
    use Gpr::*;
    // (byte, word, dword, qword) forms; `width` never projects a GPR to
    // `Tbyte` (that variant only describes x87 memory operands).
    let (b, w, d, q) = match g {
        Rax => ("al", "ax", "eax", "rax"),
        Rcx => ("cl", "cx", "ecx", "rcx"),
        Rdx => ("dl", "dx", "edx", "rdx"),
        Rbx => ("bl", "bx", "ebx", "rbx"),
        Rsp => ("spl", "sp", "esp", "rsp"),
        Rbp => ("bpl", "bp", "ebp", "rbp"),
        Rsi => ("sil", "si", "esi", "rsi"),
        Rdi => ("dil", "di", "edi", "rdi"),
        R8 => ("r8b", "r8w", "r8d", "r8"),
        R9 => ("r9b", "r9w", "r9d", "r9"),
        R10 => ("r10b", "r10w", "r10d", "r10"),
        R11 => ("r11b", "r11w", "r11d", "r11"),
        R12 => ("r12b", "r12w", "r12d", "r12"),
        R13 => ("r13b", "r13w", "r13d", "r13"),
        R14 => ("r14b", "r14w", "r14d", "r14"),
        R15 => ("r15b", "r15w", "r15d", "r15"),
    };
    match width {
        Width::Byte => b,
        Width::Word => w,
        Width::Dword => d,
        Width::Qword => q,
        Width::Tbyte => q,
    }
}

fn xmm_name(x: Xmm) -> &'static str {
    use Xmm::*;
    match x {
        Xmm0 => "xmm0",
        Xmm1 => "xmm1",
        Xmm2 => "xmm2",
        Xmm3 => "xmm3",
        Xmm4 => "xmm4",
        Xmm5 => "xmm5",
        Xmm6 => "xmm6",
        Xmm7 => "xmm7",
        Xmm8 => "xmm8",
        Xmm9 => "xmm9",
        Xmm10 => "xmm10",
        Xmm11 => "xmm11",
        Xmm12 => "xmm12",
        Xmm13 => "xmm13",
        Xmm14 => "xmm14",
        Xmm15 => "xmm15",
    }
}

/// A register name at a specific width, as rendered by the text emitter and
/// the inline-asm template formatter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizedReg {
    pub reg: Reg,
    pub width: Width,
}

impl SizedReg {
    pub fn new(reg: Reg, width: Width) -> Self {
        SizedReg { reg, width }
    }

    /// The enclosing 64-bit (or full XMM) register this projects from.
    /// `widest(width(r, w)) = r` is the round-trip property tests check.
    pub fn widest(self) -> Reg {
        self.reg
    }
}

impl fmt::Display for SizedReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.reg {
            Reg::Gpr(g) => f.write_str(gpr_name(g, self.width)),
            Reg::Xmm(x) => f.write_str(xmm_name(x)),
            Reg::X87Top => f.write_str("st(0)"),
        }
    }
}

/// Project `reg` to the requested width. For `Xmm`/`X87Top`, width is
/// informational only (there is no narrower addressable form this backend
/// emits); the projection is the identity.
pub fn width(reg: Reg, w: Width) -> SizedReg {
    SizedReg::new(reg, w)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn width_round_trips_to_widest() {
        for g in ALL_GPR {
            for w in [Width::Byte, Width::Word, Width::Dword, Width::Qword] {
                let sized = width(Reg::Gpr(g), w);
                assert_eq!(sized.widest(), Reg::Gpr(g));
            }
        }
    }

    #[test]
    fn rsp_rbp_not_allocatable() {
        assert!(!is_allocatable(Gpr::Rsp));
        assert!(!is_allocatable(Gpr::Rbp));
        assert!(is_allocatable(Gpr::Rax));
    }

    #[test]
    fn callee_saved_disjoint_from_caller_saved() {
        for g in CALLEE_SAVED_GPR {
            assert!(!CALLER_SAVED_GPR.contains(&g));
        }
    }
}
