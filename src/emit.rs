//! The assembly emitter: component A, an external collaborator. Only its
//! operation vocabulary is fixed here (§2: "syntax-aware printing of
//! instructions, operands, labels, directives"); translators in
//! [`crate::select`] depend only on the [`AssemblyEmitter`] trait, never on
//! a concrete renderer, so the module-level driver can plug in whatever
//! formatter owns section/symbol bookkeeping.
//!
//! [`TextEmitter`] is a minimal concrete implementation good enough to drive
//! the crate's own tests end to end; a production driver is expected to
//! supply a richer one (interning labels, deduplicating rodata, etc).

use core::fmt::Write as _;

use crate::error::CodegenResult;
use crate::reg::{width, Gpr, Reg, Width};

/// An assembly-level operand: a register at some width, a memory reference,
/// or an immediate/label. `Operand` is deliberately syntax-agnostic; the
/// emitter decides how to render the destination/source order and `$`/`%`
/// sigils for its configured [`crate::config::Syntax`].
#[derive(Debug, Clone)]
pub enum Operand {
    Reg(Reg, Width),
    Mem(MemOperand),
    Imm(i64),
    /// A 64-bit immediate too wide for a normal `mov`/`cmp` encoding;
    /// translators route these through `movabs`.
    ImmU64(u64),
    /// A bare symbol reference, e.g. for `call`, `lea sym(%rip)`, or a
    /// branch target label.
    Label(String),
}

impl Operand {
    pub fn reg(reg: impl Into<Reg>, width: Width) -> Operand {
        Operand::Reg(reg.into(), width)
    }

    pub fn reg64(reg: impl Into<Reg>) -> Operand {
        Operand::Reg(reg.into(), Width::Qword)
    }
}

/// `segment:[base + index*scale + disp]`. `base`/`index` are `None` for a
/// bare `rip`-relative or absolute reference (`symbol`).
#[derive(Debug, Clone, Default)]
pub struct MemOperand {
    pub base: Option<Gpr>,
    pub index: Option<(Gpr, u8)>,
    pub disp: i64,
    pub symbol: Option<String>,
    pub rip_relative: bool,
    pub fs_segment: bool,
    /// Explicit operand size, needed whenever no register operand in the
    /// same instruction disambiguates it (Intel `byte ptr [...]`; AT&T
    /// folds this into the mnemonic suffix instead, via [`Width::suffix`]).
    pub width: Option<Width>,
}

impl MemOperand {
    pub fn based(base: Gpr, disp: i64) -> MemOperand {
        MemOperand {
            base: Some(base),
            disp,
            ..Default::default()
        }
    }

    pub fn symbol(name: impl Into<String>) -> MemOperand {
        MemOperand {
            symbol: Some(name.into()),
            rip_relative: true,
            ..Default::default()
        }
    }

    pub fn fs(disp: i64) -> MemOperand {
        MemOperand {
            disp,
            fs_segment: true,
            ..Default::default()
        }
    }
}

/// The operation vocabulary a translator may invoke. Every method has a
/// default implementation in terms of `raw`, so a concrete emitter only has
/// to implement instruction/label/directive/data emission; the ergonomic
/// per-opcode helpers (`mov_reg_reg`, `setcc`, `x87`, ...) translators
/// actually call are provided here.
pub trait AssemblyEmitter {
    /// Emit one instruction: `mnemonic operands[0], operands[1], ...` in
    /// whatever order/syntax the concrete emitter renders (AT&T reverses
    /// source/destination relative to the logical order given here, which
    /// always lists the *destination first* when there is one).
    fn raw(&mut self, mnemonic: &str, operands: &[Operand]) -> CodegenResult<()>;

    fn emit_label(&mut self, name: &str) -> CodegenResult<()>;

    fn directive(&mut self, text: &str) -> CodegenResult<()>;

    /// The syntax this emitter renders in; default helpers that must choose
    /// between an AT&T-suffixed mnemonic and an explicit Intel size keyword
    /// (`movsx` + `byte ptr` vs `movsbq`) consult this.
    fn syntax(&self) -> crate::config::Syntax;

    fn comment(&mut self, _text: &str) -> CodegenResult<()> {
        Ok(())
    }

    // -- register/memory moves -------------------------------------------------

    fn mov_reg_reg(&mut self, dst: Reg, src: Reg) -> CodegenResult<()> {
        let mnemonic = if dst.is_float() && src.is_float() {
            "movdqu"
        } else if dst.is_float() != src.is_float() {
            "movq"
        } else {
            "mov"
        };
        self.raw(mnemonic, &[Operand::reg64(dst), Operand::reg64(src)])
    }

    fn mov_reg_mem(&mut self, dst: Reg, src: MemOperand, width: Width) -> CodegenResult<()> {
        let mnemonic = if dst.is_float() {
            if width == Width::Dword { "movss" } else { "movsd" }
        } else {
            "mov"
        };
        self.raw(mnemonic, &[Operand::Reg(dst, width), Operand::Mem(src)])
    }

    fn mov_mem_reg(&mut self, dst: MemOperand, src: Reg, width: Width) -> CodegenResult<()> {
        let mnemonic = if src.is_float() {
            if width == Width::Dword { "movss" } else { "movsd" }
        } else {
            "mov"
        };
        self.raw(mnemonic, &[Operand::Mem(dst), Operand::Reg(src, width)])
    }

    fn mov_imm(&mut self, dst: Reg, imm: i64) -> CodegenResult<()> {
        self.raw("mov", &[Operand::reg64(dst), Operand::Imm(imm)])
    }

    fn movabs(&mut self, dst: Reg, imm: u64) -> CodegenResult<()> {
        self.raw("movabs", &[Operand::reg64(dst), Operand::ImmU64(imm)])
    }

    fn movsx(&mut self, dst: Reg, mut src: MemOperand, src_width: Width) -> CodegenResult<()> {
        src.width = Some(src_width);
        let mnemonic = if self.syntax() == crate::config::Syntax::X86_64Att {
            format!("movs{}{}", src_width.att_suffix(), Width::Qword.att_suffix())
        } else {
            "movsx".to_string()
        };
        self.raw(&mnemonic, &[Operand::reg64(dst), Operand::Mem(src)])
    }

    fn movzx(&mut self, dst: Reg, mut src: MemOperand, src_width: Width) -> CodegenResult<()> {
        src.width = Some(src_width);
        if src_width == Width::Dword {
            // An ordinary 32-bit `mov` implicitly zero-extends into the
            // full 64-bit register; no explicit `movzx` encoding exists.
            return self.raw("mov", &[Operand::Reg(dst, Width::Dword), Operand::Mem(src)]);
        }
        let mnemonic = if self.syntax() == crate::config::Syntax::X86_64Att {
            format!("movz{}{}", src_width.att_suffix(), Width::Qword.att_suffix())
        } else {
            "movzx".to_string()
        };
        self.raw(&mnemonic, &[Operand::reg64(dst), Operand::Mem(src)])
    }

    fn lea(&mut self, dst: Reg, addr: MemOperand) -> CodegenResult<()> {
        self.raw("lea", &[Operand::reg64(dst), Operand::Mem(addr)])
    }

    // -- arithmetic/logic --------------------------------------------------

    fn binop(&mut self, mnemonic: &str, dst: Reg, src: Operand) -> CodegenResult<()> {
        self.raw(mnemonic, &[Operand::reg64(dst), src])
    }

    fn cmp(&mut self, lhs: Reg, rhs: Operand) -> CodegenResult<()> {
        self.raw("cmp", &[Operand::reg64(lhs), rhs])
    }

    fn test(&mut self, lhs: Reg, rhs: Operand) -> CodegenResult<()> {
        self.raw("test", &[Operand::reg64(lhs), rhs])
    }

    fn setcc(&mut self, cc: &str, dst: Reg) -> CodegenResult<()> {
        self.raw(&format!("set{cc}"), &[Operand::Reg(dst, Width::Byte)])
    }

    fn shift(&mut self, mnemonic: &str, dst: Reg) -> CodegenResult<()> {
        // Shift count is implicitly `cl`; callers are responsible for
        // putting the count there first (§4.G: "shift count must occupy
        // RCX").
        self.raw(mnemonic, &[Operand::reg64(dst), Operand::Reg(Gpr::Rcx.into(), Width::Byte)])
    }

    fn shift_imm(&mut self, mnemonic: &str, dst: Reg, count: u8) -> CodegenResult<()> {
        self.raw(mnemonic, &[Operand::reg64(dst), Operand::Imm(count as i64)])
    }

    fn unary(&mut self, mnemonic: &str, operand: Operand) -> CodegenResult<()> {
        self.raw(mnemonic, &[operand])
    }

    fn cqo(&mut self) -> CodegenResult<()> {
        self.raw("cqo", &[])
    }

    fn push_reg(&mut self, reg: Reg) -> CodegenResult<()> {
        self.raw("push", &[Operand::reg64(reg)])
    }

    fn pop_reg(&mut self, reg: Reg) -> CodegenResult<()> {
        self.raw("pop", &[Operand::reg64(reg)])
    }

    fn sub_imm(&mut self, dst: Reg, imm: i64) -> CodegenResult<()> {
        self.raw("sub", &[Operand::reg64(dst), Operand::Imm(imm)])
    }

    fn add_imm(&mut self, dst: Reg, imm: i64) -> CodegenResult<()> {
        self.raw("add", &[Operand::reg64(dst), Operand::Imm(imm)])
    }

    fn and_imm(&mut self, dst: Reg, imm: i64) -> CodegenResult<()> {
        self.raw("and", &[Operand::reg64(dst), Operand::Imm(imm)])
    }

    // -- control flow -------------------------------------------------------

    fn jmp_label(&mut self, label: &str) -> CodegenResult<()> {
        self.raw("jmp", &[Operand::Label(label.to_string())])
    }

    fn jmp_reg(&mut self, reg: Reg) -> CodegenResult<()> {
        self.raw("jmp", &[Operand::reg64(reg)])
    }

    fn jcc(&mut self, cc: &str, label: &str) -> CodegenResult<()> {
        self.raw(&format!("j{cc}"), &[Operand::Label(label.to_string())])
    }

    fn call_symbol(&mut self, symbol: &str) -> CodegenResult<()> {
        self.raw("call", &[Operand::Label(symbol.to_string())])
    }

    fn call_reg(&mut self, reg: Reg) -> CodegenResult<()> {
        self.raw("call", &[Operand::reg64(reg)])
    }

    fn ret(&mut self) -> CodegenResult<()> {
        self.raw("ret", &[])
    }

    // -- string/memory ops ---------------------------------------------------

    fn cld(&mut self) -> CodegenResult<()> {
        self.raw("cld", &[])
    }

    fn rep_movsb(&mut self) -> CodegenResult<()> {
        self.raw("rep movsb", &[])
    }

    fn rep_stosb(&mut self) -> CodegenResult<()> {
        self.raw("rep stosb", &[])
    }

    // -- SSE/x87 --------------------------------------------------------------

    fn sse_binop(&mut self, mnemonic: &str, dst: Reg, src: Operand) -> CodegenResult<()> {
        self.raw(mnemonic, &[Operand::reg64(dst), src])
    }

    fn cvt(&mut self, mnemonic: &str, dst: Reg, src: Operand) -> CodegenResult<()> {
        self.raw(mnemonic, &[Operand::reg64(dst), src])
    }

    fn x87(&mut self, mnemonic: &str, operand: Option<Operand>) -> CodegenResult<()> {
        match operand {
            // AT&T spells the tbyte-operand form of `fld`/`fstp` as
            // `fldt`/`fstpt` rather than carrying an explicit size keyword;
            // Intel syntax instead renders it through the memory operand's
            // `tbyte ptr` prefix, which `render_mem` already supplies.
            Some(Operand::Mem(m))
                if m.width == Some(Width::Tbyte) && self.syntax() == crate::config::Syntax::X86_64Att =>
            {
                self.raw(&format!("{mnemonic}t"), &[Operand::Mem(m)])
            }
            Some(op) => self.raw(mnemonic, &[op]),
            None => self.raw(mnemonic, &[]),
        }
    }

    fn pushfq(&mut self) -> CodegenResult<()> {
        self.raw("pushfq", &[])
    }

    fn popfq(&mut self) -> CodegenResult<()> {
        self.raw("popfq", &[])
    }

    /// Extracts 64-bit lane `imm` of `src` into `dst` (a GPR or memory
    /// operand). Used by `GetArgument` to pull an SSE-classified eightbyte
    /// of a register-passed aggregate out of its XMM argument register.
    fn pextrq(&mut self, dst: Operand, src: Reg, imm: i64) -> CodegenResult<()> {
        self.raw("pextrq", &[dst, Operand::reg64(src), Operand::Imm(imm)])
    }

    /// `data16` operand-size-override prefix, emitted standalone the way
    /// the general-dynamic TLS sequence pads `lea`/`call` to the fixed
    /// instruction length the linker's TLS relaxation expects.
    fn data16(&mut self) -> CodegenResult<()> {
        self.raw("data16", &[])
    }

    /// `rex64` (`REX.W`) prefix, emitted standalone ahead of the
    /// `__tls_get_addr` call in the general-dynamic TLS sequence.
    fn rex_w(&mut self) -> CodegenResult<()> {
        self.raw("rex64", &[])
    }
}

/// A minimal, fully-owned text renderer used by this crate's own tests
/// (feature `test-emitter`) and suitable as a starting point for a real
/// driver's formatter. Renders AT&T or Intel syntax per [`crate::config::Syntax`].
#[cfg(any(test, feature = "test-emitter"))]
pub struct TextEmitter {
    pub syntax: crate::config::Syntax,
    pub buffer: String,
}

#[cfg(any(test, feature = "test-emitter"))]
impl TextEmitter {
    pub fn new(syntax: crate::config::Syntax) -> Self {
        TextEmitter {
            syntax,
            buffer: String::new(),
        }
    }

    fn is_att(&self) -> bool {
        matches!(self.syntax, crate::config::Syntax::X86_64Att)
    }

    fn render_operand(&self, op: &Operand) -> String {
        match op {
            Operand::Reg(r, w) => {
                let sized = width(*r, *w);
                if self.is_att() {
                    format!("%{sized}")
                } else {
                    sized.to_string()
                }
            }
            Operand::Mem(m) => self.render_mem(m),
            Operand::Imm(i) => {
                if self.is_att() {
                    format!("${i}")
                } else {
                    i.to_string()
                }
            }
            Operand::ImmU64(i) => {
                if self.is_att() {
                    format!("${i:#x}")
                } else {
                    format!("{i:#x}")
                }
            }
            Operand::Label(l) => l.clone(),
        }
    }

    fn render_mem(&self, m: &MemOperand) -> String {
        let ptr_prefix = match (self.is_att(), m.width) {
            (false, Some(w)) => format!("{} ptr ", w.ptr_keyword()),
            _ => String::new(),
        };
        let mut inner = String::new();
        if let Some(sym) = &m.symbol {
            inner.push_str(sym);
            if m.rip_relative {
                inner.push_str(if self.is_att() { "(%rip)" } else { " [rip]" });
                return format!("{ptr_prefix}{inner}");
            }
        }
        if self.is_att() {
            if m.disp != 0 || (m.base.is_none() && m.index.is_none()) {
                write!(inner, "{}", m.disp).ok();
            }
            if m.base.is_some() || m.index.is_some() {
                inner.push('(');
                if let Some(b) = m.base {
                    write!(inner, "%{}", width(b.into(), Width::Qword)).ok();
                }
                if let Some((idx, scale)) = m.index {
                    write!(inner, ",%{},{}", width(idx.into(), Width::Qword), scale).ok();
                }
                inner.push(')');
            }
            if m.fs_segment {
                format!("%fs:{inner}")
            } else {
                inner
            }
        } else {
            let mut s = String::from("[");
            if m.fs_segment {
                s.push_str("fs:");
            }
            if let Some(b) = m.base {
                write!(s, "{}", width(b.into(), Width::Qword)).ok();
            }
            if let Some((idx, scale)) = m.index {
                write!(s, " + {}*{}", width(idx.into(), Width::Qword), scale).ok();
            }
            if m.disp != 0 {
                if m.disp > 0 {
                    write!(s, " + {}", m.disp).ok();
                } else {
                    write!(s, " - {}", -m.disp).ok();
                }
            }
            s.push(']');
            format!("{ptr_prefix}{s}")
        }
    }
}

#[cfg(any(test, feature = "test-emitter"))]
impl AssemblyEmitter for TextEmitter {
    fn syntax(&self) -> crate::config::Syntax {
        self.syntax
    }

    fn raw(&mut self, mnemonic: &str, operands: &[Operand]) -> CodegenResult<()> {
        let rendered: Vec<String> = operands.iter().map(|o| self.render_operand(o)).collect();
        let operand_str = if self.is_att() {
            let mut rev = rendered.clone();
            rev.reverse();
            rev.join(", ")
        } else {
            rendered.join(", ")
        };
        if operand_str.is_empty() {
            self.buffer.push_str(&format!("\t{mnemonic}\n"));
        } else {
            self.buffer.push_str(&format!("\t{mnemonic}\t{operand_str}\n"));
        }
        Ok(())
    }

    fn emit_label(&mut self, name: &str) -> CodegenResult<()> {
        self.buffer.push_str(&format!("{name}:\n"));
        Ok(())
    }

    fn directive(&mut self, text: &str) -> CodegenResult<()> {
        self.buffer.push_str(&format!("\t{text}\n"));
        Ok(())
    }

    fn comment(&mut self, text: &str) -> CodegenResult<()> {
        self.buffer.push_str(&format!("\t# {text}\n"));
        Ok(())
    }
}
