//! AMD64 code-generation backend: lowers an SSA-form optimizer IR into
//! concrete x86-64 assembly text under the System V AMD64 ABI.
//!
//! This crate implements the core of a C compiler's AMD64 backend: the
//! instruction selector ([`select`]), the calling-convention engine
//! ([`call`]), inline-assembly lowering ([`inline_asm`]), and the storage
//! bookkeeping ([`storage`]) those two lean on. The module-level driver that
//! emits section directives, iterates live functions, and writes DWARF is an
//! external collaborator and is not part of this crate; callers drive
//! translation by calling [`select::translate_instruction`] for each SSA
//! instruction in block order, supplying a concrete [`emit::AssemblyEmitter`].
//!
//! The legacy ("System V") and newer ("amd64-common") translation paths this
//! family of backends historically carried side by side are unified here
//! into the single path described by the per-opcode contracts below.

pub mod abi;
pub mod alloc;
pub mod call;
pub mod config;
pub mod emit;
pub mod error;
pub mod frame;
pub mod inline_asm;
pub mod ir;
pub mod reg;
pub mod select;
pub mod storage;

pub use error::{CodegenResult, Error, ErrorKind};
