//! Error model for the backend.
//!
//! Every fallible operation in this crate returns [`CodegenResult`]. We hand-roll
//! `Error`/`Display` here rather than pull in `thiserror`, matching the "minimal
//! external dependencies" stance code generators in this family tend to take.

use core::fmt;

/// Discriminates the *kind* of failure, independent of the diagnostic text
/// attached to it. Mirrors the error taxonomy a translation pass needs to
/// distinguish: some kinds are locally recoverable (`NotFound` during
/// longest-prefix matching), most are not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A required argument was absent, or an input violated an expected shape
    /// (wrong register width, wrong allocation class for the opcode, ...).
    InvalidParameter,
    /// An internal invariant was violated: unexpected opcode for a translator,
    /// a missing IR symbol, an allocation of the wrong class.
    InvalidState,
    /// A legal API used illegally: out-of-order release, double borrow, a
    /// register argument wider than 8 bytes.
    InvalidRequest,
    /// An optional lookup missed. Callers may propagate or catch this locally.
    NotFound,
    /// A feature the backend does not implement (e.g. returning a `va_list`
    /// by value).
    NotSupported,
    /// Scratch registers or stack space were exhausted.
    OutOfSpace,
    /// A heap allocation failed.
    MemAllocFailure,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::InvalidParameter => "invalid parameter",
            ErrorKind::InvalidState => "invalid state",
            ErrorKind::InvalidRequest => "invalid request",
            ErrorKind::NotFound => "not found",
            ErrorKind::NotSupported => "not supported",
            ErrorKind::OutOfSpace => "out of space",
            ErrorKind::MemAllocFailure => "memory allocation failure",
        };
        f.write_str(s)
    }
}

/// A diagnostic attached to an [`ErrorKind`]. Carries a short message and,
/// where the call site had one handy, a single format argument folded into
/// the message text (we don't keep a generic arg-list; one substitution
/// covers every call site this backend actually has).
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    message: String,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Error {
            kind,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for Error {}

/// The result type threaded through every translator, ledger operation, and
/// transform in this crate.
pub type CodegenResult<T> = Result<T, Error>;

/// Shorthand constructors, one per [`ErrorKind`], used pervasively enough
/// that spelling out `Error::new(ErrorKind::X, ...)` at every call site would
/// drown the translators in boilerplate.
macro_rules! err_ctor {
    ($name:ident, $kind:ident) => {
        pub(crate) fn $name(message: impl Into<String>) -> Error {
            Error::new(ErrorKind::$kind, message)
        }
    };
}

err_ctor!(err_invalid_parameter, InvalidParameter);
err_ctor!(err_invalid_state, InvalidState);
err_ctor!(err_invalid_request, InvalidRequest);
err_ctor!(err_not_found, NotFound);
err_ctor!(err_not_supported, NotSupported);
err_ctor!(err_out_of_space, OutOfSpace);
