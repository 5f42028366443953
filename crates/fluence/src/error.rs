//! Internal runtime failure taxonomy.
//!
//! Execution paths use [`RunError`] with [`RunResult`] and `?` propagation.
//! A `RunError` is cheap and context-free; the VM attaches source locations,
//! stack traces, and elaborated hints when an error escapes unhandled and is
//! converted into a public [`Diagnostic`](crate::diagnostic::Diagnostic).

use strum::{Display, IntoStaticStr};

use crate::value::Value;

/// Result type alias for operations that can produce a runtime error.
pub(crate) type RunResult<T> = Result<T, RunError>;

/// Kinds of runtime failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr)]
pub enum ErrorKind {
    /// A name did not resolve to any variable, function, or method.
    UnknownVariable,
    /// An operation was applied to operands of unsupported types.
    TypeMismatch,
    /// A callable was invoked with the wrong number of arguments.
    ArityMismatch,
    /// A collection was indexed outside its bounds (or with a negative index).
    IndexOutOfRange,
    /// Integer division or modulo by zero.
    DivisionByZero,
    /// The call stack exceeded the recursion limit.
    RecursionLimit,
    /// The configured execution deadline expired.
    Timeout,
    /// The host requested a stop via `request_stop()`.
    Stopped,
    /// A script-level `throw` that no handler caught.
    ScriptException,
    /// Anything without a more precise classification.
    NonSpecific,
}

/// An in-flight runtime error.
///
/// `payload` carries the thrown value for `ScriptException` so handlers can
/// bind it; every other kind leaves it `None`.
#[derive(Debug, Clone)]
pub(crate) struct RunError {
    pub kind: ErrorKind,
    pub message: String,
    pub payload: Option<Value>,
    /// Kind-specific elaboration lines (e.g. near-miss signatures).
    pub hints: Vec<String>,
}

impl RunError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            payload: None,
            hints: Vec::new(),
        }
    }

    pub fn with_hints(kind: ErrorKind, message: impl Into<String>, hints: Vec<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            payload: None,
            hints,
        }
    }

    pub fn thrown(message: impl Into<String>, payload: Option<Value>) -> Self {
        Self {
            kind: ErrorKind::ScriptException,
            message: message.into(),
            payload,
        hints: Vec::new(),
        }
    }

    pub fn type_mismatch(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TypeMismatch, message)
    }

    pub fn unknown_variable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UnknownVariable, message)
    }

    pub fn arity_mismatch(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ArityMismatch, message)
    }

    pub fn index_out_of_range(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::IndexOutOfRange, message)
    }

    pub fn division_by_zero() -> Self {
        Self::new(ErrorKind::DivisionByZero, "division by zero")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_display_matches_variant_name() {
        assert_eq!(ErrorKind::UnknownVariable.to_string(), "UnknownVariable");
        assert_eq!(ErrorKind::DivisionByZero.to_string(), "DivisionByZero");
    }

    #[test]
    fn thrown_carries_payload_kind() {
        let err = RunError::thrown("boom", None);
        assert_eq!(err.kind, ErrorKind::ScriptException);
        assert_eq!(err.message, "boom");
    }
}
