//! The error a caller of `perform` sees.
//!
//! Exactly one of these is returned per failed perform. Business outcomes
//! ([`PerformError::Domain`]) are kept apart from infrastructure failures
//! ([`PerformError::Unexpected`]) so callers can decide whether to reload the
//! core by matching on the type alone.

use std::fmt;

use serde_json::Value;
use thiserror::Error;

use crate::message::CoreException;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PerformError {
    /// The use case ran and reported an error value of its own.
    #[error("use case failed: {0}")]
    Domain(DomainError),
    /// Declared input or output shape was violated.
    #[error("validation failed: {0}")]
    Validation(ValidationError),
    #[error("unexpected error: {0}")]
    Unexpected(UnexpectedError),
}

impl PerformError {
    pub fn validation(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation(ValidationError {
            code: code.into(),
            message: message.into(),
        })
    }

    pub fn unexpected(kind: UnexpectedKind, message: impl Into<String>) -> Self {
        Self::Unexpected(UnexpectedError {
            kind,
            message: message.into(),
        })
    }

    /// Classify an exception reported by the core.
    #[must_use]
    pub fn from_exception(exception: CoreException) -> Self {
        if exception.error_code.ends_with("ValidationError") {
            Self::Validation(ValidationError {
                code: exception.error_code,
                message: exception.message,
            })
        } else {
            Self::Unexpected(UnexpectedError {
                kind: UnexpectedKind::Exception {
                    code: exception.error_code,
                },
                message: exception.message,
            })
        }
    }

    /// Whether the core instance must be re-initialized before the next perform.
    #[must_use]
    pub fn requires_reload(&self) -> bool {
        match self {
            Self::Unexpected(err) => err.requires_reload(),
            Self::Domain(_) | Self::Validation(_) => false,
        }
    }
}

/// A structured error value produced by the integration logic.
#[derive(Debug, Clone, PartialEq)]
pub struct DomainError {
    pub value: Value,
}

impl fmt::Display for DomainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub code: String,
    pub message: String,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnexpectedError {
    pub kind: UnexpectedKind,
    pub message: String,
}

impl UnexpectedError {
    #[must_use]
    pub fn requires_reload(&self) -> bool {
        matches!(
            self.kind,
            UnexpectedKind::Trap | UnexpectedKind::BridgeViolation
        )
    }
}

impl fmt::Display for UnexpectedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnexpectedKind {
    /// The core raised an exception through `perform-output-exception`.
    Exception { code: String },
    /// The core trapped; its memory can no longer be trusted.
    Trap,
    /// The suspend/resume state machine was violated.
    BridgeViolation,
    /// The perform export returned without reporting any outcome.
    MissingOutcome,
    /// The runtime was not in a state that allows the call.
    Lifecycle,
    /// A host-side failure outside the core.
    Host,
}

impl fmt::Display for UnexpectedKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exception { code } => write!(f, "exception {code}"),
            Self::Trap => f.write_str("core trap"),
            Self::BridgeViolation => f.write_str("bridge violation"),
            Self::MissingOutcome => f.write_str("missing outcome"),
            Self::Lifecycle => f.write_str("lifecycle"),
            Self::Host => f.write_str("host"),
        }
    }
}
