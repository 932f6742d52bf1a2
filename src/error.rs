//! Error types for the trace optimizer
//!
//! Every failure is local to one optimization attempt. The entry points only
//! publish results after a run succeeded, so an `Err` never leaves a
//! half-optimized trace behind.

use std::fmt;
use thiserror::Error;

/// Errors raised while parsing, configuring or optimizing a trace
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OptError {
    /// The trace can never run to completion (a guard is provably false)
    #[error("InvalidLoop: {0}")]
    InvalidLoop(String),

    /// A bridge does not fit any entry state of its target loop
    #[error("RetraceLoop: target loop must be retraced")]
    RetraceLoop,

    /// A field declared immutable by the front end was written to
    #[error("BogusPureField: store to immutable field '{0}'")]
    BogusPureField(String),

    /// An optimizer invariant was violated
    #[error("InternalError: {0}")]
    Internal(String),

    /// Malformed textual trace
    #[error("ParseError at line {line}: {message}")]
    Parse { line: usize, message: String },

    /// Bad pass list or policy file
    #[error("ConfigError: {0}")]
    Config(String),
}

/// Error kind for matching without the payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidLoop,
    RetraceLoop,
    BogusPureField,
    Internal,
    Parse,
    Config,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::InvalidLoop => write!(f, "InvalidLoop"),
            ErrorKind::RetraceLoop => write!(f, "RetraceLoop"),
            ErrorKind::BogusPureField => write!(f, "BogusPureField"),
            ErrorKind::Internal => write!(f, "InternalError"),
            ErrorKind::Parse => write!(f, "ParseError"),
            ErrorKind::Config => write!(f, "ConfigError"),
        }
    }
}

impl OptError {
    /// Create an InvalidLoop error
    pub fn invalid_loop(message: impl Into<String>) -> Self {
        OptError::InvalidLoop(message.into())
    }

    /// Create an internal invariant error
    pub fn internal(message: impl Into<String>) -> Self {
        OptError::Internal(message.into())
    }

    /// Create a BogusPureField error for the named field
    pub fn bogus_pure_field(field: impl Into<String>) -> Self {
        OptError::BogusPureField(field.into())
    }

    /// Create a parse error at a 1-indexed line
    pub fn parse(line: usize, message: impl Into<String>) -> Self {
        OptError::Parse {
            line,
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        OptError::Config(message.into())
    }

    /// Get the kind of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            OptError::InvalidLoop(_) => ErrorKind::InvalidLoop,
            OptError::RetraceLoop => ErrorKind::RetraceLoop,
            OptError::BogusPureField(_) => ErrorKind::BogusPureField,
            OptError::Internal(_) => ErrorKind::Internal,
            OptError::Parse { .. } => ErrorKind::Parse,
            OptError::Config(_) => ErrorKind::Config,
        }
    }

    /// Whether the caller should simply retry compilation later
    ///
    /// `InvalidLoop` and `RetraceLoop` are expected outcomes of speculative
    /// optimization; the others point at a front-end or optimizer bug.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, OptError::InvalidLoop(_) | OptError::RetraceLoop)
    }
}

/// Result type for optimizer operations
pub type Result<T> = std::result::Result<T, OptError>;
