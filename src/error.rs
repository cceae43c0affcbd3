//! Core error taxonomy shared by every component in this crate.
//!
//! Mirrors the error-kind set that must be representable distinctly and
//! mappable to wire-level errno-class strings (invalid-argument,
//! permission-denied, ...). Library code returns `Result<T, FluxError>`;
//! the CLI binary converts into `anyhow::Error` at the command boundary.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FluxError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("out of memory")]
    OutOfMemory,

    #[error("no such entry: {0}")]
    NoSuchEntry(String),

    #[error("already exists: {0}")]
    ExistsAlready(String),

    #[error("in progress: {0}")]
    InProgress(String),

    #[error("connection reset")]
    ConnectionReset,

    #[error("would block")]
    WouldBlock,

    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("read only")]
    ReadOnly,

    #[error("no data")]
    NoData,

    #[error("timeout")]
    Timeout,

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("overflow")]
    Overflow,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl FluxError {
    /// The wire-level errno-class string used in submit responses and
    /// `ErrorResponse::code`.
    pub fn code(&self) -> &'static str {
        match self {
            FluxError::InvalidArgument(_) => "invalid-argument",
            FluxError::PermissionDenied(_) => "permission-denied",
            FluxError::OutOfMemory => "out-of-memory",
            FluxError::NoSuchEntry(_) => "no-such-entry",
            FluxError::ExistsAlready(_) => "exists-already",
            FluxError::InProgress(_) => "in-progress",
            FluxError::ConnectionReset => "connection-reset",
            FluxError::WouldBlock => "wouldblock",
            FluxError::ProtocolError(_) => "protocol-error",
            FluxError::ReadOnly => "read-only",
            FluxError::NoData => "no-data",
            FluxError::Timeout => "timeout",
            FluxError::Unsupported(_) => "unsupported",
            FluxError::Overflow => "overflow",
            FluxError::Io(_) => "io-error",
        }
    }

    /// Whether the caller may retry the same request and expect a
    /// different outcome.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            FluxError::InProgress(_)
                | FluxError::ConnectionReset
                | FluxError::WouldBlock
                | FluxError::Timeout
                | FluxError::Io(_)
        )
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        FluxError::InvalidArgument(msg.into())
    }

    pub fn denied(msg: impl Into<String>) -> Self {
        FluxError::PermissionDenied(msg.into())
    }
}

pub type FluxResult<T> = Result<T, FluxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_matches_spec_taxonomy() {
        assert_eq!(FluxError::invalid("x").code(), "invalid-argument");
        assert_eq!(FluxError::denied("x").code(), "permission-denied");
        assert_eq!(FluxError::NoData.code(), "no-data");
    }

    #[test]
    fn retryable_is_false_for_permanent_failures() {
        assert!(!FluxError::invalid("x").retryable());
        assert!(!FluxError::denied("x").retryable());
        assert!(FluxError::Timeout.retryable());
    }
}
