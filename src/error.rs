//! The error taxonomy shared across every component (§7 of the design).
//!
//! Components that only need to propagate failures with context use
//! `anyhow::Result` at their call sites, same as the teacher crate. Anything
//! that has to branch on *kind* — the breaker's transient/permanent split,
//! the store client's `ClientError`/`BulkError`, the orchestrator's
//! lifecycle failures — gets a `thiserror` enum instead.

use thiserror::Error;

/// Top-level error kind, one variant per row of the recovery-policy table.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("path security violation: {0}")]
    PathSecurity(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("transient I/O failure: {0}")]
    Transient(String),

    #[error("permanent I/O failure: {0}")]
    Permanent(String),

    #[error("service lifecycle error: {0}")]
    ServiceLifecycle(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Error::Configuration(msg.into())
    }

    pub fn path_security(msg: impl Into<String>) -> Self {
        Error::PathSecurity(msg.into())
    }

    pub fn decode(msg: impl Into<String>) -> Self {
        Error::Decode(msg.into())
    }

    /// Whether this error represents a transient condition a retry policy
    /// should act on (network, timeout, 5xx) as opposed to a permanent one
    /// (4xx, validation, config) that should propagate immediately.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind::*;
        match e.kind() {
            TimedOut | Interrupted | WouldBlock => Error::Transient(e.to_string()),
            _ => Error::Permanent(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Decode(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() {
            Error::Transient(e.to_string())
        } else if let Some(status) = e.status() {
            if status.is_server_error() {
                Error::Transient(format!("server error {status}: {e}"))
            } else {
                Error::Permanent(format!("client error {status}: {e}"))
            }
        } else {
            Error::Transient(e.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_io_errors_classify_as_transient() {
        let e: Error = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow").into();
        assert!(e.is_transient());
    }

    #[test]
    fn permanent_io_errors_classify_as_permanent() {
        let e: Error = std::io::Error::new(std::io::ErrorKind::NotFound, "missing").into();
        assert!(!e.is_transient());
    }

    #[test]
    fn decode_errors_are_never_transient() {
        let bad = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let e: Error = bad.into();
        assert!(!e.is_transient());
    }
}
