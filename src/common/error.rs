//! Error types for minicfg

use crate::client::Consistency;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // === Storage Errors ===
    #[error("Corrupted data: {0}")]
    Corrupted(String),

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Change log error: {0}")]
    Log(String),

    #[error("Config storage error: {0}")]
    ConfigStorage(String),

    #[cfg(feature = "sled-backend")]
    #[error("Sled error: {0}")]
    Sled(#[from] sled::Error),

    // === Protocol Errors ===
    #[error("Bad hash for change {change_uuid}: expected {expected:?}, got {actual:?}")]
    BadHash {
        change_uuid: uuid::Uuid,
        expected: Option<String>,
        actual: Option<String>,
    },

    #[error("Expected increment in mutative message count. Expected: {expected} found: {actual}")]
    MutativeCountViolation { expected: u64, actual: u64 },

    #[error("Node halted after a fatal error: {0}")]
    Halted(String),

    #[error("Change application failed: {0}")]
    ApplyFailed(String),

    // === Cluster Errors ===
    #[error("Inconsistent change history: {0}")]
    Inconsistent(String),

    #[error("{}", format_failures(.consistency, .failures))]
    ChangeFailed {
        consistency: Consistency,
        failures: Vec<String>,
    },

    // === Network Errors ===
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Operation timeout: {0}")]
    Timeout(String),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Configuration loading failed: {0}")]
    Config(#[from] config::ConfigError),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(String),
}

fn format_failures(consistency: &Consistency, failures: &[String]) -> String {
    let mut out = format!(
        "Two-phase commit failed ({}) with {} message(s):\n",
        consistency,
        failures.len()
    );
    for (i, failure) in failures.iter().enumerate() {
        out.push_str(&format!("\n({}) {}", i + 1, failure));
    }
    out
}

impl Error {
    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_) | Error::ConnectionFailed(_) | Error::Http(_)
        )
    }

    /// The node never answered
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Error::Timeout(_) | Error::ConnectionFailed(_))
    }

    /// Convert to HTTP status code
    pub fn to_http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Error::InvalidConfig(_) | Error::Serialization(_) => StatusCode::BAD_REQUEST,
            Error::Inconsistent(_) => StatusCode::CONFLICT,
            Error::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
            Error::Halted(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::Timeout(e.to_string())
        } else if e.is_connect() {
            Error::ConnectionFailed(e.to_string())
        } else if e.is_decode() {
            Error::Corrupted(e.to_string())
        } else {
            Error::Http(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_change_failed_lists_every_failure() {
        let err = Error::ChangeFailed {
            consistency: Consistency::Consistent,
            failures: vec!["node-1: rejected".into(), "node-2: timeout".into()],
        };
        let text = err.to_string();
        assert!(text.contains("2 message(s)"));
        assert!(text.contains("(1) node-1: rejected"));
        assert!(text.contains("(2) node-2: timeout"));
    }

    #[test]
    fn test_retryable() {
        assert!(Error::Timeout("x".into()).is_retryable());
        assert!(!Error::Inconsistent("x".into()).is_retryable());
        assert!(!Error::Halted("count violation".into()).is_retryable());
    }
}
