//! Error types for the docbridge SDK

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for docbridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Status class reported by the transport for a failed command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    KeyNotFound,
    KeyExists,
    CasMismatch,
    TemporaryFailure,
    Network,
    Protocol,
    DurabilityImpossible,
    RangeScanCancelled,
    Other(u16),
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::KeyNotFound => write!(f, "key not found"),
            Self::KeyExists => write!(f, "key exists"),
            Self::CasMismatch => write!(f, "cas mismatch"),
            Self::TemporaryFailure => write!(f, "temporary failure"),
            Self::Network => write!(f, "network error"),
            Self::Protocol => write!(f, "protocol error"),
            Self::DurabilityImpossible => write!(f, "durability impossible"),
            Self::RangeScanCancelled => write!(f, "range scan cancelled"),
            Self::Other(code) => write!(f, "status 0x{:04x}", code),
        }
    }
}

/// docbridge error types
///
/// Errors are `Clone` because a batch stores one per key and hands the same
/// value back through both the result map and an aggregate failure.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BridgeError {
    /// A blocking call ran out of time before its completion arrived
    #[error("Operation timed out after {waited:?}")]
    Timeout { waited: Duration },

    /// Failure surfaced by the transport for one command
    #[error("Transport error ({code}): {message}")]
    Transport { code: ErrorCode, message: String },

    /// One or more keys of a non-quiet multi operation failed
    #[error("{} of the batch keys failed, first: {}", .failed.len(), first_failure(.failed))]
    PartialBatchFailure { failed: Vec<(String, BridgeError)> },

    /// Pipeline begin/end misuse
    #[error("Pipeline error: {0}")]
    PipelineState(String),

    /// Range scan create/continue/cancel failure
    #[error("Scan session error: {0}")]
    ScanSession(String),

    /// The caller cancelled the operation
    #[error("Operation cancelled by caller")]
    CancelledByCaller,

    /// Configuration could not be loaded or is inconsistent
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid argument passed by the caller
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

fn first_failure(failed: &[(String, BridgeError)]) -> String {
    failed
        .first()
        .map(|(key, err)| format!("{}: {}", key, err))
        .unwrap_or_else(|| "none".to_string())
}

impl BridgeError {
    /// Build a transport error from a status code
    pub fn transport(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Transport {
            code,
            message: message.into(),
        }
    }

    /// Shorthand for a not-found transport error on `key`
    pub fn not_found(key: &str) -> Self {
        Self::transport(ErrorCode::KeyNotFound, format!("document '{}' not found", key))
    }

    /// Transport status code, if this error came from the transport
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::Transport { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.code() == Some(ErrorCode::KeyNotFound)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Whether resubmitting the same command could succeed.
    ///
    /// Nothing inside this crate retries; this is advice for the caller.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Transport { code, .. } => {
                matches!(code, ErrorCode::TemporaryFailure | ErrorCode::Network)
            }
            _ => false,
        }
    }
}

impl From<serde_yaml::Error> for BridgeError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Config(err.to_string())
    }
}

impl From<std::io::Error> for BridgeError {
    fn from(err: std::io::Error) -> Self {
        Self::Config(err.to_string())
    }
}
