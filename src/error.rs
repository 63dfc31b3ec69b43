//! Error types shared by the handle owner, the model adapter and the prompt bridge.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// An error reported by the native engine (mirrors `llmodel_error`).
///
/// Either absent or fully populated: the native side never hands back a
/// code without a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Engine-specific error code (errno-like for file failures).
    pub code: i32,

    /// Human-readable message, preserved verbatim.
    pub message: String,
}

impl ErrorRecord {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

/// Errors surfaced to callers of the bridge.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// The factory refused the model (bad path, bad format, unknown variant).
    #[error("Failed to load model: {0}")]
    LoadFailure(ErrorRecord),

    /// The handle was never created or has already been released.
    #[error("Model not loaded")]
    NotLoaded,

    /// The prompt queue for this model is full.
    #[error("Model busy: {queued} prompts already queued")]
    Busy { queued: usize },

    /// An argument was rejected before reaching the native layer.
    #[error("Invalid argument: {0}")]
    Validation(String),

    /// A native call reported an error record.
    #[error("Native error: {0}")]
    Native(ErrorRecord),

    /// No GPU device matched the requested selector.
    #[error("GPU unavailable: {0}")]
    GpuUnavailable(String),

    /// The prompt was cancelled (or timed out) before producing a result.
    #[error("Prompt cancelled")]
    Cancelled,

    /// The host asked for a method the model class does not expose.
    #[error("Unknown method: {0}")]
    UnknownMethod(String),

    /// Worker join failure or missing async runtime.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// The native error record carried by this error, if any.
    pub fn record(&self) -> Option<&ErrorRecord> {
        match self {
            Error::LoadFailure(record) | Error::Native(record) => Some(record),
            _ => None,
        }
    }
}

/// Result type alias for bridge operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_native_message_preserved() {
        let err = Error::LoadFailure(ErrorRecord::new(2, "No such file or directory"));
        assert!(err.to_string().contains("No such file or directory"));
        assert_eq!(err.record().unwrap().code, 2);
    }

    #[test]
    fn test_local_errors_carry_no_record() {
        assert!(Error::NotLoaded.record().is_none());
        assert!(Error::Validation("n must be positive".into()).record().is_none());
    }
}
