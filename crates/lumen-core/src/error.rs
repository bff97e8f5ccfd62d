//! Error types for the Lumen embedding pipeline.
//!
//! Errors are split into construction-time configuration failures and
//! runtime pipeline failures, so callers can tell "fix your setup" apart
//! from "this item failed" at the type level.

use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Top-level error type for Lumen operations.
#[derive(Error, Debug)]
pub enum LumenError {
    /// Configuration-related errors, fatal at construction
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Pipeline processing errors
    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    /// General I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Configuration-specific errors. All of these are fatal: the component
/// refusing to construct is the correct outcome.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to read the config file from disk
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    /// Failed to parse TOML configuration
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Configuration values are invalid
    #[error("Invalid configuration: {0}")]
    Validation(String),

    /// A tokenizer vocabulary lacks a required special token
    #[error("Vocabulary at {path} is missing required token {token}")]
    VocabMissing { path: PathBuf, token: String },

    /// A BPE merges file line does not hold two whitespace-separated fields
    #[error("Merges file {path} malformed at line {line}")]
    MergesMalformed { path: PathBuf, line: usize },

    /// An encoder graph file is absent
    #[error("Model not found: {path}")]
    ModelMissing { path: PathBuf },

    /// An encoder graph loaded but is not usable (bad graph, missing inputs)
    #[error("Model at {path} is malformed: {message}")]
    ModelMalformed { path: PathBuf, message: String },
}

/// Runtime pipeline errors, organized by failure kind.
///
/// `EncoderTransient` is the only kind the batch scheduler retries on its
/// own; `Io` is retried by the orchestrator against the store. Everything
/// else surfaces to the nearest public entry point.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Underlying filesystem or store I/O failure, possibly transient
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Input violated a tokenizer precondition
    #[error("Tokenization input error: {0}")]
    TokenizationInput(String),

    /// Image could not be decoded
    #[error("Decode error for {path}: {message}")]
    ImageDecode { path: PathBuf, message: String },

    /// Image format is recognized but not supported
    #[error("Unsupported format for {path}: {format}")]
    UnsupportedFormat { path: PathBuf, format: String },

    /// The requested encoder session was not configured
    #[error("Encoder {0} is not configured")]
    EncoderUnavailable(crate::encoder::EncoderKind),

    /// Recoverable inference runtime failure, worth retrying
    #[error("Transient encoder failure: {message}")]
    EncoderTransient { message: String },

    /// Unrecoverable inference runtime failure
    #[error("Fatal encoder failure: {message}")]
    EncoderFatal { message: String },

    /// The inference graph did not produce the expected output tensor
    #[error("Encoder output {name} missing from graph results")]
    OutputMissing { name: String },

    /// Persistent store reported an error
    #[error("Store error: {message}")]
    Store { message: String },

    /// Persistent store operation exceeded its deadline
    #[error("Store operation {operation} timed out after {timeout_ms}ms")]
    StoreTimeout { operation: String, timeout_ms: u64 },

    /// Cooperative cancellation was observed
    #[error("Operation cancelled")]
    Cancelled,
}

impl PipelineError {
    /// Short stable label for failure accounting in statistics.
    pub fn kind_label(&self) -> &'static str {
        match self {
            PipelineError::Io(_) => "io",
            PipelineError::TokenizationInput(_) => "tokenization",
            PipelineError::ImageDecode { .. } => "image_decode",
            PipelineError::UnsupportedFormat { .. } => "unsupported_format",
            PipelineError::EncoderUnavailable(_) => "encoder_unavailable",
            PipelineError::EncoderTransient { .. } => "encoder_transient",
            PipelineError::EncoderFatal { .. } => "encoder_fatal",
            PipelineError::OutputMissing { .. } => "output_missing",
            PipelineError::Store { .. } => "store",
            PipelineError::StoreTimeout { .. } => "store_timeout",
            PipelineError::Cancelled => "cancelled",
        }
    }

    /// Whether the orchestrator may retry the failed store operation.
    pub fn is_retryable_io(&self) -> bool {
        matches!(
            self,
            PipelineError::Io(_) | PipelineError::Store { .. } | PipelineError::StoreTimeout { .. }
        )
    }

    /// Produce an owned copy of this error for delivery to multiple waiters.
    ///
    /// `PipelineError` holds non-clonable payloads (`std::io::Error`), so
    /// fan-out paths (cache single-flight, batch scheduler) rebuild an
    /// equivalent error per receiver instead of cloning.
    pub fn replicate(&self) -> Self {
        match self {
            PipelineError::Io(e) => {
                PipelineError::Io(std::io::Error::new(e.kind(), e.to_string()))
            }
            PipelineError::TokenizationInput(m) => PipelineError::TokenizationInput(m.clone()),
            PipelineError::ImageDecode { path, message } => PipelineError::ImageDecode {
                path: path.clone(),
                message: message.clone(),
            },
            PipelineError::UnsupportedFormat { path, format } => PipelineError::UnsupportedFormat {
                path: path.clone(),
                format: format.clone(),
            },
            PipelineError::EncoderUnavailable(kind) => PipelineError::EncoderUnavailable(*kind),
            PipelineError::EncoderTransient { message } => PipelineError::EncoderTransient {
                message: message.clone(),
            },
            PipelineError::EncoderFatal { message } => PipelineError::EncoderFatal {
                message: message.clone(),
            },
            PipelineError::OutputMissing { name } => PipelineError::OutputMissing {
                name: name.clone(),
            },
            PipelineError::Store { message } => PipelineError::Store {
                message: message.clone(),
            },
            PipelineError::StoreTimeout {
                operation,
                timeout_ms,
            } => PipelineError::StoreTimeout {
                operation: operation.clone(),
                timeout_ms: *timeout_ms,
            },
            PipelineError::Cancelled => PipelineError::Cancelled,
        }
    }
}

/// Rebuild a waiter-facing error from a shared single-flight failure.
impl From<Arc<PipelineError>> for PipelineError {
    fn from(shared: Arc<PipelineError>) -> Self {
        shared.replicate()
    }
}

/// Convenience type alias for Lumen results.
pub type Result<T> = std::result::Result<T, LumenError>;

/// Convenience type alias for pipeline-specific results.
pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replicate_preserves_kind() {
        let err = PipelineError::EncoderTransient {
            message: "device lost".to_string(),
        };
        let copy = err.replicate();
        assert_eq!(copy.kind_label(), "encoder_transient");
        assert_eq!(copy.to_string(), err.to_string());
    }

    #[test]
    fn test_replicate_io_keeps_error_kind() {
        let err = PipelineError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "missing file",
        ));
        match err.replicate() {
            PipelineError::Io(e) => assert_eq!(e.kind(), std::io::ErrorKind::NotFound),
            other => panic!("expected Io, got {other:?}"),
        }
    }

    #[test]
    fn test_retryable_classification() {
        assert!(PipelineError::Store {
            message: "busy".into()
        }
        .is_retryable_io());
        assert!(!PipelineError::Cancelled.is_retryable_io());
        assert!(!PipelineError::EncoderFatal {
            message: "corrupt".into()
        }
        .is_retryable_io());
    }

    #[test]
    fn test_kind_labels_are_stable() {
        assert_eq!(PipelineError::Cancelled.kind_label(), "cancelled");
        assert_eq!(
            PipelineError::OutputMissing {
                name: "pooler_output".into()
            }
            .kind_label(),
            "output_missing"
        );
    }
}
