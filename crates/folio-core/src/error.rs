//! Error taxonomy for the Folio engine.
//!
//! Every fallible core operation returns [`Result<T>`]. The application
//! crate wraps these in `anyhow` at its boundaries; callers that need to
//! branch on the failure kind (retry, degrade, refuse) match on [`Error`].

use thiserror::Error;

/// Result type alias using Folio's [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// Chunker input was empty or not text.
    #[error("malformed input: {0}")]
    MalformedInput(String),

    /// Not enough qualifying chunks to build a profile.
    #[error("insufficient evidence for {target}: {found} qualifying chunks, need {required}")]
    InsufficientEvidence {
        target: String,
        found: usize,
        required: usize,
    },

    /// `fuse` was called with no profiles.
    #[error("cannot fuse an empty set of profiles")]
    EmptyFusionInput,

    /// The index backing store could not be reached for a book.
    #[error("index unavailable for book {book_id}: {reason}")]
    IndexUnavailable { book_id: String, reason: String },

    /// An embedding or generation provider call failed.
    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// The document extractor does not handle this content type.
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    /// A vector's dimensionality does not match the configured model.
    #[error("dimension mismatch for {context}: expected {expected}, got {actual}")]
    DimensionMismatch {
        context: String,
        expected: usize,
        actual: usize,
    },

    /// Embeddings from different model versions were about to be compared.
    #[error("embedding model mismatch: index uses {index}, query uses {query}")]
    ModelMismatch { index: String, query: String },

    /// Unknown book, or a book the requester may not read.
    #[error("book not found: {0}")]
    BookNotFound(String),

    /// A retrieval or generation deadline elapsed.
    #[error("{0} timed out")]
    Timeout(String),

    /// The caller cancelled the turn.
    #[error("turn cancelled")]
    Cancelled,

    /// A turn tried to move to a state its current state does not lead to.
    #[error("invalid turn transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    /// Metadata store failure.
    #[error("storage error: {0}")]
    Storage(String),
}

impl Error {
    /// Whether the caller may retry the same operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::IndexUnavailable { .. }
                | Error::ProviderUnavailable(_)
                | Error::Timeout(_)
                | Error::Storage(_)
        )
    }

    /// Stable machine-readable kind, stored with `Failed` ingestion statuses
    /// and returned in HTTP error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::MalformedInput(_) => "malformed_input",
            Error::InsufficientEvidence { .. } => "insufficient_evidence",
            Error::EmptyFusionInput => "empty_fusion_input",
            Error::IndexUnavailable { .. } => "index_unavailable",
            Error::ProviderUnavailable(_) => "provider_unavailable",
            Error::UnsupportedFormat(_) => "unsupported_format",
            Error::DimensionMismatch { .. } => "dimension_mismatch",
            Error::ModelMismatch { .. } => "model_mismatch",
            Error::BookNotFound(_) => "book_not_found",
            Error::Timeout(_) => "timeout",
            Error::Cancelled => "cancelled",
            Error::InvalidTransition { .. } => "invalid_transition",
            Error::Storage(_) => "storage",
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Storage(format!("serialization: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds() {
        assert!(Error::ProviderUnavailable("429".into()).is_retryable());
        assert!(Error::IndexUnavailable {
            book_id: "b".into(),
            reason: "down".into()
        }
        .is_retryable());
        assert!(!Error::EmptyFusionInput.is_retryable());
        assert!(!Error::MalformedInput("empty".into()).is_retryable());
    }

    #[test]
    fn kinds_are_snake_case() {
        assert_eq!(Error::Cancelled.kind(), "cancelled");
        assert_eq!(
            Error::UnsupportedFormat("image/png".into()).kind(),
            "unsupported_format"
        );
    }
}
