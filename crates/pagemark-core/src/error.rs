//! Error types for annotation operations.

use crate::storage::ProviderError;
use thiserror::Error;

/// Result type for annotation operations.
pub type AnnotationResult<T> = Result<T, AnnotationError>;

/// Errors surfaced to callers of the store, sync manager and editing geometry.
#[derive(Debug, Error)]
pub enum AnnotationError {
    /// A provider rejected a write because durable storage is full.
    /// Previously committed state is untouched.
    #[error("Storage quota exceeded writing {key}")]
    QuotaExceeded { key: String },

    /// A persisted document failed schema validation.
    #[error("Invalid document: {0}")]
    Validation(String),

    /// The targeted document, annotation or session does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// One secondary provider failed during sync.
    #[error("Sync with provider '{provider}' failed: {source}")]
    SyncProvider {
        provider: String,
        #[source]
        source: ProviderError,
    },

    /// An import payload could not be parsed.
    #[error("Parse error: {0}")]
    Parse(String),

    /// A page number outside the document.
    #[error("Page {page} out of range (document has {total} pages)")]
    InvalidPage { page: u32, total: u32 },

    /// The operation is not supported for this annotation.
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Any other provider failure on the primary path.
    #[error("Storage error: {0}")]
    Provider(ProviderError),
}

impl From<ProviderError> for AnnotationError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::QuotaExceeded { key } => AnnotationError::QuotaExceeded { key },
            other => AnnotationError::Provider(other),
        }
    }
}

impl From<serde_json::Error> for AnnotationError {
    fn from(err: serde_json::Error) -> Self {
        AnnotationError::Parse(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quota_maps_to_dedicated_variant() {
        let err: AnnotationError = ProviderError::QuotaExceeded {
            key: "annotations/doc".to_string(),
        }
        .into();
        assert!(matches!(err, AnnotationError::QuotaExceeded { ref key } if key == "annotations/doc"));

        let err: AnnotationError = ProviderError::Io("disk gone".to_string()).into();
        assert!(matches!(err, AnnotationError::Provider(ProviderError::Io(_))));
    }
}
