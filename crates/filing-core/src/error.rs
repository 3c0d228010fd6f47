use std::fmt;

use chrono::{DateTime, Utc};

/// Kind of a retryable backend fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransientKind {
    /// Network timeout or dispatch failure
    Timeout,
    /// Rate limiting (429, SlowDown)
    Throttled,
    /// Backend temporarily unavailable (5xx)
    Unavailable,
    /// Local syscall interrupted or would block
    Interrupted,
}

impl fmt::Display for TransientKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Timeout => "timeout",
            Self::Throttled => "throttled",
            Self::Unavailable => "unavailable",
            Self::Interrupted => "interrupted",
        };
        f.write_str(name)
    }
}

/// Errors shared by every backend driver and by the record store.
///
/// Backends translate their native failures into this taxonomy so callers never
/// branch on backend identity.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Record already exists: {0}")]
    AlreadyExists(String),

    #[error("Version conflict on {0}: record was modified concurrently")]
    VersionConflict(String),

    #[error("Concurrent modification of {key}: gave up after {attempts} attempts")]
    ConcurrentModification { key: String, attempts: u32 },

    #[error("Lock on {key} is held by {owner} until {expires_at}")]
    Busy {
        key: String,
        owner: String,
        expires_at: DateTime<Utc>,
    },

    #[error("Transient backend error ({kind}): {message}")]
    Transient { kind: TransientKind, message: String },

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Key space exhausted: {0}")]
    KeysExhausted(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl StorageError {
    pub fn transient(kind: TransientKind, message: impl Into<String>) -> Self {
        Self::Transient {
            kind,
            message: message.into(),
        }
    }

    /// Whether the retry policy may retry the failed call.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_version_conflict(&self) -> bool {
        matches!(self, Self::VersionConflict(_))
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_errors_are_retryable() {
        assert!(StorageError::transient(TransientKind::Throttled, "slow down").is_transient());
        assert!(!StorageError::NotFound("a".into()).is_transient());
        assert!(!StorageError::VersionConflict("a".into()).is_transient());
        assert!(!StorageError::PermissionDenied("a".into()).is_transient());
    }

    #[test]
    fn test_display_includes_kind() {
        let err = StorageError::transient(TransientKind::Unavailable, "503 from backend");
        assert_eq!(
            err.to_string(),
            "Transient backend error (unavailable): 503 from backend"
        );
    }
}
