use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StorageError};

/// Opaque, backend-supplied identity of a stored payload.
///
/// Local disk: size, mtime and content digest. S3: the ETag as returned by the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(String);

impl Version {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Version {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Version {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A stored payload together with the version it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub key: String,
    pub payload: Vec<u8>,
    pub version: Version,
}

/// Condition attached to a write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Precondition {
    /// Unconditional write
    Any,
    /// Fail with `VersionConflict` if the key already exists
    NotExists,
    /// Fail unless the stored version equals this one
    Matches(Version),
}

impl Precondition {
    /// Check a precondition against the currently stored version.
    ///
    /// Drivers that synthesize conditional writes (local disk, memory) share this rule.
    pub fn check(&self, key: &str, current: Option<&Version>) -> Result<()> {
        match (self, current) {
            (Precondition::Any, _) => Ok(()),
            (Precondition::NotExists, None) => Ok(()),
            (Precondition::NotExists, Some(_)) => Err(StorageError::VersionConflict(key.to_string())),
            (Precondition::Matches(_), None) => Err(StorageError::NotFound(key.to_string())),
            (Precondition::Matches(expected), Some(actual)) if expected == actual => Ok(()),
            (Precondition::Matches(_), Some(_)) => Err(StorageError::VersionConflict(key.to_string())),
        }
    }
}

/// One key produced by a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingEntry {
    pub key: String,
    pub size: Option<u64>,
    pub last_modified: Option<DateTime<Utc>>,
}

impl ListingEntry {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            size: None,
            last_modified: None,
        }
    }
}

/// Validate a record key.
///
/// Keys are `/`-separated paths. Components starting with `.` are reserved for
/// driver bookkeeping (temp files, latch files).
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(StorageError::InvalidKey("key is empty".to_string()));
    }
    if key.contains('\\') || key.contains('\0') {
        return Err(StorageError::InvalidKey(format!(
            "{key:?} contains a backslash or NUL"
        )));
    }
    for component in key.split('/') {
        if component.is_empty() {
            return Err(StorageError::InvalidKey(format!(
                "{key:?} has an empty path component"
            )));
        }
        if component.starts_with('.') {
            return Err(StorageError::InvalidKey(format!(
                "{key:?} has a component starting with '.'"
            )));
        }
    }
    Ok(())
}
