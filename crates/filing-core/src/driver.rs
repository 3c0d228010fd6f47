use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::Result;
use crate::types::{ListingEntry, Precondition, Version};

/// Lazy listing of a prefix. Each call to [`BackendDriver::list`] re-queries the backend.
pub type EntryStream<'a> = BoxStream<'a, Result<ListingEntry>>;

/// Uniform operation set implemented once per backing store.
///
/// Conditional `put`/`delete` is the single primitive every higher-level guarantee
/// (atomic update, locking) is derived from. Drivers must:
/// - never expose a partially written payload to a concurrent reader
/// - issue a new [`Version`] whenever a payload is stored
/// - return listings sorted by key, relative to the driver's namespace
#[async_trait]
pub trait BackendDriver: Send + Sync {
    /// Short backend name for logging ("local", "s3", "memory").
    fn driver_name(&self) -> &'static str;

    /// Read a payload and its current version.
    ///
    /// Fails with `NotFound` when the key is absent.
    async fn get(&self, key: &str) -> Result<(Vec<u8>, Version)>;

    /// Store a payload if `precondition` holds, returning the new version.
    ///
    /// - `NotExists` on an existing key: `VersionConflict`
    /// - `Matches(v)` on a missing key: `NotFound`
    /// - `Matches(v)` when the stored version differs: `VersionConflict`
    async fn put(&self, key: &str, payload: &[u8], precondition: Precondition) -> Result<Version>;

    /// Delete a key, optionally only if its stored version equals `expected`.
    ///
    /// Fails with `NotFound` if absent and `VersionConflict` on mismatch.
    async fn delete(&self, key: &str, expected: Option<&Version>) -> Result<()>;

    /// List entries whose key starts with `prefix`, sorted by key.
    fn list<'a>(&'a self, prefix: &'a str) -> EntryStream<'a>;
}
