use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_stream::try_stream;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::driver::{BackendDriver, EntryStream};
use crate::error::{Result, StorageError, TransientKind};
use crate::types::{validate_key, ListingEntry, Precondition, Version};

#[derive(Debug, Clone)]
struct StoredRecord {
    payload: Vec<u8>,
    version: Version,
    modified_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct MemoryState {
    records: BTreeMap<String, StoredRecord>,
    generation: u64,
    pending_faults: u32,
    fault_kind: Option<TransientKind>,
    drop_put_response: Option<TransientKind>,
    listing_fault: Option<(usize, TransientKind)>,
}

impl MemoryState {
    fn take_fault(&mut self) -> Option<StorageError> {
        if self.pending_faults == 0 {
            return None;
        }
        self.pending_faults -= 1;
        let kind = self.fault_kind.unwrap_or(TransientKind::Unavailable);
        Some(StorageError::transient(kind, "injected fault"))
    }

    fn store(&mut self, key: &str, payload: &[u8]) -> Version {
        self.generation += 1;
        let version = Version::new(format!("{:x}", self.generation));
        self.records.insert(
            key.to_string(),
            StoredRecord {
                payload: payload.to_vec(),
                version: version.clone(),
                modified_at: Utc::now(),
            },
        );
        version
    }
}

/// In-process backend with the same semantics as the disk and object-store drivers.
///
/// Versions are a generation counter, so every stored payload gets a new token.
/// Faults can be injected to exercise retry paths.
#[derive(Debug, Default)]
pub struct MemoryDriver {
    state: Mutex<MemoryState>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail the next `count` calls with a transient error of `kind`.
    pub fn fail_next(&self, count: u32, kind: TransientKind) {
        let mut state = self.state();
        state.pending_faults = count;
        state.fault_kind = Some(kind);
    }

    /// Apply the next `put`, then report a transient failure as if the response was lost.
    pub fn drop_next_put_response(&self, kind: TransientKind) {
        self.state().drop_put_response = Some(kind);
    }

    /// Make the next listing fail after yielding `count` entries.
    pub fn fail_listing_after(&self, count: usize, kind: TransientKind) {
        self.state().listing_fault = Some((count, kind));
    }

    /// Store a payload immediately, bypassing preconditions.
    ///
    /// Simulates a writer in another process racing with the caller.
    pub fn overwrite(&self, key: &str, payload: &[u8]) -> Version {
        self.state().store(key, payload)
    }

    pub fn len(&self) -> usize {
        self.state().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self, prefix: &str) -> Result<(Vec<ListingEntry>, Option<(usize, TransientKind)>)> {
        let mut state = self.state();
        if let Some(fault) = state.take_fault() {
            return Err(fault);
        }
        let entries = state
            .records
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, record)| ListingEntry {
                key: key.clone(),
                size: Some(record.payload.len() as u64),
                last_modified: Some(record.modified_at),
            })
            .collect();
        Ok((entries, state.listing_fault.take()))
    }
}

#[async_trait]
impl BackendDriver for MemoryDriver {
    fn driver_name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<(Vec<u8>, Version)> {
        validate_key(key)?;
        let mut state = self.state();
        if let Some(fault) = state.take_fault() {
            return Err(fault);
        }
        state
            .records
            .get(key)
            .map(|record| (record.payload.clone(), record.version.clone()))
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn put(&self, key: &str, payload: &[u8], precondition: Precondition) -> Result<Version> {
        validate_key(key)?;
        let mut state = self.state();
        if let Some(fault) = state.take_fault() {
            return Err(fault);
        }
        let current = state.records.get(key).map(|record| &record.version);
        precondition.check(key, current)?;

        let version = state.store(key, payload);
        if let Some(kind) = state.drop_put_response.take() {
            return Err(StorageError::transient(kind, "response lost after write"));
        }
        Ok(version)
    }

    async fn delete(&self, key: &str, expected: Option<&Version>) -> Result<()> {
        validate_key(key)?;
        let mut state = self.state();
        if let Some(fault) = state.take_fault() {
            return Err(fault);
        }
        let current = state
            .records
            .get(key)
            .map(|record| record.version.clone())
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
        if let Some(expected) = expected {
            if *expected != current {
                return Err(StorageError::VersionConflict(key.to_string()));
            }
        }
        state.records.remove(key);
        Ok(())
    }

    fn list<'a>(&'a self, prefix: &'a str) -> EntryStream<'a> {
        Box::pin(try_stream! {
            let (entries, fault) = self.snapshot(prefix)?;
            for (index, entry) in entries.into_iter().enumerate() {
                if let Some((fail_at, kind)) = fault {
                    if index == fail_at {
                        Err(StorageError::transient(kind, "listing interrupted"))?;
                    }
                }
                yield entry;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use futures::TryStreamExt;

    use super::*;

    #[tokio::test]
    async fn test_conditional_put_semantics() {
        let driver = MemoryDriver::new();

        let v1 = driver.put("k", b"one", Precondition::NotExists).await.unwrap();
        assert!(!v1.is_empty());
        assert!(driver
            .put("k", b"two", Precondition::NotExists)
            .await
            .unwrap_err()
            .is_version_conflict());

        let v2 = driver
            .put("k", b"two", Precondition::Matches(v1.clone()))
            .await
            .unwrap();
        assert_ne!(v1, v2);
        assert!(driver
            .put("k", b"three", Precondition::Matches(v1))
            .await
            .unwrap_err()
            .is_version_conflict());
        assert!(driver
            .put("missing", b"x", Precondition::Matches(v2))
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_delete_checks_version() {
        let driver = MemoryDriver::new();
        let v1 = driver.put("k", b"one", Precondition::Any).await.unwrap();
        let stale = Version::from("stale");

        assert!(driver
            .delete("k", Some(&stale))
            .await
            .unwrap_err()
            .is_version_conflict());
        driver.delete("k", Some(&v1)).await.unwrap();
        assert!(driver.delete("k", None).await.unwrap_err().is_not_found());
        assert!(driver.is_empty());
    }

    #[tokio::test]
    async fn test_list_is_sorted_and_restartable() {
        let driver = MemoryDriver::new();
        for key in ["b/1", "a/2", "a/1", "ab"] {
            driver.put(key, b"x", Precondition::Any).await.unwrap();
        }

        for _ in 0..2 {
            let keys: Vec<String> = driver
                .list("a/")
                .map_ok(|entry| entry.key)
                .try_collect()
                .await
                .unwrap();
            assert_eq!(keys, vec!["a/1", "a/2"]);
        }
    }

    #[tokio::test]
    async fn test_injected_faults_are_consumed() {
        let driver = MemoryDriver::new();
        driver.fail_next(1, TransientKind::Throttled);
        assert!(driver.get("k").await.unwrap_err().is_transient());
        assert!(driver.get("k").await.unwrap_err().is_not_found());
    }
}
