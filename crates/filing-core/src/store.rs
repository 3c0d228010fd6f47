use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use tracing::{debug, instrument, warn};

use crate::config::StoreConfig;
use crate::driver::{BackendDriver, EntryStream};
use crate::error::{Result, StorageError};
use crate::retry::{RetryPolicy, RetryingDriver};
use crate::types::{Precondition, Record, Version};

/// Atomic create/update/delete over any [`BackendDriver`].
///
/// The injected driver is wrapped in a [`RetryingDriver`], so transient backend faults
/// are absorbed below this layer. Version tokens are only trusted for the duration
/// of a single read-modify-write attempt and never cached across attempts.
#[derive(Clone)]
pub struct RecordStore {
    driver: Arc<RetryingDriver>,
    policy: RetryPolicy,
    update_attempts: u32,
}

impl RecordStore {
    pub fn new(driver: Arc<dyn BackendDriver>, config: &StoreConfig) -> Self {
        let policy = RetryPolicy::from(&config.retry);
        Self {
            driver: Arc::new(RetryingDriver::new(driver, policy)),
            policy,
            update_attempts: config.update_attempts.max(1),
        }
    }

    pub fn with_defaults(driver: Arc<dyn BackendDriver>) -> Self {
        Self::new(driver, &StoreConfig::default())
    }

    pub fn driver_name(&self) -> &'static str {
        self.driver.driver_name()
    }

    // =========================================================================
    // Single-record operations
    // =========================================================================

    #[instrument(skip(self), level = "debug")]
    pub async fn read(&self, key: &str) -> Result<Record> {
        let (payload, version) = self.driver.get(key).await?;
        Ok(Record {
            key: key.to_string(),
            payload,
            version,
        })
    }

    pub async fn exists(&self, key: &str) -> Result<bool> {
        match self.driver.get(key).await {
            Ok(_) => Ok(true),
            Err(StorageError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Create a record, failing with `AlreadyExists` if the key is present.
    #[instrument(skip(self, payload), level = "debug", fields(payload_len = payload.len()))]
    pub async fn create(&self, key: &str, payload: &[u8]) -> Result<Record> {
        match self.driver.put(key, payload, Precondition::NotExists).await {
            Ok(version) => {
                debug!(key, "created record");
                Ok(Record {
                    key: key.to_string(),
                    payload: payload.to_vec(),
                    version,
                })
            }
            Err(StorageError::VersionConflict(_)) => Err(StorageError::AlreadyExists(key.to_string())),
            Err(e) => Err(e),
        }
    }

    /// Unconditionally store a payload, creating or replacing the record.
    #[instrument(skip(self, payload), level = "debug", fields(payload_len = payload.len()))]
    pub async fn write(&self, key: &str, payload: &[u8]) -> Result<Record> {
        let version = self.driver.put(key, payload, Precondition::Any).await?;
        Ok(Record {
            key: key.to_string(),
            payload: payload.to_vec(),
            version,
        })
    }

    /// Single conditional write: replace the payload only if the stored version is `expected`.
    #[instrument(skip(self, payload), level = "debug", fields(payload_len = payload.len()))]
    pub async fn replace(&self, key: &str, payload: &[u8], expected: &Version) -> Result<Record> {
        let version = self
            .driver
            .put(key, payload, Precondition::Matches(expected.clone()))
            .await?;
        Ok(Record {
            key: key.to_string(),
            payload: payload.to_vec(),
            version,
        })
    }

    /// Read, transform and conditionally write back a record.
    ///
    /// When another writer wins the conditional write, the whole sequence restarts from
    /// a fresh read, up to the configured number of attempts, after which the call fails
    /// with `ConcurrentModification`. A transform returning identical bytes writes nothing
    /// and leaves the version unchanged.
    pub async fn update<F>(&self, key: &str, mut mutator: F) -> Result<Record>
    where
        F: FnMut(&[u8]) -> Vec<u8>,
    {
        self.try_update(key, |payload| Ok(mutator(payload))).await
    }

    /// Like [`RecordStore::update`], for transforms that can fail.
    ///
    /// A transform error aborts the update without writing.
    #[instrument(skip(self, mutator), level = "debug")]
    pub async fn try_update<F>(&self, key: &str, mut mutator: F) -> Result<Record>
    where
        F: FnMut(&[u8]) -> Result<Vec<u8>>,
    {
        for attempt in 0..self.update_attempts {
            let (payload, version) = self.driver.get(key).await?;
            let updated = mutator(&payload)?;

            if updated == payload {
                debug!(key, attempt, "update produced identical payload, skipping write");
                return Ok(Record {
                    key: key.to_string(),
                    payload,
                    version,
                });
            }

            match self
                .driver
                .put(key, &updated, Precondition::Matches(version))
                .await
            {
                Ok(version) => {
                    debug!(key, attempt, "update succeeded");
                    return Ok(Record {
                        key: key.to_string(),
                        payload: updated,
                        version,
                    });
                }
                Err(StorageError::VersionConflict(_)) => {
                    warn!(key, attempt, "update conflict, retrying");
                    if attempt + 1 < self.update_attempts {
                        self.policy.backoff(attempt).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Err(StorageError::ConcurrentModification {
            key: key.to_string(),
            attempts: self.update_attempts,
        })
    }

    #[instrument(skip(self), level = "debug")]
    pub async fn delete(&self, key: &str) -> Result<()> {
        self.driver.delete(key, None).await?;
        debug!(key, "deleted record");
        Ok(())
    }

    /// Delete only if the record is still at `expected`.
    #[instrument(skip(self), level = "debug")]
    pub async fn delete_if(&self, key: &str, expected: &Version) -> Result<()> {
        self.driver.delete(key, Some(expected)).await
    }

    // =========================================================================
    // Multi-record helpers (not atomic across keys)
    // =========================================================================

    /// Copy a record's current payload to another key, replacing any existing record there.
    #[instrument(skip(self), level = "debug")]
    pub async fn copy(&self, src: &str, dst: &str) -> Result<Record> {
        let (payload, _) = self.driver.get(src).await?;
        self.write(dst, &payload).await
    }

    /// Copy then delete the source, provided the source was not modified in between.
    #[instrument(skip(self), level = "debug")]
    pub async fn rename(&self, src: &str, dst: &str) -> Result<Record> {
        let (payload, version) = self.driver.get(src).await?;
        let record = self.write(dst, &payload).await?;
        self.driver.delete(src, Some(&version)).await?;
        Ok(record)
    }

    // =========================================================================
    // Listing
    // =========================================================================

    /// Lazily list keys under `prefix`, sorted. Each call re-queries the backend.
    pub fn list<'a>(&'a self, prefix: &'a str) -> BoxStream<'a, Result<String>> {
        self.driver.list(prefix).map_ok(|entry| entry.key).boxed()
    }

    /// Like [`RecordStore::list`] but with size and modification time where known.
    pub fn list_entries<'a>(&'a self, prefix: &'a str) -> EntryStream<'a> {
        self.driver.list(prefix)
    }

    /// Delete every record under `prefix`, returning the affected keys.
    ///
    /// With `dry_run` nothing is deleted.
    #[instrument(skip(self), level = "debug")]
    pub async fn purge(&self, prefix: &str, dry_run: bool) -> Result<Vec<String>> {
        let keys: Vec<String> = self.list(prefix).try_collect().await?;
        if dry_run {
            return Ok(keys);
        }
        for key in &keys {
            match self.driver.delete(key, None).await {
                Ok(()) | Err(StorageError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        debug!(prefix, count = keys.len(), "purged records");
        Ok(keys)
    }

    /// Most recent modification time under `prefix`, if the backend reports one.
    pub async fn most_recent(&self, prefix: &str) -> Result<Option<DateTime<Utc>>> {
        self.list_entries(prefix)
            .try_fold(None, |latest: Option<DateTime<Utc>>, entry| async move {
                Ok(match (latest, entry.last_modified) {
                    (Some(a), Some(b)) => Some(a.max(b)),
                    (a, b) => a.or(b),
                })
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::memory::MemoryDriver;

    fn config(update_attempts: u32) -> StoreConfig {
        StoreConfig {
            retry: RetryConfig {
                max_attempts: 3,
                base_delay_ms: 0,
                max_delay_ms: 0,
                jitter_ms: 1,
            },
            update_attempts,
        }
    }

    fn setup(update_attempts: u32) -> (Arc<MemoryDriver>, RecordStore) {
        let memory = Arc::new(MemoryDriver::new());
        let store = RecordStore::new(memory.clone(), &config(update_attempts));
        (memory, store)
    }

    fn append(suffix: &'static [u8]) -> impl FnMut(&[u8]) -> Vec<u8> {
        move |payload| [payload, suffix].concat()
    }

    #[tokio::test]
    async fn test_create_then_read() {
        let (_, store) = setup(5);
        let created = store.create("docs/1", b"hello").await.unwrap();
        let read = store.read("docs/1").await.unwrap();

        assert_eq!(read.payload, b"hello");
        assert!(!read.version.is_empty());
        assert_eq!(read.version, created.version);
    }

    #[tokio::test]
    async fn test_create_twice_fails() {
        let (_, store) = setup(5);
        store.create("k", b"one").await.unwrap();
        let err = store.create("k", b"two").await.unwrap_err();

        assert!(matches!(err, StorageError::AlreadyExists(ref k) if k == "k"));
        assert_eq!(store.read("k").await.unwrap().payload, b"one");
    }

    #[tokio::test]
    async fn test_missing_key_is_not_found() {
        let (_, store) = setup(5);
        assert!(store.read("nope").await.unwrap_err().is_not_found());
        assert!(store.update("nope", append(b"x")).await.unwrap_err().is_not_found());
        assert!(store.delete("nope").await.unwrap_err().is_not_found());
        assert!(!store.exists("nope").await.unwrap());
    }

    #[tokio::test]
    async fn test_identity_update_keeps_version() {
        let (_, store) = setup(5);
        let created = store.create("k", b"same").await.unwrap();

        let unchanged = store.update("k", |p| p.to_vec()).await.unwrap();
        assert_eq!(unchanged.version, created.version);

        let changed = store.update("k", append(b"!")).await.unwrap();
        assert_ne!(changed.version, created.version);
        assert_eq!(store.read("k").await.unwrap().payload, b"same!");
    }

    #[tokio::test]
    async fn test_update_retries_after_losing_race() {
        let (memory, store) = setup(5);
        store.create("k", b"x").await.unwrap();

        // The first transform races with a competing writer that wins.
        let mut calls = 0;
        let record = store
            .update("k", |payload| {
                calls += 1;
                if calls == 1 {
                    memory.overwrite("k", &[payload, b"G".as_slice()].concat());
                }
                [payload, b"F".as_slice()].concat()
            })
            .await
            .unwrap();

        assert_eq!(calls, 2);
        assert_eq!(record.payload, b"xGF");
        assert_eq!(store.read("k").await.unwrap().payload, b"xGF");
    }

    #[tokio::test]
    async fn test_losing_writer_without_budget_leaves_winner_intact() {
        let (memory, store) = setup(1);
        store.create("k", b"x").await.unwrap();

        let err = store
            .update("k", |payload| {
                memory.overwrite("k", &[payload, b"G".as_slice()].concat());
                [payload, b"F".as_slice()].concat()
            })
            .await
            .unwrap_err();

        assert!(matches!(err, StorageError::ConcurrentModification { attempts: 1, .. }));
        assert_eq!(store.read("k").await.unwrap().payload, b"xG");
    }

    #[tokio::test]
    async fn test_constant_contention_exhausts_budget() {
        let (memory, store) = setup(4);
        store.create("k", b"0").await.unwrap();

        let mut calls = 0;
        let err = store
            .update("k", |payload| {
                calls += 1;
                memory.overwrite("k", b"competitor");
                [payload, b"+".as_slice()].concat()
            })
            .await
            .unwrap_err();

        assert!(matches!(err, StorageError::ConcurrentModification { attempts: 4, .. }));
        assert_eq!(calls, 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_updates_never_lose_increments() {
        let (_, store) = setup(200);
        store.create("counter", b"0").await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .update("counter", |payload| {
                        let n: u64 = std::str::from_utf8(payload).unwrap().parse().unwrap();
                        (n + 1).to_string().into_bytes()
                    })
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(store.read("counter").await.unwrap().payload, b"16");
    }

    #[tokio::test]
    async fn test_failed_transform_does_not_write() {
        let (_, store) = setup(5);
        let created = store.create("k", b"v").await.unwrap();

        let err = store
            .try_update("k", |_| Err(StorageError::Serialization("bad".into())))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Serialization(_)));
        assert_eq!(store.read("k").await.unwrap().version, created.version);
    }

    #[tokio::test]
    async fn test_replace_and_delete_if_are_conditional() {
        let (_, store) = setup(5);
        let v1 = store.create("k", b"1").await.unwrap().version;
        let v2 = store.replace("k", b"2", &v1).await.unwrap().version;

        assert!(store.replace("k", b"3", &v1).await.unwrap_err().is_version_conflict());
        assert!(store.delete_if("k", &v1).await.unwrap_err().is_version_conflict());
        store.delete_if("k", &v2).await.unwrap();
        assert!(!store.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_list_prefix_sorted_and_restartable() {
        let (_, store) = setup(5);
        for key in ["b/1", "a/2", "a/1"] {
            store.create(key, b"x").await.unwrap();
        }

        let first: Vec<String> = store.list("a/").try_collect().await.unwrap();
        let second: Vec<String> = store.list("a/").try_collect().await.unwrap();
        assert_eq!(first, vec!["a/1", "a/2"]);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_copy_and_rename() {
        let (_, store) = setup(5);
        store.create("src", b"payload").await.unwrap();

        store.copy("src", "copy").await.unwrap();
        assert_eq!(store.read("copy").await.unwrap().payload, b"payload");
        assert!(store.exists("src").await.unwrap());

        store.rename("src", "moved").await.unwrap();
        assert_eq!(store.read("moved").await.unwrap().payload, b"payload");
        assert!(!store.exists("src").await.unwrap());
        assert!(store.copy("src", "again").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_purge_with_dry_run() {
        let (memory, store) = setup(5);
        for key in ["tmp/a", "tmp/b/c", "keep"] {
            store.create(key, b"x").await.unwrap();
        }

        let listed = store.purge("tmp/", true).await.unwrap();
        assert_eq!(listed, vec!["tmp/a", "tmp/b/c"]);
        assert_eq!(memory.len(), 3);

        let deleted = store.purge("tmp/", false).await.unwrap();
        assert_eq!(deleted, listed);
        assert_eq!(memory.len(), 1);
        assert!(store.purge("tmp/", true).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_most_recent() {
        let (_, store) = setup(5);
        assert_eq!(store.most_recent("logs/").await.unwrap(), None);

        store.create("logs/1", b"x").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        store.create("logs/2", b"y").await.unwrap();

        let latest = store.most_recent("logs/").await.unwrap().unwrap();
        let entries: Vec<_> = store.list_entries("logs/").try_collect().await.unwrap();
        assert_eq!(Some(latest), entries[1].last_modified);
    }
}
