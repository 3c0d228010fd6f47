use std::collections::HashSet;
use std::marker::PhantomData;

use futures::TryStreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, instrument};

use crate::error::{Result, StorageError};
use crate::store::RecordStore;

const KEY_ALPHABET: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const RANDOM_KEY_ATTEMPTS: u32 = 16;
/// Key spaces up to this size are scanned exhaustively once random picks keep colliding.
const KEY_SCAN_LIMIT: u128 = 36 * 36 * 36;
const CREATE_ATTEMPTS: u32 = 4;

/// Serde-typed records stored as JSON at `{prefix}{key}.{extension}`.
pub struct JsonStore<T> {
    store: RecordStore,
    prefix: String,
    extension: String,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for JsonStore<T> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            prefix: self.prefix.clone(),
            extension: self.extension.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> JsonStore<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new(store: RecordStore, prefix: impl Into<String>, extension: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            extension: extension.into(),
            _marker: PhantomData,
        }
    }

    /// Backend key of a record.
    pub fn path(&self, key: &str) -> String {
        format!("{}{}.{}", self.prefix, key, self.extension)
    }

    pub async fn read(&self, key: &str) -> Result<T> {
        let record = self.store.read(&self.path(key)).await?;
        Ok(serde_json::from_slice(&record.payload)?)
    }

    /// Store `value` under `key`, or under a freshly generated key when `None`.
    ///
    /// Returns the key used.
    #[instrument(skip(self, value), level = "debug")]
    pub async fn write(&self, value: &T, key: Option<&str>) -> Result<String> {
        let payload = serde_json::to_vec(value)?;
        if let Some(key) = key {
            self.store.write(&self.path(key), &payload).await?;
            return Ok(key.to_string());
        }

        for _ in 0..CREATE_ATTEMPTS {
            let key = self.unique_key(8).await?;
            match self.store.create(&self.path(&key), &payload).await {
                Ok(_) => {
                    debug!(key = %key, "stored record under generated key");
                    return Ok(key);
                }
                // Another writer claimed the same key first
                Err(StorageError::AlreadyExists(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(StorageError::KeysExhausted(format!(
            "no free key under {} after {CREATE_ATTEMPTS} attempts",
            self.prefix
        )))
    }

    /// Store `value` under `key`, failing with `AlreadyExists` if the key is taken.
    pub async fn create(&self, key: &str, value: &T) -> Result<()> {
        let payload = serde_json::to_vec(value)?;
        self.store.create(&self.path(key), &payload).await?;
        Ok(())
    }

    /// Apply `mutate` to the stored value with optimistic concurrency.
    ///
    /// See [`RecordStore::update`] for the retry behaviour.
    pub async fn update<F>(&self, key: &str, mut mutate: F) -> Result<T>
    where
        F: FnMut(&mut T),
    {
        let record = self
            .store
            .try_update(&self.path(key), |payload| {
                let mut value: T = serde_json::from_slice(payload)?;
                mutate(&mut value);
                Ok(serde_json::to_vec(&value)?)
            })
            .await?;
        Ok(serde_json::from_slice(&record.payload)?)
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        self.store.delete(&self.path(key)).await
    }

    /// Keys of all records, sorted, with prefix and extension stripped.
    pub async fn list(&self) -> Result<Vec<String>> {
        let suffix = format!(".{}", self.extension);
        let keys: Vec<String> = self.store.list(&self.prefix).try_collect().await?;
        Ok(keys
            .iter()
            .filter_map(|key| key.strip_prefix(self.prefix.as_str()))
            .filter_map(|key| key.strip_suffix(suffix.as_str()))
            .map(str::to_string)
            .collect())
    }

    /// A random base-36 key of `len` characters not currently in use.
    ///
    /// Fails with `KeysExhausted` when every key of that length is taken. The key is
    /// not reserved: use [`JsonStore::create`] to claim it.
    #[instrument(skip(self), level = "debug")]
    pub async fn unique_key(&self, len: u32) -> Result<String> {
        if len == 0 {
            return Err(StorageError::InvalidKey("key length must be positive".into()));
        }
        let space = 36u128.checked_pow(len).unwrap_or(u128::MAX);

        for _ in 0..RANDOM_KEY_ATTEMPTS {
            let candidate = encode_key(random_u128() % space, len);
            if !self.store.exists(&self.path(&candidate)).await? {
                return Ok(candidate);
            }
        }

        if space <= KEY_SCAN_LIMIT {
            let taken: HashSet<String> = self.list().await?.into_iter().collect();
            let start = random_u128() % space;
            if let Some(free) = (0..space)
                .map(|offset| encode_key((start + offset) % space, len))
                .find(|candidate| !taken.contains(candidate))
            {
                return Ok(free);
            }
        }

        Err(StorageError::KeysExhausted(format!(
            "no free key of length {len} under {}",
            self.prefix
        )))
    }
}

fn random_u128() -> u128 {
    uuid::Uuid::new_v4().as_u128()
}

fn encode_key(mut value: u128, len: u32) -> String {
    let mut key = vec![b'0'; len as usize];
    for slot in key.iter_mut().rev() {
        *slot = KEY_ALPHABET[(value % 36) as usize];
        value /= 36;
    }
    key.into_iter().map(char::from).collect()
}
