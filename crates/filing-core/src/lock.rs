use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use crate::config::LockConfig;
use crate::error::{Result, StorageError};
use crate::store::RecordStore;
use crate::types::Version;

/// Takeover attempts before a contended acquisition reports `Busy`.
const ACQUIRE_ATTEMPTS: u32 = 3;

/// Payload of a lock record.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LeaseRecord {
    owner: String,
    acquired_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl LeaseRecord {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// A held lease on a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lock {
    pub key: String,
    pub owner: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    version: Version,
}

impl Lock {
    fn new(key: &str, lease: LeaseRecord, version: Version) -> Self {
        Self {
            key: key.to_string(),
            owner: lease.owner,
            acquired_at: lease.acquired_at,
            expires_at: lease.expires_at,
            version,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }

    /// Version of the lock record this lock was written at.
    pub fn version(&self) -> &Version {
        &self.version
    }
}

fn expiry(from: DateTime<Utc>, lease: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(lease)
        .ok()
        .and_then(|d| from.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Advisory, lease-based locks keyed by record identity.
///
/// Lock records are ordinary records in the underlying [`RecordStore`], written with
/// conditional puts, so mutual exclusion holds across processes and hosts without a
/// lock server. A crashed holder's lock is taken over once its lease expires.
///
/// Lock state per key: `UNLOCKED -> LOCKED(owner, expiry) -> UNLOCKED`
#[derive(Clone)]
pub struct LockCoordinator {
    store: RecordStore,
    config: LockConfig,
}

impl LockCoordinator {
    pub fn new(store: RecordStore, config: LockConfig) -> Self {
        Self { store, config }
    }

    /// A fresh owner id, unique per call.
    pub fn new_owner_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    fn lock_key(&self, key: &str) -> String {
        format!("{}{}", self.config.lock_prefix, key)
    }

    fn encode(lease: &LeaseRecord) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(lease)?)
    }

    /// Acquire the lock on `key` for `owner`, or fail with `Busy` without blocking.
    ///
    /// An expired or unreadable lock record is taken over. Acquiring a lock the
    /// owner already holds extends its lease.
    #[instrument(skip(self), level = "debug")]
    pub async fn acquire(&self, key: &str, owner: &str, lease: Duration) -> Result<Lock> {
        let lock_key = self.lock_key(key);
        let mut last_holder: Option<LeaseRecord> = None;

        for attempt in 0..ACQUIRE_ATTEMPTS {
            let now = Utc::now();
            let record = LeaseRecord {
                owner: owner.to_string(),
                acquired_at: now,
                expires_at: expiry(now, lease),
            };
            let payload = Self::encode(&record)?;

            match self.store.create(&lock_key, &payload).await {
                Ok(created) => {
                    debug!(key, owner, "lock acquired");
                    return Ok(Lock::new(key, record, created.version));
                }
                Err(StorageError::AlreadyExists(_)) => {}
                Err(e) => return Err(e),
            }

            let current = match self.store.read(&lock_key).await {
                Ok(current) => current,
                // Released between our create and read
                Err(StorageError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };

            match serde_json::from_slice::<LeaseRecord>(&current.payload) {
                Ok(held) if held.owner != owner && held.is_live(now) => {
                    return Err(StorageError::Busy {
                        key: key.to_string(),
                        owner: held.owner,
                        expires_at: held.expires_at,
                    });
                }
                Ok(held) => {
                    debug!(key, owner, previous = %held.owner, "taking over expired or own lock");
                    last_holder = Some(held);
                }
                Err(e) => {
                    warn!(key, error = %e, "unreadable lock record, treating as stale");
                    last_holder = None;
                }
            }

            let record = LeaseRecord {
                acquired_at: last_holder
                    .as_ref()
                    .filter(|held| held.owner == owner && held.is_live(now))
                    .map_or(now, |held| held.acquired_at),
                ..record
            };
            let payload = Self::encode(&record)?;

            match self.store.replace(&lock_key, &payload, &current.version).await {
                Ok(replaced) => {
                    debug!(key, owner, attempt, "lock taken over");
                    return Ok(Lock::new(key, record, replaced.version));
                }
                Err(StorageError::VersionConflict(_)) | Err(StorageError::NotFound(_)) => {
                    warn!(key, owner, attempt, "lost lock takeover race");
                }
                Err(e) => return Err(e),
            }
        }

        let holder = match self.holder(key).await? {
            Some(lock) => lock,
            None => {
                return Err(StorageError::Busy {
                    key: key.to_string(),
                    owner: last_holder.map(|h| h.owner).unwrap_or_default(),
                    expires_at: Utc::now(),
                })
            }
        };
        Err(StorageError::Busy {
            key: key.to_string(),
            owner: holder.owner,
            expires_at: holder.expires_at,
        })
    }

    /// Poll [`LockCoordinator::acquire`] with the configured wait period and timeout.
    pub async fn acquire_wait(&self, key: &str, owner: &str, lease: Duration) -> Result<Lock> {
        self.acquire_wait_for(
            key,
            owner,
            lease,
            self.config.wait_period(),
            self.config.wait_timeout(),
        )
        .await
    }

    /// Poll [`LockCoordinator::acquire`] every `wait_period` until it succeeds or `timeout` passes.
    #[instrument(skip(self), level = "debug")]
    pub async fn acquire_wait_for(
        &self,
        key: &str,
        owner: &str,
        lease: Duration,
        wait_period: Duration,
        timeout: Duration,
    ) -> Result<Lock> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.acquire(key, owner, lease).await {
                Err(StorageError::Busy { owner: holder, .. }) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(StorageError::Timeout(format!(
                            "lock on {key} still held by {holder} after {timeout:?}"
                        )));
                    }
                    tokio::time::sleep(wait_period.min(deadline - now)).await;
                }
                other => return other,
            }
        }
    }

    /// Extend a held lock's lease.
    ///
    /// Fails with `Busy` if another owner took the lock over, `NotFound` if it is gone.
    #[instrument(skip(self, lock), level = "debug", fields(key = %lock.key, owner = %lock.owner))]
    pub async fn refresh(&self, lock: &Lock, lease: Duration) -> Result<Lock> {
        let record = LeaseRecord {
            owner: lock.owner.clone(),
            acquired_at: lock.acquired_at,
            expires_at: expiry(Utc::now(), lease),
        };
        let payload = Self::encode(&record)?;

        match self
            .store
            .replace(&self.lock_key(&lock.key), &payload, &lock.version)
            .await
        {
            Ok(replaced) => Ok(Lock::new(&lock.key, record, replaced.version)),
            Err(StorageError::VersionConflict(_)) => match self.holder(&lock.key).await? {
                Some(holder) if holder.owner != lock.owner => Err(StorageError::Busy {
                    key: lock.key.clone(),
                    owner: holder.owner,
                    expires_at: holder.expires_at,
                }),
                // Same owner re-acquired through another handle
                _ => self.acquire(&lock.key, &lock.owner, lease).await,
            },
            Err(e) => Err(e),
        }
    }

    /// Release `key` if `owner` still holds it.
    ///
    /// Returns `false` without error when the lock is absent or held by someone else.
    #[instrument(skip(self), level = "debug")]
    pub async fn release(&self, key: &str, owner: &str) -> Result<bool> {
        let lock_key = self.lock_key(key);
        let current = match self.store.read(&lock_key).await {
            Ok(current) => current,
            Err(StorageError::NotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        };

        match serde_json::from_slice::<LeaseRecord>(&current.payload) {
            Ok(held) if held.owner == owner => {}
            _ => {
                debug!(key, owner, "lock not held by caller, nothing to release");
                return Ok(false);
            }
        }

        match self.store.delete_if(&lock_key, &current.version).await {
            Ok(()) => {
                debug!(key, owner, "lock released");
                Ok(true)
            }
            Err(StorageError::NotFound(_)) | Err(StorageError::VersionConflict(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Current lock record on `key`, expired or not.
    pub async fn holder(&self, key: &str) -> Result<Option<Lock>> {
        let current = match self.store.read(&self.lock_key(key)).await {
            Ok(current) => current,
            Err(StorageError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        Ok(serde_json::from_slice::<LeaseRecord>(&current.payload)
            .ok()
            .map(|lease| Lock::new(key, lease, current.version)))
    }

    /// Run `body` while holding the lock on `key`.
    ///
    /// The body is bounded by the lock's `expires_at`, so time spent acquiring counts
    /// against the lease: running past it fails with `Timeout`. The lock
    /// is released after a normal return, an error, a timeout, or a panic (which is
    /// resumed after release). A release failure is logged; the lease then expires.
    pub async fn with_lock<T, E, F, Fut>(
        &self,
        key: &str,
        owner: &str,
        lease: Duration,
        body: F,
    ) -> std::result::Result<T, E>
    where
        F: FnOnce(Lock) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<StorageError>,
    {
        let lock = self.acquire(key, owner, lease).await?;
        let remaining = (lock.expires_at - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        let outcome = AssertUnwindSafe(tokio::time::timeout(remaining, body(lock)))
            .catch_unwind()
            .await;

        if let Err(e) = self.release(key, owner).await {
            warn!(key, owner, error = %e, "failed to release lock, leaving it to expire");
        }

        match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(_elapsed)) => Err(StorageError::Timeout(format!(
                "critical section on {key} exceeded its {lease:?} lease"
            ))
            .into()),
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}
