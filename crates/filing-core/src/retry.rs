use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_stream::try_stream;
use async_trait::async_trait;
use futures::StreamExt;
use tracing::{debug, instrument, warn};

use crate::config::RetryConfig;
use crate::driver::{BackendDriver, EntryStream};
use crate::error::{Result, StorageError};
use crate::types::{Precondition, Version};

/// Capped exponential backoff with jitter over a bounded number of attempts.
///
/// Only `StorageError::Transient` is retried. `NotFound`, `VersionConflict`,
/// permission errors and everything else propagate on the first occurrence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    jitter: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            jitter: Duration::ZERO,
        }
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO)
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before retry number `attempt + 1`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponential = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt));
        exponential.min(self.max_delay) + jitter(self.jitter)
    }

    /// Sleep with exponential backoff + jitter.
    pub async fn backoff(&self, attempt: u32) {
        let delay = self.delay(attempt);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    /// Run `call` until it succeeds, fails non-transiently, or the attempt budget is spent.
    pub async fn run<T, F, Fut>(&self, op: &str, key: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(StorageError::Transient { kind, message }) => {
                    if attempt + 1 >= self.max_attempts {
                        return Err(StorageError::Transient {
                            kind,
                            message: format!(
                                "{op} {key} failed after {} attempts: {message}",
                                attempt + 1
                            ),
                        });
                    }
                    warn!(attempt, op, key, %kind, %message, "retryable backend error, retrying");
                    self.backoff(attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self::new(
            config.max_attempts,
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
        )
        .with_jitter(Duration::from_millis(config.jitter_ms))
    }
}

/// Simple jitter: random-ish value below `max` using timestamp nanos.
fn jitter(max: Duration) -> Duration {
    let bound = max.as_nanos() as u64;
    if bound == 0 {
        return Duration::ZERO;
    }
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64)
        .unwrap_or(0);
    Duration::from_nanos(nanos % bound)
}

/// Wraps any driver so every call goes through a [`RetryPolicy`].
///
/// A conditional `put` that conflicts after a retry is reported as applied when the
/// stored bytes equal its payload. A concurrent writer that stored the very same
/// bytes in between is taken for the earlier attempt; any other payload still
/// surfaces as `VersionConflict`.
#[derive(Clone)]
pub struct RetryingDriver {
    inner: Arc<dyn BackendDriver>,
    policy: RetryPolicy,
}

impl RetryingDriver {
    pub fn new(inner: Arc<dyn BackendDriver>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }
}

#[async_trait]
impl BackendDriver for RetryingDriver {
    fn driver_name(&self) -> &'static str {
        self.inner.driver_name()
    }

    async fn get(&self, key: &str) -> Result<(Vec<u8>, Version)> {
        self.policy.run("get", key, || self.inner.get(key)).await
    }

    #[instrument(skip(self, payload), level = "debug", fields(driver = self.inner.driver_name()))]
    async fn put(&self, key: &str, payload: &[u8], precondition: Precondition) -> Result<Version> {
        let mut attempts = 0u32;
        let result = self
            .policy
            .run("put", key, || {
                attempts += 1;
                self.inner.put(key, payload, precondition.clone())
            })
            .await;

        // A retried conditional put can conflict with its own earlier attempt when
        // that attempt landed but its response was lost. Only identical stored bytes
        // count as ours; a concurrent writer of the same bytes is indistinguishable.
        if let Err(StorageError::VersionConflict(_)) = &result {
            if attempts > 1 && precondition != Precondition::Any {
                if let Ok((stored, version)) = self.inner.get(key).await {
                    if stored == payload {
                        debug!(key, attempts, "conditional put already applied by an earlier attempt");
                        return Ok(version);
                    }
                }
            }
        }
        result
    }

    async fn delete(&self, key: &str, expected: Option<&Version>) -> Result<()> {
        self.policy
            .run("delete", key, || self.inner.delete(key, expected))
            .await
    }

    fn list<'a>(&'a self, prefix: &'a str) -> EntryStream<'a> {
        let policy = self.policy;
        Box::pin(try_stream! {
            let mut last_key: Option<String> = None;
            let mut attempt = 0u32;

            'listing: loop {
                let mut entries = self.inner.list(prefix);
                while let Some(item) = entries.next().await {
                    match item {
                        Ok(entry) => {
                            // Resume after the last yielded key: listings are sorted.
                            if last_key.as_deref().is_some_and(|last| entry.key.as_str() <= last) {
                                continue;
                            }
                            last_key = Some(entry.key.clone());
                            yield entry;
                        }
                        Err(e) if e.is_transient() && attempt + 1 < policy.max_attempts() => {
                            warn!(attempt, prefix, error = %e, "listing interrupted, restarting");
                            policy.backoff(attempt).await;
                            attempt += 1;
                            continue 'listing;
                        }
                        Err(e) => Err(e)?,
                    }
                }
                break;
            }
        })
    }
}
