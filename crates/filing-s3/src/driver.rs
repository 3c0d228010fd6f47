use async_stream::try_stream;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::config::retry::RetryConfig;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use chrono::{DateTime, Utc};
use filing_core::{
    validate_key, BackendDriver, EntryStream, ListingEntry, Precondition, Result, StorageError,
    TransientKind, Version,
};
use tracing::{debug, instrument};

use crate::config::S3Config;

/// S3-compatible object store driver.
///
/// Each key maps to the object `{prefix}{key}`. Retries are left to
/// `filing_core::RetryingDriver`, so clients built by [`S3Driver::from_config`]
/// have SDK retries disabled.
#[derive(Debug, Clone)]
pub struct S3Driver {
    client: Client,
    bucket: String,
    prefix: String,
}

impl S3Driver {
    pub fn new(client: Client, bucket: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            prefix: prefix.into(),
        }
    }

    /// Build a client from the AWS default chain plus overrides in `config`.
    pub async fn from_config(config: &S3Config) -> Self {
        let shared = aws_config::defaults(BehaviorVersion::latest()).load().await;
        let mut builder = aws_sdk_s3::config::Builder::from(&shared)
            .retry_config(RetryConfig::disabled())
            .force_path_style(config.force_path_style);

        if let Some(endpoint) = &config.endpoint_url {
            builder = builder.endpoint_url(endpoint);
        }
        if let Some(region) = &config.region {
            builder = builder.region(Region::new(region.clone()));
        }
        if let (Some(access_key), Some(secret_key)) =
            (&config.access_key_id, &config.secret_access_key)
        {
            builder = builder.credentials_provider(Credentials::new(
                access_key,
                secret_key,
                None,
                None,
                "filing-s3-config",
            ));
        }

        debug!(bucket = %config.bucket, prefix = %config.prefix, "S3 driver configured");
        Self::new(
            Client::from_conf(builder.build()),
            config.bucket.clone(),
            config.prefix.clone(),
        )
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    fn object_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    /// Current ETag of `key`.
    async fn head(&self, key: &str) -> Result<Version> {
        let output = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(self.object_key(key))
            .send()
            .await
            .map_err(|e| classify("head", key, e))?;
        etag(key, output.e_tag())
    }
}

fn etag(key: &str, etag: Option<&str>) -> Result<Version> {
    etag.map(Version::from)
        .ok_or_else(|| StorageError::Io(format!("{key}: object store returned no ETag")))
}

fn status_of<E>(err: &SdkError<E, HttpResponse>) -> Option<u16> {
    match err {
        SdkError::ServiceError(e) => Some(e.raw().status().as_u16()),
        SdkError::ResponseError(e) => Some(e.raw().status().as_u16()),
        _ => None,
    }
}

/// Map an SDK failure onto the storage error taxonomy.
fn classify<E>(op: &str, key: &str, err: SdkError<E, HttpResponse>) -> StorageError
where
    E: std::error::Error + Send + Sync + 'static,
{
    let status = status_of(&err);
    let message = format!("S3 {op} {key}: {}", DisplayErrorContext(&err));
    match (&err, status) {
        (SdkError::TimeoutError(_) | SdkError::DispatchFailure(_), _) => {
            StorageError::transient(TransientKind::Timeout, message)
        }
        (_, Some(409 | 412)) => StorageError::VersionConflict(key.to_string()),
        (_, Some(404)) => StorageError::NotFound(key.to_string()),
        (_, Some(403)) => StorageError::PermissionDenied(message),
        (_, Some(429 | 503)) => StorageError::transient(TransientKind::Throttled, message),
        (_, Some(500 | 502 | 504)) => StorageError::transient(TransientKind::Unavailable, message),
        _ => StorageError::Io(message),
    }
}

fn to_chrono(timestamp: &aws_sdk_s3::primitives::DateTime) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(timestamp.secs(), timestamp.subsec_nanos())
}

#[async_trait]
impl BackendDriver for S3Driver {
    fn driver_name(&self) -> &'static str {
        "s3"
    }

    async fn get(&self, key: &str) -> Result<(Vec<u8>, Version)> {
        validate_key(key)?;
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.object_key(key))
            .send()
            .await
            .map_err(|e| classify("get", key, e))?;

        let version = etag(key, output.e_tag())?;
        let payload = output
            .body
            .collect()
            .await
            .map_err(|e| {
                StorageError::transient(
                    TransientKind::Interrupted,
                    format!("S3 get {key}: failed to read body: {e}"),
                )
            })?
            .into_bytes();
        Ok((payload.to_vec(), version))
    }

    #[instrument(skip(self, payload), level = "debug", fields(bucket = %self.bucket, size = payload.len()))]
    async fn put(&self, key: &str, payload: &[u8], precondition: Precondition) -> Result<Version> {
        validate_key(key)?;
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(self.object_key(key))
            .body(ByteStream::from(payload.to_vec()));

        request = match &precondition {
            Precondition::Any => request,
            Precondition::NotExists => request.if_none_match("*"),
            Precondition::Matches(version) => request.if_match(version.as_str()),
        };

        match request.send().await {
            Ok(output) => {
                let version = match output.e_tag() {
                    Some(tag) => Version::from(tag),
                    None => self.head(key).await?,
                };
                debug!(key, %version, "stored object");
                Ok(version)
            }
            Err(e) => match classify("put", key, e) {
                // Some stores answer If-Match on a missing object with 412
                StorageError::VersionConflict(_)
                    if matches!(precondition, Precondition::Matches(_)) =>
                {
                    match self.head(key).await {
                        Err(StorageError::NotFound(_)) => Err(StorageError::NotFound(key.to_string())),
                        _ => Err(StorageError::VersionConflict(key.to_string())),
                    }
                }
                other => Err(other),
            },
        }
    }

    #[instrument(skip(self), level = "debug", fields(bucket = %self.bucket))]
    async fn delete(&self, key: &str, expected: Option<&Version>) -> Result<()> {
        validate_key(key)?;
        let current = self.head(key).await?;
        if expected.is_some_and(|expected| *expected != current) {
            return Err(StorageError::VersionConflict(key.to_string()));
        }

        let mut request = self
            .client
            .delete_object()
            .bucket(&self.bucket)
            .key(self.object_key(key));
        if let Some(expected) = expected {
            request = request.if_match(expected.as_str());
        }
        request.send().await.map_err(|e| classify("delete", key, e))?;
        debug!(key, "deleted object");
        Ok(())
    }

    fn list<'a>(&'a self, prefix: &'a str) -> EntryStream<'a> {
        Box::pin(try_stream! {
            let full_prefix = self.object_key(prefix);
            let mut continuation: Option<String> = None;

            loop {
                let mut request = self
                    .client
                    .list_objects_v2()
                    .bucket(&self.bucket)
                    .prefix(&full_prefix);
                if let Some(token) = continuation.take() {
                    request = request.continuation_token(token);
                }

                let output = request
                    .send()
                    .await
                    .map_err(|e| classify("list", prefix, e))?;

                for object in output.contents() {
                    let Some(key) = object
                        .key()
                        .and_then(|k| k.strip_prefix(self.prefix.as_str()))
                    else {
                        continue;
                    };
                    yield ListingEntry {
                        key: key.to_string(),
                        size: object.size().and_then(|s| u64::try_from(s).ok()),
                        last_modified: object.last_modified().and_then(to_chrono),
                    };
                }

                match output.next_continuation_token() {
                    Some(token) if output.is_truncated() == Some(true) => {
                        continuation = Some(token.to_string());
                    }
                    _ => break,
                }
            }
        })
    }
}
