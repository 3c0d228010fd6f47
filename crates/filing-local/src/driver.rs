use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use async_stream::try_stream;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use filing_core::{
    validate_key, BackendDriver, EntryStream, ListingEntry, Precondition, Result, StorageError,
    TransientKind, Version,
};
use fs2::FileExt;
use sha2::{Digest, Sha256};
use tracing::{debug, instrument, warn};

use crate::config::LocalConfig;

/// Directory under the root holding the latch files.
const LATCH_DIR: &str = ".latch";
/// Latch files are striped by the first byte of the key digest.
const LATCH_STRIPES: usize = 256;
/// Attempts at creating a temp file when a concurrent delete prunes its directory.
const TEMP_CREATE_ATTEMPTS: u32 = 3;

/// Local filesystem driver.
///
/// Storage layout:
/// ```text
/// {root}/
///   {key path}                 # one file per record
///   .../.{name}.{uuid}.tmp     # in-flight replacement, renamed over the record
///   .latch/{sha256(key)[0]}    # fs2 lock held during compare-and-replace, 256 stripes
/// ```
///
/// Several drivers (in one or many processes) may share a root.
///
/// A record file cannot share its path with a directory of other records: with a
/// record at `a`, the key `a/b` reads as absent and `put` fails with `InvalidKey`
/// (likewise `d` while `d/e` exists).
#[derive(Debug, Clone)]
pub struct LocalDriver {
    root: PathBuf,
}

impl LocalDriver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn from_config(config: &LocalConfig) -> Self {
        Self::new(config.root.clone())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn file_path(root: &Path, key: &str) -> PathBuf {
        key.split('/').fold(root.to_path_buf(), |path, part| path.join(part))
    }
}

/// Run filesystem work off the async runtime.
async fn blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| StorageError::Io(format!("filesystem task failed: {e}")))?
}

fn map_io(key: &str, err: io::Error) -> StorageError {
    match err.kind() {
        io::ErrorKind::NotFound | io::ErrorKind::NotADirectory | io::ErrorKind::IsADirectory => {
            StorageError::NotFound(key.to_string())
        }
        io::ErrorKind::PermissionDenied => StorageError::PermissionDenied(format!("{key}: {err}")),
        io::ErrorKind::Interrupted | io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
            StorageError::transient(TransientKind::Interrupted, format!("{key}: {err}"))
        }
        _ => StorageError::Io(format!("{key}: {err}")),
    }
}

/// Exclusive lock on a key's latch file, released on drop.
struct Latch(File);

impl Latch {
    fn acquire(root: &Path, key: &str) -> io::Result<Self> {
        let dir = root.join(LATCH_DIR);
        fs::create_dir_all(&dir)?;
        let stripe = usize::from(Sha256::digest(key.as_bytes())[0]) % LATCH_STRIPES;
        let name = format!("{stripe:02x}");
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(dir.join(name))?;
        FileExt::lock_exclusive(&file)?;
        Ok(Self(file))
    }
}

impl Drop for Latch {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.0);
    }
}

/// Version of an open file: size, mtime and a content digest prefix.
fn fingerprint(file: &mut File) -> io::Result<(Vec<u8>, Version)> {
    let metadata = file.metadata()?;
    if !metadata.is_file() {
        return Err(io::Error::new(io::ErrorKind::NotFound, "not a record file"));
    }
    let mut payload = Vec::with_capacity(metadata.len() as usize);
    file.read_to_end(&mut payload)?;

    let mtime_ns = metadata
        .modified()?
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let digest = hex::encode(Sha256::digest(&payload));
    let version = Version::new(format!("{:x}-{:x}-{}", payload.len(), mtime_ns, &digest[..16]));
    Ok((payload, version))
}

fn read_record(path: &Path) -> io::Result<(Vec<u8>, Version)> {
    fingerprint(&mut File::open(path)?)
}

fn current_version(path: &Path) -> io::Result<Option<Version>> {
    match read_record(path) {
        Ok((_, version)) => Ok(Some(version)),
        Err(e) if is_absent(&e) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Errors meaning no record file exists at a path.
fn is_absent(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::NotADirectory | io::ErrorKind::IsADirectory
    )
}

/// Whether `path` is a directory or lies below an existing non-directory.
fn collides(root: &Path, path: &Path) -> bool {
    if path.is_dir() {
        return true;
    }
    path.ancestors()
        .skip(1)
        .take_while(|dir| *dir != root && dir.starts_with(root))
        .any(|dir| fs::symlink_metadata(dir).is_ok_and(|m| !m.is_dir()))
}

/// Write `payload` to a temp file beside `path`, then rename it into place.
fn replace_file(path: &Path, payload: &[u8]) -> io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "record path has no parent"))?;
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "record path has no name"))?;
    let temp_path = parent.join(format!(".{}.{}.tmp", name, uuid::Uuid::new_v4()));

    let mut attempt = 0;
    let mut temp = loop {
        fs::create_dir_all(parent)?;
        match File::create(&temp_path) {
            Ok(file) => break file,
            // Directory pruned by a concurrent delete
            Err(e) if e.kind() == io::ErrorKind::NotFound && attempt + 1 < TEMP_CREATE_ATTEMPTS => {
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    };

    let written = temp
        .write_all(payload)
        .and_then(|()| temp.sync_all())
        .and_then(|()| fs::rename(&temp_path, path));
    if written.is_err() {
        let _ = fs::remove_file(&temp_path);
    }
    written
}

/// Remove empty directories from `dir` up to, but excluding, `root`.
fn prune_empty_dirs(root: &Path, mut dir: &Path) {
    while dir != root && dir.starts_with(root) {
        if fs::remove_dir(dir).is_err() {
            break;
        }
        match dir.parent() {
            Some(parent) => dir = parent,
            None => break,
        }
    }
}

fn put_blocking(root: &Path, key: &str, payload: &[u8], precondition: &Precondition) -> Result<Version> {
    let path = LocalDriver::file_path(root, key);
    let _latch = Latch::acquire(root, key).map_err(|e| map_io(key, e))?;

    if collides(root, &path) {
        return Err(StorageError::InvalidKey(format!(
            "{key} collides with the path of an existing record"
        )));
    }
    let current = current_version(&path).map_err(|e| map_io(key, e))?;
    precondition.check(key, current.as_ref())?;

    replace_file(&path, payload).map_err(|e| map_io(key, e))?;
    let (_, version) = read_record(&path).map_err(|e| map_io(key, e))?;
    Ok(version)
}

fn delete_blocking(root: &Path, key: &str, expected: Option<&Version>) -> Result<()> {
    let path = LocalDriver::file_path(root, key);
    let _latch = Latch::acquire(root, key).map_err(|e| map_io(key, e))?;

    let current = current_version(&path)
        .map_err(|e| map_io(key, e))?
        .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
    if expected.is_some_and(|expected| *expected != current) {
        return Err(StorageError::VersionConflict(key.to_string()));
    }

    fs::remove_file(&path).map_err(|e| map_io(key, e))?;
    if let Some(parent) = path.parent() {
        prune_empty_dirs(root, parent);
    }
    Ok(())
}

/// Collect files under `dir` whose key starts with `prefix`. Dot entries are skipped.
fn walk(dir: &Path, dir_key: &str, prefix: &str, out: &mut Vec<ListingEntry>) -> io::Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if is_absent(&e) => return Ok(()),
        Err(e) => return Err(e),
    };

    for entry in entries {
        let entry = entry?;
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else {
            warn!(path = %entry.path().display(), "skipping non UTF-8 file name");
            continue;
        };
        if name.starts_with('.') {
            continue;
        }

        let key = if dir_key.is_empty() {
            name.to_string()
        } else {
            format!("{dir_key}/{name}")
        };
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            let subtree = format!("{key}/");
            if subtree.starts_with(prefix) || prefix.starts_with(&subtree) {
                walk(&entry.path(), &key, prefix, out)?;
            }
        } else if file_type.is_file() && key.starts_with(prefix) {
            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                // Deleted while listing
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e),
            };
            out.push(ListingEntry {
                key,
                size: Some(metadata.len()),
                last_modified: metadata.modified().ok().map(DateTime::<Utc>::from),
            });
        }
    }
    Ok(())
}

fn list_blocking(root: &Path, prefix: &str) -> Result<Vec<ListingEntry>> {
    // Start from the deepest directory the prefix names in full
    let base = prefix.rfind('/').map_or("", |i| &prefix[..i]);
    if !base.is_empty() {
        validate_key(base)?;
    }
    let start = if base.is_empty() {
        root.to_path_buf()
    } else {
        LocalDriver::file_path(root, base)
    };

    let mut entries = Vec::new();
    walk(&start, base, prefix, &mut entries).map_err(|e| map_io(prefix, e))?;
    entries.sort_by(|a, b| a.key.cmp(&b.key));
    Ok(entries)
}

#[async_trait]
impl BackendDriver for LocalDriver {
    fn driver_name(&self) -> &'static str {
        "local"
    }

    async fn get(&self, key: &str) -> Result<(Vec<u8>, Version)> {
        validate_key(key)?;
        let path = Self::file_path(&self.root, key);
        let owned_key = key.to_string();
        blocking(move || read_record(&path).map_err(|e| map_io(&owned_key, e))).await
    }

    #[instrument(skip(self, payload), level = "debug", fields(size = payload.len()))]
    async fn put(&self, key: &str, payload: &[u8], precondition: Precondition) -> Result<Version> {
        validate_key(key)?;
        let root = self.root.clone();
        let owned_key = key.to_string();
        let payload = payload.to_vec();
        let version =
            blocking(move || put_blocking(&root, &owned_key, &payload, &precondition)).await?;
        debug!(key, %version, "stored record");
        Ok(version)
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete(&self, key: &str, expected: Option<&Version>) -> Result<()> {
        validate_key(key)?;
        let root = self.root.clone();
        let owned_key = key.to_string();
        let expected = expected.cloned();
        blocking(move || delete_blocking(&root, &owned_key, expected.as_ref())).await?;
        debug!(key, "deleted record");
        Ok(())
    }

    fn list<'a>(&'a self, prefix: &'a str) -> EntryStream<'a> {
        let root = self.root.clone();
        let owned_prefix = prefix.to_string();
        Box::pin(try_stream! {
            let entries = blocking(move || list_blocking(&root, &owned_prefix)).await?;
            for entry in entries {
                yield entry;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use futures::TryStreamExt;
    use tempfile::TempDir;

    use super::*;

    fn setup() -> (TempDir, LocalDriver) {
        let temp_dir = TempDir::new().unwrap();
        let driver = LocalDriver::new(temp_dir.path());
        (temp_dir, driver)
    }

    async fn keys(driver: &LocalDriver, prefix: &str) -> Vec<String> {
        driver
            .list(prefix)
            .map_ok(|entry| entry.key)
            .try_collect()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let (_temp, driver) = setup();
        let version = driver
            .put("docs/a.json", b"{\"v\":1}", Precondition::NotExists)
            .await
            .unwrap();

        let (payload, read_version) = driver.get("docs/a.json").await.unwrap();
        assert_eq!(payload, b"{\"v\":1}");
        assert_eq!(read_version, version);
        assert_eq!(version.as_str().split('-').count(), 3);
        assert!(version.as_str().starts_with("7-"));
    }

    #[tokio::test]
    async fn test_conditional_put() {
        let (_temp, driver) = setup();
        let v1 = driver.put("k", b"one", Precondition::NotExists).await.unwrap();

        assert!(driver
            .put("k", b"two", Precondition::NotExists)
            .await
            .unwrap_err()
            .is_version_conflict());
        assert!(driver
            .put("other", b"two", Precondition::Matches(v1.clone()))
            .await
            .unwrap_err()
            .is_not_found());

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
        assert_eq!(driver.get("k").await.unwrap().0, b"two");
    }

    #[tokio::test]
    async fn test_get_missing_and_invalid_keys() {
        let (_temp, driver) = setup();
        assert!(driver.get("missing").await.unwrap_err().is_not_found());

        for bad in ["../escape", ".latch/x", "a//b"] {
            let err = driver.put(bad, b"x", Precondition::Any).await.unwrap_err();
            assert!(matches!(err, StorageError::InvalidKey(_)), "{bad}");
        }
    }

    #[tokio::test]
    async fn test_list_sorted_and_skips_bookkeeping() {
        let (temp, driver) = setup();
        for key in ["b/2", "a/2", "a/1", "ab/1", "a/sub/3"] {
            driver.put(key, b"x", Precondition::Any).await.unwrap();
        }
        // Leftover temp file from a crashed writer
        fs::write(temp.path().join("a").join(".1.deadbeef.tmp"), b"partial").unwrap();

        assert_eq!(keys(&driver, "a/").await, vec!["a/1", "a/2", "a/sub/3"]);
        assert_eq!(keys(&driver, "a").await, vec!["a/1", "a/2", "a/sub/3", "ab/1"]);
        assert_eq!(keys(&driver, "a/s").await, vec!["a/sub/3"]);
        assert_eq!(keys(&driver, "").await.len(), 5);
        assert!(keys(&driver, "zzz/").await.is_empty());

        let entries: Vec<ListingEntry> = driver.list("b/").try_collect().await.unwrap();
        assert_eq!(entries[0].size, Some(1));
        assert!(entries[0].last_modified.is_some());
    }

    #[tokio::test]
    async fn test_missing_root_lists_empty() {
        let temp = TempDir::new().unwrap();
        let driver = LocalDriver::new(temp.path().join("not-created"));
        assert!(keys(&driver, "").await.is_empty());
    }

    #[tokio::test]
    async fn test_delete_checks_version_and_prunes_dirs() {
        let (temp, driver) = setup();
        let version = driver.put("x/y/z", b"data", Precondition::Any).await.unwrap();

        assert!(driver
            .delete("x/y/z", Some(&Version::from("stale")))
            .await
            .unwrap_err()
            .is_version_conflict());
        driver.delete("x/y/z", Some(&version)).await.unwrap();

        assert!(!temp.path().join("x").exists());
        assert!(temp.path().exists());
        assert!(driver.delete("x/y/z", None).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_file_and_directory_keys_do_not_clash() {
        let (_temp, driver) = setup();
        driver.put("a", b"leaf", Precondition::NotExists).await.unwrap();
        driver.put("d/e", b"nested", Precondition::NotExists).await.unwrap();

        // Below a record file
        assert!(driver.get("a/b").await.unwrap_err().is_not_found());
        assert!(driver.delete("a/b", None).await.unwrap_err().is_not_found());
        assert!(keys(&driver, "a/").await.is_empty());
        let err = driver.put("a/b", b"x", Precondition::NotExists).await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidKey(_)), "{err}");

        // On a directory of records
        assert!(driver.get("d").await.unwrap_err().is_not_found());
        assert!(driver.delete("d", None).await.unwrap_err().is_not_found());
        let err = driver.put("d", b"x", Precondition::Any).await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidKey(_)), "{err}");

        assert_eq!(driver.get("a").await.unwrap().0, b"leaf");
        assert_eq!(keys(&driver, "").await, vec!["a", "d/e"]);
    }

    #[tokio::test]
    async fn test_latch_files_are_bounded() {
        let (temp, driver) = setup();
        for i in 0..400 {
            let key = format!("keys/{i}");
            driver.put(&key, b"x", Precondition::Any).await.unwrap();
            driver.delete(&key, None).await.unwrap();
        }

        let latches = fs::read_dir(temp.path().join(LATCH_DIR)).unwrap().count();
        assert!(latches <= LATCH_STRIPES, "{latches} latch files");
    }

    #[tokio::test]
    async fn test_no_temp_files_left_behind() {
        let (temp, driver) = setup();
        for i in 0..5u8 {
            driver.put("doc", &[i], Precondition::Any).await.unwrap();
        }
        let names: Vec<String> = fs::read_dir(temp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert!(names.iter().all(|n| !n.ends_with(".tmp")), "{names:?}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_exclusive_create_across_instances() {
        let temp = TempDir::new().unwrap();
        let mut tasks = Vec::new();
        for i in 0..8u8 {
            // Separate driver instances sharing one root
            let driver = Arc::new(LocalDriver::new(temp.path()));
            tasks.push(tokio::spawn(async move {
                driver.put("claim", &[i], Precondition::NotExists).await
            }));
        }

        let mut winners = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => winners += 1,
                Err(e) => assert!(e.is_version_conflict(), "{e}"),
            }
        }
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_io_error_mapping() {
        let err = map_io("k", io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(matches!(err, StorageError::PermissionDenied(_)));
        assert!(map_io("k", io::Error::from(io::ErrorKind::Interrupted)).is_transient());
        assert!(map_io("k", io::Error::from(io::ErrorKind::NotFound)).is_not_found());
        assert!(map_io("k", io::Error::from(io::ErrorKind::NotADirectory)).is_not_found());
        assert!(map_io("k", io::Error::from(io::ErrorKind::IsADirectory)).is_not_found());
        assert!(matches!(
            map_io("k", io::Error::other("disk on fire")),
            StorageError::Io(_)
        ));
    }
}
