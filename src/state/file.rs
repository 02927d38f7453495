use crate::error::StateError;
use crate::state::records::new_holder_id;
use crate::state::StateStore;
use crate::BoxFuture;
use log::{debug, warn};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::io::AsyncWriteExt;

const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(20);
const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);
/// A lock file older than this is assumed to belong to a crashed process
const STALE_LOCK_AGE: Duration = Duration::from_secs(30);

/// State store backed by a single JSON file
///
/// Each operation takes an exclusive lock file next to the data file, so
/// conditional writes stay atomic across concurrent invocations of the
/// binary, not only across tasks in one process. Writes go to a temporary
/// file that is renamed over the data file.
#[derive(Debug)]
pub struct FileStateStore {
    path: PathBuf,
    lock_path: PathBuf,
    lock_timeout: Duration,
    local: tokio::sync::Mutex<()>,
}

/// Removes the lock file when dropped
struct LockFile {
    path: PathBuf,
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("Failed to remove lock file {}: {}", self.path.display(), e);
        }
    }
}

impl FileStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut lock_path = path.clone().into_os_string();
        lock_path.push(".lock");

        Self {
            path,
            lock_path: PathBuf::from(lock_path),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            local: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn acquire_lock(&self) -> Result<LockFile, StateError> {
        let deadline = tokio::time::Instant::now() + self.lock_timeout;

        loop {
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&self.lock_path)
                .await
            {
                Ok(_) => {
                    return Ok(LockFile {
                        path: self.lock_path.clone(),
                    })
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    self.break_stale_lock().await;
                }
                Err(e) => {
                    return Err(StateError::Io(format!(
                        "{}: {}",
                        self.lock_path.display(),
                        e
                    )))
                }
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(StateError::LockTimeout(self.lock_timeout));
            }
            tokio::time::sleep(LOCK_RETRY_INTERVAL).await;
        }
    }

    async fn break_stale_lock(&self) {
        if is_stale(&self.lock_path).await {
            self.remove_stale_lock().await;
        }
    }

    /// Move the lock aside before deleting it, so a lock that another
    /// process has just broken and re-taken is put back instead of lost
    async fn remove_stale_lock(&self) -> bool {
        let mut moved = self.lock_path.clone().into_os_string();
        moved.push(format!(".stale-{}", new_holder_id()));
        let moved = PathBuf::from(moved);

        // Losing the rename means someone else already broke it
        if tokio::fs::rename(&self.lock_path, &moved).await.is_err() {
            return false;
        }

        if is_stale(&moved).await {
            warn!(
                "Removing stale state lock {} left by another process",
                self.lock_path.display()
            );
            let _ = tokio::fs::remove_file(&moved).await;
            return true;
        }

        if let Err(e) = tokio::fs::hard_link(&moved, &self.lock_path).await {
            warn!("Failed to restore state lock {}: {}", self.lock_path.display(), e);
        }
        let _ = tokio::fs::remove_file(&moved).await;
        false
    }

    async fn read_entries(&self) -> Result<BTreeMap<String, String>, StateError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) if contents.trim().is_empty() => Ok(BTreeMap::new()),
            Ok(contents) => serde_json::from_str(&contents).map_err(|e| StateError::Corrupt {
                key: self.path.display().to_string(),
                message: e.to_string(),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(StateError::Io(format!("{}: {}", self.path.display(), e))),
        }
    }

    async fn write_entries(&self, entries: &BTreeMap<String, String>) -> Result<(), StateError> {
        let io_err = |e: std::io::Error| StateError::Io(format!("{}: {}", self.path.display(), e));

        let contents = serde_json::to_vec_pretty(entries).map_err(|e| StateError::Corrupt {
            key: self.path.display().to_string(),
            message: e.to_string(),
        })?;

        let mut tmp_path = self.path.clone().into_os_string();
        tmp_path.push(".tmp");
        let tmp_path = PathBuf::from(tmp_path);

        let mut file = tokio::fs::File::create(&tmp_path).await.map_err(io_err)?;
        file.write_all(&contents).await.map_err(io_err)?;
        file.sync_all().await.map_err(io_err)?;
        drop(file);

        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .map_err(io_err)
    }

    /// Run `f` against the current entries under both locks, persisting the
    /// map when `f` reports a change
    async fn update<R>(
        &self,
        f: impl FnOnce(&mut BTreeMap<String, String>) -> (R, bool),
    ) -> Result<R, StateError> {
        let _local = self.local.lock().await;
        let _lock = self.acquire_lock().await?;

        let mut entries = self.read_entries().await?;
        let (result, changed) = f(&mut entries);
        if changed {
            self.write_entries(&entries).await?;
            debug!("State file {} updated", self.path.display());
        }
        Ok(result)
    }
}

async fn is_stale(lock: &Path) -> bool {
    let Ok(metadata) = tokio::fs::metadata(lock).await else {
        return false;
    };
    metadata
        .modified()
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .is_some_and(|age| age > STALE_LOCK_AGE)
}

impl StateStore for FileStateStore {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<String>, StateError>> {
        Box::pin(async move { self.update(|entries| (entries.get(key).cloned(), false)).await })
    }

    fn put<'a>(&'a self, key: &'a str, value: String) -> BoxFuture<'a, Result<(), StateError>> {
        Box::pin(async move {
            self.update(|entries| {
                entries.insert(key.to_string(), value);
                ((), true)
            })
            .await
        })
    }

    fn put_if_absent<'a>(
        &'a self,
        key: &'a str,
        value: String,
    ) -> BoxFuture<'a, Result<bool, StateError>> {
        Box::pin(async move {
            self.update(|entries| {
                if entries.contains_key(key) {
                    (false, false)
                } else {
                    entries.insert(key.to_string(), value);
                    (true, true)
                }
            })
            .await
        })
    }

    fn compare_and_swap<'a>(
        &'a self,
        key: &'a str,
        expected: Option<&'a str>,
        new: Option<String>,
    ) -> BoxFuture<'a, Result<bool, StateError>> {
        Box::pin(async move {
            self.update(|entries| {
                if entries.get(key).map(String::as_str) != expected {
                    return (false, false);
                }
                match new {
                    Some(value) => entries.insert(key.to_string(), value),
                    None => entries.remove(key),
                };
                (true, true)
            })
            .await
        })
    }
}
