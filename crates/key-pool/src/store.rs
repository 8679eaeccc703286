//! Key-value persistence for quota records
//!
//! The ledger only needs `get`/`set` by key plus key listing for cleanup.
//! `MemoryStore` keeps everything in process; `FileStore` keeps a JSON map on
//! disk. All file writes use atomic temp-file + rename so a crash mid-write
//! never leaves a truncated file behind. A tokio Mutex serializes writers.
//!
//! Neither implementation is transactional across processes. Deployments that
//! share one quota between processes need a store with atomic increments.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Boxed future returned by store operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Generic byte-valued key-value store.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility (`Arc<dyn KeyValueStore>`).
pub trait KeyValueStore: Send + Sync {
    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<Vec<u8>>>;

    fn set<'a>(&'a self, key: &'a str, value: Vec<u8>) -> StoreFuture<'a, ()>;

    /// Remove a key. Removing an absent key is not an error.
    fn remove<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ()>;

    fn keys(&self) -> StoreFuture<'_, Vec<String>>;
}

/// In-process store. Contents are lost on restart.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<Vec<u8>>> {
        Box::pin(async move { Ok(self.state.lock().await.get(key).cloned()) })
    }

    fn set<'a>(&'a self, key: &'a str, value: Vec<u8>) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.state.lock().await.insert(key.to_string(), value);
            Ok(())
        })
    }

    fn remove<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.state.lock().await.remove(key);
            Ok(())
        })
    }

    fn keys(&self) -> StoreFuture<'_, Vec<String>> {
        Box::pin(async move { Ok(self.state.lock().await.keys().cloned().collect()) })
    }
}

/// Durable store backed by a single JSON file mapping keys to UTF-8 values.
pub struct FileStore {
    path: PathBuf,
    state: Mutex<BTreeMap<String, String>>,
}

impl FileStore {
    /// Open the store at `path`, creating an empty file on first use.
    pub async fn open(path: PathBuf) -> Result<Self> {
        let state = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Io(format!("reading store file: {e}")))?;
            let entries: BTreeMap<String, String> = serde_json::from_str(&contents)
                .map_err(|e| Error::Encoding(format!("parsing store file: {e}")))?;
            info!(path = %path.display(), entries = entries.len(), "opened quota store");
            entries
        } else {
            info!(path = %path.display(), "quota store not found, starting empty");
            let entries = BTreeMap::new();
            write_atomic(&path, &entries).await?;
            entries
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl KeyValueStore for FileStore {
    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<Vec<u8>>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            Ok(state.get(key).map(|v| v.clone().into_bytes()))
        })
    }

    fn set<'a>(&'a self, key: &'a str, value: Vec<u8>) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let value = String::from_utf8(value)
                .map_err(|e| Error::Encoding(format!("value for {key} is not UTF-8: {e}")))?;
            let mut state = self.state.lock().await;
            state.insert(key.to_string(), value);
            write_atomic(&self.path, &state).await
        })
    }

    fn remove<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            if state.remove(key).is_some() {
                write_atomic(&self.path, &state).await?;
            }
            Ok(())
        })
    }

    fn keys(&self) -> StoreFuture<'_, Vec<String>> {
        Box::pin(async move { Ok(self.state.lock().await.keys().cloned().collect()) })
    }
}

/// Write the store map to disk atomically with 0600 permissions.
async fn write_atomic(path: &Path, data: &BTreeMap<String, String>) -> Result<()> {
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| Error::Encoding(format!("serializing store: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("store path has no parent directory".into()))?;

    let tmp_path = dir.join(format!(".quota-store.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp store file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting store file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp store file: {e}")))?;

    debug!(path = %path.display(), "persisted quota store");
    Ok(())
}
