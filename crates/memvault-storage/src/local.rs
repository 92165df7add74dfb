//! Filesystem-backed storage for the local fallback path.
//!
//! [`LocalBackend`] maps `/`-separated keys onto files below a root
//! directory. Directory creation is create-if-absent, so concurrent
//! writers never race on it; uniqueness of file names is the caller's job.

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::fs;
use tracing::{debug, instrument};

use memvault_core::error::MemvaultError;
use memvault_core::storage::{ObjectInfo, StorageBackend};
use memvault_core::Result;

/// Fallback files on local disk.
///
/// `put` creates missing parent directories; `delete` of an absent file is
/// a no-op, which lets concurrent rotations overlap.
#[derive(Debug, Clone)]
pub struct LocalBackend {
    root: PathBuf,
}

fn io_failure(action: &str, path: &Path, err: std::io::Error) -> MemvaultError {
    MemvaultError::storage(format!("{action} {}", path.display()), err)
}

impl LocalBackend {
    /// Open (and create if needed) the fallback root.
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .await
            .map_err(|e| io_failure("Cannot create log root", &root, e))?;
        debug!(root = %root.display(), "Local fallback root ready");
        Ok(Self { root })
    }

    /// Filesystem path of `key`.
    ///
    /// Keys are relative and stay below the root: absolute keys and keys
    /// with `..` or drive-prefix components are rejected.
    pub fn path_for(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let escapes = relative.components().any(|c| {
            matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_))
        });
        if escapes || key.contains('\\') {
            return Err(MemvaultError::storage_msg(format!(
                "Key {key:?} does not stay inside the log root"
            )));
        }
        Ok(self.root.join(relative))
    }

    pub fn base_dir(&self) -> &Path {
        &self.root
    }

    /// Turn a file below the root back into its `/`-separated key.
    fn key_of(&self, path: &Path) -> Result<String> {
        let relative = path.strip_prefix(&self.root).map_err(|e| MemvaultError::Internal {
            message: format!("{} escapes the log root: {e}", path.display()),
        })?;
        let parts: Vec<String> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        Ok(parts.join("/"))
    }

    /// Walk `dir` depth-first, collecting files whose key starts with `prefix`.
    async fn collect(&self, dir: PathBuf, prefix: &str, out: &mut Vec<ObjectInfo>) -> Result<()> {
        let mut pending = vec![dir];
        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(io_failure("Cannot list", &dir, e)),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| io_failure("Cannot list", &dir, e))?
            {
                let path = entry.path();
                let meta = match entry.metadata().await {
                    Ok(meta) => meta,
                    // Removed by a concurrent rotation between read_dir and stat.
                    Err(e) if e.kind() == ErrorKind::NotFound => continue,
                    Err(e) => return Err(io_failure("Cannot stat", &path, e)),
                };
                if meta.is_dir() {
                    pending.push(path);
                    continue;
                }
                let key = self.key_of(&path)?;
                if !key.starts_with(prefix) {
                    continue;
                }
                out.push(ObjectInfo {
                    key,
                    size: meta.len(),
                    last_modified: meta
                        .modified()
                        .map(DateTime::<Utc>::from)
                        .unwrap_or_else(|_| Utc::now()),
                });
            }
        }
        Ok(())
    }
}

/// The deepest directory that can contain keys with `prefix`.
///
/// `by-user/bob/` starts the walk at `root/by-user/bob`, `all/bob-` at
/// `root/all`.
fn start_dir(root: &Path, prefix: &str) -> PathBuf {
    match prefix.rfind('/') {
        Some(idx) => root.join(&prefix[..idx]),
        None => root.to_path_buf(),
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    #[instrument(skip(self, data), fields(key = %key, size = data.len()))]
    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        let path = self.path_for(key)?;
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .await
                .map_err(|e| io_failure("Cannot create directory", dir, e))?;
        }
        fs::write(&path, &data)
            .await
            .map_err(|e| io_failure("Cannot write", &path, e))
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn get(&self, key: &str) -> Result<Bytes> {
        let path = self.path_for(key)?;
        match fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(MemvaultError::NotFound {
                key: key.to_string(),
            }),
            Err(e) => Err(io_failure("Cannot read", &path, e)),
        }
    }

    #[instrument(skip(self), fields(prefix = %prefix))]
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        let mut found = Vec::new();
        self.collect(start_dir(&self.root, prefix), prefix, &mut found)
            .await?;
        found.sort_by(|a, b| a.key.cmp(&b.key));
        debug!(count = found.len(), "Listed local files");
        Ok(found)
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_failure("Cannot delete", &path, e)),
        }
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn exists(&self, key: &str) -> Result<bool> {
        let path = self.path_for(key)?;
        fs::try_exists(&path)
            .await
            .map_err(|e| io_failure("Cannot stat", &path, e))
    }
}
