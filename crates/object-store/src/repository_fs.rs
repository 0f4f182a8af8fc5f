use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::bus::Bus;
use common::vfs::{DirEntry, File, FileInfo, FileSystem, OpenFlags, VfsError, VfsResult};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::store_to_vfs;
use crate::remote_fs::RemoteFs;

const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_secs(30);

/// Filesystem over every repository on the bus. Paths take the form
/// `//repository/key`; each repository is opened and synced on first use.
#[derive(Debug)]
pub struct RepositoryFs {
    bus: Arc<dyn Bus>,
    sync_timeout: Duration,
    mounts: Mutex<HashMap<String, RemoteFs>>,
    cancel: CancellationToken,
}

impl RepositoryFs {
    pub fn new(bus: Arc<dyn Bus>) -> Self {
        Self {
            bus,
            sync_timeout: DEFAULT_SYNC_TIMEOUT,
            mounts: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_sync_timeout(mut self, timeout: Duration) -> Self {
        self.sync_timeout = timeout;
        self
    }

    /// Abort pending syncs; later opens of new repositories fail.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    async fn mount(&self, repository: &str) -> VfsResult<RemoteFs> {
        let mut mounts = self.mounts.lock().await;
        if let Some(fs) = mounts.get(repository) {
            return Ok(fs.clone());
        }

        let store = self
            .bus
            .object_store(repository)
            .await
            .map_err(store_to_vfs)?;
        let fs = RemoteFs::new(store).await?;
        match tokio::time::timeout(self.sync_timeout, fs.wait(&self.cancel)).await {
            Ok(result) => result?,
            Err(_) => {
                tracing::warn!(repository, timeout = ?self.sync_timeout, "repository sync timed out");
                return Err(VfsError::NotSynced);
            }
        }
        tracing::debug!(repository, "mounted repository");
        mounts.insert(repository.to_string(), fs.clone());
        Ok(fs)
    }

    async fn resolve(&self, name: &str) -> VfsResult<(RemoteFs, String)> {
        let (repository, key) = split_repository(name)?;
        Ok((self.mount(repository).await?, key.to_string()))
    }

    async fn resolve_pair(&self, old: &str, new: &str) -> VfsResult<(RemoteFs, String, String)> {
        let (old_repo, old_key) = split_repository(old)?;
        let (new_repo, new_key) = split_repository(new)?;
        if old_repo != new_repo {
            return Err(VfsError::CrossingFsBoundaries);
        }
        Ok((self.mount(old_repo).await?, old_key.to_string(), new_key.to_string()))
    }
}

/// Split `//repository/key` into its parts; the key defaults to `/`.
fn split_repository(name: &str) -> VfsResult<(&str, &str)> {
    let rest = name
        .strip_prefix("//")
        .ok_or_else(|| VfsError::Invalid(format!("path does not name a repository: {name}")))?;
    let (repository, key) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, "/"),
    };
    if repository.is_empty() {
        return Err(VfsError::Invalid(format!(
            "path does not name a repository: {name}"
        )));
    }
    Ok((repository, key))
}

#[async_trait]
impl FileSystem for RepositoryFs {
    async fn open_file(&self, name: &str, flags: OpenFlags, perm: u32) -> VfsResult<Box<dyn File>> {
        let (fs, key) = self.resolve(name).await?;
        fs.open_file(&key, flags, perm).await
    }

    async fn mkdir(&self, name: &str, perm: u32) -> VfsResult<()> {
        let (fs, key) = self.resolve(name).await?;
        fs.mkdir(&key, perm).await
    }

    async fn mkdir_all(&self, name: &str, perm: u32) -> VfsResult<()> {
        let (fs, key) = self.resolve(name).await?;
        fs.mkdir_all(&key, perm).await
    }

    async fn remove(&self, name: &str) -> VfsResult<()> {
        let (fs, key) = self.resolve(name).await?;
        fs.remove(&key).await
    }

    async fn remove_all(&self, name: &str) -> VfsResult<()> {
        let (fs, key) = self.resolve(name).await?;
        fs.remove_all(&key).await
    }

    async fn rename(&self, old: &str, new: &str) -> VfsResult<()> {
        let (fs, old_key, new_key) = self.resolve_pair(old, new).await?;
        fs.rename(&old_key, &new_key).await
    }

    async fn stat(&self, name: &str) -> VfsResult<FileInfo> {
        let (fs, key) = self.resolve(name).await?;
        fs.stat(&key).await
    }

    async fn symlink(&self, old: &str, new: &str) -> VfsResult<()> {
        let (fs, key) = self.resolve(new).await?;
        // link targets inside the same repository are stored by key
        let target = match split_repository(old) {
            Ok((repository, target_key)) if repository == fs.bucket() => target_key,
            Ok(_) => return Err(VfsError::CrossingFsBoundaries),
            Err(_) => old,
        };
        fs.symlink(target, &key).await
    }

    async fn read_dir(&self, name: &str) -> VfsResult<Vec<DirEntry>> {
        let (fs, key) = self.resolve(name).await?;
        fs.read_dir(&key).await
    }
}
