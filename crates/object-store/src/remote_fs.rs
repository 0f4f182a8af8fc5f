//! Filesystem over one object store bucket.
//!
//! Object contents live only in the store. Locally we keep a [`MemFs`]
//! mirroring which paths exist (files are empty placeholders), fed by the
//! bucket's change feed: history first, then the caught-up marker, then
//! live updates. Until the marker arrives every operation fails with
//! [`VfsError::NotSynced`].
//!
//! Objects are keyed by cleaned absolute path and tagged with a file-type
//! metadata entry. Any operation that creates a directory also stores a
//! zero-length directory marker so other replicas converge on the same tree.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use common::bus::{Object, ObjectInfo, ObjectKind, ObjectMeta, ObjectStore, StoreError, WatchEvent, Watcher};
use common::urlpath::{clean_abs, file_name_of, parent_of};
use common::vfs::{
    DirEntry, File, FileInfo, FileSystem, FileType, MemFs, OpenFlags, VfsError, VfsResult,
    DEFAULT_DIR_MODE, DEFAULT_FILE_MODE,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::store_to_vfs;

#[derive(Debug)]
struct Inner {
    store: Arc<dyn ObjectStore>,
    cache: MemFs,
    synced: watch::Receiver<bool>,
    cancel: CancellationToken,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Object-store backed filesystem. Clones share the cache and the watcher.
#[derive(Debug, Clone)]
pub struct RemoteFs {
    inner: Arc<Inner>,
}

impl RemoteFs {
    /// Start watching `store`. The returned filesystem is not synced yet;
    /// see [`RemoteFs::wait`].
    pub async fn new(store: Arc<dyn ObjectStore>) -> VfsResult<Self> {
        let watcher = store.watch().await.map_err(store_to_vfs)?;
        let cache = MemFs::new();
        let (synced_tx, synced) = watch::channel(false);
        let cancel = CancellationToken::new();

        tokio::spawn(replay(
            store.bucket().to_string(),
            watcher,
            cache.clone(),
            synced_tx,
            cancel.clone(),
        ));

        Ok(Self {
            inner: Arc::new(Inner {
                store,
                cache,
                synced,
                cancel,
            }),
        })
    }

    pub fn bucket(&self) -> &str {
        self.inner.store.bucket()
    }

    pub fn is_synced(&self) -> bool {
        *self.inner.synced.borrow()
    }

    /// Block until the cache has caught up with the bucket's history.
    pub async fn wait(&self, cancel: &CancellationToken) -> VfsResult<()> {
        let mut synced = self.inner.synced.clone();
        tokio::select! {
            _ = cancel.cancelled() => Err(VfsError::NotSynced),
            result = synced.wait_for(|s| *s) => result.map(|_| ()).map_err(|_| VfsError::NotSynced),
        }
    }

    fn ensure_synced(&self) -> VfsResult<()> {
        if self.is_synced() {
            Ok(())
        } else {
            Err(VfsError::NotSynced)
        }
    }

    fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.inner.store
    }

    fn cache(&self) -> &MemFs {
        &self.inner.cache
    }

    /// Ancestors of `path` (outermost first) that the cache lacks.
    async fn missing_dirs(&self, path: &str) -> Vec<String> {
        let mut missing = Vec::new();
        let mut current = path.to_string();
        while current != "/" {
            if self.cache().stat(&current).await.is_ok() {
                break;
            }
            missing.push(current.clone());
            current = parent_of(&current).to_string();
        }
        missing.reverse();
        missing
    }

    async fn put_dir_markers(&self, dirs: &[String]) -> VfsResult<()> {
        for dir in dirs {
            let meta = ObjectMeta::new(dir.clone()).with_kind(ObjectKind::Dir);
            self.store().put(meta, Bytes::new()).await.map_err(store_to_vfs)?;
        }
        Ok(())
    }

    async fn put_file(&self, path: &str, data: Bytes) -> VfsResult<ObjectInfo> {
        let meta = ObjectMeta::new(path).with_kind(ObjectKind::File);
        self.store().put(meta, data).await.map_err(store_to_vfs)
    }

    /// Undo cache entries created for a store write that failed.
    async fn revert(&self, created: &[String]) {
        for path in created.iter().rev() {
            if let Err(e) = self.cache().remove_all(path).await {
                tracing::debug!(path, error = %e, "cache revert failed");
            }
        }
    }

    /// Move already renamed objects back and restore the cache after a
    /// rename failed partway. The watcher replays every store change, so
    /// the cache converges on the store even if a step here fails.
    async fn undo_rename(
        &self,
        moved: Vec<(String, ObjectMeta)>,
        old_path: &str,
        new_path: &str,
    ) {
        for (key, mut meta) in moved.into_iter().rev() {
            let renamed = std::mem::replace(&mut meta.name, key.clone());
            if let Err(e) = self.store().update_meta(&renamed, meta).await {
                tracing::warn!(
                    bucket = %self.bucket(),
                    path = %renamed,
                    error = %e,
                    "failed to move object back after rename"
                );
            }
        }
        if let Err(e) = self.cache().rename(new_path, old_path).await {
            tracing::warn!(
                bucket = %self.bucket(),
                path = %new_path,
                error = %e,
                "failed to revert cached rename"
            );
        }
    }

    /// Keys of every object at or below `path`.
    async fn keys_under(&self, path: &str) -> VfsResult<Vec<String>> {
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{path}/")
        };
        let objects = self.store().list().await.map_err(store_to_vfs)?;
        Ok(objects
            .into_iter()
            .map(|o| o.name)
            .filter(|name| name == path || name.starts_with(&prefix))
            .collect())
    }

    async fn create_placeholder(&self, path: &str, perm: u32) -> VfsResult<Vec<String>> {
        let mut created = self.missing_dirs(parent_of(path)).await;
        self.cache()
            .mkdir_all(parent_of(path), DEFAULT_DIR_MODE)
            .await?;
        let flags = OpenFlags::WRITE_ONLY | OpenFlags::CREATE | OpenFlags::EXCLUSIVE;
        let mut placeholder = self.cache().open_file(path, flags, perm).await?;
        placeholder.close().await?;
        created.push(path.to_string());
        Ok(created)
    }
}

fn info_from_object(info: &ObjectInfo) -> FileInfo {
    let (file_type, mode) = match info.kind() {
        ObjectKind::Dir => (FileType::Dir, DEFAULT_DIR_MODE),
        ObjectKind::Link => (FileType::Symlink, DEFAULT_FILE_MODE),
        ObjectKind::File => (FileType::File, DEFAULT_FILE_MODE),
    };
    FileInfo {
        name: file_name_of(&info.name).to_string(),
        size: info.size,
        mode,
        modified: info.modified,
        file_type,
        symlink_target: info.link_target().map(str::to_string),
    }
}

/// Apply the change feed to the cache until it ends or `cancel` fires.
async fn replay(
    bucket: String,
    mut watcher: Watcher,
    cache: MemFs,
    synced: watch::Sender<bool>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = watcher.next() => event,
        };
        match event {
            Some(Ok(WatchEvent::CaughtUp)) => {
                tracing::debug!(bucket = %bucket, "remote filesystem synced");
                let _ = synced.send(true);
            }
            Some(Ok(WatchEvent::Update(info))) => {
                if let Err(e) = apply_update(&cache, &info).await {
                    tracing::debug!(bucket = %bucket, object = %info.name, error = %e, "skipping update");
                }
            }
            Some(Err(e)) => {
                tracing::warn!(bucket = %bucket, error = %e, "object store watcher error");
            }
            None => {
                tracing::debug!(bucket = %bucket, "object store watcher closed");
                break;
            }
        }
    }
}

async fn apply_update(cache: &MemFs, info: &ObjectInfo) -> VfsResult<()> {
    let path = clean_abs(&info.name);
    if info.deleted {
        return cache.remove_all(&path).await;
    }
    match info.kind() {
        ObjectKind::Dir => cache.mkdir_all(&path, DEFAULT_DIR_MODE).await,
        ObjectKind::Link => {
            let target = info.link_target().unwrap_or_default();
            cache.mkdir_all(parent_of(&path), DEFAULT_DIR_MODE).await?;
            match cache.symlink(target, &path).await {
                Err(VfsError::Exist(_)) => Ok(()),
                other => other,
            }
        }
        ObjectKind::File => {
            if cache.stat(&path).await.is_ok() {
                return Ok(());
            }
            cache.mkdir_all(parent_of(&path), DEFAULT_DIR_MODE).await?;
            let mut placeholder = cache
                .open_file(&path, OpenFlags::WRITE_ONLY | OpenFlags::CREATE, DEFAULT_FILE_MODE)
                .await?;
            placeholder.close().await
        }
    }
}

#[async_trait]
impl FileSystem for RemoteFs {
    async fn open_file(&self, name: &str, flags: OpenFlags, perm: u32) -> VfsResult<Box<dyn File>> {
        self.ensure_synced()?;
        let path = clean_abs(name);

        let existing = match self.cache().stat(&path).await {
            Ok(info) => Some(info),
            Err(VfsError::NotExist(_)) => None,
            Err(e) => return Err(e),
        };

        let info = match existing {
            Some(info) => {
                if info.is_dir() && flags.is_writable() {
                    return Err(VfsError::IsDir(path));
                }
                if flags.contains(OpenFlags::CREATE) && flags.contains(OpenFlags::EXCLUSIVE) {
                    return Err(VfsError::Exist(path));
                }
                if info.is_file() && flags.is_writable() && flags.contains(OpenFlags::TRUNCATE) {
                    self.put_file(&path, Bytes::new()).await?;
                }
                info
            }
            None if flags.contains(OpenFlags::CREATE) => {
                let created = self.create_placeholder(&path, perm).await?;
                let new_dirs = &created[..created.len() - 1];
                let stored = async {
                    self.put_file(&path, Bytes::new()).await?;
                    self.put_dir_markers(new_dirs).await
                }
                .await;
                if let Err(e) = stored {
                    self.revert(&created).await;
                    return Err(e);
                }
                self.cache().stat(&path).await?
            }
            None => return Err(VfsError::NotExist(path)),
        };

        let object = if flags.is_readable() && info.is_file() {
            Some(self.store().get(&path).await.map_err(store_to_vfs)?)
        } else {
            None
        };

        let mut file = RemoteFile {
            path,
            fs: self.clone(),
            flags,
            info,
            object,
            offset: 0,
            buffer: Vec::new(),
            dirty: false,
            closed: false,
        };
        if flags.contains(OpenFlags::APPEND) && flags.is_writable() && file.info.is_file() {
            file.load_base(usize::MAX).await?;
        }
        Ok(Box::new(file))
    }

    async fn mkdir(&self, name: &str, perm: u32) -> VfsResult<()> {
        self.ensure_synced()?;
        let path = clean_abs(name);
        self.cache().mkdir(&path, perm).await?;
        if let Err(e) = self.put_dir_markers(std::slice::from_ref(&path)).await {
            self.revert(std::slice::from_ref(&path)).await;
            return Err(e);
        }
        Ok(())
    }

    async fn mkdir_all(&self, name: &str, perm: u32) -> VfsResult<()> {
        self.ensure_synced()?;
        let path = clean_abs(name);
        let missing = self.missing_dirs(&path).await;
        self.cache().mkdir_all(&path, perm).await?;
        if let Err(e) = self.put_dir_markers(&missing).await {
            self.revert(&missing).await;
            return Err(e);
        }
        Ok(())
    }

    async fn remove(&self, name: &str) -> VfsResult<()> {
        self.ensure_synced()?;
        let path = clean_abs(name);
        let info = self.cache().stat(&path).await?;
        if info.is_dir() && !self.cache().read_dir(&path).await?.is_empty() {
            return Err(VfsError::DirNotEmpty(path));
        }
        if path != "/" {
            match self.store().delete(&path).await {
                Ok(()) | Err(StoreError::ObjectNotFound(_)) => {}
                Err(e) => return Err(store_to_vfs(e)),
            }
        }
        self.cache().remove(&path).await
    }

    async fn remove_all(&self, name: &str) -> VfsResult<()> {
        self.ensure_synced()?;
        let path = clean_abs(name);
        for key in self.keys_under(&path).await? {
            match self.store().delete(&key).await {
                Ok(()) | Err(StoreError::ObjectNotFound(_)) => {}
                Err(e) => return Err(store_to_vfs(e)),
            }
        }
        self.cache().remove_all(&path).await
    }

    async fn rename(&self, old: &str, new: &str) -> VfsResult<()> {
        self.ensure_synced()?;
        let old_path = clean_abs(old);
        let new_path = clean_abs(new);
        let mut keys = self.keys_under(&old_path).await?;
        // children before parents, so peers never see a directory marker
        // vanish while its entries are still listed
        keys.sort_unstable_by(|a, b| b.cmp(a));
        self.cache().rename(&old_path, &new_path).await?;

        let mut moved = Vec::with_capacity(keys.len());
        for key in keys {
            let renamed = format!("{new_path}{}", &key[old_path.len()..]);
            let result = match self.store().info(&key).await {
                Ok(info) => {
                    let mut meta = info.meta();
                    meta.name = renamed.clone();
                    self.store().update_meta(&key, meta.clone()).await.map(|()| Some(meta))
                }
                Err(StoreError::ObjectNotFound(_)) => Ok(None),
                Err(e) => Err(e),
            };
            match result {
                Ok(Some(meta)) => moved.push((key, meta)),
                Ok(None) => {}
                Err(e) => {
                    self.undo_rename(moved, &old_path, &new_path).await;
                    return Err(store_to_vfs(e));
                }
            }
        }
        Ok(())
    }

    async fn stat(&self, name: &str) -> VfsResult<FileInfo> {
        self.ensure_synced()?;
        let path = clean_abs(name);
        let cached = self.cache().stat(&path).await?;
        if !cached.is_file() {
            return Ok(cached);
        }
        match self.store().info(&path).await {
            Ok(info) => Ok(info_from_object(&info)),
            Err(StoreError::ObjectNotFound(_)) => Ok(cached),
            Err(e) => Err(store_to_vfs(e)),
        }
    }

    async fn symlink(&self, old: &str, new: &str) -> VfsResult<()> {
        self.ensure_synced()?;
        let path = clean_abs(new);
        self.cache().symlink(old, &path).await?;
        let meta = ObjectMeta::new(path.clone()).with_link_target(old);
        if let Err(e) = self.store().put(meta, Bytes::new()).await {
            self.revert(std::slice::from_ref(&path)).await;
            return Err(store_to_vfs(e));
        }
        Ok(())
    }

    async fn read_dir(&self, name: &str) -> VfsResult<Vec<DirEntry>> {
        self.ensure_synced()?;
        self.cache().read_dir(&clean_abs(name)).await
    }
}

/// Handle on a [`RemoteFs`] path.
///
/// Readable handles hold the fetched object for their whole lifetime.
/// Writes are buffered and stored as one object on close.
#[derive(Debug)]
pub struct RemoteFile {
    path: String,
    fs: RemoteFs,
    flags: OpenFlags,
    info: FileInfo,
    object: Option<Object>,
    offset: usize,
    buffer: Vec<u8>,
    dirty: bool,
    closed: bool,
}

impl RemoteFile {
    fn check_open(&self) -> VfsResult<()> {
        if self.closed {
            return Err(VfsError::Closed);
        }
        Ok(())
    }

    /// Seed the write buffer with up to `limit` bytes of the stored object.
    async fn load_base(&mut self, limit: usize) -> VfsResult<()> {
        let object = match self.fs.store().get(&self.path).await {
            Ok(object) => object,
            Err(StoreError::ObjectNotFound(_)) => return Ok(()),
            Err(e) => return Err(store_to_vfs(e)),
        };
        let data = object.bytes().await.map_err(store_to_vfs)?;
        let keep = limit.min(data.len());
        self.buffer = data[..keep].to_vec();
        self.offset = keep;
        Ok(())
    }

    fn object_reader(&mut self) -> VfsResult<&mut (dyn AsyncRead + Send + Unpin)> {
        if !self.flags.is_readable() {
            return Err(VfsError::BadDescriptor);
        }
        if self.info.is_dir() {
            return Err(VfsError::IsDir(self.path.clone()));
        }
        match self.object.as_mut() {
            Some(object) => Ok(object.reader()),
            None => Err(VfsError::NotExist(self.path.clone())),
        }
    }
}

#[async_trait]
impl File for RemoteFile {
    fn name(&self) -> &str {
        &self.path
    }

    async fn read(&mut self, buf: &mut [u8]) -> VfsResult<usize> {
        self.check_open()?;
        let n = self.object_reader()?.read(buf).await?;
        self.offset += n;
        Ok(n)
    }

    async fn write(&mut self, buf: &[u8]) -> VfsResult<usize> {
        self.check_open()?;
        if !self.flags.is_writable() {
            return Err(VfsError::BadDescriptor);
        }
        if self.info.is_dir() {
            return Err(VfsError::IsDir(self.path.clone()));
        }
        if self.buffer.len() < self.offset {
            self.load_base(self.offset).await?;
        }
        self.buffer.truncate(self.offset);
        self.buffer.extend_from_slice(buf);
        self.offset = self.buffer.len();
        self.dirty = true;
        Ok(buf.len())
    }

    async fn stat(&self) -> VfsResult<FileInfo> {
        self.check_open()?;
        match &self.object {
            Some(object) => Ok(info_from_object(object.info())),
            None => {
                let mut info = self.info.clone();
                if self.dirty {
                    info.size = self.buffer.len() as u64;
                    info.modified = Utc::now();
                }
                Ok(info)
            }
        }
    }

    async fn close(&mut self) -> VfsResult<()> {
        self.check_open()?;
        self.closed = true;
        self.object = None;
        if self.dirty && !self.buffer.is_empty() {
            let data = Bytes::from(std::mem::take(&mut self.buffer));
            self.fs.put_file(&self.path, data).await?;
        }
        Ok(())
    }

    /// Stream `reader` straight into the store under this handle's path.
    async fn read_from(&mut self, reader: &mut (dyn AsyncRead + Unpin + Send)) -> VfsResult<u64> {
        self.check_open()?;
        if !self.flags.is_writable() {
            return Err(VfsError::BadDescriptor);
        }
        let meta = ObjectMeta::new(self.path.clone()).with_kind(ObjectKind::File);
        let info = self
            .fs
            .store()
            .put_stream(meta, reader)
            .await
            .map_err(store_to_vfs)?;
        self.buffer.clear();
        self.dirty = false;
        Ok(info.size)
    }

    async fn write_to(&mut self, writer: &mut (dyn AsyncWrite + Unpin + Send)) -> VfsResult<u64> {
        self.check_open()?;
        let reader = self.object_reader()?;
        let n = tokio::io::copy(reader, writer).await?;
        self.offset += n as usize;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use common::bus::MemoryObjectStore;

    use super::*;

    async fn synced_fs() -> (Arc<MemoryObjectStore>, RemoteFs) {
        let store = Arc::new(MemoryObjectStore::new("r1"));
        let fs = RemoteFs::new(store.clone()).await.unwrap();
        fs.wait(&CancellationToken::new()).await.unwrap();
        (store, fs)
    }

    #[tokio::test]
    async fn test_history_is_replayed_before_sync() {
        let store = Arc::new(MemoryObjectStore::new("r1"));
        store
            .put(
                ObjectMeta::new("/a/b.txt").with_kind(ObjectKind::File),
                Bytes::from_static(b"data"),
            )
            .await
            .unwrap();
        store
            .put(ObjectMeta::new("/empty").with_kind(ObjectKind::Dir), Bytes::new())
            .await
            .unwrap();

        let fs = RemoteFs::new(store.clone()).await.unwrap();
        fs.wait(&CancellationToken::new()).await.unwrap();

        assert!(fs.stat("/a").await.unwrap().is_dir());
        assert!(fs.stat("/empty").await.unwrap().is_dir());
        let info = fs.stat("/a/b.txt").await.unwrap();
        assert!(info.is_file());
        assert_eq!(info.size, 4);
        assert_eq!(fs.read_file("/a/b.txt").await.unwrap(), b"data");
    }

    #[tokio::test]
    async fn test_write_read_and_markers() {
        let (store, fs) = synced_fs().await;
        fs.write_file("/x/y/z.txt", b"hello", 0o644).await.unwrap();
        assert_eq!(fs.read_file("/x/y/z.txt").await.unwrap(), b"hello");

        let x = store.info("/x").await.unwrap();
        assert_eq!(x.kind(), ObjectKind::Dir);
        assert_eq!(store.info("/x/y").await.unwrap().kind(), ObjectKind::Dir);

        fs.mkdir_all("/x/y", 0o755).await.unwrap();
        fs.mkdir_all("/x/y", 0o755).await.unwrap();
        assert!(matches!(
            fs.mkdir("/x", 0o755).await.unwrap_err(),
            VfsError::Exist(_)
        ));
    }

    #[tokio::test]
    async fn test_descriptor_checks() {
        let (_store, fs) = synced_fs().await;
        fs.write_file("/f", b"abc", 0o644).await.unwrap();

        let mut ro = fs.open("/f").await.unwrap();
        assert!(matches!(ro.write(b"x").await.unwrap_err(), VfsError::BadDescriptor));
        let mut wo = fs
            .open_file("/f", OpenFlags::WRITE_ONLY, 0)
            .await
            .unwrap();
        let mut buf = [0u8; 4];
        assert!(matches!(wo.read(&mut buf).await.unwrap_err(), VfsError::BadDescriptor));

        fs.mkdir("/d", 0o755).await.unwrap();
        assert!(matches!(
            fs.open_file("/d", OpenFlags::READ_WRITE, 0).await.unwrap_err(),
            VfsError::IsDir(_)
        ));
    }

    #[tokio::test]
    async fn test_rename_and_remove_all() {
        let (store, fs) = synced_fs().await;
        fs.write_file("/src/a", b"1", 0o644).await.unwrap();
        fs.write_file("/src/sub/b", b"2", 0o644).await.unwrap();

        fs.rename("/src", "/dst").await.unwrap();
        assert_eq!(fs.read_file("/dst/sub/b").await.unwrap(), b"2");
        assert!(store.info("/src/a").await.is_err());
        assert!(fs.stat("/src").await.unwrap_err().is_not_exist());

        assert!(matches!(
            fs.remove("/dst").await.unwrap_err(),
            VfsError::DirNotEmpty(_)
        ));
        fs.remove_all("/dst").await.unwrap();
        assert!(store.list().await.unwrap().is_empty());
        assert!(fs.read_dir("/").await.unwrap().is_empty());
    }

    /// Fails the `fail_at`-th metadata update.
    #[derive(Debug)]
    struct FlakyRename {
        inner: MemoryObjectStore,
        fail_at: usize,
        calls: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl ObjectStore for FlakyRename {
        fn bucket(&self) -> &str {
            self.inner.bucket()
        }
        async fn put(&self, meta: ObjectMeta, data: Bytes) -> Result<ObjectInfo, StoreError> {
            self.inner.put(meta, data).await
        }
        async fn put_stream(
            &self,
            meta: ObjectMeta,
            reader: &mut (dyn AsyncRead + Send + Unpin),
        ) -> Result<ObjectInfo, StoreError> {
            self.inner.put_stream(meta, reader).await
        }
        async fn get(&self, name: &str) -> Result<Object, StoreError> {
            self.inner.get(name).await
        }
        async fn info(&self, name: &str) -> Result<ObjectInfo, StoreError> {
            self.inner.info(name).await
        }
        async fn delete(&self, name: &str) -> Result<(), StoreError> {
            self.inner.delete(name).await
        }
        async fn list(&self) -> Result<Vec<ObjectInfo>, StoreError> {
            self.inner.list().await
        }
        async fn status(&self) -> Result<common::bus::StoreStatus, StoreError> {
            self.inner.status().await
        }
        async fn update_meta(&self, name: &str, meta: ObjectMeta) -> Result<(), StoreError> {
            let call = self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
            if call == self.fail_at {
                return Err(StoreError::Other("update rejected".to_string()));
            }
            self.inner.update_meta(name, meta).await
        }
        async fn watch(&self) -> Result<Watcher, StoreError> {
            self.inner.watch().await
        }
    }

    #[tokio::test]
    async fn test_failed_rename_is_rolled_back() {
        let store = Arc::new(FlakyRename {
            inner: MemoryObjectStore::new("r1"),
            fail_at: 2,
            calls: Default::default(),
        });
        let fs = RemoteFs::new(store.clone()).await.unwrap();
        fs.wait(&CancellationToken::new()).await.unwrap();
        fs.write_file("/src/a", b"1", 0o644).await.unwrap();
        fs.write_file("/src/sub/b", b"2", 0o644).await.unwrap();

        // "/src/sub/b" moves, then "/src/sub" fails
        assert!(fs.rename("/src", "/dst").await.is_err());

        let mut names: Vec<String> = store
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|o| o.name)
            .collect();
        names.sort();
        assert_eq!(names, ["/src", "/src/a", "/src/sub", "/src/sub/b"]);

        // once a later write shows up, every earlier move has been replayed
        store
            .put(
                ObjectMeta::new("/marker").with_kind(ObjectKind::File),
                Bytes::new(),
            )
            .await
            .unwrap();
        for _ in 0..100 {
            if fs.stat("/marker").await.is_ok() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(fs.stat("/marker").await.is_ok());
        assert_eq!(fs.read_file("/src/sub/b").await.unwrap(), b"2");
        assert_eq!(fs.read_file("/src/a").await.unwrap(), b"1");
        assert!(fs.stat("/dst/sub/b").await.unwrap_err().is_not_exist());
        assert!(fs.stat("/dst/a").await.unwrap_err().is_not_exist());
    }

    #[tokio::test]
    async fn test_not_synced_before_history() {
        #[derive(Debug)]
        struct Silent(MemoryObjectStore);

        #[async_trait]
        impl ObjectStore for Silent {
            fn bucket(&self) -> &str {
                self.0.bucket()
            }
            async fn put(&self, meta: ObjectMeta, data: Bytes) -> Result<ObjectInfo, StoreError> {
                self.0.put(meta, data).await
            }
            async fn put_stream(
                &self,
                meta: ObjectMeta,
                reader: &mut (dyn AsyncRead + Send + Unpin),
            ) -> Result<ObjectInfo, StoreError> {
                self.0.put_stream(meta, reader).await
            }
            async fn get(&self, name: &str) -> Result<Object, StoreError> {
                self.0.get(name).await
            }
            async fn info(&self, name: &str) -> Result<ObjectInfo, StoreError> {
                self.0.info(name).await
            }
            async fn delete(&self, name: &str) -> Result<(), StoreError> {
                self.0.delete(name).await
            }
            async fn list(&self) -> Result<Vec<ObjectInfo>, StoreError> {
                self.0.list().await
            }
            async fn status(&self) -> Result<common::bus::StoreStatus, StoreError> {
                self.0.status().await
            }
            async fn update_meta(&self, name: &str, meta: ObjectMeta) -> Result<(), StoreError> {
                self.0.update_meta(name, meta).await
            }
            async fn watch(&self) -> Result<Watcher, StoreError> {
                // a feed that never catches up
                let (tx, rx) = flume::unbounded();
                std::mem::forget(tx);
                Ok(Watcher::new(rx))
            }
        }

        let fs = RemoteFs::new(Arc::new(Silent(MemoryObjectStore::new("r1"))))
            .await
            .unwrap();
        assert!(matches!(fs.stat("/").await.unwrap_err(), VfsError::NotSynced));
        assert!(matches!(
            fs.write_file("/a", b"x", 0o644).await.unwrap_err(),
            VfsError::NotSynced
        ));

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(fs.wait(&cancel).await.unwrap_err(), VfsError::NotSynced));
    }

    #[tokio::test]
    async fn test_read_from_streams_to_store() {
        let (store, fs) = synced_fs().await;
        let mut file = fs.create("/stream").await.unwrap();
        let mut source: &[u8] = b"streamed";
        assert_eq!(file.read_from(&mut source).await.unwrap(), 8);
        file.close().await.unwrap();
        let object = store.get("/stream").await.unwrap();
        assert_eq!(object.bytes().await.unwrap(), Bytes::from_static(b"streamed"));

        let mut reader = fs.open("/stream").await.unwrap();
        let mut out = Vec::new();
        assert_eq!(reader.write_to(&mut out).await.unwrap(), 8);
        assert_eq!(out, b"streamed");
    }
}
