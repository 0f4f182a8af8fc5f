//! Host filesystem backend for the `file` scheme.

use std::io;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::{DirEntry, File, FileInfo, FileSystem, FileType, OpenFlags, VfsError, VfsResult};
use crate::urlpath::{PathStyle, VfsUrl};

/// Passes operations through to the host filesystem via `tokio::fs`.
#[derive(Debug, Clone)]
pub struct LocalFs {
    style: PathStyle,
}

impl Default for LocalFs {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalFs {
    pub fn new() -> Self {
        Self {
            style: PathStyle::native(),
        }
    }

    fn native(&self, name: &str) -> PathBuf {
        PathBuf::from(self.style.to_native(&VfsUrl::new("", "", name)))
    }
}

fn map_io(err: io::Error, name: &str) -> VfsError {
    match err.kind() {
        io::ErrorKind::NotFound => VfsError::NotExist(name.to_string()),
        io::ErrorKind::AlreadyExists => VfsError::Exist(name.to_string()),
        _ => VfsError::Io(err),
    }
}

fn info_from_metadata(name: String, meta: &std::fs::Metadata, target: Option<String>) -> FileInfo {
    let file_type = if meta.file_type().is_symlink() {
        FileType::Symlink
    } else if meta.is_dir() {
        FileType::Dir
    } else {
        FileType::File
    };
    let modified = meta
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now());
    FileInfo {
        name,
        size: meta.len(),
        mode: permission_bits(meta),
        modified,
        file_type,
        symlink_target: target,
    }
}

#[cfg(unix)]
fn permission_bits(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o777
}

#[cfg(not(unix))]
fn permission_bits(meta: &std::fs::Metadata) -> u32 {
    match (meta.is_dir(), meta.permissions().readonly()) {
        (true, _) => 0o755,
        (false, true) => 0o444,
        (false, false) => 0o644,
    }
}

fn base_name(path: &std::path::Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "/".to_string())
}

#[async_trait]
impl FileSystem for LocalFs {
    async fn open_file(&self, name: &str, flags: OpenFlags, perm: u32) -> VfsResult<Box<dyn File>> {
        let path = self.native(name);
        let is_dir = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta.is_dir(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => return Err(map_io(e, name)),
        };
        if is_dir && flags.is_writable() {
            return Err(VfsError::IsDir(name.to_string()));
        }

        let mut options = tokio::fs::OpenOptions::new();
        options
            .read(flags.is_readable())
            .write(flags.is_writable())
            .append(flags.contains(OpenFlags::APPEND))
            .truncate(flags.contains(OpenFlags::TRUNCATE) && flags.is_writable());
        if flags.contains(OpenFlags::CREATE) {
            if flags.contains(OpenFlags::EXCLUSIVE) {
                options.create_new(true);
            } else {
                options.create(true);
            }
        }
        #[cfg(unix)]
        if flags.contains(OpenFlags::CREATE) {
            options.mode(if perm == 0 { 0o666 } else { perm });
        }
        #[cfg(not(unix))]
        let _ = perm;

        let file = if is_dir {
            None
        } else {
            Some(options.open(&path).await.map_err(|e| map_io(e, name))?)
        };

        Ok(Box::new(LocalFile {
            name: name.to_string(),
            path,
            file,
            flags,
            closed: false,
        }))
    }

    async fn mkdir(&self, name: &str, perm: u32) -> VfsResult<()> {
        let mut builder = tokio::fs::DirBuilder::new();
        #[cfg(unix)]
        builder.mode(perm);
        #[cfg(not(unix))]
        let _ = perm;
        builder
            .create(self.native(name))
            .await
            .map_err(|e| map_io(e, name))
    }

    async fn mkdir_all(&self, name: &str, perm: u32) -> VfsResult<()> {
        let path = self.native(name);
        let mut builder = tokio::fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        builder.mode(perm);
        #[cfg(not(unix))]
        let _ = perm;
        match builder.create(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                Err(VfsError::NotDir(name.to_string()))
            }
            Err(e) => match tokio::fs::metadata(&path).await {
                Ok(meta) if !meta.is_dir() => Err(VfsError::NotDir(name.to_string())),
                _ => Err(map_io(e, name)),
            },
        }
    }

    async fn remove(&self, name: &str) -> VfsResult<()> {
        let path = self.native(name);
        let meta = tokio::fs::symlink_metadata(&path)
            .await
            .map_err(|e| map_io(e, name))?;
        if meta.is_dir() {
            let mut entries = tokio::fs::read_dir(&path)
                .await
                .map_err(|e| map_io(e, name))?;
            if entries.next_entry().await?.is_some() {
                return Err(VfsError::DirNotEmpty(name.to_string()));
            }
            tokio::fs::remove_dir(&path)
                .await
                .map_err(|e| map_io(e, name))
        } else {
            tokio::fs::remove_file(&path)
                .await
                .map_err(|e| map_io(e, name))
        }
    }

    async fn remove_all(&self, name: &str) -> VfsResult<()> {
        let path = self.native(name);
        let meta = match tokio::fs::symlink_metadata(&path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(map_io(e, name)),
        };
        let result = if meta.is_dir() {
            tokio::fs::remove_dir_all(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        };
        result.map_err(|e| map_io(e, name))
    }

    async fn rename(&self, old: &str, new: &str) -> VfsResult<()> {
        let from = self.native(old);
        let to = self.native(new);
        tokio::fs::symlink_metadata(&from)
            .await
            .map_err(|e| map_io(e, old))?;
        if tokio::fs::symlink_metadata(&to).await.is_ok() {
            return Err(VfsError::Exist(new.to_string()));
        }
        tokio::fs::rename(&from, &to)
            .await
            .map_err(|e| map_io(e, old))
    }

    async fn stat(&self, name: &str) -> VfsResult<FileInfo> {
        let path = self.native(name);
        let meta = tokio::fs::symlink_metadata(&path)
            .await
            .map_err(|e| map_io(e, name))?;
        let target = if meta.file_type().is_symlink() {
            tokio::fs::read_link(&path)
                .await
                .ok()
                .map(|t| t.to_string_lossy().into_owned())
        } else {
            None
        };
        Ok(info_from_metadata(base_name(&path), &meta, target))
    }

    #[cfg(unix)]
    async fn symlink(&self, old: &str, new: &str) -> VfsResult<()> {
        tokio::fs::symlink(old, self.native(new))
            .await
            .map_err(|e| map_io(e, new))
    }

    #[cfg(not(unix))]
    async fn symlink(&self, _old: &str, _new: &str) -> VfsResult<()> {
        Err(VfsError::Unsupported("symlink"))
    }

    async fn read_dir(&self, name: &str) -> VfsResult<Vec<DirEntry>> {
        let path = self.native(name);
        let mut reader = tokio::fs::read_dir(&path).await.map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => VfsError::NotExist(name.to_string()),
            _ if path.is_file() => VfsError::NotDir(name.to_string()),
            _ => VfsError::Io(e),
        })?;
        let mut entries = Vec::new();
        while let Some(entry) = reader.next_entry().await? {
            let meta = entry.metadata().await?;
            let entry_name = entry.file_name().to_string_lossy().into_owned();
            entries.push(info_from_metadata(entry_name, &meta, None));
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }
}

/// Handle on a host file. Directories are opened without an OS handle.
#[derive(Debug)]
pub struct LocalFile {
    name: String,
    path: PathBuf,
    file: Option<tokio::fs::File>,
    flags: OpenFlags,
    closed: bool,
}

impl LocalFile {
    fn handle(&mut self) -> VfsResult<&mut tokio::fs::File> {
        if self.closed {
            return Err(VfsError::Closed);
        }
        self.file
            .as_mut()
            .ok_or_else(|| VfsError::IsDir(self.name.clone()))
    }
}

#[async_trait]
impl File for LocalFile {
    fn name(&self) -> &str {
        &self.name
    }

    async fn read(&mut self, buf: &mut [u8]) -> VfsResult<usize> {
        if !self.flags.is_readable() {
            return Err(VfsError::BadDescriptor);
        }
        Ok(self.handle()?.read(buf).await?)
    }

    async fn write(&mut self, buf: &[u8]) -> VfsResult<usize> {
        if !self.flags.is_writable() {
            return Err(VfsError::BadDescriptor);
        }
        Ok(self.handle()?.write(buf).await?)
    }

    async fn stat(&self) -> VfsResult<FileInfo> {
        if self.closed {
            return Err(VfsError::Closed);
        }
        let meta = match &self.file {
            Some(file) => file.metadata().await?,
            None => tokio::fs::metadata(&self.path).await?,
        };
        Ok(info_from_metadata(base_name(&self.path), &meta, None))
    }

    async fn close(&mut self) -> VfsResult<()> {
        if self.closed {
            return Err(VfsError::Closed);
        }
        if let Some(file) = self.file.as_mut() {
            if self.flags.is_writable() {
                file.flush().await?;
            }
        }
        self.file = None;
        self.closed = true;
        Ok(())
    }
}
