//! Virtual filesystem contract shared by every backend.
//!
//! Backends implement [`FileSystem`] and hand out [`File`] handles. Paths
//! given to a backend are slash-separated and absolute; the [`MuxFs`]
//! multiplexer turns user-facing URLs (`file://`, `mem://`, `nats://`) into
//! backend paths before dispatching.
//!
//! Handles enforce their open mode on every call: reading a handle opened
//! write-only, or writing one opened read-only, fails with
//! [`VfsError::BadDescriptor`]. Offsets only move forward.

mod local;
mod memory;
mod mux;

use std::fmt::Debug;

use async_trait::async_trait;
use bitflags::bitflags;
use chrono::{DateTime, Utc};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub use local::{LocalFile, LocalFs};
pub use memory::{MemFile, MemFs};
pub use mux::MuxFs;

/// Default permission bits for new regular files.
pub const DEFAULT_FILE_MODE: u32 = 0o644;
/// Default permission bits for new directories.
pub const DEFAULT_DIR_MODE: u32 = 0o755;

const COPY_BUFFER_SIZE: usize = 8 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum VfsError {
    #[error("file does not exist: {0}")]
    NotExist(String),
    #[error("file already exists: {0}")]
    Exist(String),
    #[error("is a directory: {0}")]
    IsDir(String),
    #[error("not a directory: {0}")]
    NotDir(String),
    #[error("directory not empty: {0}")]
    DirNotEmpty(String),
    #[error("bad file descriptor")]
    BadDescriptor,
    #[error("filesystem not synced")]
    NotSynced,
    #[error("no filesystem registered for scheme {0:?}")]
    FsNotFound(String),
    #[error("crossing filesystem boundaries")]
    CrossingFsBoundaries,
    #[error("invalid argument: {0}")]
    Invalid(String),
    #[error("operation not supported: {0}")]
    Unsupported(&'static str),
    #[error("file already closed")]
    Closed,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Backend(Box<dyn std::error::Error + Send + Sync>),
}

impl VfsError {
    pub fn backend(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        VfsError::Backend(Box::new(err))
    }

    pub fn is_not_exist(&self) -> bool {
        matches!(self, VfsError::NotExist(_))
    }
}

pub type VfsResult<T> = Result<T, VfsError>;

bitflags! {
    /// Open mode and creation flags. The access mode is read-only when
    /// neither `WRITE_ONLY` nor `READ_WRITE` is set.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpenFlags: u32 {
        const WRITE_ONLY = 0x0001;
        const READ_WRITE = 0x0002;
        const CREATE = 0x0040;
        const EXCLUSIVE = 0x0080;
        const TRUNCATE = 0x0200;
        const APPEND = 0x0400;
    }
}

impl OpenFlags {
    pub const READ_ONLY: Self = Self::empty();

    pub fn is_readable(self) -> bool {
        !self.contains(Self::WRITE_ONLY) || self.contains(Self::READ_WRITE)
    }

    pub fn is_writable(self) -> bool {
        self.intersects(Self::WRITE_ONLY | Self::READ_WRITE)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    File,
    Dir,
    Symlink,
}

/// Metadata for a file, directory or link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub name: String,
    pub size: u64,
    pub mode: u32,
    pub modified: DateTime<Utc>,
    pub file_type: FileType,
    pub symlink_target: Option<String>,
}

impl FileInfo {
    pub fn is_dir(&self) -> bool {
        self.file_type == FileType::Dir
    }

    pub fn is_file(&self) -> bool {
        self.file_type == FileType::File
    }

    pub fn is_symlink(&self) -> bool {
        self.file_type == FileType::Symlink
    }
}

/// Directory listings reuse the metadata record.
pub type DirEntry = FileInfo;

/// Returned by a [`FileSystem::walk_dir`] visitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkControl {
    Continue,
    /// Do not descend into the directory just visited.
    SkipDir,
    /// Abort the walk without error.
    Stop,
}

pub type WalkFn<'a> = dyn FnMut(&str, &DirEntry) -> VfsResult<WalkControl> + Send + 'a;

#[async_trait]
pub trait File: Send + Sync + Debug {
    fn name(&self) -> &str;

    /// Read into `buf`; `Ok(0)` signals end of file.
    async fn read(&mut self, buf: &mut [u8]) -> VfsResult<usize>;

    async fn write(&mut self, buf: &[u8]) -> VfsResult<usize>;

    async fn stat(&self) -> VfsResult<FileInfo>;

    async fn close(&mut self) -> VfsResult<()>;

    async fn read_to_end(&mut self) -> VfsResult<Vec<u8>> {
        let mut out = Vec::new();
        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        loop {
            let n = self.read(&mut buf).await?;
            if n == 0 {
                return Ok(out);
            }
            out.extend_from_slice(&buf[..n]);
        }
    }

    async fn write_all(&mut self, mut buf: &[u8]) -> VfsResult<()> {
        while !buf.is_empty() {
            let n = self.write(buf).await?;
            if n == 0 {
                return Err(VfsError::Io(std::io::ErrorKind::WriteZero.into()));
            }
            buf = &buf[n..];
        }
        Ok(())
    }

    /// Copy everything from `reader` into the file.
    async fn read_from(&mut self, reader: &mut (dyn AsyncRead + Unpin + Send)) -> VfsResult<u64> {
        let mut total = 0u64;
        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                return Ok(total);
            }
            self.write_all(&buf[..n]).await?;
            total += n as u64;
        }
    }

    /// Copy the remaining file contents into `writer`.
    async fn write_to(&mut self, writer: &mut (dyn AsyncWrite + Unpin + Send)) -> VfsResult<u64> {
        let mut total = 0u64;
        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        loop {
            let n = self.read(&mut buf).await?;
            if n == 0 {
                writer.flush().await?;
                return Ok(total);
            }
            writer.write_all(&buf[..n]).await?;
            total += n as u64;
        }
    }
}

#[async_trait]
pub trait FileSystem: Send + Sync + Debug {
    async fn open_file(&self, name: &str, flags: OpenFlags, perm: u32) -> VfsResult<Box<dyn File>>;

    async fn mkdir(&self, name: &str, perm: u32) -> VfsResult<()>;

    async fn mkdir_all(&self, name: &str, perm: u32) -> VfsResult<()>;

    async fn remove(&self, name: &str) -> VfsResult<()>;

    async fn remove_all(&self, name: &str) -> VfsResult<()>;

    async fn rename(&self, old: &str, new: &str) -> VfsResult<()>;

    async fn stat(&self, name: &str) -> VfsResult<FileInfo>;

    /// Create `new` as a link whose target is the literal `old`.
    async fn symlink(&self, old: &str, new: &str) -> VfsResult<()>;

    /// Entries sorted by name.
    async fn read_dir(&self, name: &str) -> VfsResult<Vec<DirEntry>>;

    async fn open(&self, name: &str) -> VfsResult<Box<dyn File>> {
        self.open_file(name, OpenFlags::READ_ONLY, 0).await
    }

    async fn create(&self, name: &str) -> VfsResult<Box<dyn File>> {
        self.open_file(
            name,
            OpenFlags::READ_WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE,
            DEFAULT_FILE_MODE,
        )
        .await
    }

    async fn read_file(&self, name: &str) -> VfsResult<Vec<u8>> {
        let mut file = self.open(name).await?;
        let data = file.read_to_end().await;
        file.close().await?;
        data
    }

    async fn write_file(&self, name: &str, data: &[u8], perm: u32) -> VfsResult<()> {
        let flags = OpenFlags::WRITE_ONLY | OpenFlags::CREATE | OpenFlags::TRUNCATE;
        let mut file = self.open_file(name, flags, perm).await?;
        file.write_all(data).await?;
        file.close().await
    }

    /// Visit `root`, then every descendant depth-first in lexicographic order.
    async fn walk_dir(&self, root: &str, visit: &mut WalkFn<'_>) -> VfsResult<()> {
        let info = self.stat(root).await?;
        let mut stack = vec![(root.to_string(), info)];
        while let Some((path, info)) = stack.pop() {
            match visit(&path, &info)? {
                WalkControl::Stop => return Ok(()),
                WalkControl::SkipDir => continue,
                WalkControl::Continue => {}
            }
            if info.is_dir() {
                let mut entries = self.read_dir(&path).await?;
                entries.sort_by(|a, b| a.name.cmp(&b.name));
                for entry in entries.into_iter().rev() {
                    stack.push((join_child(&path, &entry.name), entry));
                }
            }
        }
        Ok(())
    }
}

/// Append a child name to a directory path or URL.
pub fn join_child(dir: &str, name: &str) -> String {
    if dir.ends_with('/') {
        format!("{dir}{name}")
    } else {
        format!("{dir}/{name}")
    }
}
