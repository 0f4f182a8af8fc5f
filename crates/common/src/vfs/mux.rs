//! Scheme-dispatching filesystem.
//!
//! Names are resolved against the working directory, the scheme selects a
//! registered backend (an empty scheme means `file`) and the backend
//! receives the URL path, prefixed with `//host` when the URL has a host.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{DirEntry, File, FileInfo, FileSystem, OpenFlags, VfsError, VfsResult};
use crate::urlpath::{PathStyle, VfsUrl};

#[derive(Debug)]
pub struct MuxFs {
    style: PathStyle,
    backends: BTreeMap<String, Arc<dyn FileSystem>>,
    wd: RwLock<VfsUrl>,
}

impl MuxFs {
    /// Empty multiplexer whose working directory is `/` on the `file` scheme.
    pub fn new() -> Self {
        Self {
            style: PathStyle::native(),
            backends: BTreeMap::new(),
            wd: RwLock::new(VfsUrl::new("", "", "/")),
        }
    }

    pub fn with_backend(mut self, scheme: &str, fs: Arc<dyn FileSystem>) -> Self {
        self.backends.insert(scheme.to_ascii_lowercase(), fs);
        self
    }

    pub fn with_working_dir(self, wd: &str) -> Self {
        let url = self.style.abs(wd, &self.wd.read());
        *self.wd.write() = url;
        self
    }

    pub fn schemes(&self) -> impl Iterator<Item = &str> {
        self.backends.keys().map(String::as_str)
    }

    pub fn getwd(&self) -> String {
        self.wd.read().to_string()
    }

    /// Change the working directory; the target must be a directory.
    pub async fn chdir(&self, name: &str) -> VfsResult<()> {
        let (fs, url) = self.resolve(name)?;
        let info = fs.stat(&url.backend_path()).await?;
        if !info.is_dir() {
            return Err(VfsError::NotDir(url.to_string()));
        }
        *self.wd.write() = url;
        Ok(())
    }

    /// Absolute URL for `name` relative to the working directory.
    pub fn abs(&self, name: &str) -> VfsUrl {
        let wd = self.wd.read().clone();
        self.style.abs(name, &wd)
    }

    fn resolve(&self, name: &str) -> VfsResult<(Arc<dyn FileSystem>, VfsUrl)> {
        let url = self.abs(name);
        let fs = self
            .backends
            .get(url.effective_scheme())
            .cloned()
            .ok_or_else(|| VfsError::FsNotFound(url.effective_scheme().to_string()))?;
        Ok((fs, url))
    }

    fn resolve_pair(
        &self,
        old: &str,
        new: &str,
    ) -> VfsResult<(Arc<dyn FileSystem>, VfsUrl, VfsUrl)> {
        let old_url = self.abs(old);
        let new_url = self.abs(new);
        if old_url.effective_scheme() != new_url.effective_scheme()
            || old_url.host() != new_url.host()
        {
            return Err(VfsError::CrossingFsBoundaries);
        }
        let (fs, old_url) = self.resolve(&old_url.to_string())?;
        Ok((fs, old_url, new_url))
    }
}

impl Default for MuxFs {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FileSystem for MuxFs {
    async fn open_file(&self, name: &str, flags: OpenFlags, perm: u32) -> VfsResult<Box<dyn File>> {
        let (fs, url) = self.resolve(name)?;
        fs.open_file(&url.backend_path(), flags, perm).await
    }

    async fn mkdir(&self, name: &str, perm: u32) -> VfsResult<()> {
        let (fs, url) = self.resolve(name)?;
        fs.mkdir(&url.backend_path(), perm).await
    }

    async fn mkdir_all(&self, name: &str, perm: u32) -> VfsResult<()> {
        let (fs, url) = self.resolve(name)?;
        fs.mkdir_all(&url.backend_path(), perm).await
    }

    async fn remove(&self, name: &str) -> VfsResult<()> {
        let (fs, url) = self.resolve(name)?;
        fs.remove(&url.backend_path()).await
    }

    async fn remove_all(&self, name: &str) -> VfsResult<()> {
        let (fs, url) = self.resolve(name)?;
        fs.remove_all(&url.backend_path()).await
    }

    async fn rename(&self, old: &str, new: &str) -> VfsResult<()> {
        let (fs, old_url, new_url) = self.resolve_pair(old, new)?;
        fs.rename(&old_url.backend_path(), &new_url.backend_path())
            .await
    }

    async fn stat(&self, name: &str) -> VfsResult<FileInfo> {
        let (fs, url) = self.resolve(name)?;
        fs.stat(&url.backend_path()).await
    }

    async fn symlink(&self, old: &str, new: &str) -> VfsResult<()> {
        let (fs, old_url, new_url) = self.resolve_pair(old, new)?;
        fs.symlink(&old_url.backend_path(), &new_url.backend_path())
            .await
    }

    async fn read_dir(&self, name: &str) -> VfsResult<Vec<DirEntry>> {
        let (fs, url) = self.resolve(name)?;
        fs.read_dir(&url.backend_path()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::{MemFs, WalkControl};

    fn mux() -> MuxFs {
        MuxFs::new()
            .with_backend("mem", Arc::new(MemFs::new()))
            .with_backend("scratch", Arc::new(MemFs::new()))
    }

    #[tokio::test]
    async fn test_unknown_scheme_fails_everywhere() {
        let fs = mux();
        let name = "ftp://host/file";
        assert!(matches!(fs.stat(name).await.unwrap_err(), VfsError::FsNotFound(s) if s == "ftp"));
        assert!(matches!(fs.open(name).await.unwrap_err(), VfsError::FsNotFound(_)));
        assert!(matches!(
            fs.mkdir_all(name, 0o755).await.unwrap_err(),
            VfsError::FsNotFound(_)
        ));
        assert!(matches!(fs.remove_all(name).await.unwrap_err(), VfsError::FsNotFound(_)));
        assert!(matches!(fs.read_dir(name).await.unwrap_err(), VfsError::FsNotFound(_)));
        // no file backend registered, so plain paths fail too
        assert!(matches!(fs.stat("/etc").await.unwrap_err(), VfsError::FsNotFound(s) if s == "file"));
    }

    #[tokio::test]
    async fn test_cross_scheme_rename_and_symlink() {
        let fs = mux();
        fs.write_file("mem:///a", b"x", 0o644).await.unwrap();
        assert!(matches!(
            fs.rename("mem:///a", "scratch:///a").await.unwrap_err(),
            VfsError::CrossingFsBoundaries
        ));
        assert!(matches!(
            fs.rename("file:///a", "mem:///a").await.unwrap_err(),
            VfsError::CrossingFsBoundaries
        ));
        assert!(matches!(
            fs.symlink("mem:///a", "scratch:///l").await.unwrap_err(),
            VfsError::CrossingFsBoundaries
        ));
        fs.rename("mem:///a", "mem:///b").await.unwrap();
        assert_eq!(fs.read_file("mem:///b").await.unwrap(), b"x");
    }

    #[tokio::test]
    async fn test_relative_names_follow_working_directory() {
        let fs = mux().with_working_dir("mem:///");
        fs.mkdir_all("work/dir", 0o755).await.unwrap();
        fs.chdir("work").await.unwrap();
        assert_eq!(fs.getwd(), "mem:///work");

        fs.write_file("dir/f.txt", b"hi", 0o644).await.unwrap();
        assert_eq!(fs.read_file("mem:///work/dir/f.txt").await.unwrap(), b"hi");
        assert!(matches!(
            fs.chdir("dir/f.txt").await.unwrap_err(),
            VfsError::NotDir(_)
        ));
    }

    #[tokio::test]
    async fn test_walk_dir_yields_urls() {
        let fs = mux();
        fs.write_file("mem:///d/b", b"", 0o644).await.unwrap();
        fs.write_file("mem:///d/a", b"", 0o644).await.unwrap();
        let mut seen = Vec::new();
        fs.walk_dir("mem:///d", &mut |path: &str, _: &DirEntry| {
            seen.push(path.to_string());
            Ok(WalkControl::Continue)
        })
        .await
        .unwrap();
        assert_eq!(seen, ["mem:///d", "mem:///d/a", "mem:///d/b"]);
    }
}
