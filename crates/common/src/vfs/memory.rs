//! In-memory filesystem.
//!
//! A tree of reference-counted nodes rooted at `/`. Structural changes
//! (create, remove, rename, link) take the filesystem-level lock for
//! writing; lookups take it for reading. Node contents and child maps are
//! guarded by per-node locks, always acquired after the filesystem lock.
//!
//! Writes are not POSIX: a write replaces everything after the handle's
//! offset with the written bytes.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use super::{
    DirEntry, File, FileInfo, FileSystem, FileType, OpenFlags, VfsError, VfsResult,
    DEFAULT_DIR_MODE,
};
use crate::urlpath::{clean_abs, file_name_of, parent_of};

type NodeRef = Arc<RwLock<Node>>;

#[derive(Debug)]
struct Node {
    name: String,
    mode: u32,
    modified: DateTime<Utc>,
    kind: NodeKind,
}

#[derive(Debug)]
enum NodeKind {
    Dir(BTreeMap<String, NodeRef>),
    File(Vec<u8>),
    Symlink(String),
}

impl Node {
    fn new(name: &str, mode: u32, kind: NodeKind) -> NodeRef {
        Arc::new(RwLock::new(Node {
            name: name.to_string(),
            mode,
            modified: Utc::now(),
            kind,
        }))
    }

    fn dir(name: &str, mode: u32) -> NodeRef {
        Self::new(name, mode, NodeKind::Dir(BTreeMap::new()))
    }

    fn info(&self) -> FileInfo {
        let (size, file_type, symlink_target) = match &self.kind {
            NodeKind::Dir(_) => (0, FileType::Dir, None),
            NodeKind::File(content) => (content.len() as u64, FileType::File, None),
            NodeKind::Symlink(target) => (0, FileType::Symlink, Some(target.clone())),
        };
        FileInfo {
            name: self.name.clone(),
            size,
            mode: self.mode,
            modified: self.modified,
            file_type,
            symlink_target,
        }
    }

    fn is_dir(&self) -> bool {
        matches!(self.kind, NodeKind::Dir(_))
    }
}

#[derive(Debug)]
struct Inner {
    root: NodeRef,
    tree: RwLock<()>,
}

/// Ephemeral filesystem held entirely in memory. Cloning shares the tree.
#[derive(Debug, Clone)]
pub struct MemFs {
    inner: Arc<Inner>,
}

impl Default for MemFs {
    fn default() -> Self {
        Self::new()
    }
}

impl MemFs {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                root: Node::dir("/", DEFAULT_DIR_MODE),
                tree: RwLock::new(()),
            }),
        }
    }

    fn lookup(&self, path: &str) -> VfsResult<NodeRef> {
        let mut node = self.inner.root.clone();
        if path == "/" {
            return Ok(node);
        }
        for component in path[1..].split('/') {
            let next = {
                let guard = node.read();
                match &guard.kind {
                    NodeKind::Dir(children) => children.get(component).cloned(),
                    _ => return Err(VfsError::NotDir(path.to_string())),
                }
            };
            node = next.ok_or_else(|| VfsError::NotExist(path.to_string()))?;
        }
        Ok(node)
    }

    fn lookup_dir(&self, path: &str) -> VfsResult<NodeRef> {
        let node = self.lookup(path)?;
        if !node.read().is_dir() {
            return Err(VfsError::NotDir(path.to_string()));
        }
        Ok(node)
    }

    /// Caller holds the tree lock for writing.
    fn mkdir_all_locked(&self, path: &str, perm: u32) -> VfsResult<NodeRef> {
        let mut node = self.inner.root.clone();
        if path == "/" {
            return Ok(node);
        }
        for component in path[1..].split('/') {
            let next = {
                let mut guard = node.write();
                let dir = &mut *guard;
                let children = match &mut dir.kind {
                    NodeKind::Dir(children) => children,
                    _ => return Err(VfsError::NotDir(path.to_string())),
                };
                let existing = children.get(component).cloned();
                match existing {
                    Some(child) => child,
                    None => {
                        let child = Node::dir(component, perm);
                        children.insert(component.to_string(), child.clone());
                        dir.modified = Utc::now();
                        child
                    }
                }
            };
            node = next;
        }
        if !node.read().is_dir() {
            return Err(VfsError::NotDir(path.to_string()));
        }
        Ok(node)
    }

    /// Insert `child` under `parent`, failing if the name is taken.
    fn insert_child(parent: &NodeRef, path: &str, child: NodeRef) -> VfsResult<()> {
        let mut guard = parent.write();
        let dir = &mut *guard;
        let name = child.read().name.clone();
        match &mut dir.kind {
            NodeKind::Dir(children) => {
                if children.contains_key(&name) {
                    return Err(VfsError::Exist(path.to_string()));
                }
                children.insert(name, child);
            }
            _ => return Err(VfsError::NotDir(parent_of(path).to_string())),
        }
        dir.modified = Utc::now();
        Ok(())
    }

    fn detach_child(parent: &NodeRef, name: &str) -> Option<NodeRef> {
        let mut guard = parent.write();
        let dir = &mut *guard;
        let removed = match &mut dir.kind {
            NodeKind::Dir(children) => children.remove(name),
            _ => None,
        };
        if removed.is_some() {
            dir.modified = Utc::now();
        }
        removed
    }

    fn open_node(&self, path: &str, flags: OpenFlags, perm: u32) -> VfsResult<NodeRef> {
        if !flags.contains(OpenFlags::CREATE) {
            let _tree = self.inner.tree.read();
            return self.lookup(path);
        }

        let _tree = self.inner.tree.write();
        match self.lookup(path) {
            Ok(node) => {
                if flags.contains(OpenFlags::EXCLUSIVE) {
                    return Err(VfsError::Exist(path.to_string()));
                }
                Ok(node)
            }
            Err(VfsError::NotExist(_)) => {
                let parent = self.mkdir_all_locked(parent_of(path), DEFAULT_DIR_MODE)?;
                let node = Node::new(file_name_of(path), perm, NodeKind::File(Vec::new()));
                Self::insert_child(&parent, path, node.clone())?;
                Ok(node)
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl FileSystem for MemFs {
    async fn open_file(&self, name: &str, flags: OpenFlags, perm: u32) -> VfsResult<Box<dyn File>> {
        let path = clean_abs(name);
        let node = self.open_node(&path, flags, perm)?;

        let offset = {
            let mut guard = node.write();
            let entry = &mut *guard;
            match &mut entry.kind {
                NodeKind::Dir(_) if flags.is_writable() => {
                    return Err(VfsError::IsDir(path));
                }
                NodeKind::Dir(_) => 0,
                NodeKind::Symlink(_) => {
                    return Err(VfsError::Invalid(format!("cannot open symlink {path}")));
                }
                NodeKind::File(content) => {
                    if flags.contains(OpenFlags::TRUNCATE) && flags.is_writable() {
                        content.clear();
                        entry.modified = Utc::now();
                        0
                    } else if flags.contains(OpenFlags::APPEND) {
                        content.len()
                    } else {
                        0
                    }
                }
            }
        };

        Ok(Box::new(MemFile {
            path,
            node,
            flags,
            offset,
            closed: false,
        }))
    }

    async fn mkdir(&self, name: &str, perm: u32) -> VfsResult<()> {
        let path = clean_abs(name);
        if path == "/" {
            return Err(VfsError::Exist(path));
        }
        let _tree = self.inner.tree.write();
        let parent = self.lookup_dir(parent_of(&path))?;
        Self::insert_child(&parent, &path, Node::dir(file_name_of(&path), perm))
    }

    async fn mkdir_all(&self, name: &str, perm: u32) -> VfsResult<()> {
        let path = clean_abs(name);
        let _tree = self.inner.tree.write();
        self.mkdir_all_locked(&path, perm).map(|_| ())
    }

    async fn remove(&self, name: &str) -> VfsResult<()> {
        let path = clean_abs(name);
        let _tree = self.inner.tree.write();
        let node = self.lookup(&path)?;
        if let NodeKind::Dir(children) = &node.read().kind {
            if !children.is_empty() {
                return Err(VfsError::DirNotEmpty(path));
            }
        }
        if path == "/" {
            return Ok(());
        }
        let parent = self.lookup_dir(parent_of(&path))?;
        Self::detach_child(&parent, file_name_of(&path));
        Ok(())
    }

    async fn remove_all(&self, name: &str) -> VfsResult<()> {
        let path = clean_abs(name);
        let _tree = self.inner.tree.write();
        if path == "/" {
            let mut root = self.inner.root.write();
            if let NodeKind::Dir(children) = &mut root.kind {
                children.clear();
            }
            root.modified = Utc::now();
            return Ok(());
        }
        match self.lookup_dir(parent_of(&path)) {
            Ok(parent) => {
                Self::detach_child(&parent, file_name_of(&path));
                Ok(())
            }
            Err(VfsError::NotExist(_)) | Err(VfsError::NotDir(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn rename(&self, old: &str, new: &str) -> VfsResult<()> {
        let old_path = clean_abs(old);
        let new_path = clean_abs(new);
        if old_path == "/" || new_path == "/" {
            return Err(VfsError::Invalid("cannot rename the root".to_string()));
        }

        let _tree = self.inner.tree.write();
        let node = self.lookup(&old_path)?;
        let new_parent = self.lookup_dir(parent_of(&new_path))?;
        if self.lookup(&new_path).is_ok() {
            return Err(VfsError::Exist(new_path));
        }
        if new_path.starts_with(&format!("{old_path}/")) {
            return Err(VfsError::Invalid(format!(
                "cannot move {old_path} into its own subtree"
            )));
        }

        let old_parent = self.lookup_dir(parent_of(&old_path))?;
        Self::detach_child(&old_parent, file_name_of(&old_path));
        {
            let mut guard = node.write();
            guard.name = file_name_of(&new_path).to_string();
            guard.modified = Utc::now();
        }
        Self::insert_child(&new_parent, &new_path, node)
    }

    async fn stat(&self, name: &str) -> VfsResult<FileInfo> {
        let path = clean_abs(name);
        let _tree = self.inner.tree.read();
        let node = self.lookup(&path)?;
        let info = node.read().info();
        Ok(info)
    }

    async fn symlink(&self, old: &str, new: &str) -> VfsResult<()> {
        if old.is_empty() {
            return Err(VfsError::Invalid("empty symlink target".to_string()));
        }
        let path = clean_abs(new);
        if path == "/" {
            return Err(VfsError::Exist(path));
        }
        let _tree = self.inner.tree.write();
        let parent = self.lookup_dir(parent_of(&path))?;
        let link = Node::new(
            file_name_of(&path),
            0o777,
            NodeKind::Symlink(old.to_string()),
        );
        Self::insert_child(&parent, &path, link)
    }

    async fn read_dir(&self, name: &str) -> VfsResult<Vec<DirEntry>> {
        let path = clean_abs(name);
        let _tree = self.inner.tree.read();
        let node = self.lookup(&path)?;
        let guard = node.read();
        match &guard.kind {
            NodeKind::Dir(children) => Ok(children.values().map(|c| c.read().info()).collect()),
            _ => Err(VfsError::NotDir(path)),
        }
    }
}

/// Handle on a [`MemFs`] node.
#[derive(Debug)]
pub struct MemFile {
    path: String,
    node: NodeRef,
    flags: OpenFlags,
    offset: usize,
    closed: bool,
}

impl MemFile {
    fn check_open(&self) -> VfsResult<()> {
        if self.closed {
            return Err(VfsError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl File for MemFile {
    fn name(&self) -> &str {
        &self.path
    }

    async fn read(&mut self, buf: &mut [u8]) -> VfsResult<usize> {
        self.check_open()?;
        if !self.flags.is_readable() {
            return Err(VfsError::BadDescriptor);
        }
        let guard = self.node.read();
        match &guard.kind {
            NodeKind::File(content) => {
                if self.offset >= content.len() {
                    return Ok(0);
                }
                let n = buf.len().min(content.len() - self.offset);
                buf[..n].copy_from_slice(&content[self.offset..self.offset + n]);
                self.offset += n;
                Ok(n)
            }
            NodeKind::Dir(_) => Err(VfsError::IsDir(self.path.clone())),
            NodeKind::Symlink(_) => Err(VfsError::Invalid(self.path.clone())),
        }
    }

    async fn write(&mut self, buf: &[u8]) -> VfsResult<usize> {
        self.check_open()?;
        if !self.flags.is_writable() {
            return Err(VfsError::BadDescriptor);
        }
        let mut guard = self.node.write();
        let entry = &mut *guard;
        match &mut entry.kind {
            NodeKind::File(content) => {
                let keep = self.offset.min(content.len());
                content.truncate(keep);
                content.extend_from_slice(buf);
                self.offset = keep + buf.len();
            }
            NodeKind::Dir(_) => return Err(VfsError::IsDir(self.path.clone())),
            NodeKind::Symlink(_) => return Err(VfsError::Invalid(self.path.clone())),
        }
        entry.modified = Utc::now();
        Ok(buf.len())
    }

    async fn stat(&self) -> VfsResult<FileInfo> {
        self.check_open()?;
        let info = self.node.read().info();
        Ok(info)
    }

    async fn close(&mut self) -> VfsResult<()> {
        self.check_open()?;
        self.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::WalkControl;

    #[tokio::test]
    async fn test_root_open_modes() {
        let fs = MemFs::new();
        let err = fs
            .open_file("/", OpenFlags::READ_WRITE, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, VfsError::IsDir(_)));

        let file = fs.open("/").await.unwrap();
        assert!(file.stat().await.unwrap().is_dir());
    }

    #[tokio::test]
    async fn test_write_discards_tail_after_offset() {
        let fs = MemFs::new();
        fs.write_file("/f", b"hello world", 0o644).await.unwrap();

        let mut file = fs.open_file("/f", OpenFlags::READ_WRITE, 0).await.unwrap();
        let mut buf = [0u8; 5];
        assert_eq!(file.read(&mut buf).await.unwrap(), 5);
        file.write(b"!").await.unwrap();
        file.close().await.unwrap();

        assert_eq!(fs.read_file("/f").await.unwrap(), b"hello!");
    }

    #[tokio::test]
    async fn test_descriptor_modes_are_enforced() {
        let fs = MemFs::new();
        fs.write_file("/f", b"data", 0o644).await.unwrap();

        let mut ro = fs.open("/f").await.unwrap();
        assert!(matches!(
            ro.write(b"x").await.unwrap_err(),
            VfsError::BadDescriptor
        ));

        let mut wo = fs
            .open_file("/f", OpenFlags::WRITE_ONLY, 0)
            .await
            .unwrap();
        let mut buf = [0u8; 4];
        assert!(matches!(
            wo.read(&mut buf).await.unwrap_err(),
            VfsError::BadDescriptor
        ));
    }

    #[tokio::test]
    async fn test_create_makes_missing_parents() {
        let fs = MemFs::new();
        fs.write_file("/a/b/c.txt", b"hello", 0o644).await.unwrap();
        fs.mkdir_all("/a/b", 0o755).await.unwrap();
        assert_eq!(fs.read_file("/a/b/c.txt").await.unwrap(), b"hello");
        assert!(fs.stat("/a").await.unwrap().is_dir());
    }

    #[tokio::test]
    async fn test_mkdir_errors() {
        let fs = MemFs::new();
        fs.mkdir("/d", 0o755).await.unwrap();
        assert!(matches!(
            fs.mkdir("/d", 0o755).await.unwrap_err(),
            VfsError::Exist(_)
        ));
        assert!(matches!(
            fs.mkdir("/missing/d", 0o755).await.unwrap_err(),
            VfsError::NotExist(_)
        ));

        fs.write_file("/file", b"", 0o644).await.unwrap();
        assert!(matches!(
            fs.mkdir_all("/file/sub", 0o755).await.unwrap_err(),
            VfsError::NotDir(_)
        ));
    }

    #[tokio::test]
    async fn test_remove_non_empty_directory_fails() {
        let fs = MemFs::new();
        fs.write_file("/d/f", b"x", 0o644).await.unwrap();
        assert!(matches!(
            fs.remove("/d").await.unwrap_err(),
            VfsError::DirNotEmpty(_)
        ));
        fs.remove("/d/f").await.unwrap();
        fs.remove("/d").await.unwrap();
        assert!(fs.stat("/d").await.unwrap_err().is_not_exist());
        assert!(fs.remove("/d").await.unwrap_err().is_not_exist());
    }

    #[tokio::test]
    async fn test_remove_all_root_keeps_root() {
        let fs = MemFs::new();
        fs.write_file("/a/b", b"x", 0o644).await.unwrap();
        fs.mkdir("/c", 0o755).await.unwrap();
        fs.remove_all("/").await.unwrap();

        assert!(fs.read_dir("/").await.unwrap().is_empty());
        assert!(fs.stat("/").await.unwrap().is_dir());
        fs.remove_all("/never/existed").await.unwrap();
    }

    #[tokio::test]
    async fn test_rename() {
        let fs = MemFs::new();
        assert!(fs.rename("/x", "/x").await.unwrap_err().is_not_exist());

        fs.write_file("/x", b"1", 0o644).await.unwrap();
        fs.write_file("/y", b"2", 0o644).await.unwrap();
        assert!(matches!(
            fs.rename("/x", "/y").await.unwrap_err(),
            VfsError::Exist(_)
        ));

        fs.mkdir("/dir", 0o755).await.unwrap();
        fs.rename("/x", "/dir/z").await.unwrap();
        assert_eq!(fs.read_file("/dir/z").await.unwrap(), b"1");
        assert_eq!(fs.stat("/dir/z").await.unwrap().name, "z");
        assert!(fs.stat("/x").await.unwrap_err().is_not_exist());

        assert!(matches!(
            fs.rename("/dir", "/dir/inner").await.unwrap_err(),
            VfsError::Invalid(_)
        ));
    }

    #[tokio::test]
    async fn test_symlink_is_not_resolved() {
        let fs = MemFs::new();
        fs.write_file("/target", b"x", 0o644).await.unwrap();
        fs.symlink("/target", "/link").await.unwrap();

        let info = fs.stat("/link").await.unwrap();
        assert!(info.is_symlink());
        assert_eq!(info.symlink_target.as_deref(), Some("/target"));
        assert!(matches!(
            fs.symlink("/target", "/link").await.unwrap_err(),
            VfsError::Exist(_)
        ));
    }

    #[tokio::test]
    async fn test_read_dir_on_file_fails() {
        let fs = MemFs::new();
        fs.write_file("/f", b"", 0o644).await.unwrap();
        assert!(matches!(
            fs.read_dir("/f").await.unwrap_err(),
            VfsError::NotDir(_)
        ));
    }

    #[tokio::test]
    async fn test_walk_dir_is_sorted_and_can_stop() {
        let fs = MemFs::new();
        for path in ["/b/2", "/a/1", "/b/1", "/c"] {
            fs.write_file(path, b"", 0o644).await.unwrap();
        }

        let mut seen = Vec::new();
        fs.walk_dir("/", &mut |path: &str, _: &DirEntry| {
            seen.push(path.to_string());
            Ok(WalkControl::Continue)
        })
        .await
        .unwrap();
        assert_eq!(seen, ["/", "/a", "/a/1", "/b", "/b/1", "/b/2", "/c"]);

        let mut count = 0;
        fs.walk_dir("/", &mut |_: &str, _: &DirEntry| {
            count += 1;
            if count == 3 {
                Ok(WalkControl::Stop)
            } else {
                Ok(WalkControl::Continue)
            }
        })
        .await
        .unwrap();
        assert_eq!(count, 3);
    }

    #[tokio::test]
    async fn test_append_and_exclusive() {
        let fs = MemFs::new();
        fs.write_file("/log", b"one", 0o644).await.unwrap();
        let mut file = fs
            .open_file("/log", OpenFlags::WRITE_ONLY | OpenFlags::APPEND, 0)
            .await
            .unwrap();
        file.write(b"two").await.unwrap();
        file.close().await.unwrap();
        assert_eq!(fs.read_file("/log").await.unwrap(), b"onetwo");

        let err = fs
            .open_file(
                "/log",
                OpenFlags::WRITE_ONLY | OpenFlags::CREATE | OpenFlags::EXCLUSIVE,
                0o644,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, VfsError::Exist(_)));
    }
}
