use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Metadata key tagging an object as file (`f`), directory (`d`) or link (`l`).
pub const FILE_TYPE_KEY: &str = "file-type";
/// Metadata key holding a link object's target.
pub const LINK_TARGET_KEY: &str = "link-target";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("bucket already exists: {0}")]
    BucketExists(String),
    #[error("bucket not found: {0}")]
    BucketNotFound(String),
    #[error("object not found: {0}")]
    ObjectNotFound(String),
    #[error("object already exists: {0}")]
    ObjectExists(String),
    #[error("invalid bucket name: {0}")]
    InvalidBucketName(String),
    #[error("invalid object name: {0:?}")]
    InvalidObjectName(String),
    #[error("object store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("object store error: {0}")]
    Other(String),
}

/// Bucket names are limited to ASCII alphanumerics, `-` and `_`.
pub fn is_valid_bucket_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    File,
    Dir,
    Link,
}

impl ObjectKind {
    pub fn tag(self) -> &'static str {
        match self {
            ObjectKind::File => "f",
            ObjectKind::Dir => "d",
            ObjectKind::Link => "l",
        }
    }

    /// Objects without a recognised tag are files.
    pub fn from_metadata(metadata: &HashMap<String, String>) -> Self {
        match metadata.get(FILE_TYPE_KEY).map(String::as_str) {
            Some("d") => ObjectKind::Dir,
            Some("l") => ObjectKind::Link,
            _ => ObjectKind::File,
        }
    }
}

/// What a writer supplies when storing an object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectMeta {
    pub name: String,
    pub description: Option<String>,
    pub metadata: HashMap<String, String>,
}

impl ObjectMeta {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_kind(mut self, kind: ObjectKind) -> Self {
        self.metadata
            .insert(FILE_TYPE_KEY.to_string(), kind.tag().to_string());
        self
    }

    pub fn with_link_target(mut self, target: impl Into<String>) -> Self {
        self.metadata
            .insert(LINK_TARGET_KEY.to_string(), target.into());
        self.with_kind(ObjectKind::Link)
    }

    pub fn kind(&self) -> ObjectKind {
        ObjectKind::from_metadata(&self.metadata)
    }
}

/// Stored object description, also used for change-feed updates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub bucket: String,
    pub name: String,
    pub size: u64,
    pub modified: DateTime<Utc>,
    pub metadata: HashMap<String, String>,
    pub deleted: bool,
}

impl ObjectInfo {
    pub fn kind(&self) -> ObjectKind {
        ObjectKind::from_metadata(&self.metadata)
    }

    pub fn link_target(&self) -> Option<&str> {
        self.metadata.get(LINK_TARGET_KEY).map(String::as_str)
    }

    pub fn meta(&self) -> ObjectMeta {
        ObjectMeta {
            name: self.name.clone(),
            description: None,
            metadata: self.metadata.clone(),
        }
    }
}

type ObjectReader = Box<dyn AsyncRead + Send + Unpin>;

/// A fetched object: its description plus a reader over its bytes.
pub struct Object {
    info: ObjectInfo,
    reader: Mutex<ObjectReader>,
}

impl Object {
    pub fn new(info: ObjectInfo, reader: ObjectReader) -> Self {
        Self {
            info,
            reader: Mutex::new(reader),
        }
    }

    pub fn info(&self) -> &ObjectInfo {
        &self.info
    }

    pub fn reader(&mut self) -> &mut (dyn AsyncRead + Send + Unpin) {
        self.reader.get_mut().as_mut()
    }

    pub async fn bytes(mut self) -> Result<Bytes, StoreError> {
        let mut data = Vec::with_capacity(self.info.size as usize);
        self.reader().read_to_end(&mut data).await?;
        Ok(Bytes::from(data))
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Object").field("info", &self.info).finish()
    }
}

/// Change-feed item: history first, then [`WatchEvent::CaughtUp`], then live updates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Update(ObjectInfo),
    CaughtUp,
}

#[derive(Debug)]
pub struct Watcher {
    rx: flume::Receiver<Result<WatchEvent, StoreError>>,
}

impl Watcher {
    pub fn new(rx: flume::Receiver<Result<WatchEvent, StoreError>>) -> Self {
        Self { rx }
    }

    /// `None` once the feed has ended.
    pub async fn next(&mut self) -> Option<Result<WatchEvent, StoreError>> {
        self.rx.recv_async().await.ok()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreStatus {
    pub bucket: String,
    pub objects: u64,
    pub size: u64,
}

#[async_trait]
pub trait ObjectStore: Send + Sync + fmt::Debug {
    fn bucket(&self) -> &str;

    async fn put(&self, meta: ObjectMeta, data: Bytes) -> Result<ObjectInfo, StoreError>;

    /// Store everything `reader` yields under `meta.name`.
    async fn put_stream(
        &self,
        meta: ObjectMeta,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<ObjectInfo, StoreError>;

    async fn get(&self, name: &str) -> Result<Object, StoreError>;

    async fn info(&self, name: &str) -> Result<ObjectInfo, StoreError>;

    async fn delete(&self, name: &str) -> Result<(), StoreError>;

    /// Live (non-deleted) objects.
    async fn list(&self) -> Result<Vec<ObjectInfo>, StoreError>;

    async fn status(&self) -> Result<StoreStatus, StoreError>;

    /// Replace an object's metadata; a different `meta.name` renames it.
    async fn update_meta(&self, name: &str, meta: ObjectMeta) -> Result<(), StoreError>;

    async fn watch(&self) -> Result<Watcher, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_names() {
        assert!(is_valid_bucket_name("repo_1-a"));
        assert!(!is_valid_bucket_name(""));
        assert!(!is_valid_bucket_name("a.b"));
        assert!(!is_valid_bucket_name("a b"));
    }

    #[test]
    fn test_kind_tags() {
        let meta = ObjectMeta::new("/d").with_kind(ObjectKind::Dir);
        assert_eq!(meta.kind(), ObjectKind::Dir);
        let link = ObjectMeta::new("/l").with_link_target("/t");
        assert_eq!(link.kind(), ObjectKind::Link);
        assert_eq!(ObjectMeta::new("/f").kind(), ObjectKind::File);
    }
}
