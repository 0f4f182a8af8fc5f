use std::sync::Arc;

use bytes::Bytes;
use common::bus::{Bus, ObjectInfo, ObjectKind, ObjectMeta, ObjectStore, StoreStatus};
use common::urlpath::clean_abs;

use crate::error::Result;

/// File-level access to repositories over the bus.
#[derive(Debug, Clone)]
pub struct RepositoryClient {
    bus: Arc<dyn Bus>,
}

impl RepositoryClient {
    pub fn new(bus: Arc<dyn Bus>) -> Self {
        Self { bus }
    }

    async fn store(&self, repository: &str) -> Result<Arc<dyn ObjectStore>> {
        Ok(self.bus.object_store(repository).await?)
    }

    /// Fetch the full contents of `path` in `repository`.
    pub async fn get_file(&self, repository: &str, path: &str) -> Result<Bytes> {
        let store = self.store(repository).await?;
        let object = store.get(&clean_abs(path)).await?;
        tracing::debug!(repository, path, size = object.info().size, "fetching file");
        Ok(object.bytes().await?)
    }

    pub async fn put_file(&self, repository: &str, path: &str, data: Bytes) -> Result<ObjectInfo> {
        let store = self.store(repository).await?;
        let meta = ObjectMeta::new(clean_abs(path)).with_kind(ObjectKind::File);
        Ok(store.put(meta, data).await?)
    }

    pub async fn list_files(&self, repository: &str) -> Result<Vec<ObjectInfo>> {
        let store = self.store(repository).await?;
        let mut files = store.list().await?;
        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }

    pub async fn delete_file(&self, repository: &str, path: &str) -> Result<()> {
        let store = self.store(repository).await?;
        Ok(store.delete(&clean_abs(path)).await?)
    }

    pub async fn create_repository(&self, repository: &str) -> Result<()> {
        self.bus.create_object_store(repository).await?;
        tracing::info!(repository, "created repository");
        Ok(())
    }

    pub async fn delete_repository(&self, repository: &str) -> Result<()> {
        self.bus.delete_object_store(repository).await?;
        tracing::info!(repository, "deleted repository");
        Ok(())
    }

    pub async fn status(&self, repository: &str) -> Result<StoreStatus> {
        let store = self.store(repository).await?;
        Ok(store.status().await?)
    }
}

#[cfg(test)]
mod tests {
    use common::bus::MemoryBus;

    use super::*;
    use crate::RepositoryError;

    #[tokio::test]
    async fn test_put_get_list() {
        let client = RepositoryClient::new(Arc::new(MemoryBus::new()));
        client.create_repository("r1").await.unwrap();
        client
            .put_file("r1", "scripts/hello.fzz", Bytes::from_static(b"zip"))
            .await
            .unwrap();

        let data = client.get_file("r1", "/scripts/hello.fzz").await.unwrap();
        assert_eq!(data, Bytes::from_static(b"zip"));
        let files = client.list_files("r1").await.unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].name, "/scripts/hello.fzz");
        assert_eq!(client.status("r1").await.unwrap().size, 3);
    }

    #[tokio::test]
    async fn test_errors_are_friendly() {
        let client = RepositoryClient::new(Arc::new(MemoryBus::new()));
        assert!(matches!(
            client.get_file("missing", "/a").await.unwrap_err(),
            RepositoryError::NotFound
        ));
        client.create_repository("r1").await.unwrap();
        assert!(matches!(
            client.create_repository("r1").await.unwrap_err(),
            RepositoryError::AlreadyExists
        ));
        assert!(matches!(
            client.get_file("r1", "/a").await.unwrap_err(),
            RepositoryError::FileNotFound
        ));
        assert!(matches!(
            client.create_repository("no/slash").await.unwrap_err(),
            RepositoryError::InvalidName
        ));
    }
}
