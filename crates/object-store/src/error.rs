use common::bus::{BusError, StoreError};
use common::vfs::VfsError;

/// Object store failures as reported to users.
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("repository already exists")]
    AlreadyExists,
    #[error("repository not found")]
    NotFound,
    #[error("file not found")]
    FileNotFound,
    #[error("invalid repository name")]
    InvalidName,
    #[error(transparent)]
    Store(StoreError),
    #[error(transparent)]
    Bus(#[from] BusError),
}

impl From<StoreError> for RepositoryError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::BucketExists(_) => RepositoryError::AlreadyExists,
            StoreError::BucketNotFound(_) => RepositoryError::NotFound,
            StoreError::ObjectNotFound(_) => RepositoryError::FileNotFound,
            StoreError::InvalidBucketName(_) => RepositoryError::InvalidName,
            other => RepositoryError::Store(other),
        }
    }
}

impl From<RepositoryError> for VfsError {
    fn from(err: RepositoryError) -> Self {
        VfsError::backend(err)
    }
}

pub type Result<T> = std::result::Result<T, RepositoryError>;

/// Translate a store failure straight into a filesystem error.
pub(crate) fn store_to_vfs(err: StoreError) -> VfsError {
    RepositoryError::from(err).into()
}
