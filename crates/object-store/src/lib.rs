//! Repositories: object store buckets reached through the bus.
//!
//! [`RepositoryClient`] is the thin file-level API the worker uses to fetch
//! bundles. [`RemoteFs`] exposes one bucket through the VFS contract,
//! keeping a watcher-driven cache of which paths exist; [`RepositoryFs`]
//! routes `//bucket/key` paths to a lazily opened [`RemoteFs`] per bucket
//! and is what the `nats://` scheme is mounted on.

mod error;
mod remote_fs;
mod repository;
mod repository_fs;

pub use error::{RepositoryError, Result};
pub use remote_fs::{RemoteFile, RemoteFs};
pub use repository::RepositoryClient;
pub use repository_fs::RepositoryFs;
