//! Shared building blocks for the vessel remote execution agent.
//!
//! - [`urlpath`]: OS-aware path/URL normalization used by every filesystem.
//! - [`vfs`]: the filesystem contract plus the in-memory, local and
//!   scheme-multiplexing implementations.
//! - [`bus`]: the message bus and object store capabilities the agent
//!   consumes, with an in-process implementation and an optional NATS adapter.
//! - [`protocol`]: tagged wire messages and stable error codes.
//! - [`bundle`]: zip script bundles (packager and reader).

pub mod bundle;
pub mod bus;
pub mod protocol;
pub mod urlpath;
pub mod version;
pub mod vfs;
