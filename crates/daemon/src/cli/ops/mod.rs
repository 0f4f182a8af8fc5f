pub mod bundle;
pub mod daemon;
pub mod repo;
pub mod version;
pub mod worker;

pub use bundle::Bundle;
pub use daemon::Daemon;
pub use repo::Repo;
pub use version::Version;
pub use worker::Worker;
