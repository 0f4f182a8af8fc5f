// Configuration and process setup
pub mod config;
pub mod logging;

// Script execution
pub mod engine;
pub mod pipe;

// Vessel pipeline
pub mod connector;
pub mod decoder;
pub mod processor;
pub mod publisher;
pub mod scheduler;
pub mod session;
pub mod vessel;

// Operator side
pub mod client;

pub use client::{ClientError, VesselClient};
pub use config::{ConfigError, Credentials, VesselConfig};
pub use scheduler::{Scheduler, SchedulerSummary, WorkerEvent};
pub use session::{SessionSpawner, StopReason, WorkerSpawner};
pub use vessel::{Vessel, VesselError};

#[cfg(test)]
pub(crate) mod testing;

/// Capacity of the channels linking pipeline stages.
pub(crate) const STAGE_BUFFER: usize = 8;

/// Daemon-specific build info that uses the daemon's BUILD_FEATURES.
///
/// `common::version::BuildInfo::new()` reads BUILD_FEATURES from common's
/// compile environment, not the daemon's.
pub fn build_info() -> common::version::BuildInfo {
    let mut info = common::version::BuildInfo::new();
    info.build_features = option_env!("BUILD_FEATURES").unwrap_or("none").to_string();
    info
}
