//! The vessel: the long-lived agent serving worker lifecycle RPCs.

use std::sync::Arc;

use common::bus::{Bus, BusError, ServiceConfig};
use common::protocol::rpc_subject;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::VesselConfig;
use crate::connector::Connector;
use crate::decoder::VesselDecoder;
use crate::engine::EngineError;
use crate::scheduler::{Scheduler, SchedulerSummary};
use crate::session::{SessionSpawner, WorkerSpawner};
use crate::STAGE_BUFFER;

#[derive(Debug, thiserror::Error)]
pub enum VesselError {
    #[error("bus error: {0}")]
    Bus(#[from] BusError),
    #[error("script engine error: {0}")]
    Engine(#[from] EngineError),
    #[error("{0} task failed: {1}")]
    Task(&'static str, String),
}

enum Exit {
    Connector(Result<(), BusError>),
    Decoder,
    Scheduler(SchedulerSummary),
}

#[derive(Debug)]
pub struct Vessel<S = SessionSpawner> {
    bus: Arc<dyn Bus>,
    config: Arc<VesselConfig>,
    spawner: S,
}

impl Vessel<SessionSpawner> {
    pub fn new(bus: Arc<dyn Bus>, config: VesselConfig) -> Result<Self, VesselError> {
        let config = Arc::new(config);
        let spawner = SessionSpawner::new(bus.clone(), config.clone())?;
        Ok(Self {
            bus,
            config,
            spawner,
        })
    }
}

impl<S: WorkerSpawner> Vessel<S> {
    /// Replace how workers are started.
    pub fn with_spawner<T: WorkerSpawner>(self, spawner: T) -> Vessel<T> {
        Vessel {
            bus: self.bus,
            config: self.config,
            spawner,
        }
    }

    /// Serve until `cancel` fires or any component exits, then wait for
    /// every worker to stop.
    pub async fn run(self, cancel: CancellationToken) -> Result<SchedulerSummary, VesselError> {
        let service_name = self.config.service_name.clone();
        let group = cancel.child_token();

        let (raw_tx, raw_rx) = flume::bounded(STAGE_BUFFER);
        let (request_tx, request_rx) = flume::bounded(STAGE_BUFFER);
        let (response_tx, response_rx) = flume::unbounded();

        let connector = Connector::new(
            self.bus.clone(),
            ServiceConfig {
                name: service_name.clone(),
                version: self.config.version.clone(),
                description: self.config.description.clone(),
                metadata: Default::default(),
            },
        )
        .with_endpoint("rpc", rpc_subject(&service_name));

        let mut tasks = JoinSet::new();
        let token = group.clone();
        tasks.spawn(async move { Exit::Connector(connector.run(raw_tx, None, token).await) });
        let token = group.clone();
        tasks.spawn(async move {
            VesselDecoder::new()
                .run(raw_rx, request_tx, response_rx, token)
                .await;
            Exit::Decoder
        });
        let scheduler = Scheduler::new(self.spawner);
        let token = group.clone();
        tasks.spawn(async move { Exit::Scheduler(scheduler.run(request_rx, response_tx, token).await) });
        tracing::info!(service = %service_name, "vessel running");

        let mut summary = None;
        let mut failure = None;
        while let Some(joined) = tasks.join_next().await {
            // any component returning takes the rest down with it
            group.cancel();
            match joined {
                Ok(Exit::Connector(Ok(()))) | Ok(Exit::Decoder) => {}
                Ok(Exit::Connector(Err(e))) => {
                    tracing::error!(error = %e, "vessel connector failed");
                    failure.get_or_insert(VesselError::Bus(e));
                }
                Ok(Exit::Scheduler(s)) => summary = Some(s),
                Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                Err(e) => {
                    failure.get_or_insert(VesselError::Task("vessel", e.to_string()));
                }
            }
        }
        tracing::info!(service = %service_name, "vessel stopped");

        match (failure, summary) {
            (Some(e), _) => Err(e),
            (None, Some(summary)) => Ok(summary),
            (None, None) => Err(VesselError::Task("scheduler", "exited without summary".into())),
        }
    }
}
