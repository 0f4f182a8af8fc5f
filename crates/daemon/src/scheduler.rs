//! Worker registry and lifecycle.
//!
//! The scheduler is a single task that owns the registry outright. It reacts
//! to decoded vessel RPCs and to lifecycle events sent up by worker
//! sessions; cancellation flows the other way, through one child token per
//! worker. A worker stays in the registry until its `Stopped` event has been
//! consumed, so on shutdown the scheduler keeps draining events until the
//! registry is empty.

use std::collections::HashMap;

use common::protocol::{
    CreateWorkerResponse, DestroyWorkerResponse, ErrorCode, GetWorkerResponse, RpcError,
    VesselRequest, VesselResponse,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::decoder::{Inbound, Outbound};
use crate::session::{StopReason, WorkerSpawner};

const EVENT_BUFFER: usize = 64;

/// Lifecycle notifications sent by worker sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    /// The worker's service is registered and reachable.
    Started {
        id: u64,
        service_name: String,
        service_id: String,
    },
    /// The worker has fully shut down. Sent exactly once per spawned worker.
    Stopped { id: u64, reason: StopReason },
}

/// Worker counts reported when the scheduler returns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerSummary {
    pub created: u64,
    pub stopped: u64,
}

#[derive(Debug)]
struct WorkerRecord {
    cancel: CancellationToken,
    /// `(service_name, service_id)` once the worker has registered.
    service: Option<(String, String)>,
}

#[derive(Debug)]
pub struct Scheduler<S> {
    spawner: S,
    last_id: u64,
    workers: HashMap<u64, WorkerRecord>,
    summary: SchedulerSummary,
}

impl<S: WorkerSpawner> Scheduler<S> {
    pub fn new(spawner: S) -> Self {
        Self {
            spawner,
            last_id: 0,
            workers: HashMap::new(),
            summary: SchedulerSummary::default(),
        }
    }

    /// Serve requests until `cancel` fires or the request channel closes,
    /// then stop every worker and wait for each of them to report back.
    pub async fn run(
        mut self,
        requests: flume::Receiver<Inbound<VesselRequest>>,
        responses: flume::Sender<Outbound<VesselResponse>>,
        cancel: CancellationToken,
    ) -> SchedulerSummary {
        let (events_tx, mut events_rx) = mpsc::channel(EVENT_BUFFER);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(event) = events_rx.recv() => self.handle_event(event),
                inbound = requests.recv_async() => match inbound {
                    Ok(inbound) => {
                        let result = self.handle_request(&inbound.request, &events_tx, &cancel);
                        if responses.send(inbound.respond(result)).is_err() {
                            tracing::debug!("decoder gone, dropping reply");
                        }
                    }
                    Err(_) => break,
                },
            }
        }

        tracing::info!(workers = self.workers.len(), "scheduler shutting down");
        for record in self.workers.values() {
            record.cancel.cancel();
        }
        while !self.workers.is_empty() {
            match events_rx.recv().await {
                Some(event) => self.handle_event(event),
                None => break,
            }
        }
        tracing::info!(
            created = self.summary.created,
            stopped = self.summary.stopped,
            "scheduler stopped"
        );
        self.summary
    }

    fn handle_request(
        &mut self,
        request: &VesselRequest,
        events: &mpsc::Sender<WorkerEvent>,
        cancel: &CancellationToken,
    ) -> Result<VesselResponse, RpcError> {
        match request {
            VesselRequest::CreateWorker(_) => {
                self.last_id += 1;
                let id = self.last_id;
                let worker_cancel = cancel.child_token();
                self.spawner.spawn(id, worker_cancel.clone(), events.clone());
                self.workers.insert(
                    id,
                    WorkerRecord {
                        cancel: worker_cancel,
                        service: None,
                    },
                );
                self.summary.created += 1;
                tracing::info!(worker_id = id, "worker created");
                Ok(CreateWorkerResponse { id }.into())
            }
            VesselRequest::DestroyWorker(request) => {
                let record = self
                    .workers
                    .get(&request.id)
                    .ok_or_else(|| ErrorCode::WorkerNotFound.error())?;
                tracing::info!(worker_id = request.id, "destroying worker");
                record.cancel.cancel();
                Ok(DestroyWorkerResponse {}.into())
            }
            VesselRequest::GetWorker(request) => {
                let record = self
                    .workers
                    .get(&request.id)
                    .ok_or_else(|| ErrorCode::WorkerNotFound.error())?;
                let (service_name, service_id) = record
                    .service
                    .clone()
                    .ok_or_else(|| ErrorCode::WorkerStarting.error())?;
                Ok(GetWorkerResponse {
                    service_name,
                    service_id,
                }
                .into())
            }
        }
    }

    fn handle_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Started {
                id,
                service_name,
                service_id,
            } => match self.workers.get_mut(&id) {
                Some(record) => {
                    tracing::info!(worker_id = id, service_id = %service_id, "worker started");
                    record.service = Some((service_name, service_id));
                }
                None => tracing::debug!(worker_id = id, "started event for unknown worker"),
            },
            WorkerEvent::Stopped { id, reason } => {
                if let Some(record) = self.workers.remove(&id) {
                    record.cancel.cancel();
                    self.summary.stopped += 1;
                }
                match reason {
                    StopReason::Cancelled => tracing::info!(worker_id = id, "worker stopped"),
                    reason => tracing::error!(worker_id = id, %reason, "worker stopped"),
                }
            }
        }
    }
}
