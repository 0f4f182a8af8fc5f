//! Worker sessions.
//!
//! A session wires one worker's pipeline together:
//!
//! ```text
//! bus ─▶ connector ─▶ decoder ─▶ processor ─▶ publisher ─▶ bus
//!                        ▲            │
//!                        └─ replies ──┘
//! ```
//!
//! Each stage runs in its own task with its own cancellation token, so that
//! shutdown can proceed front to back: the connector stops accepting work
//! first, the publisher flushes last. Whatever happens inside, the session
//! reports exactly one [`WorkerEvent::Stopped`] to the scheduler.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use common::bus::{Bus, ServiceConfig};
use common::protocol::{data_subject, stdin_subject, stdout_subject};
use common::vfs::{LocalFs, MemFs, MuxFs};
use futures::FutureExt;
use object_store::{RepositoryClient, RepositoryFs};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::VesselConfig;
use crate::connector::Connector;
use crate::decoder::WorkerDecoder;
use crate::engine::{bootstrap, Code, EngineError};
use crate::processor::Processor;
use crate::publisher::Publisher;
use crate::scheduler::WorkerEvent;
use crate::STAGE_BUFFER;

/// Why a worker stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    Cancelled,
    Failed(String),
    Panicked(String),
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Cancelled => f.write_str("cancelled"),
            StopReason::Failed(e) => write!(f, "failed: {e}"),
            StopReason::Panicked(msg) => write!(f, "panicked: {msg}"),
        }
    }
}

/// Starts workers on behalf of the scheduler.
///
/// Implementations must eventually send exactly one
/// [`WorkerEvent::Stopped`] for every call, and should send
/// [`WorkerEvent::Started`] before it once the worker is reachable.
pub trait WorkerSpawner: Send + Sync + 'static {
    fn spawn(&self, worker_id: u64, cancel: CancellationToken, events: mpsc::Sender<WorkerEvent>);
}

/// Spawns real worker sessions on the bus.
#[derive(Debug, Clone)]
pub struct SessionSpawner {
    bus: Arc<dyn Bus>,
    config: Arc<VesselConfig>,
    code: Code,
}

impl SessionSpawner {
    pub fn new(bus: Arc<dyn Bus>, config: Arc<VesselConfig>) -> Result<Self, EngineError> {
        Ok(Self {
            bus,
            config,
            code: bootstrap()?,
        })
    }
}

impl WorkerSpawner for SessionSpawner {
    fn spawn(&self, worker_id: u64, cancel: CancellationToken, events: mpsc::Sender<WorkerEvent>) {
        let session = Session {
            worker_id,
            bus: self.bus.clone(),
            config: self.config.clone(),
            code: self.code.clone(),
        };
        tokio::spawn(async move {
            let reason = match AssertUnwindSafe(session.run(cancel, &events))
                .catch_unwind()
                .await
            {
                Ok(reason) => reason,
                Err(panic) => StopReason::Panicked(panic_message(panic.as_ref())),
            };
            // never select on cancellation here: the scheduler waits for this
            if events
                .send(WorkerEvent::Stopped {
                    id: worker_id,
                    reason,
                })
                .await
                .is_err()
            {
                tracing::debug!(worker_id, "scheduler gone before stop event");
            }
        });
    }
}

struct Session {
    worker_id: u64,
    bus: Arc<dyn Bus>,
    config: Arc<VesselConfig>,
    code: Code,
}

impl Session {
    async fn run(self, cancel: CancellationToken, events: &mpsc::Sender<WorkerEvent>) -> StopReason {
        let worker_id = self.worker_id;
        let service_name = self.config.service_name.clone();

        let connector_cancel = CancellationToken::new();
        let decoder_cancel = CancellationToken::new();
        let processor_cancel = CancellationToken::new();
        let publisher_cancel = CancellationToken::new();

        let (raw_tx, raw_rx) = flume::bounded(STAGE_BUFFER);
        let (request_tx, request_rx) = flume::bounded(STAGE_BUFFER);
        let (response_tx, response_rx) = flume::unbounded();
        let (stdin_tx, stdin_rx) = flume::bounded(STAGE_BUFFER);
        let (stdout_tx, stdout_rx) = flume::bounded(STAGE_BUFFER);
        let (registered_tx, registered_rx) = oneshot::channel();

        let publisher = Publisher::new(self.bus.clone(), stdout_subject(&service_name, worker_id));
        let publisher = tokio::spawn(publisher.run(stdout_rx, publisher_cancel.clone()));

        let processor = Processor::new(
            worker_id,
            RepositoryClient::new(self.bus.clone()),
            Arc::new(self.filesystem(processor_cancel.clone())),
            self.code.clone(),
        )
        .with_env(self.config.env.clone());
        let processor = tokio::spawn(processor.run(
            request_rx,
            response_tx,
            stdin_rx,
            stdout_tx,
            processor_cancel.clone(),
        ));

        let decoder = WorkerDecoder::new().with_raw_endpoint("stdin", stdin_tx);
        let decoder = tokio::spawn(decoder.run(raw_rx, request_tx, response_rx, decoder_cancel.clone()));

        let connector = Connector::new(self.bus.clone(), self.service_config())
            .with_endpoint("data", data_subject(&service_name, worker_id))
            .with_endpoint("stdin", stdin_subject(&service_name, worker_id));
        let session_cancel = cancel.clone();
        let connector_token = connector_cancel.clone();
        let connector: JoinHandle<Result<(), common::bus::BusError>> = tokio::spawn(async move {
            // the session ends with its connector
            let _guard = session_cancel.drop_guard();
            connector.run(raw_tx, Some(registered_tx), connector_token).await
        });

        let registered = tokio::select! {
            _ = cancel.cancelled() => None,
            id = registered_rx => id.ok(),
        };
        if let Some(service_id) = registered {
            let started = WorkerEvent::Started {
                id: worker_id,
                service_name: service_name.clone(),
                service_id,
            };
            if events.send(started).await.is_err() {
                tracing::debug!(worker_id, "scheduler gone before start event");
            }
            cancel.cancelled().await;
        }

        tracing::debug!(worker_id, "stopping worker session");
        let mut reason = StopReason::Cancelled;
        connector_cancel.cancel();
        match connector.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::error!(worker_id, error = %e, "connector failed");
                reason = StopReason::Failed(e.to_string());
            }
            Err(e) => reason = join_failure(e),
        }
        for (stage, token, handle) in [
            ("decoder", decoder_cancel, decoder),
            ("processor", processor_cancel, processor),
            ("publisher", publisher_cancel, publisher),
        ] {
            token.cancel();
            if let Err(e) = handle.await {
                tracing::error!(worker_id, stage, error = %e, "stage task failed");
                if reason == StopReason::Cancelled {
                    reason = join_failure(e);
                }
            }
        }
        reason
    }

    fn service_config(&self) -> ServiceConfig {
        ServiceConfig {
            name: self.config.service_name.clone(),
            version: self.config.version.clone(),
            description: self.config.description.clone(),
            metadata: HashMap::from([("worker_id".to_string(), self.worker_id.to_string())]),
        }
    }

    /// The filesystems scripts see: local files, every repository on the
    /// bus, and optionally an in-memory scratch space used as working dir.
    fn filesystem(&self, cancel: CancellationToken) -> MuxFs {
        let repositories = RepositoryFs::new(self.bus.clone())
            .with_sync_timeout(self.config.sync_timeout())
            .with_cancel(cancel);
        let fs = MuxFs::new()
            .with_backend("file", Arc::new(LocalFs::new()))
            .with_backend("nats", Arc::new(repositories));
        if self.config.mem_scratch {
            fs.with_backend("mem", Arc::new(MemFs::new()))
                .with_working_dir("mem:///")
        } else {
            fs
        }
    }
}

fn join_failure(e: tokio::task::JoinError) -> StopReason {
    if e.is_panic() {
        StopReason::Panicked(panic_message(e.into_panic().as_ref()))
    } else {
        StopReason::Failed(e.to_string())
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use common::bus::MemoryBus;
    use common::protocol::{
        ExecuteRequest, ExecuteResponse, WireMessage, WorkerRequest, WorkerResponse,
    };

    use super::*;
    use crate::testing::bundle;

    fn config() -> Arc<VesselConfig> {
        Arc::new(VesselConfig {
            service_name: "agent".to_string(),
            ..Default::default()
        })
    }

    async fn started(events: &mut mpsc::Receiver<WorkerEvent>) -> String {
        match events.recv().await.unwrap() {
            WorkerEvent::Started {
                id,
                service_name,
                service_id,
            } => {
                assert_eq!(id, 1);
                assert_eq!(service_name, "agent");
                service_id
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_session_executes_and_publishes_stdout() {
        let bus: Arc<dyn Bus> = Arc::new(MemoryBus::new());
        let repos = RepositoryClient::new(bus.clone());
        repos.create_repository("r1").await.unwrap();
        repos
            .put_file(
                "r1",
                "/scripts/hello.fzz",
                bundle(&[("main.risor", r#"print("hi"); exit(2);"#)]),
            )
            .await
            .unwrap();

        let spawner = SessionSpawner::new(bus.clone(), config()).unwrap();
        let (events_tx, mut events_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        spawner.spawn(1, cancel.clone(), events_tx);
        assert!(!started(&mut events_rx).await.is_empty());

        let mut stdout = bus.subscribe("agent.1.STDOUT").await.unwrap();
        let request = WorkerRequest::from(ExecuteRequest {
            repository: "r1".to_string(),
            file_path: "/scripts/hello.fzz".to_string(),
        });
        let reply = bus
            .request("agent.1.DATA", request.encode().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            WorkerResponse::decode(&reply).unwrap(),
            WorkerResponse::Execute(ExecuteResponse { code: 2 })
        );
        assert_eq!(stdout.next().await.unwrap().payload, Bytes::from_static(b"hi\n"));

        cancel.cancel();
        assert_eq!(
            events_rx.recv().await.unwrap(),
            WorkerEvent::Stopped {
                id: 1,
                reason: StopReason::Cancelled
            }
        );
        let err = bus.request("agent.1.DATA", Bytes::new()).await.unwrap_err();
        assert!(matches!(err, common::bus::BusError::NoResponders(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_interrupts_a_running_script() {
        let bus: Arc<dyn Bus> =
            Arc::new(MemoryBus::new().with_request_timeout(Duration::from_secs(1)));
        let repos = RepositoryClient::new(bus.clone());
        repos.create_repository("r1").await.unwrap();
        repos
            .put_file(
                "r1",
                "/scripts/spin.fzz",
                bundle(&[("main.risor", "let n = 0; loop { n += 1; }")]),
            )
            .await
            .unwrap();

        let spawner = SessionSpawner::new(bus.clone(), config()).unwrap();
        let (events_tx, mut events_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        spawner.spawn(1, cancel.clone(), events_tx);
        started(&mut events_rx).await;

        let request = WorkerRequest::from(ExecuteRequest {
            repository: "r1".to_string(),
            file_path: "/scripts/spin.fzz".to_string(),
        });
        let caller = {
            let bus = bus.clone();
            tokio::spawn(async move { bus.request("agent.1.DATA", request.encode().unwrap()).await })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();

        let stopped = tokio::time::timeout(Duration::from_secs(10), events_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(stopped, WorkerEvent::Stopped { id: 1, .. }));
        // the interrupted request is answered or times out, never left hanging
        let _ = caller.await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_before_registration_still_reports_stop() {
        let bus: Arc<dyn Bus> = Arc::new(MemoryBus::new());
        let spawner = SessionSpawner::new(bus, config()).unwrap();
        let (events_tx, mut events_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        cancel.cancel();
        spawner.spawn(7, cancel, events_tx);

        loop {
            match events_rx.recv().await.unwrap() {
                WorkerEvent::Started { .. } => continue,
                WorkerEvent::Stopped { id, reason } => {
                    assert_eq!(id, 7);
                    assert_eq!(reason, StopReason::Cancelled);
                    break;
                }
            }
        }
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
        let payload: Box<dyn Any + Send> = Box::new(3_u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }
}
