//! Operator-side client for a running vessel and its workers.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use common::bus::{Bus, BusError, ServiceError, Subscription};
use common::protocol::{
    data_subject, rpc_subject, stdin_subject, stdout_subject, Action, CreateWorkerRequest,
    DestroyWorkerRequest, ErrorCode, ExecuteRequest, GetWorkerRequest, GetWorkerResponse,
    ProtocolError, RpcError, VesselRequest, VesselResponse, WireMessage, WorkerRequest,
    WorkerResponse,
};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Rpc(RpcError),
    #[error("remote error {0}")]
    Remote(ServiceError),
    #[error("unexpected {0:?} response")]
    UnexpectedResponse(Action),
    #[error("worker {0} did not start in time")]
    Timeout(u64),
}

impl ClientError {
    /// Protocol error code carried by this error, if any.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            ClientError::Rpc(e) => Some(e.code),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct VesselClient {
    bus: Arc<dyn Bus>,
    service_name: String,
    poll_interval: Duration,
}

impl VesselClient {
    pub fn new(bus: Arc<dyn Bus>, service_name: impl Into<String>) -> Self {
        Self {
            bus,
            service_name: service_name.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    async fn call<Req: WireMessage, Resp: WireMessage>(
        &self,
        subject: &str,
        request: Req,
    ) -> Result<Resp, ClientError> {
        let reply = self.bus.request(subject, request.encode()?).await?;
        match reply {
            Ok(payload) => Ok(Resp::decode(&payload)?),
            Err(e) => Err(match RpcError::from_service(&e) {
                Some(rpc) => ClientError::Rpc(rpc),
                None => ClientError::Remote(e),
            }),
        }
    }

    async fn vessel(&self, request: impl Into<VesselRequest>) -> Result<VesselResponse, ClientError> {
        let request: VesselRequest = request.into();
        self.call(&rpc_subject(&self.service_name), request).await
    }

    pub async fn create_worker(&self) -> Result<u64, ClientError> {
        match self.vessel(CreateWorkerRequest {}).await? {
            VesselResponse::CreateWorker(response) => Ok(response.id),
            other => Err(ClientError::UnexpectedResponse(other.action())),
        }
    }

    pub async fn destroy_worker(&self, id: u64) -> Result<(), ClientError> {
        match self.vessel(DestroyWorkerRequest { id }).await? {
            VesselResponse::DestroyWorker(_) => Ok(()),
            other => Err(ClientError::UnexpectedResponse(other.action())),
        }
    }

    pub async fn get_worker(&self, id: u64) -> Result<GetWorkerResponse, ClientError> {
        match self.vessel(GetWorkerRequest { id }).await? {
            VesselResponse::GetWorker(response) => Ok(response),
            other => Err(ClientError::UnexpectedResponse(other.action())),
        }
    }

    /// Poll [`get_worker`](Self::get_worker) until the worker has registered.
    pub async fn wait_worker(
        &self,
        id: u64,
        timeout: Duration,
    ) -> Result<GetWorkerResponse, ClientError> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.get_worker(id).await {
                Err(e) if e.code() == Some(ErrorCode::WorkerStarting) => {
                    if Instant::now() >= deadline {
                        return Err(ClientError::Timeout(id));
                    }
                    tokio::time::sleep(self.poll_interval).await;
                }
                other => return other,
            }
        }
    }

    /// Run the bundle at `file_path` in `repository` on worker `id` and
    /// return the script's exit code.
    pub async fn execute(
        &self,
        id: u64,
        repository: &str,
        file_path: &str,
    ) -> Result<i64, ClientError> {
        let request = WorkerRequest::from(ExecuteRequest {
            repository: repository.to_string(),
            file_path: file_path.to_string(),
        });
        let subject = data_subject(&self.service_name, id);
        let response: WorkerResponse = self.call(&subject, request).await?;
        match response {
            WorkerResponse::Execute(response) => Ok(response.code),
        }
    }

    /// Send raw bytes to the worker's stdin.
    pub async fn write_stdin(&self, id: u64, data: Bytes) -> Result<(), ClientError> {
        let subject = stdin_subject(&self.service_name, id);
        match self.bus.request(&subject, data).await? {
            Ok(_) => Ok(()),
            Err(e) => Err(ClientError::Remote(e)),
        }
    }

    pub async fn subscribe_stdout(&self, id: u64) -> Result<Subscription, ClientError> {
        Ok(self
            .bus
            .subscribe(&stdout_subject(&self.service_name, id))
            .await?)
    }
}
