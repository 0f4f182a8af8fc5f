//! Wire protocol between operators, the vessel and its workers.
//!
//! Every payload is a bincode [`Frame`]: a numeric action tag followed by a
//! length-prefixed body holding the bincode encoding of the typed message.
//! Requests and their responses share the tag of their action. Errors never
//! travel inside a frame; they are sent out of band as a
//! [`ServiceError`](crate::bus::ServiceError) carrying one of the stable
//! [`ErrorCode`]s.
//!
//! To add a message, give it an [`Action`] tag, define its request and
//! response structs in [`messages`] and list it in the matching
//! `tagged_union!` block.

#[macro_use]
mod macros;
mod codes;
pub mod messages;

use serde::{Deserialize, Serialize};

pub use codes::{ErrorCode, RpcError};
pub use messages::*;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid message: {0}")]
    InvalidMessage(String),
    #[error("invalid action: {0}")]
    InvalidAction(u16),
    #[error("failed to encode message: {0}")]
    Encode(String),
}

impl ProtocolError {
    /// Stable code reported to the peer for this failure.
    pub fn code(&self) -> ErrorCode {
        match self {
            ProtocolError::InvalidMessage(_) => ErrorCode::InvalidMessage,
            ProtocolError::InvalidAction(_) => ErrorCode::InvalidAction,
            ProtocolError::Encode(_) => ErrorCode::NewResponseFailed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Action {
    CreateWorker = 1,
    DestroyWorker = 2,
    GetWorker = 3,
    Execute = 4,
}

impl TryFrom<u16> for Action {
    type Error = ProtocolError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Action::CreateWorker),
            2 => Ok(Action::DestroyWorker),
            3 => Ok(Action::GetWorker),
            4 => Ok(Action::Execute),
            other => Err(ProtocolError::InvalidAction(other)),
        }
    }
}

/// A message family that travels as a [`Frame`].
pub trait WireMessage: Sized + Send + 'static {
    fn encode(&self) -> Result<bytes::Bytes, ProtocolError>;

    fn decode(bytes: &[u8]) -> Result<Self, ProtocolError>;
}

/// Tagged envelope shared by every message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub action: u16,
    pub body: Vec<u8>,
}

impl Frame {
    pub fn new(action: Action, body: Vec<u8>) -> Self {
        Self {
            action: action as u16,
            body,
        }
    }

    pub fn action(&self) -> Result<Action, ProtocolError> {
        Action::try_from(self.action)
    }

    pub fn encode(&self) -> Result<bytes::Bytes, ProtocolError> {
        bincode::serialize(self)
            .map(bytes::Bytes::from)
            .map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Decode a frame, rejecting trailing bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        strict_decode(bytes)
    }

    /// Decode the body as `T`, rejecting trailing bytes.
    pub fn body_as<T: for<'de> Deserialize<'de>>(&self) -> Result<T, ProtocolError> {
        strict_decode(&self.body)
    }
}

/// Same layout as `bincode::serialize`, but the input must be consumed
/// exactly.
fn strict_decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, ProtocolError> {
    use bincode::Options;

    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .reject_trailing_bytes()
        .deserialize(bytes)
        .map_err(|e| ProtocolError::InvalidMessage(e.to_string()))
}

tagged_union! {
    /// Requests served on the vessel's RPC subject.
    pub enum VesselRequest {
        CreateWorker(CreateWorkerRequest),
        DestroyWorker(DestroyWorkerRequest),
        GetWorker(GetWorkerRequest),
    }
}

tagged_union! {
    /// Replies to [`VesselRequest`]s.
    pub enum VesselResponse {
        CreateWorker(CreateWorkerResponse),
        DestroyWorker(DestroyWorkerResponse),
        GetWorker(GetWorkerResponse),
    }
}

tagged_union! {
    /// Requests served on a worker's data subject.
    pub enum WorkerRequest {
        Execute(ExecuteRequest),
    }
}

tagged_union! {
    /// Replies to [`WorkerRequest`]s.
    pub enum WorkerResponse {
        Execute(ExecuteResponse),
    }
}

/// Subject of the vessel's RPC endpoint.
pub fn rpc_subject(service_name: &str) -> String {
    format!("{service_name}.RPC")
}

/// Subject carrying execute requests for one worker.
pub fn data_subject(service_name: &str, worker_id: u64) -> String {
    format!("{service_name}.{worker_id}.DATA")
}

/// Subject carrying raw stdin bytes for one worker.
pub fn stdin_subject(service_name: &str, worker_id: u64) -> String {
    format!("{service_name}.{worker_id}.STDIN")
}

/// Subject on which a worker publishes its stdout.
pub fn stdout_subject(service_name: &str, worker_id: u64) -> String {
    format!("{service_name}.{worker_id}.STDOUT")
}

/// Inbox prefix under which a service receives replies.
pub fn inbox_prefix(service_name: &str) -> String {
    format!("_INBOX_{service_name}")
}
