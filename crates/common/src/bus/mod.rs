//! Message bus capabilities consumed by the agent.
//!
//! The agent needs subject-based publish/subscribe, request/reply,
//! "micro-service" registration with a bus-assigned id, and a bucketed
//! object store with a change feed. [`Bus`] and [`ObjectStore`] describe
//! exactly that surface. [`MemoryBus`] implements it in-process; the `nats`
//! feature adds an adapter over a NATS server.
//!
//! RPC errors travel out of band in message headers, never in the payload
//! of a successful reply.

mod memory;
#[cfg(feature = "nats")]
mod nats;
mod store;

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;

pub use memory::{MemoryBus, MemoryObjectStore};
#[cfg(feature = "nats")]
pub use nats::{NatsBus, NatsOptions};
pub use store::{
    is_valid_bucket_name, Object, ObjectInfo, ObjectKind, ObjectMeta, ObjectStore, StoreError,
    StoreStatus, WatchEvent, Watcher, FILE_TYPE_KEY, LINK_TARGET_KEY,
};

/// Header carrying the description of a service error.
pub const SERVICE_ERROR_HEADER: &str = "Nats-Service-Error";
/// Header carrying the code of a service error.
pub const SERVICE_ERROR_CODE_HEADER: &str = "Nats-Service-Error-Code";

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("failed to connect: {0}")]
    Connect(String),
    #[error("no responders available for {0}")]
    NoResponders(String),
    #[error("request to {0} timed out")]
    Timeout(String),
    #[error("failed to publish to {subject}: {reason}")]
    Publish { subject: String, reason: String },
    #[error("failed to subscribe to {subject}: {reason}")]
    Subscribe { subject: String, reason: String },
    #[error("service error: {0}")]
    Service(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type Headers = BTreeMap<String, String>;

/// A message as delivered to a subscriber.
#[derive(Clone)]
pub struct Message {
    pub subject: String,
    pub reply: Option<String>,
    pub headers: Headers,
    pub payload: Bytes,
}

impl Message {
    pub fn new(subject: impl Into<String>, payload: Bytes) -> Self {
        Self {
            subject: subject.into(),
            reply: None,
            headers: Headers::new(),
            payload,
        }
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("subject", &self.subject)
            .field("reply", &self.reply)
            .field("headers", &self.headers)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Error reported by a service endpoint: `{code, description, data}`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {description}")]
pub struct ServiceError {
    pub code: String,
    pub description: String,
    pub data: Bytes,
}

impl ServiceError {
    pub fn new(code: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            description: description.into(),
            data: Bytes::new(),
        }
    }

    /// Recover an error from reply headers, if the reply carries one.
    pub fn from_headers(headers: &Headers, payload: &Bytes) -> Option<Self> {
        let code = headers.get(SERVICE_ERROR_CODE_HEADER)?;
        Some(Self {
            code: code.clone(),
            description: headers
                .get(SERVICE_ERROR_HEADER)
                .cloned()
                .unwrap_or_default(),
            data: payload.clone(),
        })
    }

    pub fn to_headers(&self) -> Headers {
        let mut headers = Headers::new();
        headers.insert(SERVICE_ERROR_CODE_HEADER.to_string(), self.code.clone());
        headers.insert(SERVICE_ERROR_HEADER.to_string(), self.description.clone());
        headers
    }
}

/// Outcome of a request: the reply payload or an out-of-band error.
pub type Reply = Result<Bytes, ServiceError>;

/// Stream of messages on one subject. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    subject: String,
    rx: flume::Receiver<Message>,
}

impl Subscription {
    pub fn new(subject: impl Into<String>, rx: flume::Receiver<Message>) -> Self {
        Self {
            subject: subject.into(),
            rx,
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub async fn next(&mut self) -> Option<Message> {
        self.rx.recv_async().await.ok()
    }

    pub fn into_stream(self) -> impl Stream<Item = Message> + Send + 'static {
        self.rx.into_stream()
    }
}

/// Registration parameters for a micro-service.
#[derive(Debug, Clone, Default)]
pub struct ServiceConfig {
    pub name: String,
    pub version: String,
    pub description: Option<String>,
    pub metadata: HashMap<String, String>,
}

/// A registered micro-service. The bus assigns [`Service::id`].
#[async_trait]
pub trait Service: Send + Sync + fmt::Debug {
    fn id(&self) -> &str;

    fn name(&self) -> &str;

    /// Install an endpoint listening on `subject`.
    async fn add_endpoint(&self, name: &str, subject: &str) -> Result<Endpoint, BusError>;

    /// Deregister the service and close its endpoints.
    async fn stop(&self) -> Result<(), BusError>;
}

/// Requests arriving at one service endpoint.
#[derive(Debug)]
pub struct Endpoint {
    name: String,
    rx: flume::Receiver<ServiceRequest>,
}

impl Endpoint {
    pub fn new(name: impl Into<String>, rx: flume::Receiver<ServiceRequest>) -> Self {
        Self {
            name: name.into(),
            rx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn next(&mut self) -> Option<ServiceRequest> {
        self.rx.recv_async().await.ok()
    }

    pub fn into_stream(self) -> impl Stream<Item = ServiceRequest> + Send + 'static {
        self.rx.into_stream()
    }
}

/// Sends the single reply a service request is owed.
#[async_trait]
pub trait Responder: Send + Sync {
    async fn respond(self: Box<Self>, reply: Reply) -> Result<(), BusError>;
}

/// An inbound request together with the means to answer it.
pub struct ServiceRequest {
    endpoint: String,
    message: Message,
    responder: Box<dyn Responder>,
}

impl ServiceRequest {
    pub fn new(endpoint: impl Into<String>, message: Message, responder: Box<dyn Responder>) -> Self {
        Self {
            endpoint: endpoint.into(),
            message,
            responder,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn payload(&self) -> &Bytes {
        &self.message.payload
    }

    pub async fn respond(self, reply: Reply) -> Result<(), BusError> {
        self.responder.respond(reply).await
    }
}

impl fmt::Debug for ServiceRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceRequest")
            .field("endpoint", &self.endpoint)
            .field("message", &self.message)
            .finish()
    }
}

#[async_trait]
pub trait Bus: Send + Sync + fmt::Debug {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), BusError>;

    /// Send a request and wait for its reply.
    async fn request(&self, subject: &str, payload: Bytes) -> Result<Reply, BusError>;

    async fn subscribe(&self, subject: &str) -> Result<Subscription, BusError>;

    async fn add_service(&self, config: ServiceConfig) -> Result<Box<dyn Service>, BusError>;

    /// Open an existing object store bucket.
    async fn object_store(
        &self,
        bucket: &str,
    ) -> Result<std::sync::Arc<dyn ObjectStore>, StoreError>;

    async fn create_object_store(
        &self,
        bucket: &str,
    ) -> Result<std::sync::Arc<dyn ObjectStore>, StoreError>;

    async fn delete_object_store(&self, bucket: &str) -> Result<(), StoreError>;
}
