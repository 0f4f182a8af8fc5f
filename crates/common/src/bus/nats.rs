//! NATS adapter: core pub/sub and request/reply, the micro-service API and
//! JetStream object store buckets.

use std::sync::Arc;
use std::time::Duration;

use async_nats::jetstream;
use async_nats::jetstream::object_store as js_store;
use async_nats::service::ServiceExt;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::io::AsyncRead;
use tokio::sync::Mutex;

use super::{
    Bus, BusError, Endpoint, Headers, Message, Object, ObjectInfo, ObjectMeta, ObjectStore, Reply,
    Responder, Service, ServiceConfig, ServiceError, ServiceRequest, StoreError, StoreStatus,
    Subscription, WatchEvent, Watcher, SERVICE_ERROR_CODE_HEADER, SERVICE_ERROR_HEADER,
};

const ENDPOINT_BUFFER: usize = 16;

/// Connection parameters.
#[derive(Clone, Default)]
pub struct NatsOptions {
    pub name: String,
    pub servers: Vec<String>,
    pub jwt: Option<String>,
    pub seed: Option<String>,
    pub inbox_prefix: Option<String>,
    pub request_timeout: Option<Duration>,
}

impl std::fmt::Debug for NatsOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NatsOptions")
            .field("name", &self.name)
            .field("servers", &self.servers)
            .field("jwt", &self.jwt.as_ref().map(|_| "<redacted>"))
            .field("seed", &self.seed.as_ref().map(|_| "<redacted>"))
            .field("inbox_prefix", &self.inbox_prefix)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

fn credentials_text(jwt: &str, seed: &str) -> String {
    format!(
        "-----BEGIN NATS USER JWT-----\n{jwt}\n------END NATS USER JWT------\n\n\
         -----BEGIN USER NKEY SEED-----\n{seed}\n------END USER NKEY SEED------\n"
    )
}

#[derive(Clone)]
pub struct NatsBus {
    client: async_nats::Client,
    jetstream: jetstream::Context,
}

impl std::fmt::Debug for NatsBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NatsBus").finish_non_exhaustive()
    }
}

impl NatsBus {
    pub async fn connect(options: &NatsOptions) -> Result<Self, BusError> {
        let mut connect = match (&options.jwt, &options.seed) {
            (Some(jwt), Some(seed)) => {
                async_nats::ConnectOptions::with_credentials(&credentials_text(jwt, seed))
                    .map_err(|e| BusError::Connect(e.to_string()))?
            }
            _ => async_nats::ConnectOptions::new(),
        };
        if !options.name.is_empty() {
            connect = connect.name(&options.name);
        }
        if let Some(prefix) = &options.inbox_prefix {
            connect = connect.custom_inbox_prefix(prefix);
        }
        if let Some(timeout) = options.request_timeout {
            connect = connect.request_timeout(Some(timeout));
        }

        let addrs = options
            .servers
            .iter()
            .map(|server| server.parse::<async_nats::ServerAddr>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| BusError::Connect(e.to_string()))?;
        let client = connect
            .connect(addrs.as_slice())
            .await
            .map_err(|e| BusError::Connect(e.to_string()))?;
        tracing::info!(servers = ?options.servers, "connected to nats");
        Ok(Self {
            jetstream: jetstream::new(client.clone()),
            client,
        })
    }
}

fn convert_message(message: async_nats::Message) -> Message {
    let mut headers = Headers::new();
    if let Some(map) = &message.headers {
        for key in [SERVICE_ERROR_HEADER, SERVICE_ERROR_CODE_HEADER] {
            if let Some(value) = map.get(key) {
                headers.insert(key.to_string(), value.as_str().to_string());
            }
        }
    }
    Message {
        subject: message.subject.to_string(),
        reply: message.reply.map(|r| r.to_string()),
        headers,
        payload: message.payload,
    }
}

#[async_trait]
impl Bus for NatsBus {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), BusError> {
        self.client
            .publish(subject.to_string(), payload)
            .await
            .map_err(|e| BusError::Publish {
                subject: subject.to_string(),
                reason: e.to_string(),
            })
    }

    async fn request(&self, subject: &str, payload: Bytes) -> Result<Reply, BusError> {
        use async_nats::RequestErrorKind;

        match self.client.request(subject.to_string(), payload).await {
            Ok(message) => {
                let message = convert_message(message);
                match ServiceError::from_headers(&message.headers, &message.payload) {
                    Some(err) => Ok(Err(err)),
                    None => Ok(Ok(message.payload)),
                }
            }
            Err(err) => match err.kind() {
                RequestErrorKind::NoResponders => Err(BusError::NoResponders(subject.to_string())),
                RequestErrorKind::TimedOut => Err(BusError::Timeout(subject.to_string())),
                _ => Err(BusError::Publish {
                    subject: subject.to_string(),
                    reason: err.to_string(),
                }),
            },
        }
    }

    async fn subscribe(&self, subject: &str) -> Result<Subscription, BusError> {
        let mut subscriber = self
            .client
            .subscribe(subject.to_string())
            .await
            .map_err(|e| BusError::Subscribe {
                subject: subject.to_string(),
                reason: e.to_string(),
            })?;
        let (tx, rx) = flume::unbounded();
        tokio::spawn(async move {
            while let Some(message) = subscriber.next().await {
                if tx.send_async(convert_message(message)).await.is_err() {
                    break;
                }
            }
            let _ = subscriber.unsubscribe().await;
        });
        Ok(Subscription::new(subject, rx))
    }

    async fn add_service(&self, config: ServiceConfig) -> Result<Box<dyn Service>, BusError> {
        let mut builder = self.client.service_builder();
        if let Some(description) = &config.description {
            builder = builder.description(description.clone());
        }
        if !config.metadata.is_empty() {
            builder = builder.metadata(config.metadata.clone());
        }
        let service = builder
            .start(config.name.clone(), config.version.clone())
            .await
            .map_err(|e| BusError::Service(e.to_string()))?;
        let id = service.info().await.id;
        Ok(Box::new(NatsService {
            id,
            name: config.name,
            service: Mutex::new(Some(service)),
        }))
    }

    async fn object_store(&self, bucket: &str) -> Result<Arc<dyn ObjectStore>, StoreError> {
        let store = self
            .jetstream
            .get_object_store(bucket)
            .await
            .map_err(|e| {
                tracing::debug!(bucket, error = %e, "object store lookup failed");
                StoreError::BucketNotFound(bucket.to_string())
            })?;
        Ok(Arc::new(NatsObjectStore {
            bucket: bucket.to_string(),
            store,
        }))
    }

    async fn create_object_store(&self, bucket: &str) -> Result<Arc<dyn ObjectStore>, StoreError> {
        if !super::is_valid_bucket_name(bucket) {
            return Err(StoreError::InvalidBucketName(bucket.to_string()));
        }
        if self.jetstream.get_object_store(bucket).await.is_ok() {
            return Err(StoreError::BucketExists(bucket.to_string()));
        }
        let store = self
            .jetstream
            .create_object_store(js_store::Config {
                bucket: bucket.to_string(),
                ..Default::default()
            })
            .await
            .map_err(|e| StoreError::Other(e.to_string()))?;
        Ok(Arc::new(NatsObjectStore {
            bucket: bucket.to_string(),
            store,
        }))
    }

    async fn delete_object_store(&self, bucket: &str) -> Result<(), StoreError> {
        if self.jetstream.get_object_store(bucket).await.is_err() {
            return Err(StoreError::BucketNotFound(bucket.to_string()));
        }
        self.jetstream
            .delete_object_store(bucket)
            .await
            .map_err(|e| StoreError::Other(e.to_string()))
    }
}

struct NatsService {
    id: String,
    name: String,
    service: Mutex<Option<async_nats::service::Service>>,
}

impl std::fmt::Debug for NatsService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NatsService")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

#[async_trait]
impl Service for NatsService {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn add_endpoint(&self, name: &str, subject: &str) -> Result<Endpoint, BusError> {
        let guard = self.service.lock().await;
        let service = guard
            .as_ref()
            .ok_or_else(|| BusError::Service(format!("service {} stopped", self.id)))?;
        let mut endpoint = service
            .endpoint_builder()
            .name(name)
            .add(subject.to_string())
            .await
            .map_err(|e| BusError::Service(e.to_string()))?;

        let (tx, rx) = flume::bounded(ENDPOINT_BUFFER);
        let endpoint_name = name.to_string();
        tokio::spawn(async move {
            while let Some(request) = endpoint.next().await {
                let message = convert_message(request.message.clone());
                let responder = NatsResponder { request };
                let request = ServiceRequest::new(endpoint_name.clone(), message, Box::new(responder));
                if tx.send_async(request).await.is_err() {
                    break;
                }
            }
        });
        Ok(Endpoint::new(name, rx))
    }

    async fn stop(&self) -> Result<(), BusError> {
        if let Some(service) = self.service.lock().await.take() {
            service
                .stop()
                .await
                .map_err(|e| BusError::Service(e.to_string()))?;
        }
        Ok(())
    }
}

struct NatsResponder {
    request: async_nats::service::Request,
}

#[async_trait]
impl Responder for NatsResponder {
    async fn respond(self: Box<Self>, reply: Reply) -> Result<(), BusError> {
        let reply = reply.map_err(|err| async_nats::service::error::Error {
            code: err.code.parse().unwrap_or(500),
            status: err.description,
        });
        self.request
            .respond(reply)
            .await
            .map_err(|e| BusError::Service(e.to_string()))
    }
}

struct NatsObjectStore {
    bucket: String,
    store: js_store::ObjectStore,
}

impl std::fmt::Debug for NatsObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NatsObjectStore")
            .field("bucket", &self.bucket)
            .finish()
    }
}

fn convert_info(info: js_store::ObjectInfo) -> ObjectInfo {
    let modified = info
        .modified
        .and_then(|m| DateTime::<Utc>::from_timestamp(m.unix_timestamp(), m.nanosecond()))
        .unwrap_or_else(Utc::now);
    ObjectInfo {
        bucket: info.bucket,
        name: info.name,
        size: info.size as u64,
        modified,
        metadata: info.metadata,
        deleted: info.deleted,
    }
}

fn object_metadata(meta: ObjectMeta) -> js_store::ObjectMetadata {
    js_store::ObjectMetadata {
        name: meta.name,
        description: meta.description,
        metadata: meta.metadata,
        ..Default::default()
    }
}

impl NatsObjectStore {
    fn not_found_or_other(&self, name: &str, err: impl std::fmt::Display) -> StoreError {
        let text = err.to_string();
        if text.contains("not found") {
            StoreError::ObjectNotFound(name.to_string())
        } else {
            StoreError::Other(text)
        }
    }
}

#[async_trait]
impl ObjectStore for NatsObjectStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn put(&self, meta: ObjectMeta, data: Bytes) -> Result<ObjectInfo, StoreError> {
        let mut reader = std::io::Cursor::new(data);
        self.put_stream(meta, &mut reader).await
    }

    async fn put_stream(
        &self,
        meta: ObjectMeta,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<ObjectInfo, StoreError> {
        if meta.name.is_empty() {
            return Err(StoreError::InvalidObjectName(meta.name));
        }
        let mut reader = reader;
        let info = self
            .store
            .put(object_metadata(meta), &mut reader)
            .await
            .map_err(|e| StoreError::Other(e.to_string()))?;
        Ok(convert_info(info))
    }

    async fn get(&self, name: &str) -> Result<Object, StoreError> {
        let object = self
            .store
            .get(name)
            .await
            .map_err(|e| self.not_found_or_other(name, e))?;
        let info = convert_info(object.info().clone());
        Ok(Object::new(info, Box::new(object)))
    }

    async fn info(&self, name: &str) -> Result<ObjectInfo, StoreError> {
        let info = self
            .store
            .info(name)
            .await
            .map_err(|e| self.not_found_or_other(name, e))?;
        if info.deleted {
            return Err(StoreError::ObjectNotFound(name.to_string()));
        }
        Ok(convert_info(info))
    }

    async fn delete(&self, name: &str) -> Result<(), StoreError> {
        self.store
            .delete(name)
            .await
            .map_err(|e| self.not_found_or_other(name, e))
    }

    async fn list(&self) -> Result<Vec<ObjectInfo>, StoreError> {
        let mut list = self
            .store
            .list()
            .await
            .map_err(|e| StoreError::Other(e.to_string()))?;
        let mut objects = Vec::new();
        while let Some(info) = list.next().await {
            let info = info.map_err(|e| StoreError::Other(e.to_string()))?;
            if !info.deleted {
                objects.push(convert_info(info));
            }
        }
        Ok(objects)
    }

    async fn status(&self) -> Result<StoreStatus, StoreError> {
        let objects = self.list().await?;
        Ok(StoreStatus {
            bucket: self.bucket.clone(),
            objects: objects.len() as u64,
            size: objects.iter().map(|o| o.size).sum(),
        })
    }

    async fn update_meta(&self, name: &str, meta: ObjectMeta) -> Result<(), StoreError> {
        self.store
            .update_metadata(
                name,
                js_store::UpdateMetadata {
                    name: meta.name,
                    description: meta.description,
                    metadata: meta.metadata,
                    ..Default::default()
                },
            )
            .await
            .map(|_| ())
            .map_err(|e| self.not_found_or_other(name, e))
    }

    async fn watch(&self) -> Result<Watcher, StoreError> {
        // Subscribe to live updates before listing so nothing falls between.
        let mut live = self
            .store
            .watch()
            .await
            .map_err(|e| StoreError::Other(e.to_string()))?;
        let history = self.list().await?;

        let (tx, rx) = flume::unbounded();
        for info in history {
            let _ = tx.send(Ok(WatchEvent::Update(info)));
        }
        let _ = tx.send(Ok(WatchEvent::CaughtUp));
        tokio::spawn(async move {
            while let Some(update) = live.next().await {
                let event = update
                    .map(|info| WatchEvent::Update(convert_info(info)))
                    .map_err(|e| StoreError::Other(e.to_string()));
                if tx.send_async(event).await.is_err() {
                    break;
                }
            }
        });
        Ok(Watcher::new(rx))
    }
}
