//! In-process bus.
//!
//! Subjects match exactly; every live subscriber of a subject receives each
//! message. Requests get a private reply subject under the bus's inbox
//! prefix and fail fast with [`BusError::NoResponders`] when nobody listens.
//! Buckets keep their objects in memory and feed watchers under the bucket
//! lock, so a watcher sees history, then `CaughtUp`, then every later
//! change exactly once and in order.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{
    is_valid_bucket_name, Bus, BusError, Endpoint, Message, Object, ObjectInfo, ObjectMeta,
    ObjectStore, Reply, Responder, Service, ServiceConfig, ServiceError, ServiceRequest,
    StoreError, StoreStatus, Subscription, WatchEvent, Watcher,
};

const DEFAULT_INBOX_PREFIX: &str = "_INBOX";
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const ENDPOINT_BUFFER: usize = 16;

type Subscribers = HashMap<String, Vec<(u64, flume::Sender<Message>)>>;

#[derive(Debug)]
struct Inner {
    next_sid: AtomicU64,
    subscribers: Mutex<Subscribers>,
    buckets: Mutex<HashMap<String, Arc<MemoryObjectStore>>>,
}

/// Bus living entirely inside the process. Clones share subjects and
/// buckets.
#[derive(Debug, Clone)]
pub struct MemoryBus {
    inner: Arc<Inner>,
    inbox_prefix: Arc<str>,
    request_timeout: Duration,
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                next_sid: AtomicU64::new(1),
                subscribers: Mutex::new(HashMap::new()),
                buckets: Mutex::new(HashMap::new()),
            }),
            inbox_prefix: Arc::from(DEFAULT_INBOX_PREFIX),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// A handle on the same bus whose requests reply through `inbox_prefix`.
    pub fn with_inbox_prefix(&self, inbox_prefix: &str) -> Self {
        Self {
            inbox_prefix: Arc::from(inbox_prefix),
            ..self.clone()
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    fn subscribe_sync(&self, subject: &str) -> (u64, Subscription) {
        let sid = self.inner.next_sid.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = flume::unbounded();
        self.inner
            .subscribers
            .lock()
            .entry(subject.to_string())
            .or_default()
            .push((sid, tx));
        (sid, Subscription::new(subject, rx))
    }

    fn unsubscribe(&self, subject: &str, sid: u64) {
        let mut subscribers = self.inner.subscribers.lock();
        if let Some(subs) = subscribers.get_mut(subject) {
            subs.retain(|(id, _)| *id != sid);
            if subs.is_empty() {
                subscribers.remove(subject);
            }
        }
    }

    /// Deliver to every live subscriber; returns how many received it.
    fn deliver(&self, message: Message) -> usize {
        let mut subscribers = self.inner.subscribers.lock();
        let Some(subs) = subscribers.get_mut(&message.subject) else {
            return 0;
        };
        subs.retain(|(_, tx)| !tx.is_disconnected());
        let mut delivered = 0;
        for (_, tx) in subs.iter() {
            if tx.send(message.clone()).is_ok() {
                delivered += 1;
            }
        }
        if subs.is_empty() {
            subscribers.remove(&message.subject);
        }
        delivered
    }
}

#[async_trait]
impl Bus for MemoryBus {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), BusError> {
        self.deliver(Message::new(subject, payload));
        Ok(())
    }

    async fn request(&self, subject: &str, payload: Bytes) -> Result<Reply, BusError> {
        let inbox = format!("{}.{}", self.inbox_prefix, Uuid::new_v4().simple());
        let (sid, mut replies) = self.subscribe_sync(&inbox);

        let mut message = Message::new(subject, payload);
        message.reply = Some(inbox.clone());
        if self.deliver(message) == 0 {
            self.unsubscribe(&inbox, sid);
            return Err(BusError::NoResponders(subject.to_string()));
        }

        let reply = tokio::time::timeout(self.request_timeout, replies.next()).await;
        self.unsubscribe(&inbox, sid);
        match reply {
            Ok(Some(message)) => match ServiceError::from_headers(&message.headers, &message.payload) {
                Some(err) => Ok(Err(err)),
                None => Ok(Ok(message.payload)),
            },
            Ok(None) | Err(_) => Err(BusError::Timeout(subject.to_string())),
        }
    }

    async fn subscribe(&self, subject: &str) -> Result<Subscription, BusError> {
        Ok(self.subscribe_sync(subject).1)
    }

    async fn add_service(&self, config: ServiceConfig) -> Result<Box<dyn Service>, BusError> {
        if config.name.is_empty() {
            return Err(BusError::Service("service name is required".to_string()));
        }
        let service = MemoryService {
            id: Uuid::new_v4().simple().to_string(),
            config,
            bus: self.clone(),
            cancel: CancellationToken::new(),
            subscriptions: Mutex::new(Vec::new()),
        };
        tracing::debug!(service = %service.config.name, service_id = %service.id, "registered service");
        Ok(Box::new(service))
    }

    async fn object_store(&self, bucket: &str) -> Result<Arc<dyn ObjectStore>, StoreError> {
        let buckets = self.inner.buckets.lock();
        match buckets.get(bucket) {
            Some(store) => Ok(store.clone()),
            None => Err(StoreError::BucketNotFound(bucket.to_string())),
        }
    }

    async fn create_object_store(&self, bucket: &str) -> Result<Arc<dyn ObjectStore>, StoreError> {
        if !is_valid_bucket_name(bucket) {
            return Err(StoreError::InvalidBucketName(bucket.to_string()));
        }
        let mut buckets = self.inner.buckets.lock();
        if buckets.contains_key(bucket) {
            return Err(StoreError::BucketExists(bucket.to_string()));
        }
        let store = Arc::new(MemoryObjectStore::new(bucket));
        buckets.insert(bucket.to_string(), store.clone());
        Ok(store)
    }

    async fn delete_object_store(&self, bucket: &str) -> Result<(), StoreError> {
        let store = self
            .inner
            .buckets
            .lock()
            .remove(bucket)
            .ok_or_else(|| StoreError::BucketNotFound(bucket.to_string()))?;
        store.close();
        Ok(())
    }
}

#[derive(Debug)]
struct MemoryService {
    id: String,
    config: ServiceConfig,
    bus: MemoryBus,
    cancel: CancellationToken,
    subscriptions: Mutex<Vec<(String, u64)>>,
}

#[async_trait]
impl Service for MemoryService {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.config.name
    }

    async fn add_endpoint(&self, name: &str, subject: &str) -> Result<Endpoint, BusError> {
        if self.cancel.is_cancelled() {
            return Err(BusError::Service(format!("service {} stopped", self.id)));
        }
        let (sid, mut subscription) = self.bus.subscribe_sync(subject);
        self.subscriptions.lock().push((subject.to_string(), sid));

        let (tx, rx) = flume::bounded(ENDPOINT_BUFFER);
        let bus = self.bus.clone();
        let cancel = self.cancel.clone();
        let endpoint = name.to_string();
        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = cancel.cancelled() => break,
                    message = subscription.next() => match message {
                        Some(message) => message,
                        None => break,
                    },
                };
                let responder = MemoryResponder {
                    bus: bus.clone(),
                    reply: message.reply.clone(),
                };
                let request = ServiceRequest::new(endpoint.clone(), message, Box::new(responder));
                if tx.send_async(request).await.is_err() {
                    break;
                }
            }
        });
        Ok(Endpoint::new(name, rx))
    }

    async fn stop(&self) -> Result<(), BusError> {
        self.cancel.cancel();
        for (subject, sid) in self.subscriptions.lock().drain(..) {
            self.bus.unsubscribe(&subject, sid);
        }
        tracing::debug!(service = %self.config.name, service_id = %self.id, "stopped service");
        Ok(())
    }
}

struct MemoryResponder {
    bus: MemoryBus,
    reply: Option<String>,
}

#[async_trait]
impl Responder for MemoryResponder {
    async fn respond(self: Box<Self>, reply: Reply) -> Result<(), BusError> {
        let Some(subject) = self.reply else {
            return Ok(());
        };
        let message = match reply {
            Ok(payload) => Message::new(subject, payload),
            Err(err) => {
                let mut message = Message::new(subject, err.data.clone());
                message.headers = err.to_headers();
                message
            }
        };
        self.bus.deliver(message);
        Ok(())
    }
}

#[derive(Debug)]
struct StoredObject {
    info: ObjectInfo,
    data: Bytes,
}

#[derive(Debug, Default)]
struct BucketState {
    objects: BTreeMap<String, StoredObject>,
    watchers: Vec<flume::Sender<Result<WatchEvent, StoreError>>>,
}

impl BucketState {
    fn notify(&mut self, info: &ObjectInfo) {
        self.watchers
            .retain(|tx| tx.send(Ok(WatchEvent::Update(info.clone()))).is_ok());
    }
}

/// Object store bucket held in memory.
#[derive(Debug)]
pub struct MemoryObjectStore {
    bucket: String,
    state: Mutex<BucketState>,
}

impl MemoryObjectStore {
    pub fn new(bucket: &str) -> Self {
        Self {
            bucket: bucket.to_string(),
            state: Mutex::new(BucketState::default()),
        }
    }

    /// End every change feed.
    fn close(&self) {
        self.state.lock().watchers.clear();
    }

    fn store(&self, meta: ObjectMeta, data: Bytes) -> Result<ObjectInfo, StoreError> {
        if meta.name.is_empty() {
            return Err(StoreError::InvalidObjectName(meta.name));
        }
        let info = ObjectInfo {
            bucket: self.bucket.clone(),
            name: meta.name.clone(),
            size: data.len() as u64,
            modified: Utc::now(),
            metadata: meta.metadata,
            deleted: false,
        };
        let mut state = self.state.lock();
        state.objects.insert(
            meta.name,
            StoredObject {
                info: info.clone(),
                data,
            },
        );
        state.notify(&info);
        Ok(info)
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn put(&self, meta: ObjectMeta, data: Bytes) -> Result<ObjectInfo, StoreError> {
        self.store(meta, data)
    }

    async fn put_stream(
        &self,
        meta: ObjectMeta,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<ObjectInfo, StoreError> {
        let mut data = Vec::new();
        reader.read_to_end(&mut data).await?;
        self.store(meta, Bytes::from(data))
    }

    async fn get(&self, name: &str) -> Result<Object, StoreError> {
        let state = self.state.lock();
        let object = state
            .objects
            .get(name)
            .ok_or_else(|| StoreError::ObjectNotFound(name.to_string()))?;
        let reader = std::io::Cursor::new(object.data.clone());
        Ok(Object::new(object.info.clone(), Box::new(reader)))
    }

    async fn info(&self, name: &str) -> Result<ObjectInfo, StoreError> {
        let state = self.state.lock();
        state
            .objects
            .get(name)
            .map(|o| o.info.clone())
            .ok_or_else(|| StoreError::ObjectNotFound(name.to_string()))
    }

    async fn delete(&self, name: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        let removed = state
            .objects
            .remove(name)
            .ok_or_else(|| StoreError::ObjectNotFound(name.to_string()))?;
        let mut info = removed.info;
        info.deleted = true;
        info.size = 0;
        info.modified = Utc::now();
        state.notify(&info);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ObjectInfo>, StoreError> {
        let state = self.state.lock();
        Ok(state.objects.values().map(|o| o.info.clone()).collect())
    }

    async fn status(&self) -> Result<StoreStatus, StoreError> {
        let state = self.state.lock();
        Ok(StoreStatus {
            bucket: self.bucket.clone(),
            objects: state.objects.len() as u64,
            size: state.objects.values().map(|o| o.info.size).sum(),
        })
    }

    async fn update_meta(&self, name: &str, meta: ObjectMeta) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        if meta.name != name && state.objects.contains_key(&meta.name) {
            return Err(StoreError::ObjectExists(meta.name));
        }
        let mut object = state
            .objects
            .remove(name)
            .ok_or_else(|| StoreError::ObjectNotFound(name.to_string()))?;

        if meta.name != name {
            let mut gone = object.info.clone();
            gone.deleted = true;
            gone.size = 0;
            state.notify(&gone);
        }

        object.info.name = meta.name.clone();
        object.info.metadata = meta.metadata;
        object.info.modified = Utc::now();
        let info = object.info.clone();
        state.objects.insert(meta.name, object);
        state.notify(&info);
        Ok(())
    }

    async fn watch(&self) -> Result<Watcher, StoreError> {
        let (tx, rx) = flume::unbounded();
        let mut state = self.state.lock();
        for object in state.objects.values() {
            let _ = tx.send(Ok(WatchEvent::Update(object.info.clone())));
        }
        let _ = tx.send(Ok(WatchEvent::CaughtUp));
        state.watchers.push(tx);
        Ok(Watcher::new(rx))
    }
}
