//! Publishes a worker's stdout chunks on its stdout subject.

use std::sync::Arc;

use bytes::Bytes;
use common::bus::Bus;
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
pub struct Publisher {
    bus: Arc<dyn Bus>,
    subject: String,
}

impl Publisher {
    pub fn new(bus: Arc<dyn Bus>, subject: impl Into<String>) -> Self {
        Self {
            bus,
            subject: subject.into(),
        }
    }

    /// Publish chunks in order until `chunks` closes or `cancel` fires.
    ///
    /// A failed publish loses that chunk only.
    pub async fn run(self, chunks: flume::Receiver<Bytes>, cancel: CancellationToken) {
        loop {
            let chunk = tokio::select! {
                biased;
                chunk = chunks.recv_async() => match chunk {
                    Ok(chunk) => chunk,
                    Err(_) => break,
                },
                _ = cancel.cancelled() => break,
            };
            if let Err(e) = self.bus.publish(&self.subject, chunk).await {
                tracing::warn!(subject = %self.subject, error = %e, "failed to publish stdout");
            }
        }
        tracing::debug!(subject = %self.subject, "publisher stopped");
    }
}

#[cfg(test)]
mod tests {
    use common::bus::MemoryBus;

    use super::*;

    #[tokio::test]
    async fn test_publishes_in_order_until_closed() {
        let bus: Arc<dyn Bus> = Arc::new(MemoryBus::new());
        let mut sub = bus.subscribe("agent.1.STDOUT").await.unwrap();
        let (tx, rx) = flume::bounded(4);
        let task = tokio::spawn(
            Publisher::new(bus.clone(), "agent.1.STDOUT").run(rx, CancellationToken::new()),
        );

        tx.send_async(Bytes::from_static(b"one")).await.unwrap();
        tx.send_async(Bytes::from_static(b"two")).await.unwrap();
        drop(tx);
        task.await.unwrap();

        assert_eq!(sub.next().await.unwrap().payload, Bytes::from_static(b"one"));
        assert_eq!(sub.next().await.unwrap().payload, Bytes::from_static(b"two"));
    }

    #[tokio::test]
    async fn test_cancel_stops_an_idle_publisher() {
        let bus: Arc<dyn Bus> = Arc::new(MemoryBus::new());
        let (_tx, rx) = flume::bounded::<Bytes>(1);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(Publisher::new(bus, "agent.1.STDOUT").run(rx, cancel.clone()));
        cancel.cancel();
        task.await.unwrap();
    }
}
