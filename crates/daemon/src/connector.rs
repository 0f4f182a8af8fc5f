//! Service registration on the bus.
//!
//! A [`Connector`] registers one micro-service, installs its endpoints and
//! forwards every inbound request, from all endpoints, to a single channel.
//! Cancellation deregisters the service.

use std::sync::Arc;

use common::bus::{Bus, BusError, ServiceConfig, ServiceRequest};
use futures::StreamExt;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
pub struct Connector {
    bus: Arc<dyn Bus>,
    config: ServiceConfig,
    endpoints: Vec<(String, String)>,
}

impl Connector {
    pub fn new(bus: Arc<dyn Bus>, config: ServiceConfig) -> Self {
        Self {
            bus,
            config,
            endpoints: Vec::new(),
        }
    }

    pub fn with_endpoint(mut self, name: impl Into<String>, subject: impl Into<String>) -> Self {
        self.endpoints.push((name.into(), subject.into()));
        self
    }

    /// Register, report the assigned service id on `registered`, then
    /// forward requests to `out` until cancelled or `out` is closed.
    pub async fn run(
        self,
        out: flume::Sender<ServiceRequest>,
        registered: Option<oneshot::Sender<String>>,
        cancel: CancellationToken,
    ) -> Result<(), BusError> {
        let service = self.bus.add_service(self.config.clone()).await?;

        let mut streams = Vec::with_capacity(self.endpoints.len());
        for (name, subject) in &self.endpoints {
            match service.add_endpoint(name, subject).await {
                Ok(endpoint) => streams.push(endpoint.into_stream().boxed()),
                Err(e) => {
                    if let Err(stop_err) = service.stop().await {
                        tracing::warn!(error = %stop_err, "failed to stop service");
                    }
                    return Err(e);
                }
            }
        }
        tracing::info!(
            service = %self.config.name,
            service_id = service.id(),
            endpoints = self.endpoints.len(),
            "service registered"
        );
        if let Some(tx) = registered {
            let _ = tx.send(service.id().to_string());
        }

        let mut requests = futures::stream::select_all(streams);
        loop {
            let request = tokio::select! {
                _ = cancel.cancelled() => break,
                next = requests.next() => match next {
                    Some(request) => request,
                    None => break,
                },
            };
            tracing::debug!(endpoint = request.endpoint(), "request received");
            tokio::select! {
                _ = cancel.cancelled() => break,
                sent = out.send_async(request) => {
                    if sent.is_err() {
                        break;
                    }
                }
            }
        }

        service.stop().await?;
        tracing::info!(service = %self.config.name, service_id = service.id(), "service stopped");
        Ok(())
    }
}
