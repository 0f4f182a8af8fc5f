//! Protocol translation between raw bus requests and typed messages.
//!
//! The decoder owns no state beyond its channels. Every inbound request is
//! either answered here (decode failures, raw passthrough acks) or handed
//! downstream wrapped in an [`Inbound`]; the typed result comes back as an
//! [`Outbound`] carrying the same request, which is how replies find their
//! way to the right caller.

use std::marker::PhantomData;

use bytes::Bytes;
use common::bus::{Reply, ServiceError, ServiceRequest};
use common::protocol::{
    ErrorCode, RpcError, VesselRequest, VesselResponse, WireMessage, WorkerRequest, WorkerResponse,
};
use tokio_util::sync::CancellationToken;

/// A decoded request and the handle to answer it.
#[derive(Debug)]
pub struct Inbound<T> {
    pub request: T,
    pub reply: ServiceRequest,
}

impl<T> Inbound<T> {
    pub fn respond<R>(self, result: Result<R, RpcError>) -> Outbound<R> {
        Outbound {
            reply: self.reply,
            result,
        }
    }
}

/// The answer owed to a request received earlier.
#[derive(Debug)]
pub struct Outbound<T> {
    pub reply: ServiceRequest,
    pub result: Result<T, RpcError>,
}

pub type VesselDecoder = Decoder<VesselRequest, VesselResponse>;
pub type WorkerDecoder = Decoder<WorkerRequest, WorkerResponse>;

pub struct Decoder<Req, Resp> {
    raw: Option<(String, flume::Sender<Bytes>)>,
    _marker: PhantomData<fn() -> (Req, Resp)>,
}

impl<Req, Resp> std::fmt::Debug for Decoder<Req, Resp> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Decoder")
            .field("raw_endpoint", &self.raw.as_ref().map(|(name, _)| name))
            .finish()
    }
}

impl<Req, Resp> Default for Decoder<Req, Resp> {
    fn default() -> Self {
        Self {
            raw: None,
            _marker: PhantomData,
        }
    }
}

impl<Req: WireMessage, Resp: WireMessage> Decoder<Req, Resp> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forward payloads from `endpoint` to `tx` as-is, without framing.
    pub fn with_raw_endpoint(
        mut self,
        endpoint: impl Into<String>,
        tx: flume::Sender<Bytes>,
    ) -> Self {
        self.raw = Some((endpoint.into(), tx));
        self
    }

    pub async fn run(
        self,
        inbound: flume::Receiver<ServiceRequest>,
        requests: flume::Sender<Inbound<Req>>,
        responses: flume::Receiver<Outbound<Resp>>,
        cancel: CancellationToken,
    ) {
        let mut inbound_open = true;
        let mut responses_open = true;
        while inbound_open || responses_open {
            tokio::select! {
                _ = cancel.cancelled() => break,
                message = inbound.recv_async(), if inbound_open => match message {
                    Ok(message) => self.decode(message, &requests, &cancel).await,
                    Err(_) => inbound_open = false,
                },
                outbound = responses.recv_async(), if responses_open => match outbound {
                    Ok(outbound) => encode_reply(outbound).await,
                    Err(_) => responses_open = false,
                },
            }
        }
    }

    async fn decode(
        &self,
        message: ServiceRequest,
        requests: &flume::Sender<Inbound<Req>>,
        cancel: &CancellationToken,
    ) {
        if let Some((endpoint, tx)) = &self.raw {
            if message.endpoint() == endpoint {
                let payload = message.payload().clone();
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    sent = tx.send_async(payload) => {
                        if sent.is_err() {
                            tracing::warn!(endpoint = %endpoint, "raw consumer gone, dropping payload");
                        }
                    }
                }
                send(message, Ok(Bytes::new())).await;
                return;
            }
        }

        match Req::decode(message.payload()) {
            Ok(request) => {
                let inbound = Inbound {
                    request,
                    reply: message,
                };
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    sent = requests.send_async(inbound) => {
                        if let Err(flume::SendError(inbound)) = sent {
                            tracing::warn!("request consumer gone");
                            send(inbound.reply, Err(ErrorCode::InvalidResponse.error().into())).await;
                        }
                    }
                }
            }
            Err(e) => {
                tracing::debug!(
                    endpoint = message.endpoint(),
                    len = message.payload().len(),
                    error = %e,
                    "rejecting undecodable request"
                );
                send(message, Err(e.code().with_detail(&e).into())).await;
            }
        }
    }
}

async fn encode_reply<Resp: WireMessage>(outbound: Outbound<Resp>) {
    let Outbound { reply, result } = outbound;
    let reply_payload = match result {
        Ok(response) => match response.encode() {
            Ok(payload) => Ok(payload),
            Err(e) => {
                tracing::error!(error = %e, "failed to encode response");
                Err(ErrorCode::NewResponseFailed.with_detail(&e).into())
            }
        },
        Err(e) => Err(ServiceError::from(e)),
    };
    send(reply, reply_payload).await;
}

async fn send(request: ServiceRequest, reply: Reply) {
    let endpoint = request.endpoint().to_string();
    if let Err(e) = request.respond(reply).await {
        tracing::debug!(endpoint, error = %e, "failed to send reply");
    }
}
