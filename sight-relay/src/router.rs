//! Bridge between the relay topic and the local tunnel.
//!
//! Inbound, every message on the shared topic is decoded and only envelopes
//! addressed to this node's [`Did`] are forwarded. Outbound, local requests
//! are wrapped in an envelope and published. Failures in either direction are
//! per-message: they are logged and counted, never propagated to the loop.

use std::{sync::Arc, time::Instant};

use serde_json::Value;
use sight_identity::Did;
use sight_overlay::{OverlayError, OverlayMessage, Subscription, Topic};
use sight_telemetry::{metrics, TelemetryHandle};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::{
    envelope::{Envelope, EnvelopeError},
    tunnel::Tunnel,
};

#[derive(Debug, Error)]
pub enum SendError {
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    #[error(transparent)]
    Publish(#[from] OverlayError),
}

/// What happened to one inbound message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InboundOutcome {
    Malformed,
    Unaddressed,
    Forwarded,
    ForwardFailed,
}

impl InboundOutcome {
    fn metric(self) -> &'static str {
        match self {
            InboundOutcome::Malformed => metrics::INBOUND_MALFORMED,
            InboundOutcome::Unaddressed => metrics::INBOUND_UNADDRESSED,
            InboundOutcome::Forwarded => metrics::INBOUND_FORWARDED,
            InboundOutcome::ForwardFailed => metrics::INBOUND_FORWARD_FAILED,
        }
    }
}

#[derive(Clone)]
pub struct MessageRouter {
    did: Did,
    topic: Arc<dyn Topic>,
    tunnel: Arc<dyn Tunnel>,
    telemetry: TelemetryHandle,
}

impl MessageRouter {
    pub fn new(
        did: Did,
        topic: Arc<dyn Topic>,
        tunnel: Arc<dyn Tunnel>,
        telemetry: TelemetryHandle,
    ) -> Self {
        Self {
            did,
            topic,
            tunnel,
            telemetry,
        }
    }

    pub fn did(&self) -> &Did {
        &self.did
    }

    pub fn topic_name(&self) -> &str {
        self.topic.name()
    }

    pub fn telemetry(&self) -> &TelemetryHandle {
        &self.telemetry
    }

    fn count(&self, name: &str) {
        if let Err(err) = self.telemetry.record_counter(name, 1) {
            warn!(error = %err, "dropping telemetry sample");
        }
    }

    /// Decodes one overlay message and forwards its payload when it is
    /// addressed to this node.
    pub async fn handle_inbound(&self, message: &OverlayMessage) -> InboundOutcome {
        self.count(metrics::INBOUND_RECEIVED);
        let outcome = self.route_inbound(message).await;
        self.count(outcome.metric());
        outcome
    }

    async fn route_inbound(&self, message: &OverlayMessage) -> InboundOutcome {
        let envelope = match Envelope::decode(&message.data) {
            Ok(envelope) => envelope,
            Err(EnvelopeError::MissingRecipient) => {
                trace!(source = ?message.source, "inbound message has no recipient");
                return InboundOutcome::Unaddressed;
            }
            Err(err) => {
                warn!(source = ?message.source, error = %err, "skipping malformed inbound message");
                return InboundOutcome::Malformed;
            }
        };
        if !envelope.is_for(&self.did) {
            trace!(to = %envelope.to, "inbound message addressed elsewhere");
            return InboundOutcome::Unaddressed;
        }

        let started = Instant::now();
        let result = self.tunnel.forward(&envelope.payload).await;
        self.telemetry.record_latency_ms(
            metrics::TUNNEL_FORWARD_MS,
            u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        );
        match result {
            Ok(()) => {
                debug!(did = %self.did, "forwarded inbound payload to tunnel");
                InboundOutcome::Forwarded
            }
            Err(err) => {
                warn!(did = %self.did, error = %err, "failed to forward inbound payload");
                InboundOutcome::ForwardFailed
            }
        }
    }

    /// Consumes the subscription until it ends or `shutdown` fires. Messages
    /// are handled one at a time, in delivery order.
    pub async fn run_inbound(&self, mut subscription: Subscription, shutdown: CancellationToken) {
        info!(did = %self.did, topic = subscription.topic(), "inbound relay started");
        loop {
            let message = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("inbound relay cancelled");
                    break;
                }
                message = subscription.next() => message,
            };
            match message {
                Some(message) => {
                    self.handle_inbound(&message).await;
                }
                None => {
                    warn!(topic = subscription.topic(), "subscription closed, inbound relay stopping");
                    break;
                }
            }
        }
        subscription.cancel();
    }

    /// Wraps a local request and publishes it to the shared topic.
    pub async fn send_outbound(&self, request: Value) -> Result<Envelope, SendError> {
        let envelope = Envelope::wrap(request)?;
        let data = envelope.encode()?;
        match self.topic.publish(data).await {
            Ok(()) => {
                self.count(metrics::OUTBOUND_PUBLISHED);
                debug!(to = %envelope.to, "published outbound envelope");
                Ok(envelope)
            }
            Err(err) => {
                self.count(metrics::OUTBOUND_PUBLISH_FAILED);
                Err(err.into())
            }
        }
    }
}
