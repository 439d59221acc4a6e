use std::{sync::Arc, time::Duration};

use libp2p::PeerId;
use tracing::{info, warn};

use crate::{
    BootstrapPeer, OverlayError, OverlayHost, Subscription, Topic, DEFAULT_DIAL_TIMEOUT,
    RELAY_TOPIC,
};

#[derive(Clone, Debug)]
pub struct MembershipConfig {
    pub topic: String,
    /// Raw `<multiaddr>/p2p/<peer-id>` strings; each is parsed on its own.
    pub bootstrap_peers: Vec<String>,
    pub dial_timeout: Duration,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            topic: RELAY_TOPIC.to_owned(),
            bootstrap_peers: Vec::new(),
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
        }
    }
}

/// What happened to each configured bootstrap peer.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BootstrapReport {
    pub connected: Vec<PeerId>,
    pub invalid: Vec<String>,
    pub unreachable: Vec<PeerId>,
}

pub struct Membership {
    pub topic: Arc<dyn Topic>,
    pub subscription: Subscription,
    pub bootstrap: BootstrapReport,
}

/// Makes one connection attempt per configured peer. Unparseable addresses
/// and failed dials are logged and skipped; this never fails.
pub async fn bootstrap(
    host: &dyn OverlayHost,
    peers: &[String],
    dial_timeout: Duration,
) -> BootstrapReport {
    let mut report = BootstrapReport::default();
    for raw in peers {
        let peer = match BootstrapPeer::parse(raw) {
            Ok(peer) => peer,
            Err(err) => {
                warn!(addr = %raw, error = %err, "skipping invalid bootstrap address");
                report.invalid.push(raw.clone());
                continue;
            }
        };
        let outcome = match tokio::time::timeout(dial_timeout, host.connect(&peer)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(OverlayError::ConnectTimeout(peer.peer_id)),
        };
        match outcome {
            Ok(()) => {
                info!(peer = %peer.peer_id, "connected to bootstrap peer");
                report.connected.push(peer.peer_id);
            }
            Err(err) => {
                warn!(peer = %peer.peer_id, error = %err, "failed to connect to bootstrap peer");
                report.unreachable.push(peer.peer_id);
            }
        }
    }
    report
}

/// Bootstraps, then joins and subscribes to the configured topic. Join or
/// subscribe failures are returned; the node cannot run without them.
pub async fn join_overlay(
    host: &dyn OverlayHost,
    config: &MembershipConfig,
) -> Result<Membership, OverlayError> {
    let report = bootstrap(host, &config.bootstrap_peers, config.dial_timeout).await;
    let topic = host.join(&config.topic).await?;
    let subscription = topic.subscribe().await?;
    info!(
        topic = %config.topic,
        connected = report.connected.len(),
        invalid = report.invalid.len(),
        unreachable = report.unreachable.len(),
        "joined overlay topic"
    );
    Ok(Membership {
        topic,
        subscription,
        bootstrap: report,
    })
}
