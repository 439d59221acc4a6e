use std::{sync::Arc, time::Duration};

use axum::Router;
use sight_identity::{Did, KeyError, Keypair};
use sight_overlay::{
    join_overlay, BootstrapReport, MembershipConfig, OverlayError, OverlayHost, PeerId,
    DEFAULT_DIAL_TIMEOUT, RELAY_TOPIC,
};
use sight_telemetry::{metrics, LatencySummary, TelemetryHandle};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    config::NodeConfig,
    control::control_router,
    router::MessageRouter,
    tunnel::{HttpTunnel, Tunnel, TunnelError},
};

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("node keypair unusable: {0}")]
    Key(#[from] KeyError),
    #[error("failed to join overlay: {0}")]
    Overlay(#[from] OverlayError),
    #[error(transparent)]
    Tunnel(#[from] TunnelError),
}

/// A running relay: identity, overlay membership, and the inbound task.
pub struct RelayNode {
    did: Did,
    host: Arc<dyn OverlayHost>,
    router: MessageRouter,
    bootstrap: BootstrapReport,
    shutdown: CancellationToken,
    inbound: JoinHandle<()>,
    reporter: JoinHandle<()>,
    grace: Duration,
}

impl RelayNode {
    /// Starts a node that forwards to the configured HTTP tunnel.
    pub async fn start(
        config: &NodeConfig,
        keypair: &Keypair,
        host: Arc<dyn OverlayHost>,
    ) -> Result<Self, NodeError> {
        let tunnel = HttpTunnel::new(config.tunnel_url.clone(), config.forward_timeout())?;
        info!(tunnel = tunnel.url(), "forwarding addressed payloads to tunnel");
        Self::start_with_tunnel(config, keypair, host, Arc::new(tunnel), DEFAULT_DIAL_TIMEOUT).await
    }

    pub async fn start_with_tunnel(
        config: &NodeConfig,
        keypair: &Keypair,
        host: Arc<dyn OverlayHost>,
        tunnel: Arc<dyn Tunnel>,
        dial_timeout: Duration,
    ) -> Result<Self, NodeError> {
        let mut keypair = keypair.clone();
        keypair.verify()?;
        let did = keypair.did(config.is_gateway);
        info!(%did, peer = %host.peer_id(), gateway = config.is_gateway, "starting relay node");

        let membership = join_overlay(
            host.as_ref(),
            &MembershipConfig {
                topic: RELAY_TOPIC.to_owned(),
                bootstrap_peers: config.bootstrap_peers.clone(),
                dial_timeout,
            },
        )
        .await?;

        let telemetry = TelemetryHandle::from_config(config.telemetry.clone());
        record_bootstrap(&telemetry, &membership.bootstrap);

        let router = MessageRouter::new(did.clone(), membership.topic, tunnel, telemetry.clone());
        let shutdown = CancellationToken::new();
        let inbound = tokio::spawn({
            let router = router.clone();
            let shutdown = shutdown.clone();
            let subscription = membership.subscription;
            async move { router.run_inbound(subscription, shutdown).await }
        });
        let reporter = tokio::spawn(report_telemetry(telemetry, shutdown.clone()));

        Ok(Self {
            did,
            host,
            router,
            bootstrap: membership.bootstrap,
            shutdown,
            inbound,
            reporter,
            grace: config.shutdown_grace(),
        })
    }

    pub fn did(&self) -> &Did {
        &self.did
    }

    pub fn peer_id(&self) -> PeerId {
        self.host.peer_id()
    }

    pub fn bootstrap_report(&self) -> &BootstrapReport {
        &self.bootstrap
    }

    pub fn telemetry(&self) -> &TelemetryHandle {
        self.router.telemetry()
    }

    pub fn control_router(&self) -> Router {
        control_router(self.router.clone(), self.peer_id().to_string())
    }

    /// Cancels the inbound task, gives it the grace period to finish the
    /// message in hand, then closes the overlay host.
    pub async fn shutdown(self) {
        info!(did = %self.did, "shutting down relay node");
        self.shutdown.cancel();
        let mut inbound = self.inbound;
        if tokio::time::timeout(self.grace, &mut inbound).await.is_err() {
            let grace_ms = u64::try_from(self.grace.as_millis()).unwrap_or(u64::MAX);
            warn!(grace_ms, "inbound relay did not stop in time, aborting");
            inbound.abort();
        }
        self.reporter.abort();
        self.host.close().await;
        info!("relay node stopped");
    }
}

fn record_bootstrap(telemetry: &TelemetryHandle, report: &BootstrapReport) {
    for (name, count) in [
        (metrics::BOOTSTRAP_CONNECTED, report.connected.len()),
        (metrics::BOOTSTRAP_INVALID, report.invalid.len()),
        (metrics::BOOTSTRAP_UNREACHABLE, report.unreachable.len()),
    ] {
        if let Err(err) = telemetry.record_counter(name, count as u64) {
            warn!(error = %err, "dropping telemetry sample");
        }
    }
}

async fn report_telemetry(telemetry: TelemetryHandle, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(Duration::from_millis(telemetry.flush_interval().max(1)));
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let snapshot = telemetry.flush();
        let forward = snapshot
            .latencies_ms
            .get(metrics::TUNNEL_FORWARD_MS)
            .and_then(|samples| LatencySummary::of(samples));
        let counter = |name: &str| snapshot.counters.get(name).copied().unwrap_or(0);
        info!(
            received = counter(metrics::INBOUND_RECEIVED),
            forwarded = counter(metrics::INBOUND_FORWARDED),
            forward_failed = counter(metrics::INBOUND_FORWARD_FAILED),
            malformed = counter(metrics::INBOUND_MALFORMED),
            published = counter(metrics::OUTBOUND_PUBLISHED),
            publish_failed = counter(metrics::OUTBOUND_PUBLISH_FAILED),
            forwards = forward.map(|s| s.count).unwrap_or(0),
            forward_mean_ms = forward.map(|s| s.mean_ms).unwrap_or(0),
            forward_max_ms = forward.map(|s| s.max_ms).unwrap_or(0),
            "relay telemetry"
        );
    }
}
