//! Overlay membership for sight relays.
//!
//! Every relay joins one well-known gossip topic, subscribes to it, and dials a
//! handful of bootstrap peers. The overlay itself is reached through the
//! [`OverlayHost`] / [`Topic`] seam so the relay logic runs the same against
//! the libp2p gossipsub host and the in-process [`MemoryOverlay`] used by
//! tests.
//!
//! # Quickstart
//! ```
//! use sight_overlay::{join_overlay, MemoryOverlay, MembershipConfig, Topic};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let overlay = MemoryOverlay::default();
//! let host = overlay.host();
//! let mut membership = join_overlay(&host, &MembershipConfig::default()).await.unwrap();
//! membership.topic.publish(b"ping".to_vec()).await.unwrap();
//! let message = membership.subscription.next().await.unwrap();
//! assert_eq!(message.data, b"ping");
//! # });
//! ```

pub mod gossip;
pub mod membership;
pub mod memory;

pub use gossip::{GossipConfig, GossipHost};
pub use membership::{bootstrap, join_overlay, BootstrapReport, Membership, MembershipConfig};
pub use memory::{MemoryHost, MemoryOverlay};

pub use libp2p::{identity, Multiaddr, PeerId};

use std::{fmt, str::FromStr, sync::Arc, time::Duration};

use async_trait::async_trait;
use libp2p::multiaddr::Protocol;
use thiserror::Error;
use tokio::sync::mpsc;

#[cfg(any(
    all(feature = "dev", feature = "test"),
    all(feature = "dev", feature = "prod"),
    all(feature = "test", feature = "prod")
))]
compile_error!(
    "Only one of the `dev`, `test`, or `prod` features may be enabled for sight-overlay."
);

#[cfg(feature = "dev")]
const DIAL_TIMEOUT_SECS: u64 = 3;
#[cfg(feature = "test")]
const DIAL_TIMEOUT_SECS: u64 = 5;
#[cfg(not(any(feature = "dev", feature = "test")))]
const DIAL_TIMEOUT_SECS: u64 = 10;

/// Upper bound on a single bootstrap connection attempt.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(DIAL_TIMEOUT_SECS);

/// The one topic all relays share. Renaming it partitions the network.
pub const RELAY_TOPIC: &str = "sight-message";

/// Messages buffered per subscription before new arrivals are dropped.
pub const SUBSCRIPTION_BUFFER: usize = 256;

#[derive(Debug, Error)]
pub enum OverlayError {
    #[error("invalid bootstrap address {addr}: {reason}")]
    InvalidPeer { addr: String, reason: String },
    #[error("failed to connect to {peer}: {reason}")]
    Connect { peer: PeerId, reason: String },
    #[error("timed out connecting to {0}")]
    ConnectTimeout(PeerId),
    #[error("failed to join topic {topic}: {reason}")]
    Join { topic: String, reason: String },
    #[error("failed to subscribe to topic {topic}: {reason}")]
    Subscribe { topic: String, reason: String },
    #[error("failed to publish to topic {topic}: {reason}")]
    Publish { topic: String, reason: String },
    #[error("overlay host error: {0}")]
    Host(String),
    #[error("overlay host is closed")]
    Closed,
}

/// A message received on a topic.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OverlayMessage {
    pub topic: String,
    pub source: Option<PeerId>,
    pub data: Vec<u8>,
}

/// A remote peer to dial at startup, given as `<multiaddr>/p2p/<peer-id>`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BootstrapPeer {
    pub peer_id: PeerId,
    /// Transport address with the `/p2p` suffix removed.
    pub address: Multiaddr,
}

impl BootstrapPeer {
    pub fn parse(raw: &str) -> Result<Self, OverlayError> {
        let invalid = |reason: String| OverlayError::InvalidPeer {
            addr: raw.to_owned(),
            reason,
        };
        let mut address: Multiaddr = raw.trim().parse().map_err(|err| invalid(format!("{err}")))?;
        match address.pop() {
            Some(Protocol::P2p(peer_id)) => {
                if address.is_empty() {
                    return Err(invalid("no transport address before /p2p".into()));
                }
                Ok(Self { peer_id, address })
            }
            _ => Err(invalid("missing /p2p/<peer-id> suffix".into())),
        }
    }
}

impl FromStr for BootstrapPeer {
    type Err = OverlayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for BootstrapPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/p2p/{}", self.address, self.peer_id)
    }
}

/// Lazily yields the messages delivered to one topic subscription.
#[derive(Debug)]
pub struct Subscription {
    topic: String,
    receiver: mpsc::Receiver<OverlayMessage>,
}

impl Subscription {
    pub fn new(topic: impl Into<String>, receiver: mpsc::Receiver<OverlayMessage>) -> Self {
        Self {
            topic: topic.into(),
            receiver,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Waits for the next message. `None` once the host closes or the
    /// subscription is cancelled and drained.
    pub async fn next(&mut self) -> Option<OverlayMessage> {
        self.receiver.recv().await
    }

    pub fn cancel(&mut self) {
        self.receiver.close();
    }
}

/// Publish/subscribe handle for a joined topic. Implementations must accept
/// concurrent `publish` calls.
#[async_trait]
pub trait Topic: Send + Sync {
    fn name(&self) -> &str;

    async fn publish(&self, data: Vec<u8>) -> Result<(), OverlayError>;

    async fn subscribe(&self) -> Result<Subscription, OverlayError>;
}

#[async_trait]
pub trait OverlayHost: Send + Sync {
    fn peer_id(&self) -> PeerId;

    async fn join(&self, topic: &str) -> Result<Arc<dyn Topic>, OverlayError>;

    /// One connection attempt; no retries.
    async fn connect(&self, peer: &BootstrapPeer) -> Result<(), OverlayError>;

    /// Stops the host. Open subscriptions end once their buffers drain.
    async fn close(&self);
}
