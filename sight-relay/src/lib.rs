//! Library facade for the `sight-relay` binary.
//!
//! A relay lifts envelopes addressed to its own identity off the shared gossip
//! topic and posts their payloads to a local tunnel, and publishes requests
//! the tunnel submits over HTTP. Everything the binary wires together is
//! exported here so integration tests can run whole nodes on an in-memory
//! overlay.
//!
//! # Quickstart
//! ```no_run
//! use std::sync::Arc;
//!
//! use sight_identity::Keypair;
//! use sight_overlay::MemoryOverlay;
//! use sight_relay::{NodeConfig, RelayNode};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let overlay = MemoryOverlay::default();
//! let keypair = Keypair::generate(chrono::Utc::now());
//! let node = RelayNode::start(&NodeConfig::default(), &keypair, Arc::new(overlay.host())).await?;
//! println!("listening as {}", node.did());
//! node.shutdown().await;
//! # Ok(())
//! # }
//! ```

#[cfg(any(
    all(feature = "dev", feature = "test"),
    all(feature = "dev", feature = "prod"),
    all(feature = "test", feature = "prod")
))]
compile_error!("Only one of the `dev`, `test`, or `prod` features may be enabled for sight-relay.");

pub mod config;
pub mod control;
pub mod envelope;
pub mod node;
pub mod router;
pub mod tunnel;

pub use config::{load_config, ConfigError, ConfigFormat, ConfigOverrides, NodeConfig};
pub use control::{control_router, StatusReport};
pub use envelope::{Envelope, EnvelopeError};
pub use node::{NodeError, RelayNode};
pub use router::{InboundOutcome, MessageRouter, SendError};
pub use tunnel::{HttpTunnel, Tunnel, TunnelError};
