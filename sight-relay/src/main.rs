use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use clap::Parser;
use color_eyre::{eyre::WrapErr, Result};
use sight_identity::KeypairStore;
use sight_overlay::{identity, GossipConfig, GossipHost};
use sight_relay::{
    config::parse_flag, load_config, ConfigError, ConfigFormat, ConfigOverrides, NodeConfig,
    RelayNode,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "sight-relay",
    version,
    about = "Relays addressed messages between the sight gossip overlay and a local tunnel"
)]
struct Cli {
    /// Optional configuration file (TOML or YAML); flags and env override it.
    #[arg(long, env = "RELAY_CONFIG")]
    config: Option<PathBuf>,
    /// Explicit configuration format override.
    #[arg(long, value_enum, default_value_t = ConfigFormat::Auto)]
    config_format: ConfigFormat,
    /// Run as the network gateway (identity "gateway").
    #[arg(long, env = "IS_GATEWAY", value_parser = parse_flag)]
    gateway: Option<bool>,
    /// Port of the local HTTP control surface.
    #[arg(long, env = "LIBP2P_PORT")]
    http_port: Option<u16>,
    /// TCP port the overlay listens on.
    #[arg(long, env = "NODE_PORT")]
    overlay_port: Option<u16>,
    /// Comma-separated `<multiaddr>/p2p/<peer-id>` bootstrap list.
    #[arg(long, env = "BOOTSTRAP_ADDRS")]
    bootstrap: Option<String>,
    /// Port of the local tunnel API.
    #[arg(long, env = "API_PORT")]
    api_port: Option<u16>,
    /// Full tunnel URL; wins over --api-port.
    #[arg(long, env = "TUNNEL_URL")]
    tunnel_url: Option<String>,
    /// Data root holding config/device-keypair.json.
    #[arg(long, env = "SIGHTAI_DATA_DIR")]
    data_dir: Option<PathBuf>,
}

impl Cli {
    fn into_config(self) -> Result<NodeConfig> {
        let mut config = match &self.config {
            Some(path) => load_config(path, self.config_format)?,
            None => NodeConfig::default(),
        };
        ConfigOverrides {
            is_gateway: self.gateway,
            http_port: self.http_port,
            overlay_port: self.overlay_port,
            bootstrap_addrs: self.bootstrap,
            api_port: self.api_port,
            tunnel_url: self.tunnel_url,
            data_dir: self.data_dir,
        }
        .apply(&mut config);
        config.validate().map_err(|err| match err {
            ConfigError::Validation(reason) => color_eyre::eyre::eyre!(reason),
            other => other.into(),
        })?;
        Ok(config)
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if std::env::var("LOG_FORMAT").is_ok_and(|format| format.eq_ignore_ascii_case("json")) {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    init_tracing();
    let config = Cli::parse().into_config()?;

    let store = KeypairStore::in_data_dir(config.data_dir.as_deref())?;
    let keypair = store.load_or_create()?;
    info!(path = %store.path().display(), "node keypair ready");

    let overlay_key = identity::Keypair::ed25519_from_bytes(keypair.secret_bytes()?)
        .wrap_err("node seed is not a valid ed25519 key")?;
    let host = GossipHost::spawn(overlay_key, GossipConfig::new(config.overlay_port))?;
    let node = RelayNode::start(&config, &keypair, Arc::new(host)).await?;

    let bind = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .wrap_err_with(|| format!("failed to bind control surface on {bind}"))?;
    info!(%bind, did = %node.did(), peer = %node.peer_id(), "control surface listening");

    axum::serve(listener, node.control_router())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .wrap_err("control surface failed")?;

    node.shutdown().await;
    Ok(())
}
