use std::{
    convert::Infallible,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use clap::ValueEnum;
use serde::Deserialize;
use sight_telemetry::TelemetryConfig;
use thiserror::Error;
use url::Url;

#[cfg(feature = "dev")]
const FORWARD_TIMEOUT_MS: u64 = 30_000;
#[cfg(feature = "test")]
const FORWARD_TIMEOUT_MS: u64 = 2_000;
#[cfg(not(any(feature = "dev", feature = "test")))]
const FORWARD_TIMEOUT_MS: u64 = 10_000;

/// Port the local tunnel API listens on when `API_PORT` is unset.
pub const DEFAULT_API_PORT: u16 = 8716;

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum ConfigFormat {
    Auto,
    Toml,
    Yaml,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {format:?} config: {details}")]
    Parse {
        format: ConfigFormat,
        details: String,
    },
    #[error("configuration invalid: {0}")]
    Validation(String),
}

/// Startup configuration, fixed for the life of the process.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct NodeConfig {
    /// Port of the local control surface.
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// TCP port the overlay host listens on.
    #[serde(default = "default_overlay_port")]
    pub overlay_port: u16,
    #[serde(default = "default_tunnel_url")]
    pub tunnel_url: String,
    #[serde(default)]
    pub is_gateway: bool,
    #[serde(default)]
    pub bootstrap_peers: Vec<String>,
    /// Root for `config/device-keypair.json`; the home directory when unset.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    #[serde(default = "default_forward_timeout_ms")]
    pub forward_timeout_ms: u64,
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

const fn default_http_port() -> u16 {
    4010
}

const fn default_overlay_port() -> u16 {
    15050
}

fn default_tunnel_url() -> String {
    tunnel_url_for_api_port(DEFAULT_API_PORT)
}

const fn default_forward_timeout_ms() -> u64 {
    FORWARD_TIMEOUT_MS
}

const fn default_shutdown_grace_ms() -> u64 {
    2_000
}

pub fn tunnel_url_for_api_port(port: u16) -> String {
    format!("http://localhost:{port}/libp2p/message")
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            http_port: default_http_port(),
            overlay_port: default_overlay_port(),
            tunnel_url: default_tunnel_url(),
            is_gateway: false,
            bootstrap_peers: Vec::new(),
            data_dir: None,
            forward_timeout_ms: default_forward_timeout_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = Url::parse(&self.tunnel_url).map_err(|err| {
            ConfigError::Validation(format!("tunnel url {:?} is invalid: {err}", self.tunnel_url))
        })?;
        if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
            return Err(ConfigError::Validation(format!(
                "tunnel url {:?} must be an absolute http(s) url",
                self.tunnel_url
            )));
        }
        if self.http_port == 0 || self.overlay_port == 0 {
            return Err(ConfigError::Validation("ports must be non-zero".into()));
        }
        if self.http_port == self.overlay_port {
            return Err(ConfigError::Validation(format!(
                "http and overlay ports must differ (both {})",
                self.http_port
            )));
        }
        if self.forward_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "forward timeout must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    pub fn forward_timeout(&self) -> Duration {
        Duration::from_millis(self.forward_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn sample() -> Self {
        Self {
            bootstrap_peers: vec![
                "/ip4/10.0.0.7/tcp/15050/p2p/12D3KooWJWoaqZhDaoEFshF7Rh1bpY9ohihFhzcW6d69Lr2NASuq"
                    .into(),
            ],
            telemetry: TelemetryConfig::sample("sight-relay"),
            ..Self::default()
        }
    }
}

/// Values supplied on the command line or through the environment. Each one
/// that is present replaces the corresponding config field.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub is_gateway: Option<bool>,
    pub http_port: Option<u16>,
    pub overlay_port: Option<u16>,
    /// Comma-separated bootstrap multiaddrs.
    pub bootstrap_addrs: Option<String>,
    pub api_port: Option<u16>,
    /// Takes precedence over `api_port`.
    pub tunnel_url: Option<String>,
    pub data_dir: Option<PathBuf>,
}

impl ConfigOverrides {
    pub fn apply(self, config: &mut NodeConfig) {
        if let Some(is_gateway) = self.is_gateway {
            config.is_gateway = is_gateway;
        }
        if let Some(port) = self.http_port {
            config.http_port = port;
        }
        if let Some(port) = self.overlay_port {
            config.overlay_port = port;
        }
        if let Some(raw) = self.bootstrap_addrs {
            config.bootstrap_peers = split_peer_list(&raw);
        }
        if let Some(port) = self.api_port {
            config.tunnel_url = tunnel_url_for_api_port(port);
        }
        if let Some(url) = self.tunnel_url.filter(|url| !url.trim().is_empty()) {
            config.tunnel_url = url;
        }
        if let Some(dir) = self.data_dir {
            config.data_dir = Some(dir);
        }
    }
}

/// Splits a comma-separated address list, dropping blank entries.
pub fn split_peer_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Reads a gateway-style flag: `1`, `true`, `yes` and `on` are set, anything
/// else is unset.
pub fn parse_flag(raw: &str) -> Result<bool, Infallible> {
    Ok(matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    ))
}

pub fn load_config(path: &Path, format: ConfigFormat) -> Result<NodeConfig, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let config = parse_config(&contents, resolve_format(path, format))?;
    config.validate()?;
    Ok(config)
}

fn parse_config(contents: &str, format: ConfigFormat) -> Result<NodeConfig, ConfigError> {
    match format {
        ConfigFormat::Yaml => serde_yaml::from_str(contents).map_err(|err| ConfigError::Parse {
            format,
            details: err.to_string(),
        }),
        ConfigFormat::Toml | ConfigFormat::Auto => {
            toml::from_str(contents).map_err(|err| ConfigError::Parse {
                format: ConfigFormat::Toml,
                details: err.to_string(),
            })
        }
    }
}

fn resolve_format(path: &Path, format: ConfigFormat) -> ConfigFormat {
    match format {
        ConfigFormat::Auto => match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => ConfigFormat::Yaml,
            _ => ConfigFormat::Toml,
        },
        _ => format,
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn sample_and_default_configs_are_valid() {
        NodeConfig::sample().validate().unwrap();
        let config = NodeConfig::default();
        config.validate().unwrap();
        assert_eq!(config.http_port, 4010);
        assert_eq!(config.overlay_port, 15050);
        assert_eq!(config.tunnel_url, "http://localhost:8716/libp2p/message");
    }

    #[test]
    fn parses_toml_with_defaults() {
        let config = parse_config(
            r#"
            tunnel-url = "http://127.0.0.1:9000/libp2p/message"
            is-gateway = true
            bootstrap-peers = ["/ip4/1.2.3.4/tcp/15050/p2p/12D3KooWJWoaqZhDaoEFshF7Rh1bpY9ohihFhzcW6d69Lr2NASuq"]
            "#,
            ConfigFormat::Toml,
        )
        .unwrap();
        assert!(config.is_gateway);
        assert_eq!(config.http_port, 4010);
        assert_eq!(config.bootstrap_peers.len(), 1);
        assert_eq!(config.forward_timeout_ms, FORWARD_TIMEOUT_MS);
    }

    #[test]
    fn parses_yaml() {
        let config = parse_config(
            "http-port: 5000\noverlay-port: 16000\ndata-dir: /var/lib/sight\n",
            ConfigFormat::Yaml,
        )
        .unwrap();
        assert_eq!(config.http_port, 5000);
        assert_eq!(config.overlay_port, 16000);
        assert_eq!(config.data_dir, Some(PathBuf::from("/var/lib/sight")));
    }

    #[test]
    fn bundled_sample_configs_load() {
        let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("configs");
        let toml = load_config(&dir.join("sight-relay.toml"), ConfigFormat::Auto).unwrap();
        assert_eq!(toml.bootstrap_peers.len(), 1);
        assert_eq!(toml.telemetry.labels["component"], "sight-relay");
        let yaml = load_config(&dir.join("sight-relay.yaml"), ConfigFormat::Auto).unwrap();
        assert!(yaml.is_gateway);
        assert!(yaml.bootstrap_peers.is_empty());
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = load_config(Path::new("/nonexistent/relay.toml"), ConfigFormat::Auto).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn resolves_format_from_extension() {
        assert_eq!(resolve_format(Path::new("a.yml"), ConfigFormat::Auto), ConfigFormat::Yaml);
        assert_eq!(resolve_format(Path::new("a.toml"), ConfigFormat::Auto), ConfigFormat::Toml);
        assert_eq!(resolve_format(Path::new("a.yml"), ConfigFormat::Toml), ConfigFormat::Toml);
    }

    #[test]
    fn rejects_bad_tunnel_urls() {
        for url in ["", "localhost:8716", "ftp://localhost/x", "http://"] {
            let config = NodeConfig {
                tunnel_url: url.into(),
                ..NodeConfig::default()
            };
            assert!(
                matches!(config.validate(), Err(ConfigError::Validation(_))),
                "{url} accepted"
            );
        }
    }

    #[test]
    fn rejects_clashing_or_zero_ports_and_zero_timeout() {
        let clash = NodeConfig {
            overlay_port: 4010,
            ..NodeConfig::default()
        };
        assert!(clash.validate().is_err());
        let zero = NodeConfig {
            http_port: 0,
            ..NodeConfig::default()
        };
        assert!(zero.validate().is_err());
        let no_timeout = NodeConfig {
            forward_timeout_ms: 0,
            ..NodeConfig::default()
        };
        assert!(no_timeout.validate().is_err());
    }

    #[test]
    fn overrides_replace_fields() {
        let mut config = NodeConfig::default();
        ConfigOverrides {
            is_gateway: Some(true),
            http_port: Some(5010),
            overlay_port: Some(16050),
            bootstrap_addrs: Some(" /ip4/1.1.1.1/tcp/1/p2p/a ,, ,/ip4/2.2.2.2/tcp/2/p2p/b".into()),
            api_port: Some(9999),
            tunnel_url: None,
            data_dir: Some(PathBuf::from("/tmp/sight")),
        }
        .apply(&mut config);
        assert!(config.is_gateway);
        assert_eq!(config.http_port, 5010);
        assert_eq!(config.overlay_port, 16050);
        assert_eq!(
            config.bootstrap_peers,
            vec!["/ip4/1.1.1.1/tcp/1/p2p/a".to_string(), "/ip4/2.2.2.2/tcp/2/p2p/b".to_string()]
        );
        assert_eq!(config.tunnel_url, "http://localhost:9999/libp2p/message");
        assert_eq!(config.data_dir, Some(PathBuf::from("/tmp/sight")));
    }

    #[test]
    fn explicit_tunnel_url_beats_api_port() {
        let mut config = NodeConfig::default();
        ConfigOverrides {
            api_port: Some(9999),
            tunnel_url: Some("https://tunnel.internal/in".into()),
            ..ConfigOverrides::default()
        }
        .apply(&mut config);
        assert_eq!(config.tunnel_url, "https://tunnel.internal/in");
    }

    #[test]
    fn empty_bootstrap_list_yields_no_peers() {
        assert!(split_peer_list("").is_empty());
        assert!(split_peer_list(" , ").is_empty());
    }

    #[test]
    fn flag_parsing_is_lenient() {
        for raw in ["1", "true", "YES", " on "] {
            assert_eq!(parse_flag(raw), Ok(true));
        }
        for raw in ["", "0", "false", "gateway"] {
            assert_eq!(parse_flag(raw), Ok(false));
        }
    }
}
