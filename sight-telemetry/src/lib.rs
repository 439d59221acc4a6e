//! Counters and latency samples recorded by a relay. Nothing is exported to an
//! external collector; the relay logs periodic summaries and serves the
//! counters on its status endpoint, and tests assert on snapshots directly.

use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::SystemTime,
};
use thiserror::Error;

#[cfg(any(
    all(feature = "dev", feature = "test"),
    all(feature = "dev", feature = "prod"),
    all(feature = "test", feature = "prod")
))]
compile_error!(
    "Only one of the `dev`, `test`, or `prod` features may be enabled for sight-telemetry."
);

#[cfg(feature = "dev")]
const DEFAULT_FLUSH_MS: u64 = 5_000;
#[cfg(feature = "test")]
const DEFAULT_FLUSH_MS: u64 = 500;
#[cfg(not(any(feature = "dev", feature = "test")))]
const DEFAULT_FLUSH_MS: u64 = 60_000;

fn default_flush_interval_ms() -> u64 {
    DEFAULT_FLUSH_MS
}

pub mod metrics {
    pub const INBOUND_RECEIVED: &str = "inbound.received";
    pub const INBOUND_MALFORMED: &str = "inbound.malformed";
    pub const INBOUND_UNADDRESSED: &str = "inbound.unaddressed";
    pub const INBOUND_FORWARDED: &str = "inbound.forwarded";
    pub const INBOUND_FORWARD_FAILED: &str = "inbound.forward_failed";
    pub const OUTBOUND_PUBLISHED: &str = "outbound.published";
    pub const OUTBOUND_PUBLISH_FAILED: &str = "outbound.publish_failed";
    pub const BOOTSTRAP_CONNECTED: &str = "bootstrap.connected";
    pub const BOOTSTRAP_INVALID: &str = "bootstrap.invalid";
    pub const BOOTSTRAP_UNREACHABLE: &str = "bootstrap.unreachable";
    /// Latency series: wall time of one tunnel POST.
    pub const TUNNEL_FORWARD_MS: &str = "tunnel.forward_ms";
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct TelemetryConfig {
    /// Cadence of the summary log line, in milliseconds.
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    /// Labels attached to every snapshot.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: default_flush_interval_ms(),
            labels: BTreeMap::new(),
        }
    }
}

impl TelemetryConfig {
    pub fn sample(component: &str) -> Self {
        Self {
            flush_interval_ms: default_flush_interval_ms(),
            labels: BTreeMap::from([("component".into(), component.into())]),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TelemetryError {
    #[error("counter overflow for metric {0}")]
    CounterOverflow(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetrySnapshot {
    pub timestamp: SystemTime,
    pub labels: BTreeMap<String, String>,
    pub counters: BTreeMap<String, u64>,
    pub latencies_ms: BTreeMap<String, Vec<u64>>,
}

/// Count, mean and max of one latency series.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LatencySummary {
    pub count: usize,
    pub mean_ms: u64,
    pub max_ms: u64,
}

impl LatencySummary {
    pub fn of(samples: &[u64]) -> Option<Self> {
        let max_ms = *samples.iter().max()?;
        let total: u128 = samples.iter().map(|&v| u128::from(v)).sum();
        let mean_ms = u64::try_from(total / samples.len() as u128).unwrap_or(u64::MAX);
        Some(Self {
            count: samples.len(),
            mean_ms,
            max_ms,
        })
    }
}

#[derive(Default)]
struct TelemetryState {
    counters: BTreeMap<String, u64>,
    latencies_ms: BTreeMap<String, Vec<u64>>,
}

#[derive(Clone)]
pub struct TelemetryHandle {
    config: TelemetryConfig,
    state: Arc<Mutex<TelemetryState>>,
}

impl Default for TelemetryHandle {
    fn default() -> Self {
        Self::from_config(TelemetryConfig::default())
    }
}

impl TelemetryHandle {
    pub fn from_config(config: TelemetryConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(TelemetryState::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TelemetryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record_counter(&self, name: &str, delta: u64) -> Result<(), TelemetryError> {
        let mut guard = self.lock();
        let entry = guard.counters.entry(name.to_owned()).or_default();
        *entry = entry
            .checked_add(delta)
            .ok_or_else(|| TelemetryError::CounterOverflow(name.to_owned()))?;
        Ok(())
    }

    pub fn record_latency_ms(&self, name: &str, value: u64) {
        self.lock()
            .latencies_ms
            .entry(name.to_owned())
            .or_default()
            .push(value);
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.lock().counters.get(name).copied().unwrap_or(0)
    }

    /// Current state; nothing is reset.
    pub fn snapshot(&self) -> TelemetrySnapshot {
        let guard = self.lock();
        TelemetrySnapshot {
            timestamp: SystemTime::now(),
            labels: self.config.labels.clone(),
            counters: guard.counters.clone(),
            latencies_ms: guard.latencies_ms.clone(),
        }
    }

    /// Like [`snapshot`](Self::snapshot) but drains the latency samples.
    /// Counters are cumulative for the life of the process.
    pub fn flush(&self) -> TelemetrySnapshot {
        let mut guard = self.lock();
        TelemetrySnapshot {
            timestamp: SystemTime::now(),
            labels: self.config.labels.clone(),
            counters: guard.counters.clone(),
            latencies_ms: std::mem::take(&mut guard.latencies_ms),
        }
    }

    pub fn flush_interval(&self) -> u64 {
        self.config.flush_interval_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> TelemetryHandle {
        TelemetryHandle::from_config(TelemetryConfig::sample("relay"))
    }

    #[test]
    fn records_counters_and_latencies() {
        let handle = handle();
        handle.record_counter(metrics::INBOUND_FORWARDED, 1).unwrap();
        handle.record_counter(metrics::INBOUND_FORWARDED, 2).unwrap();
        handle.record_latency_ms(metrics::TUNNEL_FORWARD_MS, 42);
        let snapshot = handle.snapshot();
        assert_eq!(snapshot.counters[metrics::INBOUND_FORWARDED], 3);
        assert_eq!(snapshot.latencies_ms[metrics::TUNNEL_FORWARD_MS], vec![42]);
        assert_eq!(snapshot.labels["component"], "relay");
        assert_eq!(handle.counter(metrics::INBOUND_MALFORMED), 0);
    }

    #[test]
    fn detects_counter_overflow() {
        let handle = handle();
        handle.record_counter("x", u64::MAX).unwrap();
        let err = handle.record_counter("x", 1).unwrap_err();
        assert_eq!(err, TelemetryError::CounterOverflow("x".into()));
        assert_eq!(handle.counter("x"), u64::MAX);
    }

    #[test]
    fn flush_drains_latencies_but_keeps_counters() {
        let handle = handle();
        handle.record_counter(metrics::OUTBOUND_PUBLISHED, 1).unwrap();
        handle.record_latency_ms(metrics::TUNNEL_FORWARD_MS, 7);
        let first = handle.flush();
        assert_eq!(first.latencies_ms[metrics::TUNNEL_FORWARD_MS], vec![7]);
        let second = handle.flush();
        assert!(second.latencies_ms.is_empty());
        assert_eq!(second.counters[metrics::OUTBOUND_PUBLISHED], 1);
    }

    #[test]
    fn clones_share_state() {
        let handle = handle();
        let clone = handle.clone();
        clone.record_counter(metrics::INBOUND_RECEIVED, 5).unwrap();
        assert_eq!(handle.counter(metrics::INBOUND_RECEIVED), 5);
    }

    #[test]
    fn summarises_latency_series() {
        assert_eq!(LatencySummary::of(&[]), None);
        let summary = LatencySummary::of(&[10, 20, 60]).unwrap();
        assert_eq!(
            summary,
            LatencySummary {
                count: 3,
                mean_ms: 30,
                max_ms: 60
            }
        );
    }

    #[test]
    fn config_defaults_flush_interval() {
        let config: TelemetryConfig = serde_json::from_str(r#"{"labels":{"node":"a"}}"#).unwrap();
        assert_eq!(config.flush_interval_ms, DEFAULT_FLUSH_MS);
        assert_eq!(config.labels["node"], "a");
    }
}
