use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, ValueEnum};
use coh_core::Catalog;
use coh_ops::CoordinatorConfig;
use coh_reconcile::{Backoff, ReconcilerConfig};
use regex::Regex;

/// Where last-applied resource sets are kept.
#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum StoreBackend {
    /// One Secret per deployment, next to the custom resource
    Secret,
    /// Local SQLite file
    Sqlite,
}

/// Controller settings. Every flag can also come from its `COH_*` variable.
#[derive(Args, Debug, Clone)]
pub struct OperatorConfig {
    /// Namespace to watch (default: all namespaces)
    #[arg(long = "watch-namespace", env = "COH_WATCH_NAMESPACE")]
    pub namespace: Option<String>,

    /// Concurrent reconcile workers
    #[arg(long, env = "COH_WORKERS", default_value_t = 4)]
    pub workers: usize,

    /// Pending deployments kept before the oldest is dropped
    #[arg(long = "queue-cap", env = "COH_QUEUE_CAP", default_value_t = 2048)]
    pub queue_capacity: usize,

    /// Requeue delay while StatusHA holds a scale-down
    #[arg(long, env = "COH_STATUS_HA_RETRY", default_value = "1m", value_parser = parse_duration)]
    pub status_ha_retry: Duration,

    /// Requeue delay while the start quorum is unmet
    #[arg(long, env = "COH_QUORUM_RETRY", default_value = "30s", value_parser = parse_duration)]
    pub quorum_retry: Duration,

    /// Requeue delay while members are becoming ready
    #[arg(long, env = "COH_READY_POLL", default_value = "10s", value_parser = parse_duration)]
    pub ready_poll: Duration,

    /// How long one scaling step may take to settle
    #[arg(long, env = "COH_SETTLE_TIMEOUT", default_value = "5m", value_parser = parse_duration)]
    pub settle_timeout: Duration,

    #[arg(long, env = "COH_SETTLE_POLL", default_value = "2s", value_parser = parse_duration)]
    pub settle_poll: Duration,

    /// First retry delay after a transient failure
    #[arg(long, env = "COH_BACKOFF_BASE", default_value = "500ms", value_parser = parse_duration)]
    pub backoff_base: Duration,

    #[arg(long, env = "COH_BACKOFF_CEILING", default_value = "60s", value_parser = parse_duration)]
    pub backoff_ceiling: Duration,

    #[arg(long, env = "COH_BACKOFF_MAX_ATTEMPTS", default_value_t = 8)]
    pub backoff_max_attempts: u32,

    /// Unmet quorum observations before the status reports a stall
    #[arg(long, env = "COH_MAX_QUORUM_OBSERVATIONS", default_value_t = 60)]
    pub max_quorum_observations: u32,

    #[arg(long, env = "COH_STORE", value_enum, default_value_t = StoreBackend::Secret)]
    pub store: StoreBackend,

    /// SQLite file used with `--store sqlite`
    #[arg(long, env = "COH_STORE_PATH", default_value = "coherence-operator.db")]
    pub store_path: PathBuf,

    /// Prometheus listener, host:port
    #[arg(long, env = "COH_METRICS_ADDR")]
    pub metrics_addr: Option<String>,

    #[arg(long, env = "COH_FIELD_MANAGER", default_value = coh_kubehub::DEFAULT_FIELD_MANAGER)]
    pub field_manager: String,
}

impl OperatorConfig {
    pub fn reconciler_config(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            status_ha_retry: self.status_ha_retry,
            quorum_retry: self.quorum_retry,
            ready_poll: self.ready_poll,
            max_quorum_observations: self.max_quorum_observations,
            coordinator: CoordinatorConfig { settle_timeout: self.settle_timeout, settle_poll: self.settle_poll },
            ..ReconcilerConfig::default()
        }
    }

    pub fn backoff(&self) -> Backoff {
        Backoff { base: self.backoff_base, ceiling: self.backoff_ceiling, max_attempts: self.backoff_max_attempts }
    }
}

/// `90s`, `2m`, `500ms`, `1h`, or a bare number of seconds.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let re = Regex::new(r"^\s*(\d+)\s*(ms|s|m|h)?\s*$").map_err(|e| e.to_string())?;
    let caps = re.captures(s).ok_or_else(|| format!("invalid duration '{s}' (expected e.g. 90s, 2m, 500ms, 1h)"))?;
    let n: u64 = caps[1].parse().map_err(|e| format!("invalid duration '{s}': {e}"))?;
    let d = match caps.get(2).map(|m| m.as_str()) {
        Some("ms") => Duration::from_millis(n),
        Some("m") => Duration::from_secs(n.saturating_mul(60)),
        Some("h") => Duration::from_secs(n.saturating_mul(3600)),
        _ => Duration::from_secs(n),
    };
    Ok(d)
}

/// Built-in catalog, or the built-in one overlaid with a YAML file.
pub fn load_catalog(path: Option<&Path>) -> Result<Catalog> {
    match path {
        None => Ok(Catalog::default()),
        Some(p) => {
            let text = std::fs::read_to_string(p).with_context(|| format!("reading catalog {}", p.display()))?;
            serde_yaml::from_str(&text).with_context(|| format!("parsing catalog {}", p.display()))
        }
    }
}
