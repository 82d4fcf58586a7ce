//! Batching, registry, and reverse-proxy settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Per-session task batching.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DispatchSettings {
    /// Queued task count that triggers an immediate flush.
    pub flush_size: usize,
    /// Period of the time-based flush, in milliseconds.
    pub flush_interval_ms: u64,
    /// Capacity of each session's intake queue.
    pub queue_capacity: usize,
}

impl DispatchSettings {
    /// Flush period as a [`Duration`].
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            flush_size: 10,
            flush_interval_ms: 5_000,
            queue_capacity: 1024,
        }
    }
}

/// Registry liveness and completion batching.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HubSettings {
    /// Distinct completed applications that trigger an immediate regeneration.
    pub completion_batch_size: usize,
    /// Period of the time-based regeneration, in milliseconds.
    pub completion_interval_ms: u64,
    /// Period of the liveness sweep, in milliseconds.
    pub liveness_sweep_interval_ms: u64,
    /// Silence after which a host is evicted, in milliseconds.
    pub liveness_timeout_ms: u64,
}

impl HubSettings {
    /// Completion flush period as a [`Duration`].
    pub fn completion_interval(&self) -> Duration {
        Duration::from_millis(self.completion_interval_ms)
    }

    /// Sweep period as a [`Duration`].
    pub fn liveness_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.liveness_sweep_interval_ms)
    }

    /// Eviction threshold as a [`Duration`].
    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.liveness_timeout_ms)
    }
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            completion_batch_size: 5,
            completion_interval_ms: 5_000,
            liveness_sweep_interval_ms: 60_000,
            liveness_timeout_ms: 60_000,
        }
    }
}

/// Reverse proxy regeneration and static asset locations.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProxySettings {
    /// Program and arguments run after a batch of applications changed.
    pub reload_command: Vec<String>,
    /// Root served by the proxy; assets land in `{name}_static/{version}`.
    pub static_dir: String,
    /// Root of the built assets, laid out as `{name}/{version}`.
    pub static_src_dir: String,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            reload_command: vec!["nginx".into(), "-s".into(), "reload".into()],
            static_dir: "/var/www/nbe".to_string(),
            static_src_dir: "/srv/nbe/static".to_string(),
        }
    }
}
