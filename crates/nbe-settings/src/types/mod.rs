//! Settings type definitions.
//!
//! All types use camelCase JSON keys and `#[serde(default)]`, so a settings
//! file only needs the values it changes.

mod dispatch;
mod server;

pub use dispatch::*;
pub use server::*;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type for the NBE master.
///
/// ```json
/// {
///   "server": { "port": 9000 },
///   "dispatch": { "flushSize": 20 },
///   "proxy": { "reloadCommand": ["systemctl", "reload", "nginx"] }
/// }
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NbeSettings {
    /// Listener settings.
    pub server: ServerSettings,
    /// Per-session batching.
    pub dispatch: DispatchSettings,
    /// Registry liveness and completion batching.
    pub hub: HubSettings,
    /// Reverse proxy and static assets.
    pub proxy: ProxySettings,
    /// Persistence.
    pub database: DatabaseSettings,
    /// Log output.
    pub logging: LoggingSettings,
}

impl NbeSettings {
    /// Reject values the dispatcher cannot run with.
    ///
    /// Zero thresholds would flush on every task or never; zero intervals
    /// would make `tokio::time::interval` panic.
    pub fn validate(&self) -> Result<()> {
        fn positive(name: &str, value: u64) -> Result<()> {
            if value == 0 {
                return Err(SettingsError::InvalidValue(format!(
                    "{name} must be at least 1"
                )));
            }
            Ok(())
        }

        positive("dispatch.flushSize", self.dispatch.flush_size as u64)?;
        positive("dispatch.flushIntervalMs", self.dispatch.flush_interval_ms)?;
        positive("dispatch.queueCapacity", self.dispatch.queue_capacity as u64)?;
        positive("hub.completionBatchSize", self.hub.completion_batch_size as u64)?;
        positive("hub.completionIntervalMs", self.hub.completion_interval_ms)?;
        positive(
            "hub.livenessSweepIntervalMs",
            self.hub.liveness_sweep_interval_ms,
        )?;
        positive("hub.livenessTimeoutMs", self.hub.liveness_timeout_ms)?;
        positive("server.maxMessageSize", self.server.max_message_size as u64)?;
        positive("server.writeTimeoutMs", self.server.write_timeout_ms)?;
        positive("server.readTimeoutMs", self.server.read_timeout_ms)?;

        if self.proxy.reload_command.first().is_none_or(String::is_empty) {
            return Err(SettingsError::InvalidValue(
                "proxy.reloadCommand must name a program".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn defaults_validate() {
        NbeSettings::default().validate().unwrap();
    }

    #[test]
    fn zero_flush_size_rejected() {
        let mut s = NbeSettings::default();
        s.dispatch.flush_size = 0;
        assert_matches!(
            s.validate(),
            Err(SettingsError::InvalidValue(msg)) if msg.contains("flushSize")
        );
    }

    #[test]
    fn zero_liveness_interval_rejected() {
        let mut s = NbeSettings::default();
        s.hub.liveness_sweep_interval_ms = 0;
        assert_matches!(s.validate(), Err(SettingsError::InvalidValue(_)));
    }

    #[test]
    fn empty_reload_command_rejected() {
        let mut s = NbeSettings::default();
        s.proxy.reload_command.clear();
        assert_matches!(
            s.validate(),
            Err(SettingsError::InvalidValue(msg)) if msg.contains("reloadCommand")
        );
    }

    #[test]
    fn empty_json_is_defaults() {
        let s: NbeSettings = serde_json::from_str("{}").unwrap();
        assert_eq!(s, NbeSettings::default());
    }
}
