//! Server and hub configuration derived from settings.

use std::time::Duration;

use nbe_dispatch::transport::websocket::WsOptions;
use nbe_dispatch::{FlushPolicy, HubConfig, SessionConfig};
use nbe_settings::NbeSettings;

/// Configuration for the HTTP/WebSocket front.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerConfig {
    /// Host to bind.
    pub host: String,
    /// Port to bind (`0` picks a free port).
    pub port: u16,
    /// Largest accepted agent frame, in bytes.
    pub max_message_size: usize,
    /// Per-connection deadlines.
    pub ws: WsOptions,
    /// How long shutdown waits for server tasks before aborting them.
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            max_message_size: 1024 * 1024,
            ws: WsOptions::default(),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

impl ServerConfig {
    /// Build from loaded settings.
    pub fn from_settings(settings: &NbeSettings) -> Self {
        let server = &settings.server;
        Self {
            host: server.host.clone(),
            port: server.port,
            max_message_size: server.max_message_size,
            ws: WsOptions {
                write_timeout: server.write_timeout(),
                read_timeout: server.read_timeout(),
            },
            shutdown_timeout: server.shutdown_timeout(),
        }
    }
}

/// Hub timing and batching from loaded settings.
pub fn hub_config(settings: &NbeSettings) -> HubConfig {
    HubConfig {
        session: SessionConfig {
            flush: FlushPolicy::new(
                settings.dispatch.flush_size,
                settings.dispatch.flush_interval(),
            ),
            queue_capacity: settings.dispatch.queue_capacity,
        },
        completion: FlushPolicy::new(
            settings.hub.completion_batch_size,
            settings.hub.completion_interval(),
        ),
        liveness_sweep_interval: settings.hub.liveness_sweep_interval(),
        liveness_timeout: settings.hub.liveness_timeout(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_binds_loopback_on_free_port() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.host, "127.0.0.1");
        assert_eq!(cfg.port, 0);
    }

    #[test]
    fn from_default_settings() {
        let cfg = ServerConfig::from_settings(&NbeSettings::default());
        assert_eq!(cfg.host, "0.0.0.0");
        assert_eq!(cfg.port, 8090);
        assert_eq!(cfg.max_message_size, 1024 * 1024);
        assert_eq!(cfg.ws.write_timeout, Duration::from_secs(10));
        assert_eq!(cfg.ws.read_timeout, Duration::from_secs(60));
    }

    #[test]
    fn hub_config_from_default_settings() {
        let cfg = hub_config(&NbeSettings::default());
        assert_eq!(cfg.session.flush.max_items, 10);
        assert_eq!(cfg.session.flush.interval, Duration::from_secs(5));
        assert_eq!(cfg.session.queue_capacity, 1024);
        assert_eq!(cfg.completion.max_items, 5);
        assert_eq!(cfg.completion.interval, Duration::from_secs(5));
        assert_eq!(cfg.liveness_sweep_interval, Duration::from_secs(60));
        assert_eq!(cfg.liveness_timeout, Duration::from_secs(60));
    }

    #[test]
    fn overrides_flow_through() {
        let mut settings = NbeSettings::default();
        settings.server.port = 9000;
        settings.dispatch.flush_size = 3;
        settings.hub.liveness_timeout_ms = 1_500;
        assert_eq!(ServerConfig::from_settings(&settings).port, 9000);
        let hub = hub_config(&settings);
        assert_eq!(hub.session.flush.max_items, 3);
        assert_eq!(hub.liveness_timeout, Duration::from_millis(1_500));
    }
}
