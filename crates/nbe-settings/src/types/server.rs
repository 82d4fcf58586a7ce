//! Network front, database, and logging settings.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// HTTP / WebSocket listener settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Listen port for agents and the HTTP surface.
    pub port: u16,
    /// Largest agent frame accepted, in bytes.
    pub max_message_size: usize,
    /// Deadline for writing one frame to an agent, in milliseconds.
    pub write_timeout_ms: u64,
    /// Read deadline after which a silent connection reports idle, in milliseconds.
    pub read_timeout_ms: u64,
    /// Grace period for in-flight work on shutdown, in milliseconds.
    pub shutdown_timeout_ms: u64,
}

impl ServerSettings {
    /// Write deadline as a [`Duration`].
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// Read deadline as a [`Duration`].
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Shutdown grace period as a [`Duration`].
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8090,
            max_message_size: 1024 * 1024,
            write_timeout_ms: 10_000,
            read_timeout_ms: 60_000,
            shutdown_timeout_ms: 10_000,
        }
    }
}

/// `SQLite` database location.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DatabaseSettings {
    /// Database file. Relative paths resolve against `~/.nbe`.
    pub path: String,
}

impl DatabaseSettings {
    /// Resolve [`path`](Self::path) against `home` when it is relative.
    pub fn resolve(&self, home: &Path) -> PathBuf {
        let path = Path::new(&self.path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            home.join(path)
        }
    }
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            path: "database/nbe.db".to_string(),
        }
    }
}

/// Log output settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Minimum level (`RUST_LOG` wins when set).
    pub level: String,
    /// Emit one JSON object per line instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_defaults() {
        let s = ServerSettings::default();
        assert_eq!(s.host, "0.0.0.0");
        assert_eq!(s.port, 8090);
        assert_eq!(s.max_message_size, 1_048_576);
        assert_eq!(s.write_timeout(), Duration::from_secs(10));
        assert_eq!(s.read_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn server_partial_json() {
        let s: ServerSettings = serde_json::from_str(r#"{"port": 9000}"#).unwrap();
        assert_eq!(s.port, 9000);
        assert_eq!(s.host, "0.0.0.0");
    }

    #[test]
    fn relative_database_path_resolves_under_home() {
        let db = DatabaseSettings::default();
        assert_eq!(
            db.resolve(Path::new("/home/ops/.nbe")),
            PathBuf::from("/home/ops/.nbe/database/nbe.db")
        );
    }

    #[test]
    fn absolute_database_path_is_kept() {
        let db = DatabaseSettings {
            path: "/var/lib/nbe/nbe.db".into(),
        };
        assert_eq!(
            db.resolve(Path::new("/home/ops/.nbe")),
            PathBuf::from("/var/lib/nbe/nbe.db")
        );
    }

    #[test]
    fn logging_defaults() {
        let l = LoggingSettings::default();
        assert_eq!(l.level, "info");
        assert!(!l.json);
    }
}
