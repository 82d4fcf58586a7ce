//! # nbe-master
//!
//! NBE master binary: loads settings, opens the database, and serves agent
//! connections until Ctrl-C.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use nbe_dispatch::{CommandTrigger, ContainerReconciler, FsStaticAssets, Hub, StaticLayout};
use nbe_server::{DispatchServer, ServerConfig, hub_config};
use nbe_settings::{LoggingSettings, NbeSettings};
use nbe_store::{Database, SqliteStore};
use tracing::info;

/// NBE master: dispatches container commands to connected agents.
#[derive(Parser, Debug)]
#[command(name = "nbe-master", about = "NBE container orchestration master", version)]
struct Cli {
    /// Settings file (defaults to `~/.nbe/settings.json`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Path to the `SQLite` database (overrides settings).
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Log level or filter directive (overrides settings).
    #[arg(long)]
    log_level: Option<String>,
}

impl Cli {
    fn load_settings(&self) -> Result<NbeSettings> {
        let path = self
            .config
            .clone()
            .unwrap_or_else(nbe_settings::settings_path);
        let mut settings = nbe_settings::load_settings_from_path(&path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?;
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(level) = &self.log_level {
            settings.logging.level.clone_from(level);
        }
        settings.validate().context("Invalid settings")?;
        Ok(settings)
    }

    /// Level used while settings load: the flag, then `NBE_LOG_LEVEL`, then
    /// the default.
    fn bootstrap_level(&self, env_level: Option<String>) -> String {
        self.log_level
            .clone()
            .or(env_level.filter(|level| !level.trim().is_empty()))
            .unwrap_or_else(|| LoggingSettings::default().level)
    }

    fn db_path(&self, settings: &NbeSettings) -> PathBuf {
        self.db_path
            .clone()
            .unwrap_or_else(|| settings.database.resolve(&nbe_settings::nbe_home()))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    let bootstrap = nbe_core::logging::bootstrap_subscriber(
        &args.bootstrap_level(std::env::var("NBE_LOG_LEVEL").ok()),
    );
    let settings = tracing::subscriber::with_default(bootstrap, || args.load_settings())?;
    nbe_core::logging::init_subscriber(&settings.logging.level, settings.logging.json);
    let _ = nbe_settings::init_settings(settings.clone());

    let db_path = args.db_path(&settings);
    let db = Database::open(&db_path)
        .with_context(|| format!("Failed to open database at {}", db_path.display()))?;
    info!(path = %db_path.display(), "database opened");
    let store = Arc::new(SqliteStore::new(db));

    let metrics = nbe_server::metrics::install_recorder()
        .context("Failed to install metrics recorder")?;

    let trigger = CommandTrigger::new(&settings.proxy.reload_command)
        .context("Invalid proxy reload command")?;
    let reconciler = ContainerReconciler::new(
        store.clone(),
        Arc::new(FsStaticAssets),
        StaticLayout::new(&settings.proxy.static_dir, &settings.proxy.static_src_dir),
    );
    let hub = Hub::new(hub_config(&settings), Arc::new(reconciler), Arc::new(trigger));

    let config = ServerConfig::from_settings(&settings);
    let shutdown_timeout = config.shutdown_timeout;
    let server = DispatchServer::new(config, hub.clone(), store, metrics);
    let coordinator = server.shutdown().clone();
    coordinator.track(hub.spawn_liveness_sweep(coordinator.token()));
    let addr = server.listen().await.context("Failed to bind listener")?;
    info!(%addr, "nbe master ready");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("shutdown requested");

    coordinator.graceful_shutdown(shutdown_timeout).await;
    hub.shutdown().await;
    info!("nbe master stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_level_prefers_flag_then_env() {
        let mut cli = Cli::parse_from(["nbe-master"]);
        assert_eq!(cli.bootstrap_level(None), LoggingSettings::default().level);
        assert_eq!(cli.bootstrap_level(Some(" ".into())), LoggingSettings::default().level);
        assert_eq!(cli.bootstrap_level(Some("debug".into())), "debug");

        cli.log_level = Some("trace".into());
        assert_eq!(cli.bootstrap_level(Some("debug".into())), "trace");
    }
}
