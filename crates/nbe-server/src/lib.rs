//! # nbe-server
//!
//! Axum HTTP + `WebSocket` front for the NBE master.
//!
//! - `GET /ws`: agent connections, one dispatch session per peer IP
//! - `POST /hosts/{host}/tasks`: submit a task to a connected host
//! - `GET /health` and `GET /metrics` (Prometheus)
//! - Graceful shutdown via `CancellationToken`

#![deny(unsafe_code)]

pub mod config;
pub mod health;
pub mod metrics;
pub mod server;
pub mod shutdown;

pub use config::{ServerConfig, hub_config};
pub use server::{ApiError, AppState, DispatchServer};
pub use shutdown::ShutdownCoordinator;
