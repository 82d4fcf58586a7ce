//! # nbe-store
//!
//! `SQLite` persistence for the orchestration entities the dispatcher
//! reconciles: applications, hosts, and containers.
//!
//! The dispatcher only sees the [`OrchestrationStore`] trait; [`SqliteStore`]
//! is the production implementation over a shared [`Database`].

#![deny(unsafe_code)]

pub mod database;
pub mod error;
pub mod models;
pub mod schema;
pub mod store;

pub use database::Database;
pub use error::StoreError;
pub use models::{Application, Container, Host};
pub use store::{OrchestrationStore, SqliteStore};
