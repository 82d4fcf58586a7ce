//! # nbe-core
//!
//! Foundation types shared by every NBE master crate:
//!
//! - **Branded IDs**: [`GroupId`] and [`SessionId`] as newtypes for type safety
//! - **Tasks**: [`Task`], [`GroupKey`], [`GroupedTask`] and the agent's
//!   [`TaskReply`] envelope, with their JSON wire forms
//! - **Logging**: [`logging::init_subscriber`] for the `tracing` subscriber

#![deny(unsafe_code)]

pub mod ids;
pub mod logging;
pub mod task;

pub use ids::{GroupId, SessionId};
pub use task::{GroupKey, GroupedTask, Placement, Task, TaskKind, TaskReply};
