//! # nbe-dispatch
//!
//! The master side of the agent protocol.
//!
//! - [`session`]: one [`DispatchSession`] per connected host. Tasks are
//!   grouped by `(name, owner, kind)`, flushed when the queue reaches the
//!   size threshold or the interval elapses, and correlated with the
//!   agent's positional replies.
//! - [`hub`]: the [`Hub`] registry mapping hosts to sessions, with liveness
//!   eviction and batched proxy regeneration.
//! - [`reconcile`]: applies correlated replies to container records.
//! - [`transport`]: the [`AgentTransport`] seam plus WebSocket and in-memory
//!   implementations.

#![deny(unsafe_code)]

pub mod assets;
pub mod batch;
pub mod completion;
pub mod error;
pub mod hub;
pub mod metrics;
pub mod reconcile;
pub mod regenerate;
pub mod session;
pub mod transport;

pub use assets::{AssetError, FsStaticAssets, StaticAssets, StaticLayout};
pub use batch::{Accumulator, FlushPolicy, run_batcher};
pub use completion::CompletionHandle;
pub use error::DispatchError;
pub use hub::{Hub, HubConfig, SweepReport};
pub use reconcile::{ContainerReconciler, ReplySink};
pub use regenerate::{CommandTrigger, RegenerationTrigger, TriggerError};
pub use session::{DispatchSession, SessionConfig};
pub use transport::{AgentTransport, PongHandler, Received, TransportError};
