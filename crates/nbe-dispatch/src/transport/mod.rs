//! The connection to one agent.
//!
//! A session talks to its agent only through [`AgentTransport`]: it sends
//! [`GroupedTask`] messages, receives [`TaskReply`] envelopes, and pings.
//! [`websocket::WsTransport`] is the production implementation;
//! [`memory::pair`] builds an in-process transport and a scripted agent.

pub mod memory;
pub mod websocket;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nbe_core::{GroupedTask, TaskReply};

/// Invoked whenever the agent answers a ping.
pub type PongHandler = Arc<dyn Fn() + Send + Sync>;

/// Outcome of one successful [`AgentTransport::recv`].
#[derive(Clone, Debug, PartialEq)]
pub enum Received {
    /// A decoded reply envelope.
    Reply(TaskReply),
    /// The read deadline passed without a reply. Not an error.
    Idle,
}

/// Hard transport failures. Any of these ends the session.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The connection is closed (locally or by the agent).
    #[error("transport closed")]
    Closed,
    /// The underlying connection failed.
    #[error("transport I/O error: {0}")]
    Io(String),
    /// A group could not be serialized.
    #[error("failed to encode group: {0}")]
    Encode(#[from] serde_json::Error),
    /// A write did not complete within its deadline.
    #[error("write timed out after {0:?}")]
    Timeout(Duration),
}

/// Bidirectional message connection to one agent.
///
/// Sends may run concurrently with a pending [`recv`](Self::recv).
#[async_trait]
pub trait AgentTransport: Send + Sync {
    /// Send one group as a single framed message.
    async fn send_group(&self, group: &GroupedTask) -> Result<(), TransportError>;

    /// Wait for the next reply envelope.
    async fn recv(&self) -> Result<Received, TransportError>;

    /// Send a liveness probe.
    async fn ping(&self, payload: &[u8]) -> Result<(), TransportError>;

    /// Install the callback run on every pong, replacing any previous one.
    fn set_pong_handler(&self, handler: PongHandler);

    /// Close the connection. Idempotent.
    async fn close(&self);

    /// Whether [`close`](Self::close) has run or the peer went away.
    fn is_closed(&self) -> bool;
}
