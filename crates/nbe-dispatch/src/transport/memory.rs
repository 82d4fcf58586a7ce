//! In-process transport: a [`MemoryTransport`] for the session side and a
//! [`MemoryAgent`] handle that plays the agent.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use nbe_core::{GroupedTask, TaskReply};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{AgentTransport, PongHandler, Received, TransportError};

/// A message the master sent to the agent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outbound {
    /// A flushed group.
    Group(GroupedTask),
    /// A liveness probe.
    Ping(Vec<u8>),
}

#[derive(Debug)]
enum Inbound {
    Reply(TaskReply),
    Pong,
    Idle,
    Fail(String),
}

/// Master side of an in-process connection.
pub struct MemoryTransport {
    outbound: mpsc::UnboundedSender<Outbound>,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<Inbound>>,
    pong: Mutex<Option<PongHandler>>,
    closed: CancellationToken,
    fail_sends: Arc<AtomicBool>,
    rejected: Arc<Mutex<HashSet<String>>>,
}

/// Agent side of an in-process connection.
pub struct MemoryAgent {
    outbound: mpsc::UnboundedReceiver<Outbound>,
    inbound: mpsc::UnboundedSender<Inbound>,
    closed: CancellationToken,
    fail_sends: Arc<AtomicBool>,
    rejected: Arc<Mutex<HashSet<String>>>,
}

/// Build a connected transport/agent pair.
pub fn pair() -> (MemoryTransport, MemoryAgent) {
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    let closed = CancellationToken::new();
    let fail_sends = Arc::new(AtomicBool::new(false));
    let rejected = Arc::new(Mutex::new(HashSet::new()));
    (
        MemoryTransport {
            outbound: out_tx,
            inbound: tokio::sync::Mutex::new(in_rx),
            pong: Mutex::new(None),
            closed: closed.clone(),
            fail_sends: fail_sends.clone(),
            rejected: rejected.clone(),
        },
        MemoryAgent {
            outbound: out_rx,
            inbound: in_tx,
            closed,
            fail_sends,
            rejected,
        },
    )
}

#[async_trait]
impl AgentTransport for MemoryTransport {
    async fn send_group(&self, group: &GroupedTask) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        if self.fail_sends.load(Ordering::Acquire) || self.rejected.lock().contains(&group.name) {
            return Err(TransportError::Io("send rejected by agent".into()));
        }
        self.outbound
            .send(Outbound::Group(group.clone()))
            .map_err(|_| TransportError::Closed)
    }

    async fn recv(&self) -> Result<Received, TransportError> {
        let mut inbound = self.inbound.lock().await;
        loop {
            let message = tokio::select! {
                () = self.closed.cancelled() => return Err(TransportError::Closed),
                message = inbound.recv() => message,
            };
            match message {
                Some(Inbound::Reply(reply)) => return Ok(Received::Reply(reply)),
                Some(Inbound::Idle) => return Ok(Received::Idle),
                Some(Inbound::Fail(reason)) => return Err(TransportError::Io(reason)),
                Some(Inbound::Pong) => {
                    let handler = self.pong.lock().clone();
                    if let Some(handler) = handler {
                        handler();
                    }
                }
                None => return Err(TransportError::Closed),
            }
        }
    }

    async fn ping(&self, payload: &[u8]) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.outbound
            .send(Outbound::Ping(payload.to_vec()))
            .map_err(|_| TransportError::Closed)
    }

    fn set_pong_handler(&self, handler: PongHandler) {
        *self.pong.lock() = Some(handler);
    }

    async fn close(&self) {
        self.closed.cancel();
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

impl MemoryAgent {
    /// Next message from the master, or `None` once the master side is gone.
    pub async fn next(&mut self) -> Option<Outbound> {
        self.outbound.recv().await
    }

    /// Next group from the master, skipping pings.
    pub async fn next_group(&mut self) -> Option<GroupedTask> {
        loop {
            match self.outbound.recv().await? {
                Outbound::Group(group) => return Some(group),
                Outbound::Ping(_) => {}
            }
        }
    }

    /// A message already sent by the master, without waiting.
    pub fn try_next(&mut self) -> Option<Outbound> {
        self.outbound.try_recv().ok()
    }

    /// Deliver a reply envelope.
    pub fn reply(&self, reply: TaskReply) {
        let _ = self.inbound.send(Inbound::Reply(reply));
    }

    /// Answer a ping.
    pub fn pong(&self) {
        let _ = self.inbound.send(Inbound::Pong);
    }

    /// Make the next `recv` report a read timeout.
    pub fn idle(&self) {
        let _ = self.inbound.send(Inbound::Idle);
    }

    /// Make the next `recv` fail with an I/O error.
    pub fn fail(&self, reason: impl Into<String>) {
        let _ = self.inbound.send(Inbound::Fail(reason.into()));
    }

    /// Make every following `send_group` fail (or succeed again).
    pub fn reject_sends(&self, reject: bool) {
        self.fail_sends.store(reject, Ordering::Release);
    }

    /// Make sends of groups for application `name` fail, leaving others
    /// untouched.
    pub fn reject_groups_named(&self, name: impl Into<String>) {
        let _ = self.rejected.lock().insert(name.into());
    }

    /// Whether the master closed the connection.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Wait until the master closes the connection.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }
}
