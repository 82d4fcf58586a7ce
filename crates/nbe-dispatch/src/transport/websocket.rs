//! [`AgentTransport`] over an axum WebSocket.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use nbe_core::{GroupedTask, TaskReply};
use parking_lot::Mutex;
use tokio::time;
use tracing::{debug, warn};

use super::{AgentTransport, PongHandler, Received, TransportError};

/// Deadlines applied to one agent connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WsOptions {
    /// Deadline for one outbound frame.
    pub write_timeout: Duration,
    /// Silence after which [`AgentTransport::recv`] reports [`Received::Idle`].
    pub read_timeout: Duration,
}

impl Default for WsOptions {
    fn default() -> Self {
        Self {
            write_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(60),
        }
    }
}

/// An upgraded agent WebSocket, split so writes never wait on a pending read.
pub struct WsTransport {
    sink: tokio::sync::Mutex<SplitSink<WebSocket, Message>>,
    stream: tokio::sync::Mutex<SplitStream<WebSocket>>,
    pong: Mutex<Option<PongHandler>>,
    closed: AtomicBool,
    options: WsOptions,
}

impl WsTransport {
    /// Wrap an upgraded socket.
    pub fn new(socket: WebSocket, options: WsOptions) -> Self {
        let (sink, stream) = socket.split();
        Self {
            sink: tokio::sync::Mutex::new(sink),
            stream: tokio::sync::Mutex::new(stream),
            pong: Mutex::new(None),
            closed: AtomicBool::new(false),
            options,
        }
    }

    async fn write(&self, message: Message) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let mut sink = self.sink.lock().await;
        match time::timeout(self.options.write_timeout, sink.send(message)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(TransportError::Io(e.to_string())),
            Err(_) => Err(TransportError::Timeout(self.options.write_timeout)),
        }
    }

    fn on_pong(&self) {
        let handler = self.pong.lock().clone();
        if let Some(handler) = handler {
            handler();
        }
    }
}

fn decode_reply(raw: &[u8]) -> Option<TaskReply> {
    match serde_json::from_slice(raw) {
        Ok(reply) => Some(reply),
        Err(e) => {
            warn!(error = %e, len = raw.len(), "undecodable reply frame, skipping");
            None
        }
    }
}

#[async_trait]
impl AgentTransport for WsTransport {
    async fn send_group(&self, group: &GroupedTask) -> Result<(), TransportError> {
        let json = serde_json::to_string(group)?;
        self.write(Message::Text(json.into())).await
    }

    async fn recv(&self) -> Result<Received, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let mut stream = self.stream.lock().await;
        loop {
            let Ok(next) = time::timeout(self.options.read_timeout, stream.next()).await else {
                return Ok(Received::Idle);
            };
            match next {
                Some(Ok(Message::Text(text))) => {
                    if let Some(reply) = decode_reply(text.as_str().as_bytes()) {
                        return Ok(Received::Reply(reply));
                    }
                }
                Some(Ok(Message::Binary(bytes))) => {
                    if let Some(reply) = decode_reply(&bytes) {
                        return Ok(Received::Reply(reply));
                    }
                }
                Some(Ok(Message::Pong(_))) => self.on_pong(),
                // axum queues the pong answer itself
                Some(Ok(Message::Ping(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "agent sent close frame");
                    self.closed.store(true, Ordering::Release);
                    return Err(TransportError::Closed);
                }
                Some(Err(e)) => return Err(TransportError::Io(e.to_string())),
                None => {
                    self.closed.store(true, Ordering::Release);
                    return Err(TransportError::Closed);
                }
            }
        }
    }

    async fn ping(&self, payload: &[u8]) -> Result<(), TransportError> {
        self.write(Message::Ping(payload.to_vec().into())).await
    }

    fn set_pong_handler(&self, handler: PongHandler) {
        *self.pong.lock() = Some(handler);
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut sink = self.sink.lock().await;
        if let Ok(Err(e)) = time::timeout(self.options.write_timeout, sink.close()).await {
            debug!(error = %e, "websocket close failed");
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
