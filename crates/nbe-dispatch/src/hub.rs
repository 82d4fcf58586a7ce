//! Process-wide registry of agent sessions.
//!
//! The hub maps each host to its live [`DispatchSession`], tracks when each
//! host last proved it was alive, evicts silent hosts, and batches completed
//! applications into proxy regenerations.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use metrics::{counter, gauge};
use nbe_core::{SessionId, Task};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::batch::FlushPolicy;
use crate::completion::{CompletionHandle, spawn_completion_batcher};
use crate::error::DispatchError;
use crate::metrics::{SESSIONS_ACTIVE, SESSIONS_EVICTED_TOTAL};
use crate::reconcile::ReplySink;
use crate::regenerate::RegenerationTrigger;
use crate::session::{DispatchSession, SessionConfig};
use crate::transport::AgentTransport;

/// Hub timing and batching parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HubConfig {
    /// Batching applied to every session the hub creates.
    pub session: SessionConfig,
    /// Triggers for proxy regeneration.
    pub completion: FlushPolicy,
    /// Period of the liveness sweep.
    pub liveness_sweep_interval: Duration,
    /// Silence after which a host is evicted.
    pub liveness_timeout: Duration,
}

/// Outcome of one liveness sweep.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Hosts evicted for silence.
    pub evicted: Vec<String>,
    /// Hosts pinged.
    pub pinged: Vec<String>,
}

#[derive(Default)]
struct HubState {
    sessions: HashMap<String, Arc<DispatchSession>>,
    last_seen: HashMap<String, Instant>,
}

impl HubState {
    fn take(&mut self, host: &str) -> Option<Arc<DispatchSession>> {
        let _ = self.last_seen.remove(host);
        let session = self.sessions.remove(host);
        gauge!(SESSIONS_ACTIVE).set(self.sessions.len() as f64);
        session
    }
}

/// The session registry.
///
/// Both maps sit behind one mutex that is never held across an await.
pub struct Hub {
    state: Mutex<HubState>,
    config: HubConfig,
    sink: Arc<dyn ReplySink>,
    completions: CompletionHandle,
    completion_cancel: CancellationToken,
    completion_worker: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Hub {
    /// Build a hub and start its completion worker.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn new(
        config: HubConfig,
        sink: Arc<dyn ReplySink>,
        trigger: Arc<dyn RegenerationTrigger>,
    ) -> Arc<Self> {
        let completion_cancel = CancellationToken::new();
        let (completions, worker) = spawn_completion_batcher(
            trigger,
            config.completion,
            config.session.queue_capacity,
            completion_cancel.clone(),
        );
        Arc::new(Self {
            state: Mutex::new(HubState::default()),
            config,
            sink,
            completions,
            completion_cancel,
            completion_worker: tokio::sync::Mutex::new(Some(worker)),
        })
    }

    /// The configuration the hub was built with.
    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Route `task` to the session registered for `host`.
    ///
    /// Unknown hosts are rejected without side effects; nothing is queued
    /// for a host that is not connected.
    #[instrument(skip(self, task), fields(name = %task.name, kind = %task.kind))]
    pub async fn dispatch(&self, host: &str, task: Task) -> Result<(), DispatchError> {
        let session = self.session(host).ok_or_else(|| DispatchError::SessionNotFound {
            host: host.to_string(),
        })?;
        session.submit(task).await
    }

    /// The session registered for `host`, if any.
    pub fn session(&self, host: &str) -> Option<Arc<DispatchSession>> {
        self.state.lock().sessions.get(host).cloned()
    }

    /// Register `session` under its host and mark the host alive.
    ///
    /// A session already registered for the host is displaced and closed in
    /// the background.
    pub fn add_session(&self, session: Arc<DispatchSession>) {
        let host = session.host().to_string();
        let displaced = {
            let mut state = self.state.lock();
            let _ = state.last_seen.insert(host.clone(), Instant::now());
            let displaced = state.sessions.insert(host.clone(), session.clone());
            gauge!(SESSIONS_ACTIVE).set(state.sessions.len() as f64);
            displaced
        };
        info!(host = %host, session_id = %session.id(), "session registered");

        if let Some(old) = displaced.filter(|old| old.id() != session.id()) {
            info!(host = %host, session_id = %old.id(), "closing displaced session");
            drop(tokio::spawn(async move { old.close().await }));
        }
    }

    /// Deregister `host` and close its session. A no-op for unknown hosts.
    pub async fn remove_session(&self, host: &str) {
        let session = self.state.lock().take(host);
        if let Some(session) = session {
            info!(host, session_id = %session.id(), "session removed");
            session.close().await;
        }
    }

    /// Deregister `host` only while it still maps to session `id`.
    ///
    /// Returns whether the session was removed. A replacement registered in
    /// the meantime is left alone.
    pub async fn remove_session_if(&self, host: &str, id: &SessionId) -> bool {
        let session = {
            let mut state = self.state.lock();
            match state.sessions.get(host) {
                Some(current) if current.id() == id => state.take(host),
                _ => None,
            }
        };
        match session {
            Some(session) => {
                info!(host, session_id = %id, "session removed");
                session.close().await;
                true
            }
            None => false,
        }
    }

    /// Build, register, and start serving a session for a freshly accepted
    /// agent connection.
    ///
    /// Pongs refresh the host's liveness. When the connection fails the
    /// session is closed and deregistered, unless a newer session has taken
    /// the host over.
    pub fn connect(
        self: &Arc<Self>,
        host: impl Into<String>,
        transport: Arc<dyn AgentTransport>,
    ) -> Arc<DispatchSession> {
        let host = host.into();
        let session = DispatchSession::spawn(
            host.clone(),
            transport.clone(),
            self.config.session,
            self.sink.clone(),
            self.completions.clone(),
        );

        let hub = Arc::downgrade(self);
        let pong_host = host.clone();
        let pong_id = session.id().clone();
        transport.set_pong_handler(Arc::new(move || {
            if let Some(hub) = hub.upgrade() {
                hub.touch_session(&pong_host, &pong_id);
            }
        }));

        self.add_session(session.clone());

        let hub = Arc::clone(self);
        let serving = session.clone();
        drop(tokio::spawn(async move {
            serving.run_receive_loop().await;
            let _ = hub.remove_session_if(serving.host(), serving.id()).await;
            serving.close().await;
        }));

        session
    }

    /// Record that `host` is alive. Ignored for unregistered hosts.
    pub fn touch(&self, host: &str) {
        let mut state = self.state.lock();
        if state.sessions.contains_key(host) {
            let _ = state.last_seen.insert(host.to_string(), Instant::now());
        }
    }

    /// Record that `host` is alive on behalf of session `id`. Ignored once
    /// another session has taken the host over.
    pub fn touch_session(&self, host: &str, id: &SessionId) {
        let mut state = self.state.lock();
        if state.sessions.get(host).is_some_and(|s| s.id() == id) {
            let _ = state.last_seen.insert(host.to_string(), Instant::now());
        }
    }

    /// When `host` last proved it was alive.
    pub fn last_seen(&self, host: &str) -> Option<Instant> {
        self.state.lock().last_seen.get(host).copied()
    }

    /// Run one liveness cycle.
    ///
    /// Every host silent for longer than the liveness timeout is evicted
    /// first; only the survivors are pinged.
    pub async fn sweep_once(&self) -> SweepReport {
        let timeout = self.config.liveness_timeout;
        let (evicted, survivors) = {
            let mut state = self.state.lock();
            let now = Instant::now();
            let stale: Vec<String> = state
                .last_seen
                .iter()
                .filter(|(_, seen)| now.duration_since(**seen) > timeout)
                .map(|(host, _)| host.clone())
                .collect();
            let evicted: Vec<Arc<DispatchSession>> =
                stale.iter().filter_map(|host| state.take(host)).collect();
            let survivors: Vec<Arc<DispatchSession>> = state.sessions.values().cloned().collect();
            (evicted, survivors)
        };

        let mut report = SweepReport::default();
        let closes = evicted.iter().map(|session| async move {
            counter!(SESSIONS_EVICTED_TOTAL).increment(1);
            warn!(host = session.host(), "no pong within liveness timeout, evicting");
            session.close().await;
            session.host().to_string()
        });
        report.evicted = join_all(closes).await;

        let pings = survivors.iter().map(|session| async move {
            if let Err(e) = session.ping().await {
                debug!(host = session.host(), error = %e, "ping failed");
            }
            session.host().to_string()
        });
        report.pinged = join_all(pings).await;
        report
    }

    /// Run [`sweep_once`](Self::sweep_once) every liveness interval until
    /// `cancel` fires.
    pub fn spawn_liveness_sweep(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let hub = Arc::clone(self);
        let period = self.config.liveness_sweep_interval;
        tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let report = hub.sweep_once().await;
                        debug!(
                            evicted = report.evicted.len(),
                            pinged = report.pinged.len(),
                            "liveness sweep"
                        );
                    }
                }
            }
        })
    }

    /// Queue `app_id` for the next proxy regeneration.
    pub async fn report_completed(&self, app_id: i64) {
        self.completions.report(app_id).await;
    }

    /// Number of registered sessions.
    pub fn session_count(&self) -> usize {
        self.state.lock().sessions.len()
    }

    /// Registered hosts, sorted.
    pub fn hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = self.state.lock().sessions.keys().cloned().collect();
        hosts.sort();
        hosts
    }

    /// Close every session, run a final regeneration for pending
    /// completions, and stop the completion worker.
    pub async fn shutdown(&self) {
        let sessions: Vec<Arc<DispatchSession>> = {
            let mut state = self.state.lock();
            state.last_seen.clear();
            let sessions = state.sessions.drain().map(|(_, s)| s).collect();
            gauge!(SESSIONS_ACTIVE).set(0.0);
            sessions
        };
        info!(sessions = sessions.len(), "hub shutting down");
        let _ = join_all(sessions.iter().map(|s| s.close())).await;

        self.completion_cancel.cancel();
        if let Some(worker) = self.completion_worker.lock().await.take() {
            if let Err(e) = worker.await {
                warn!(error = %e, "completion worker ended abnormally");
            }
        }
    }
}
