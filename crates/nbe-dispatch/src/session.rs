//! One agent connection: task intake, grouping, flushing, and reply
//! correlation.
//!
//! ```text
//! submit ─▶ intake queue ─▶ worker (GroupBuffer) ─▶ send_group ─▶ agent
//!                                  │ waiting[id] = tasks
//!                                  ▼
//!                     receive loop ◀─ reply {id: [results]}
//!                                  │ remove waiting[id]
//!                                  ▼
//!                          ReplySink ─▶ CompletionHandle
//! ```

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::future::join_all;
use metrics::counter;
use nbe_core::{GroupId, GroupKey, GroupedTask, SessionId, Task, TaskReply};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::batch::{Accumulator, FlushPolicy, run_batcher};
use crate::completion::CompletionHandle;
use crate::error::DispatchError;
use crate::metrics::{GROUPS_FLUSHED_TOTAL, REPLIES_DISCARDED_TOTAL, SEND_FAILURES_TOTAL, TASKS_TOTAL};
use crate::reconcile::ReplySink;
use crate::transport::{AgentTransport, Received};

/// Per-session batching parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionConfig {
    /// Size and interval triggers.
    pub flush: FlushPolicy,
    /// Capacity of the intake queue.
    pub queue_capacity: usize,
}

/// Groups sent and not yet answered, keyed by correlation id.
#[derive(Clone, Default)]
struct Waiting(Arc<Mutex<HashMap<GroupId, Vec<Task>>>>);

enum Claim {
    Unknown,
    Mismatch { expected: usize },
    Matched(Vec<Task>),
}

impl Waiting {
    fn insert(&self, id: GroupId, tasks: Vec<Task>) {
        let _ = self.0.lock().insert(id, tasks);
    }

    /// Remove and return the entry for `id` only if `results` answers every
    /// task in it.
    fn claim(&self, id: &GroupId, results: usize) -> Claim {
        let mut waiting = self.0.lock();
        match waiting.entry(id.clone()) {
            Entry::Vacant(_) => Claim::Unknown,
            Entry::Occupied(entry) if entry.get().len() != results => Claim::Mismatch {
                expected: entry.get().len(),
            },
            Entry::Occupied(entry) => Claim::Matched(entry.remove()),
        }
    }

    fn len(&self) -> usize {
        self.0.lock().len()
    }

    fn contains(&self, id: &str) -> bool {
        self.0.lock().contains_key(id)
    }

    fn ids(&self) -> Vec<GroupId> {
        self.0.lock().keys().cloned().collect()
    }
}

/// The worker-owned accumulator: open groups in first-seen key order.
struct GroupBuffer {
    host: String,
    groups: Vec<(GroupKey, Vec<Task>)>,
    queued: usize,
    transport: Arc<dyn AgentTransport>,
    waiting: Waiting,
}

impl GroupBuffer {
    async fn send(&self, group: GroupedTask) {
        self.waiting.insert(group.id.clone(), group.commands.clone());
        match self.transport.send_group(&group).await {
            Ok(()) => {
                counter!(GROUPS_FLUSHED_TOTAL, "kind" => group.kind.as_str()).increment(1);
                debug!(host = %self.host, group_id = %group.id, tasks = group.len(), "group sent");
            }
            Err(e) => {
                counter!(SEND_FAILURES_TOTAL).increment(1);
                warn!(host = %self.host, group_id = %group.id, error = %e, "group send failed");
            }
        }
    }
}

#[async_trait]
impl Accumulator for GroupBuffer {
    type Item = Task;

    fn push(&mut self, task: Task) {
        let key = task.key();
        match self.groups.iter_mut().find(|(k, _)| *k == key) {
            Some((_, tasks)) => tasks.push(task),
            None => self.groups.push((key, vec![task])),
        }
        self.queued += 1;
    }

    fn len(&self) -> usize {
        self.queued
    }

    async fn flush(&mut self) {
        let groups: Vec<GroupedTask> = std::mem::take(&mut self.groups)
            .into_iter()
            .map(|(key, tasks)| GroupedTask::seal(key, tasks))
            .collect();
        self.queued = 0;

        let this = &*self;
        let _ = join_all(groups.into_iter().map(|group| this.send(group))).await;
    }
}

/// Dispatch state for one connected agent.
///
/// Created by [`DispatchSession::spawn`], which starts the batching worker.
/// The receive side runs separately through
/// [`run_receive_loop`](Self::run_receive_loop).
pub struct DispatchSession {
    id: SessionId,
    host: String,
    intake: mpsc::Sender<Task>,
    cancel: CancellationToken,
    closed: AtomicBool,
    worker: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    transport: Arc<dyn AgentTransport>,
    waiting: Waiting,
    sink: Arc<dyn ReplySink>,
    completions: CompletionHandle,
}

impl DispatchSession {
    /// Start a session for `host` over `transport`.
    pub fn spawn(
        host: impl Into<String>,
        transport: Arc<dyn AgentTransport>,
        config: SessionConfig,
        sink: Arc<dyn ReplySink>,
        completions: CompletionHandle,
    ) -> Arc<Self> {
        let host = host.into();
        let (intake, rx) = mpsc::channel(config.queue_capacity.max(1));
        let cancel = CancellationToken::new();
        let waiting = Waiting::default();

        let buffer = GroupBuffer {
            host: host.clone(),
            groups: Vec::new(),
            queued: 0,
            transport: transport.clone(),
            waiting: waiting.clone(),
        };
        let worker = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                let _ = run_batcher(buffer, rx, config.flush, cancel).await;
            }
        });

        let session = Arc::new(Self {
            id: SessionId::new(),
            host,
            intake,
            cancel,
            closed: AtomicBool::new(false),
            worker: tokio::sync::Mutex::new(Some(worker)),
            transport,
            waiting,
            sink,
            completions,
        });
        info!(host = %session.host, session_id = %session.id, "dispatch session started");
        session
    }

    /// Unique id of this session.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Host this session serves.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Queue a task for the next flush.
    ///
    /// Waits for room when the intake queue is full.
    pub async fn submit(&self, task: Task) -> Result<(), DispatchError> {
        let closed = || DispatchError::SessionClosed {
            host: self.host.clone(),
        };
        if self.is_closed() {
            return Err(closed());
        }
        self.intake.send(task).await.map_err(|_| closed())?;
        counter!(TASKS_TOTAL).increment(1);
        Ok(())
    }

    /// Probe the agent.
    pub async fn ping(&self) -> Result<(), crate::transport::TransportError> {
        self.transport.ping(b"").await
    }

    /// Stop intake, flush what is queued, wait for outstanding sends, and
    /// close the transport. Safe to call more than once and concurrently.
    #[instrument(skip(self), fields(host = %self.host, session_id = %self.id))]
    pub async fn close(&self) {
        let first = !self.closed.swap(true, Ordering::AcqRel);
        self.cancel.cancel();

        let mut worker = self.worker.lock().await;
        if let Some(handle) = worker.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "session worker ended abnormally");
            }
        }
        drop(worker);

        self.transport.close().await;
        if first {
            info!(orphaned = self.waiting.len(), "dispatch session closed");
        }
    }

    /// Whether [`close`](Self::close) has started.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Read replies until the transport fails or the session closes.
    ///
    /// Read timeouts are not failures. The caller is responsible for closing
    /// the session and deregistering it afterwards.
    #[instrument(skip(self), fields(host = %self.host, session_id = %self.id))]
    pub async fn run_receive_loop(&self) {
        loop {
            let received = tokio::select! {
                () = self.cancel.cancelled() => break,
                received = self.transport.recv() => received,
            };
            match received {
                Ok(Received::Reply(reply)) => self.handle_reply(reply).await,
                Ok(Received::Idle) => {}
                Err(e) => {
                    info!(error = %e, "agent connection ended");
                    break;
                }
            }
        }
    }

    /// Correlate a reply envelope with the groups waiting for it.
    ///
    /// Entries for unknown groups, or whose result count differs from the
    /// group's task count, are logged and skipped. A mismatched group stays
    /// waiting.
    pub async fn handle_reply(&self, reply: TaskReply) {
        for (id, results) in reply {
            match self.waiting.claim(&id, results.len()) {
                Claim::Unknown => {
                    counter!(REPLIES_DISCARDED_TOTAL, "reason" => "unknown").increment(1);
                    warn!(host = %self.host, group_id = %id, "reply for unknown group");
                }
                Claim::Mismatch { expected } => {
                    counter!(REPLIES_DISCARDED_TOTAL, "reason" => "mismatch").increment(1);
                    warn!(
                        host = %self.host,
                        group_id = %id,
                        expected,
                        got = results.len(),
                        "reply length mismatch"
                    );
                }
                Claim::Matched(tasks) => self.reconcile(&id, &tasks, &results).await,
            }
        }
    }

    async fn reconcile(&self, id: &GroupId, tasks: &[Task], results: &[Value]) {
        debug!(host = %self.host, group_id = %id, tasks = tasks.len(), "reconciling group");
        if let Some(app_id) = self.sink.reconcile(tasks, results).await {
            self.completions.report(app_id).await;
        }
    }

    /// Number of groups sent and still awaiting a reply.
    pub fn waiting_len(&self) -> usize {
        self.waiting.len()
    }

    /// Whether group `id` is awaiting a reply.
    pub fn is_waiting(&self, id: &str) -> bool {
        self.waiting.contains(id)
    }

    /// Ids of all groups awaiting a reply.
    pub fn waiting_ids(&self) -> Vec<GroupId> {
        self.waiting.ids()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportError;
    use crate::transport::memory::{self, MemoryAgent, Outbound};
    use assert_matches::assert_matches;
    use nbe_core::{Placement, TaskKind};
    use proptest::prelude::*;
    use serde_json::json;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingSink(Mutex<Vec<(Vec<Task>, Vec<Value>)>>);

    #[async_trait]
    impl ReplySink for RecordingSink {
        async fn reconcile(&self, tasks: &[Task], results: &[Value]) -> Option<i64> {
            self.0.lock().push((tasks.to_vec(), results.to_vec()));
            Some(tasks.len() as i64)
        }
    }

    struct Harness {
        session: Arc<DispatchSession>,
        agent: MemoryAgent,
        sink: Arc<RecordingSink>,
        completions: mpsc::Receiver<i64>,
    }

    fn harness(flush_size: usize, interval: Duration) -> Harness {
        let (transport, agent) = memory::pair();
        let sink = Arc::new(RecordingSink::default());
        let (tx, completions) = mpsc::channel(16);
        let session = DispatchSession::spawn(
            "10.0.0.1",
            Arc::new(transport),
            SessionConfig {
                flush: FlushPolicy::new(flush_size, interval),
                queue_capacity: 64,
            },
            sink.clone(),
            CompletionHandle::new(tx),
        );
        Harness {
            session,
            agent,
            sink,
            completions,
        }
    }

    fn add(name: &str, bind: u16) -> Task {
        Task::add_container(
            name,
            7,
            Placement {
                version: "v1".into(),
                host: "10.0.0.1".into(),
                bind,
                daemon: false,
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn size_threshold_flushes_immediately() {
        let mut h = harness(2, Duration::from_secs(60));
        h.session.submit(add("web", 1)).await.unwrap();
        h.session.submit(add("web", 2)).await.unwrap();

        let group = tokio::time::timeout(Duration::from_millis(10), h.agent.next_group())
            .await
            .expect("flush should not wait for the interval")
            .unwrap();
        assert_eq!(group.len(), 2);
        assert!(h.session.is_waiting(&group.id));
    }

    #[tokio::test(start_paused = true)]
    async fn distinct_keys_become_distinct_groups() {
        let mut h = harness(3, Duration::from_secs(60));
        h.session.submit(add("web", 1)).await.unwrap();
        h.session.submit(add("api", 2)).await.unwrap();
        h.session
            .submit(Task::remove_container("web", 7, "c"))
            .await
            .unwrap();

        let mut groups = Vec::new();
        for _ in 0..3 {
            groups.push(h.agent.next_group().await.unwrap());
        }
        let mut keys: Vec<(String, TaskKind)> =
            groups.iter().map(|g| (g.name.clone(), g.kind)).collect();
        keys.sort();
        assert_eq!(
            keys,
            vec![
                ("api".into(), TaskKind::AddContainer),
                ("web".into(), TaskKind::AddContainer),
                ("web".into(), TaskKind::RemoveContainer),
            ]
        );
        assert_eq!(h.session.waiting_len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn matched_reply_reconciles_once() {
        let mut h = harness(1, Duration::from_secs(60));
        h.session.submit(add("web", 1)).await.unwrap();
        let group = h.agent.next_group().await.unwrap();

        let reply = TaskReply::new().with(group.id.clone(), vec![json!("cid")]);
        h.session.handle_reply(reply.clone()).await;
        h.session.handle_reply(reply).await;

        assert_eq!(h.sink.0.lock().len(), 1);
        assert!(!h.session.is_waiting(&group.id));
        assert_eq!(h.completions.recv().await, Some(1));
        assert!(h.completions.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn mismatched_reply_keeps_group_waiting() {
        let mut h = harness(2, Duration::from_secs(60));
        h.session.submit(add("web", 1)).await.unwrap();
        h.session.submit(add("web", 2)).await.unwrap();
        let group = h.agent.next_group().await.unwrap();

        h.session
            .handle_reply(TaskReply::new().with(group.id.clone(), vec![json!("only-one")]))
            .await;

        assert!(h.sink.0.lock().is_empty());
        assert!(h.session.is_waiting(&group.id));
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_group_is_ignored() {
        let h = harness(5, Duration::from_secs(60));
        h.session
            .handle_reply(TaskReply::new().with(GroupId::from("stranger"), vec![json!(1)]))
            .await;
        assert!(h.sink.0.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_sends_keep_waiting_entries() {
        let mut h = harness(2, Duration::from_secs(60));
        h.agent.reject_sends(true);
        h.session.submit(add("web", 1)).await.unwrap();
        h.session.submit(add("api", 1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert_eq!(h.session.waiting_len(), 2);
        assert!(h.agent.try_next().is_none());

        h.agent.reject_sends(false);
        h.session.submit(add("web", 2)).await.unwrap();
        h.session.submit(add("web", 3)).await.unwrap();
        let group = h.agent.next_group().await.unwrap();
        assert_eq!(group.len(), 2);
        assert_eq!(h.session.waiting_len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn one_rejected_group_does_not_hold_back_its_sibling() {
        let mut h = harness(2, Duration::from_secs(60));
        h.agent.reject_groups_named("web");
        h.session.submit(add("web", 1)).await.unwrap();
        h.session.submit(add("api", 2)).await.unwrap();

        let delivered = h.agent.next_group().await.unwrap();
        assert_eq!(delivered.name, "api");
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(h.agent.try_next().is_none());

        let ids = h.session.waiting_ids();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&delivered.id));
        let rejected = ids.into_iter().find(|id| *id != delivered.id).unwrap();
        assert!(h.session.is_waiting(&rejected));
    }

    /// Holds every send until released, recording what was offered.
    struct GatedTransport {
        sent: Mutex<Vec<GroupedTask>>,
        gate: tokio::sync::Semaphore,
    }

    #[async_trait]
    impl AgentTransport for GatedTransport {
        async fn send_group(&self, group: &GroupedTask) -> Result<(), TransportError> {
            self.sent.lock().push(group.clone());
            let permit = self
                .gate
                .acquire()
                .await
                .map_err(|_| TransportError::Closed)?;
            permit.forget();
            Ok(())
        }

        async fn recv(&self) -> Result<Received, TransportError> {
            std::future::pending().await
        }

        async fn ping(&self, _payload: &[u8]) -> Result<(), TransportError> {
            Ok(())
        }

        fn set_pong_handler(&self, _handler: crate::transport::PongHandler) {}

        async fn close(&self) {}

        fn is_closed(&self) -> bool {
            false
        }
    }

    #[tokio::test(start_paused = true)]
    async fn task_submitted_during_flush_joins_next_group() {
        let transport = Arc::new(GatedTransport {
            sent: Mutex::new(Vec::new()),
            gate: tokio::sync::Semaphore::new(0),
        });
        let (tx, _completions) = mpsc::channel(16);
        let session = DispatchSession::spawn(
            "10.0.0.1",
            transport.clone(),
            SessionConfig {
                flush: FlushPolicy::new(1, Duration::from_secs(60)),
                queue_capacity: 64,
            },
            Arc::new(RecordingSink::default()),
            CompletionHandle::new(tx),
        );

        session.submit(add("web", 1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(transport.sent.lock().len(), 1);

        session.submit(add("web", 2)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(transport.sent.lock().len(), 1);

        transport.gate.add_permits(2);
        tokio::time::sleep(Duration::from_millis(1)).await;

        let sent = transport.sent.lock().clone();
        assert_eq!(sent.len(), 2);
        assert_ne!(sent[0].id, sent[1].id);
        let binds: Vec<Vec<u16>> = sent
            .iter()
            .map(|g| g.commands.iter().map(|t| t.bind).collect())
            .collect();
        assert_eq!(binds, vec![vec![1], vec![2]]);
        assert_eq!(session.waiting_len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn close_flushes_then_rejects() {
        let mut h = harness(10, Duration::from_secs(60));
        h.session.submit(add("web", 1)).await.unwrap();
        h.session.close().await;

        assert_matches!(h.agent.next().await, Some(Outbound::Group(g)) if g.len() == 1);
        assert!(h.agent.is_closed());
        assert_matches!(
            h.session.submit(add("web", 2)).await,
            Err(DispatchError::SessionClosed { host }) if host == "10.0.0.1"
        );
        h.session.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn receive_loop_handles_replies_and_ends_on_failure() {
        let mut h = harness(1, Duration::from_secs(60));
        h.session.submit(add("web", 1)).await.unwrap();
        let group = h.agent.next_group().await.unwrap();

        h.agent.idle();
        h.agent
            .reply(TaskReply::new().with(group.id.clone(), vec![json!("cid")]));
        h.agent.fail("connection reset");

        h.session.run_receive_loop().await;
        assert_eq!(h.sink.0.lock().len(), 1);
        assert_eq!(h.session.waiting_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn receive_loop_stops_on_close() {
        let h = harness(1, Duration::from_secs(60));
        let session = h.session.clone();
        let receiving = tokio::spawn(async move { session.run_receive_loop().await });
        tokio::task::yield_now().await;
        h.session.close().await;
        receiving.await.unwrap();
    }

    proptest! {
        #[test]
        fn grouping_preserves_per_key_order(
            picks in proptest::collection::vec((0usize..3, 0usize..2), 1..40)
        ) {
            let names = ["web", "api", "db"];
            let kinds = [TaskKind::AddContainer, TaskKind::RemoveContainer];
            let (transport, _agent) = memory::pair();
            let mut buffer = GroupBuffer {
                host: "h".into(),
                groups: Vec::new(),
                queued: 0,
                transport: Arc::new(transport),
                waiting: Waiting::default(),
            };

            let mut submitted = Vec::new();
            for (seq, (n, k)) in picks.iter().enumerate() {
                let mut task = match kinds[*k] {
                    TaskKind::RemoveContainer => Task::remove_container(names[*n], 1, format!("c{seq}")),
                    _ => add(names[*n], seq as u16),
                };
                task.bind = seq as u16;
                submitted.push(task.clone());
                buffer.push(task);
            }

            prop_assert_eq!(buffer.len(), submitted.len());
            let total: usize = buffer.groups.iter().map(|(_, t)| t.len()).sum();
            prop_assert_eq!(total, submitted.len());

            for (key, tasks) in &buffer.groups {
                prop_assert!(tasks.iter().all(|t| &t.key() == key));
                let expected: Vec<&Task> = submitted.iter().filter(|t| &t.key() == key).collect();
                let actual: Vec<&Task> = tasks.iter().collect();
                prop_assert_eq!(actual, expected);
            }
        }
    }
}
