//! Batching of completed application ids into proxy regenerations.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use metrics::counter;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::batch::{Accumulator, FlushPolicy, run_batcher};
use crate::metrics::REGENERATIONS_TOTAL;
use crate::regenerate::RegenerationTrigger;

/// Sender side of the completion batch, shared by every session.
#[derive(Clone, Debug)]
pub struct CompletionHandle {
    tx: mpsc::Sender<i64>,
}

impl CompletionHandle {
    /// Wrap the sending half of a completion queue.
    pub fn new(tx: mpsc::Sender<i64>) -> Self {
        Self { tx }
    }

    /// Report that work for `app_id` finished.
    pub async fn report(&self, app_id: i64) {
        if self.tx.send(app_id).await.is_err() {
            debug!(app_id, "completion batch stopped, dropping report");
        }
    }
}

/// De-duplicated set of applications changed since the last regeneration.
///
/// The size threshold counts every report, repeats included.
pub struct CompletionBatch {
    pending: BTreeSet<i64>,
    reported: usize,
    trigger: Arc<dyn RegenerationTrigger>,
}

impl CompletionBatch {
    /// An empty batch that regenerates through `trigger`.
    pub fn new(trigger: Arc<dyn RegenerationTrigger>) -> Self {
        Self {
            pending: BTreeSet::new(),
            reported: 0,
            trigger,
        }
    }
}

#[async_trait]
impl Accumulator for CompletionBatch {
    type Item = i64;

    fn push(&mut self, app_id: i64) {
        let _ = self.pending.insert(app_id);
        self.reported += 1;
    }

    fn len(&self) -> usize {
        self.reported
    }

    async fn flush(&mut self) {
        let app_ids = std::mem::take(&mut self.pending);
        self.reported = 0;
        match self.trigger.regenerate(&app_ids).await {
            Ok(()) => counter!(REGENERATIONS_TOTAL, "outcome" => "ok").increment(1),
            Err(e) => {
                counter!(REGENERATIONS_TOTAL, "outcome" => "error").increment(1);
                warn!(error = %e, ?app_ids, "proxy regeneration failed");
            }
        }
    }
}

/// Start the completion worker.
pub fn spawn_completion_batcher(
    trigger: Arc<dyn RegenerationTrigger>,
    policy: FlushPolicy,
    capacity: usize,
    cancel: CancellationToken,
) -> (CompletionHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let worker = tokio::spawn(async move {
        let _ = run_batcher(CompletionBatch::new(trigger), rx, policy, cancel).await;
    });
    (CompletionHandle::new(tx), worker)
}
