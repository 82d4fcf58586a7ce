//! Dual-trigger batching: flush when enough items are queued or when the
//! interval elapses, whichever comes first.
//!
//! Sessions batch tasks with it; the hub batches completed application ids
//! with it. A single worker owns the [`Accumulator`] and makes every flush
//! decision, so the accumulator itself needs no locking.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// When an accumulator is flushed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FlushPolicy {
    /// Flush as soon as [`Accumulator::len`] reaches this value.
    pub max_items: usize,
    /// Flush a non-empty accumulator at this period.
    pub interval: Duration,
}

impl FlushPolicy {
    /// Build a policy. `max_items` is clamped to at least 1.
    pub fn new(max_items: usize, interval: Duration) -> Self {
        Self {
            max_items: max_items.max(1),
            interval,
        }
    }
}

/// State driven by [`run_batcher`].
#[async_trait]
pub trait Accumulator: Send {
    /// Item type delivered over the intake queue.
    type Item: Send;

    /// Add one item.
    fn push(&mut self, item: Self::Item);

    /// Current size, compared against [`FlushPolicy::max_items`].
    fn len(&self) -> usize;

    /// Whether there is nothing to flush.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ship everything accumulated so far and reset to empty.
    async fn flush(&mut self);
}

/// Drive `acc` until `cancel` fires or every sender is dropped.
///
/// On exit, items still sitting in the queue are pulled in and a final flush
/// runs if anything is pending. The accumulator is handed back for
/// inspection.
pub async fn run_batcher<A: Accumulator>(
    mut acc: A,
    mut rx: mpsc::Receiver<A::Item>,
    policy: FlushPolicy,
    cancel: CancellationToken,
) -> A {
    let mut ticker = time::interval_at(Instant::now() + policy.interval, policy.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            item = rx.recv() => match item {
                Some(item) => {
                    acc.push(item);
                    if acc.len() >= policy.max_items {
                        acc.flush().await;
                    }
                }
                None => break,
            },
            _ = ticker.tick() => {
                if !acc.is_empty() {
                    acc.flush().await;
                }
            }
        }
    }

    rx.close();
    while let Ok(item) = rx.try_recv() {
        acc.push(item);
        if acc.len() >= policy.max_items {
            acc.flush().await;
        }
    }
    if !acc.is_empty() {
        acc.flush().await;
    }
    acc
}
