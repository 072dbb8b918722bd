//! Periodic eviction of expired window entries.
//!
//! Eviction only bounds memory: an expired entry that has not been swept yet is
//! still handled correctly by the decision path, which resets it lazily.

use crate::limiter::{Inner, RateLimiter};
use crate::store::WindowStore;
use crate::telemetry::{emit_best_effort, RateLimitEvent};
use std::sync::Weak;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Default sweep interval: five minutes.
pub const DEFAULT_JANITOR_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Delete every entry that is stale at `now`. Returns the number removed.
///
/// Candidates are collected from a snapshot and each is re-checked under its
/// shard lock before removal, so an entry refreshed by a concurrent request
/// survives.
pub fn sweep(store: &WindowStore, now: u64) -> usize {
    store
        .snapshot()
        .into_iter()
        .filter(|(_, entry)| entry.is_stale_at(now))
        .filter(|(key, _)| store.remove_if_stale(key, now))
        .count()
}

/// Handle to a running janitor task.
///
/// Dropping the handle aborts the task; [`shutdown`](Self::shutdown) stops it
/// and waits for it to finish. The task also exits by itself once every
/// [`RateLimiter`] clone sharing its store has been dropped.
#[derive(Debug)]
pub struct JanitorHandle {
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl JanitorHandle {
    pub(crate) fn spawn<S>(limiter: Weak<Inner>, interval: Duration, sink: S) -> Self
    where
        S: tower::Service<RateLimitEvent, Response = ()> + Clone + Send + 'static,
        S::Error: std::error::Error + Send + 'static,
        S::Future: Send + 'static,
    {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; sweeping an empty store is pointless.
            ticker.tick().await;
            tracing::debug!(target: "speedbump::janitor", interval_ms = interval.as_millis() as u64, "janitor started");

            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        let Some(inner) = limiter.upgrade() else { break };
                        let limiter = RateLimiter::from_inner(inner);
                        let evicted = limiter.sweep();
                        let remaining_entries = limiter.store().len();
                        drop(limiter);
                        if evicted > 0 {
                            tracing::debug!(
                                target: "speedbump::janitor",
                                evicted,
                                remaining_entries,
                                "swept expired rate limit entries"
                            );
                            emit_best_effort(
                                sink.clone(),
                                RateLimitEvent::Evicted { count: evicted, remaining_entries },
                            )
                            .await;
                        }
                    }
                }
            }
            tracing::debug!(target: "speedbump::janitor", "janitor stopped");
        });

        Self { stop: Some(stop_tx), task: Some(task) }
    }

    /// Whether the background task is still running.
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Stop the task and wait for it to exit.
    pub async fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for JanitorHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
