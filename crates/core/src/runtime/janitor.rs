use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::observation::{ParticipationDeduplicator, TaskRegistry};
use crate::oracle::TopicCache;

/// Counts from one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub topics_evicted: usize,
    pub cooldowns_expired: usize,
    pub tasks_reaped: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Periodic sweep bounding the topic cache, cooldown records and the task
/// registry, independent of any task's lifecycle.
#[derive(Clone)]
pub struct Janitor {
    topics: Arc<TopicCache>,
    dedup: Arc<ParticipationDeduplicator>,
    tasks: Arc<TaskRegistry>,
    interval: Duration,
}

impl Janitor {
    pub fn new(
        topics: Arc<TopicCache>,
        dedup: Arc<ParticipationDeduplicator>,
        tasks: Arc<TaskRegistry>,
        interval: Duration,
    ) -> Self {
        Self { topics, dedup, tasks, interval }
    }

    pub fn sweep(&self) -> SweepReport {
        SweepReport {
            topics_evicted: self.topics.sweep(),
            cooldowns_expired: self.dedup.sweep(),
            tasks_reaped: self.tasks.reap_stale(),
        }
    }

    /// Run `sweep` every interval until `cancel` fires.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::info!("janitor shutting down");
                        return;
                    }
                    _ = ticker.tick() => {}
                }

                let report = self.sweep();
                if report.is_empty() {
                    tracing::trace!("janitor sweep: nothing to do");
                } else {
                    tracing::info!(
                        topics_evicted = report.topics_evicted,
                        cooldowns_expired = report.cooldowns_expired,
                        tasks_reaped = report.tasks_reaped,
                        topic_cache = self.topics.len(),
                        live_tasks = self.tasks.len(),
                        "janitor sweep"
                    );
                }
            }
        })
    }
}
