use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;

use crate::types::{AgentId, ChannelId};

/// Per-(channel, agent) participation cooldown.
///
/// Only confirmed dispatches are recorded, so an aborted or skipped attempt
/// never suppresses a later legitimate one.
#[derive(Debug)]
pub struct ParticipationDeduplicator {
    records: DashMap<(ChannelId, AgentId), Instant>,
    cooldown: Duration,
}

impl ParticipationDeduplicator {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            records: DashMap::new(),
            cooldown,
        }
    }

    pub fn should_skip(&self, channel: &ChannelId, agent: &AgentId) -> bool {
        self.records
            .get(&(channel.clone(), agent.clone()))
            .is_some_and(|last| last.elapsed() < self.cooldown)
    }

    pub fn record(&self, channel: &ChannelId, agent: &AgentId) {
        self.records.insert((channel.clone(), agent.clone()), Instant::now());
    }

    /// Drop records whose cooldown has fully elapsed. Returns the number removed.
    pub fn sweep(&self) -> usize {
        let before = self.records.len();
        self.records.retain(|_, last| last.elapsed() < self.cooldown);
        before.saturating_sub(self.records.len())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
