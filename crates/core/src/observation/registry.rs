use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::types::{AgentId, ChannelId, MessageId, TaskState};

/// Registry key: one live observation per channel per agent.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskKey {
    pub channel: ChannelId,
    pub agent: AgentId,
}

impl TaskKey {
    pub fn new(channel: ChannelId, agent: AgentId) -> Self {
        Self { channel, agent }
    }
}

#[derive(Debug)]
struct ObservationTask {
    id: Uuid,
    trigger_message_id: MessageId,
    started_at: Instant,
    max_age: Duration,
    state: TaskState,
    cancel: CancellationToken,
}

/// Handed to the task that won registration.
#[derive(Debug, Clone)]
pub struct TaskTicket {
    pub id: Uuid,
    pub cancel: CancellationToken,
}

/// Live observation tasks keyed by (channel, agent).
///
/// Registration goes through the shard-locked entry API, so two concurrent
/// triggers for the same key can never both succeed. Removal checks the
/// task id so a finished task cannot evict its successor.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: DashMap<TaskKey, ObservationTask>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomic check-and-insert. `None` means a task already owns the key.
    pub fn try_register(
        &self,
        key: TaskKey,
        trigger: &MessageId,
        max_age: Duration,
        parent: &CancellationToken,
    ) -> Option<TaskTicket> {
        match self.tasks.entry(key) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                let ticket = TaskTicket {
                    id: Uuid::new_v4(),
                    cancel: parent.child_token(),
                };
                slot.insert(ObservationTask {
                    id: ticket.id,
                    trigger_message_id: trigger.clone(),
                    started_at: Instant::now(),
                    max_age,
                    state: TaskState::Scheduled,
                    cancel: ticket.cancel.clone(),
                });
                Some(ticket)
            }
        }
    }

    pub fn set_state(&self, key: &TaskKey, id: Uuid, state: TaskState) {
        if let Some(mut task) = self.tasks.get_mut(key)
            && task.id == id
        {
            task.state = state;
        }
    }

    /// Free the slot if it still belongs to task `id`.
    pub fn release(&self, key: &TaskKey, id: Uuid) -> bool {
        self.tasks.remove_if(key, |_, task| task.id == id).is_some()
    }

    pub fn state_of(&self, key: &TaskKey) -> Option<TaskState> {
        self.tasks.get(key).map(|t| t.state)
    }

    pub fn trigger_of(&self, key: &TaskKey) -> Option<MessageId> {
        self.tasks.get(key).map(|t| t.trigger_message_id.clone())
    }

    /// Cancel and remove tasks that outlived their age bound.
    pub fn reap_stale(&self) -> usize {
        let stale: Vec<TaskKey> = self
            .tasks
            .iter()
            .filter(|t| t.started_at.elapsed() > t.max_age)
            .map(|t| t.key().clone())
            .collect();
        let mut reaped = 0;
        for key in stale {
            if let Some((key, task)) = self
                .tasks
                .remove_if(&key, |_, t| t.started_at.elapsed() > t.max_age)
            {
                task.cancel.cancel();
                tracing::warn!(
                    channel = %key.channel,
                    agent = %key.agent,
                    task = %task.id,
                    state = %task.state,
                    age_ms = task.started_at.elapsed().as_millis() as u64,
                    "reaped stale observation task"
                );
                reaped += 1;
            }
        }
        reaped
    }

    /// Cancel every live task (shutdown).
    pub fn cancel_all(&self) {
        for task in self.tasks.iter() {
            task.cancel.cancel();
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
