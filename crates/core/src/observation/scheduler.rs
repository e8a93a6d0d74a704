use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use super::dedup::ParticipationDeduplicator;
use super::registry::{TaskKey, TaskRegistry, TaskTicket};
use crate::channel::{ReplyDispatcher, SnapshotFetcher, TransportError};
use crate::config::ChorusCfg;
use crate::oracle::{Decision, DecisionOracle, OracleError};
use crate::role::{ParticipationStrategy, RoleConfig};
use crate::types::{AgentId, ChannelMessage, MessageId, MessageSnapshot, SkipReason, TaskState};

/// A configured agent: identity plus its resolved role.
#[derive(Debug, Clone)]
pub struct Agent {
    pub id: AgentId,
    pub role: Arc<RoleConfig>,
}

impl Agent {
    pub fn new(id: impl Into<AgentId>, role: RoleConfig) -> Self {
        Self { id: id.into(), role: Arc::new(role) }
    }
}

/// Failure that ends one observation task.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error(transparent)]
    Oracle(#[from] OracleError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Terminal result of one observation task.
#[derive(Debug)]
pub enum TaskOutcome {
    Participated { message_id: MessageId },
    Skipped(SkipReason),
    Aborted(TaskError),
}

impl TaskOutcome {
    pub fn participated(&self) -> bool {
        matches!(self, Self::Participated { .. })
    }

    pub fn skip_reason(&self) -> Option<SkipReason> {
        match self {
            Self::Skipped(reason) => Some(*reason),
            _ => None,
        }
    }
}

/// Where the cancellable part of a task stopped.
enum Prepared {
    Finished(TaskOutcome),
    Reply(String),
}

/// A task that won registration for its (channel, agent) slot.
#[derive(Debug)]
pub struct ScheduledTask {
    pub agent: AgentId,
    pub task_id: Uuid,
    pub handle: JoinHandle<TaskOutcome>,
}

/// Collaborators and shared bookkeeping used by every task.
pub struct SchedulerParts {
    pub fetcher: SnapshotFetcher,
    pub oracle: DecisionOracle,
    pub dispatcher: ReplyDispatcher,
    pub dedup: Arc<ParticipationDeduplicator>,
    pub tasks: Arc<TaskRegistry>,
}

struct Inner {
    cfg: Arc<ChorusCfg>,
    agents: Vec<Agent>,
    parts: SchedulerParts,
    shutdown: CancellationToken,
}

/// Fans trigger messages out to agents and drives each observation task:
/// delay, snapshot, topic check, refresh, decide, optional second refresh,
/// dispatch.
#[derive(Clone)]
pub struct ObservationScheduler {
    inner: Arc<Inner>,
}

impl ObservationScheduler {
    pub fn new(cfg: Arc<ChorusCfg>, agents: Vec<Agent>, parts: SchedulerParts, shutdown: CancellationToken) -> Self {
        Self {
            inner: Arc::new(Inner { cfg, agents, parts, shutdown }),
        }
    }

    pub fn agents(&self) -> &[Agent] {
        &self.inner.agents
    }

    pub fn tasks(&self) -> &Arc<TaskRegistry> {
        &self.inner.parts.tasks
    }

    pub fn dedup(&self) -> &Arc<ParticipationDeduplicator> {
        &self.inner.parts.dedup
    }

    pub fn oracle(&self) -> &DecisionOracle {
        &self.inner.parts.oracle
    }

    /// Fan `trigger` out to every agent except its author. Returns the tasks
    /// actually started; agents whose slot is taken or who are cooling down
    /// are left out.
    pub fn on_message(&self, trigger: &ChannelMessage) -> Vec<ScheduledTask> {
        let from_agent = self.inner.agents.iter().any(|a| a.id == trigger.author_id);
        if from_agent && !self.inner.cfg.trigger_on_agent_messages {
            tracing::trace!(channel = %trigger.channel_id, author = %trigger.author_id, "agent message, not a trigger");
            return Vec::new();
        }
        self.inner
            .agents
            .iter()
            .filter(|a| a.id != trigger.author_id)
            .filter_map(|a| self.schedule(a, trigger))
            .collect()
    }

    fn schedule(&self, agent: &Agent, trigger: &ChannelMessage) -> Option<ScheduledTask> {
        let parts = &self.inner.parts;
        let channel = &trigger.channel_id;
        if parts.dedup.should_skip(channel, &agent.id) {
            tracing::info!(channel = %channel, agent = %agent.id, reason = %SkipReason::Cooldown, "not observing");
            return None;
        }

        let key = TaskKey::new(channel.clone(), agent.id.clone());
        let Some(ticket) = parts
            .tasks
            .try_register(key.clone(), &trigger.message_id, self.max_age(&agent.role), &self.inner.shutdown)
        else {
            tracing::debug!(channel = %channel, agent = %agent.id, "observation already in flight, trigger ignored");
            return None;
        };

        let span = tracing::info_span!(
            "observation",
            channel = %channel,
            agent = %agent.id,
            trigger = %trigger.message_id,
            task = %ticket.id,
        );
        let inner = Arc::clone(&self.inner);
        let agent_c = agent.clone();
        let trigger_c = trigger.clone();
        let task_id = ticket.id;
        let handle = tokio::spawn(
            async move {
                tracing::debug!(state = %TaskState::Scheduled, "observation scheduled");
                let prepared = tokio::select! {
                    _ = ticket.cancel.cancelled() => None,
                    prepared = prepare(&inner, &agent_c, &trigger_c, &key, task_id) => Some(prepared),
                };
                let outcome = match prepared {
                    None => TaskOutcome::Skipped(SkipReason::Cancelled),
                    Some(prepared) => deliver(&inner, &agent_c, &trigger_c, &key, &ticket, prepared).await,
                };
                inner.parts.tasks.release(&key, task_id);
                match &outcome {
                    TaskOutcome::Participated { message_id } => {
                        tracing::info!(message = %message_id, "participated");
                    }
                    TaskOutcome::Skipped(reason) => tracing::info!(reason = %reason, "skipped"),
                    TaskOutcome::Aborted(e) => tracing::warn!(error = %e, "observation aborted"),
                }
                outcome
            }
            .instrument(span),
        );

        Some(ScheduledTask {
            agent: agent.id.clone(),
            task_id,
            handle,
        })
    }

    /// Age after which the janitor treats a task as orphaned: the longest
    /// legitimate run (delay, settle, every oracle call at its timeout) plus
    /// the configured grace.
    fn max_age(&self, role: &RoleConfig) -> Duration {
        let cfg = &self.inner.cfg;
        let delay_ms = if role.asks_oracle_for_delay() {
            cfg.delay_max_ms
        } else {
            role.observation_delay_ms
        };
        Duration::from_millis(delay_ms)
            + cfg.settle_delay()
            + cfg.oracle_timeout() * ORACLE_CALLS_PER_TASK
            + cfg.task_grace()
    }
}

/// Delay, topic, participation and compose.
const ORACLE_CALLS_PER_TASK: u32 = 4;

/// Post and record the reply outside the cancellation race. A posted reply
/// is always recorded.
async fn deliver(
    inner: &Inner,
    agent: &Agent,
    trigger: &ChannelMessage,
    key: &TaskKey,
    ticket: &TaskTicket,
    prepared: Result<Prepared, TaskError>,
) -> TaskOutcome {
    let parts = &inner.parts;
    let channel = &trigger.channel_id;
    let outcome = match prepared {
        Ok(Prepared::Finished(outcome)) => outcome,
        Ok(Prepared::Reply(_)) if ticket.cancel.is_cancelled() => TaskOutcome::Skipped(SkipReason::Cancelled),
        Ok(Prepared::Reply(_)) if parts.dedup.should_skip(channel, &agent.id) => {
            TaskOutcome::Skipped(SkipReason::Cooldown)
        }
        Ok(Prepared::Reply(text)) => match parts.dispatcher.dispatch(channel, &agent.id, &text).await {
            Ok(message_id) => {
                parts.dedup.record(channel, &agent.id);
                TaskOutcome::Participated { message_id }
            }
            Err(e) => TaskOutcome::Aborted(e.into()),
        },
        Err(e) => TaskOutcome::Aborted(e),
    };
    match &outcome {
        TaskOutcome::Participated { .. } => {}
        TaskOutcome::Skipped(_) => parts.tasks.set_state(key, ticket.id, TaskState::Skipped),
        TaskOutcome::Aborted(_) => parts.tasks.set_state(key, ticket.id, TaskState::Aborted),
    }
    outcome
}

async fn prepare(
    inner: &Inner,
    agent: &Agent,
    trigger: &ChannelMessage,
    key: &TaskKey,
    id: Uuid,
) -> Result<Prepared, TaskError> {
    let parts = &inner.parts;
    let role = agent.role.as_ref();
    let channel = &trigger.channel_id;
    let limit = role.max_observation_messages;
    let transition = |state: TaskState| {
        parts.tasks.set_state(key, id, state);
        tracing::debug!(state = %state, "transition");
    };

    // Scheduled → Observing
    let delay_ms = if role.asks_oracle_for_delay() {
        parts.oracle.decide_observation_delay(role).await?
    } else {
        role.observation_delay_ms
    };
    if delay_ms > 0 {
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
    }
    transition(TaskState::Observing);

    let initial = parts.fetcher.fetch_initial(trigger, limit).await?;
    transition(TaskState::Deciding);

    let decided_on = match role.participation_strategy {
        ParticipationStrategy::AlwaysOnTrigger => initial,
        ParticipationStrategy::OracleDecide => {
            if !parts.oracle.decide_topic_changed(role, &agent.id, trigger, &initial).await? {
                return Ok(Prepared::Finished(TaskOutcome::Skipped(SkipReason::TopicUnchanged)));
            }
            drop(initial);
            let settle = inner.cfg.settle_delay();
            if !settle.is_zero() {
                tokio::time::sleep(settle).await;
            }
            // Re-read right before the irreversible decision so replies other
            // agents posted during our delay and oracle latency are visible.
            let refreshed = parts.fetcher.refresh(channel, limit).await?;
            let decision = parts.oracle.decide_participation(role, &refreshed).await?;
            if !decision.participate {
                let reason = match decision.decision {
                    Decision::Unclear => SkipReason::UnclearDecision,
                    Decision::Yes | Decision::No => SkipReason::Declined,
                };
                tracing::debug!(answer = %decision.reason, "participation declined");
                return Ok(Prepared::Finished(TaskOutcome::Skipped(reason)));
            }
            refreshed
        }
    };

    if parts.dedup.should_skip(channel, &agent.id) {
        return Ok(Prepared::Finished(TaskOutcome::Skipped(SkipReason::Cooldown)));
    }
    transition(TaskState::Participating);

    let final_snapshot: MessageSnapshot = if role.refresh_before_reply {
        parts.fetcher.refresh(channel, limit).await?
    } else {
        decided_on
    };
    let text = parts.dispatcher.compose(role, &final_snapshot).await?;
    Ok(Prepared::Reply(text))
}
