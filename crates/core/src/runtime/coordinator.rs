use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use super::janitor::Janitor;
use super::shutdown::ShutdownGuard;
use crate::channel::{ChannelTransport, ReplyDispatcher, SnapshotFetcher};
use crate::config::ChorusCfg;
use crate::observation::{
    Agent, ObservationScheduler, ParticipationDeduplicator, ScheduledTask, SchedulerParts, TaskRegistry,
};
use crate::oracle::{DecisionOracle, TopicCache};
use crate::role::RoleConfig;
use crate::types::{AgentId, ChannelMessage};
use chorus_llm::LlmProvider;

/// Wires the protocol together for one process: resolved agents, the
/// observation scheduler and the janitor, all stopped by one token.
pub struct Coordinator {
    scheduler: ObservationScheduler,
    janitor: Janitor,
    transport: Arc<dyn ChannelTransport>,
    shutdown: ShutdownGuard,
}

impl Coordinator {
    pub fn new(
        cfg: Arc<ChorusCfg>,
        roles: Vec<(AgentId, RoleConfig)>,
        transport: Arc<dyn ChannelTransport>,
        llm: Arc<dyn LlmProvider>,
    ) -> Self {
        let shutdown = ShutdownGuard::new();
        let topics = Arc::new(TopicCache::new(cfg.topic_cache_max, cfg.topic_cache_ttl()));
        let dedup = Arc::new(ParticipationDeduplicator::new(cfg.cooldown()));
        let tasks = Arc::new(TaskRegistry::new());
        let oracle = DecisionOracle::new(llm, Arc::clone(&topics), &cfg);

        let janitor = Janitor::new(
            Arc::clone(&topics),
            Arc::clone(&dedup),
            Arc::clone(&tasks),
            cfg.janitor_interval(),
        );
        let parts = SchedulerParts {
            fetcher: SnapshotFetcher::new(Arc::clone(&transport)),
            dispatcher: ReplyDispatcher::new(Arc::clone(&transport), oracle.clone()),
            oracle,
            dedup,
            tasks,
        };
        let agents = roles.into_iter().map(|(id, role)| Agent::new(id, role)).collect();
        let scheduler = ObservationScheduler::new(cfg, agents, parts, shutdown.token());

        Self {
            scheduler,
            janitor,
            transport,
            shutdown,
        }
    }

    pub fn scheduler(&self) -> &ObservationScheduler {
        &self.scheduler
    }

    pub fn janitor(&self) -> &Janitor {
        &self.janitor
    }

    pub fn shutdown(&self) -> &ShutdownGuard {
        &self.shutdown
    }

    pub fn token(&self) -> CancellationToken {
        self.shutdown.token()
    }

    /// Fan one inbound message out to the agents.
    pub fn handle_message(&self, message: &ChannelMessage) -> Vec<ScheduledTask> {
        self.scheduler.on_message(message)
    }

    /// Consume inbound messages until shutdown or until the feed closes.
    /// Observation tasks run detached; their outcomes are only logged.
    pub async fn run(&self, mut inbound: broadcast::Receiver<ChannelMessage>) {
        let token = self.shutdown.token();
        let janitor = self.janitor.clone().spawn(token.clone());
        let names: Vec<&str> = self.scheduler.agents().iter().map(|a| a.id.as_str()).collect();
        tracing::info!(agents = ?names, "coordinator started");

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                received = inbound.recv() => match received {
                    Ok(message) => {
                        let started = self.handle_message(&message);
                        tracing::debug!(
                            channel = %message.channel_id,
                            message = %message.message_id,
                            started = started.len(),
                            "trigger fanned out"
                        );
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "inbound feed lagged, messages dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::info!("inbound feed closed");
                        break;
                    }
                },
            }
        }

        self.scheduler.tasks().cancel_all();
        self.shutdown.trigger();
        if let Err(e) = janitor.await {
            tracing::warn!(error = %e, "janitor task failed");
        }
        tracing::info!("coordinator stopped");
    }

    /// Direct message to the owner, outside the participation flow.
    pub async fn notify_owner(&self, owner: &AgentId, text: &str) -> bool {
        match self.transport.send_direct_message(owner, text).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(owner = %owner, error = %e, "owner notification failed");
                false
            }
        }
    }
}
