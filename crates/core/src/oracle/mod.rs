//! Decision oracle adapter.
//!
//! Asks the reasoning capability three kinds of question (observation
//! delay, topic changed, participate) and turns free-text answers into
//! bounded, fail-closed values.

mod decision;
mod topic_cache;

pub use decision::{Decision, ParticipationDecision};
pub use topic_cache::{TopicCache, TopicKey};

use std::sync::Arc;
use std::time::Duration;

use chorus_llm::{ChatMessage, CompletionRequest, LlmError, LlmProvider};

use crate::config::ChorusCfg;
use crate::role::RoleConfig;
use crate::types::{AgentId, ChannelMessage, MessageSnapshot};

const DECISION_MAX_TOKENS: u32 = 64;
const DECISION_TEMPERATURE: f32 = 0.2;

const DEFAULT_PARTICIPATION_TEMPLATE: &str = "You are {name}. {description}\n\n\
Recent conversation:\n{history}\n\n\
Other participants may already have answered. Would a message from you add something \
that has not been said yet? Answer YES or NO first, then a short reason.";

/// The reasoning capability failed; the current task must not speak.
#[derive(Debug, thiserror::Error)]
pub enum OracleError {
    #[error("oracle timed out after {0:?}")]
    Timeout(Duration),
    #[error("oracle unavailable: {0}")]
    Unavailable(#[from] LlmError),
}

/// Wraps an [`LlmProvider`] with the protocol's prompts and parsers.
#[derive(Clone)]
pub struct DecisionOracle {
    llm: Arc<dyn LlmProvider>,
    topics: Arc<TopicCache>,
    timeout: Duration,
    delay_min_ms: u64,
    delay_max_ms: u64,
    delay_default_ms: u64,
}

impl DecisionOracle {
    pub fn new(llm: Arc<dyn LlmProvider>, topics: Arc<TopicCache>, cfg: &ChorusCfg) -> Self {
        Self {
            llm,
            topics,
            timeout: cfg.oracle_timeout(),
            delay_min_ms: cfg.delay_min_ms,
            delay_max_ms: cfg.delay_max_ms,
            delay_default_ms: cfg.delay_default_ms,
        }
    }

    pub fn topic_cache(&self) -> &Arc<TopicCache> {
        &self.topics
    }

    /// Send one prompt with the persona as system context.
    pub async fn ask(&self, role: &RoleConfig, prompt: String, max_tokens: u32) -> Result<String, OracleError> {
        let request = CompletionRequest {
            messages: vec![ChatMessage::system(role.description.clone()), ChatMessage::user(prompt)],
            max_tokens,
            temperature: DECISION_TEMPERATURE,
        };
        match tokio::time::timeout(self.timeout, self.llm.complete(request)).await {
            Ok(Ok(response)) => Ok(response.content),
            Ok(Err(e)) => Err(OracleError::Unavailable(e)),
            Err(_) => Err(OracleError::Timeout(self.timeout)),
        }
    }

    /// Observation delay in milliseconds, always within bounds.
    pub async fn decide_observation_delay(&self, role: &RoleConfig) -> Result<u64, OracleError> {
        let prompt = format!(
            "You are {name}, one of several participants watching a group conversation. \
             How many seconds should you wait and observe before considering a reply? \
             Answer with a single integer between {min} and {max}.",
            name = role.name,
            min = self.delay_min_ms / 1000,
            max = self.delay_max_ms / 1000,
        );
        let answer = self.ask(role, prompt, DECISION_MAX_TOKENS).await?;
        Ok(self.parse_delay(&answer, &role.name))
    }

    /// Strict parse of an integer number of seconds; anything else yields
    /// the default delay.
    fn parse_delay(&self, answer: &str, role: &str) -> u64 {
        let parsed = answer
            .trim()
            .parse::<i64>()
            .ok()
            .and_then(|secs| secs.checked_mul(1000))
            .and_then(|ms| u64::try_from(ms).ok())
            .filter(|ms| (self.delay_min_ms..=self.delay_max_ms).contains(ms));
        match parsed {
            Some(ms) => ms,
            None => {
                tracing::warn!(
                    role,
                    answer = %answer.chars().take(40).collect::<String>(),
                    default_ms = self.delay_default_ms,
                    "invalid delay answer, using default"
                );
                self.delay_default_ms
            }
        }
    }

    /// Does `trigger` move the conversation on from where `agent` last spoke?
    ///
    /// With no earlier contribution in the window there is nothing to
    /// compare against and the topic counts as changed. Answers are memoized
    /// per (channel, agent, last contribution, trigger text), so a new
    /// question is always put to the oracle while a repeated one is not.
    /// Unclear answers are treated as unchanged and not cached.
    pub async fn decide_topic_changed(
        &self,
        role: &RoleConfig,
        agent: &AgentId,
        trigger: &ChannelMessage,
        snapshot: &MessageSnapshot,
    ) -> Result<bool, OracleError> {
        let channel = &trigger.channel_id;
        let Some(own) = snapshot.last_by(agent) else {
            return Ok(true);
        };
        let key = TopicKey::new(channel, agent, &own.message_id, &trigger.content);
        if let Some(changed) = self.topics.get(key) {
            tracing::debug!(channel = %channel, agent = %agent, changed, "topic cache hit");
            return Ok(changed);
        }

        let prompt = format!(
            "Recent conversation:\n{history}\n\n\
             Your last message was: \"{own}\"\n\
             The newest message is: \"{latest}\"\n\n\
             Has the conversation moved to a new question or subject since your last message? \
             Answer YES or NO.",
            history = snapshot.transcript(),
            own = own.content,
            latest = trigger.content,
        );
        let answer = self.ask(role, prompt, DECISION_MAX_TOKENS).await?;
        match Decision::parse(&answer) {
            Decision::Yes => {
                self.topics.put(key, true);
                Ok(true)
            }
            Decision::No => {
                self.topics.put(key, false);
                Ok(false)
            }
            Decision::Unclear => {
                tracing::warn!(channel = %channel, agent = %agent, "unclear topic answer, treating as unchanged");
                Ok(false)
            }
        }
    }

    /// Should this persona contribute given `snapshot`?
    pub async fn decide_participation(
        &self,
        role: &RoleConfig,
        snapshot: &MessageSnapshot,
    ) -> Result<ParticipationDecision, OracleError> {
        let template = role
            .decision_prompt_template
            .as_deref()
            .unwrap_or(DEFAULT_PARTICIPATION_TEMPLATE);
        let prompt = render_template(template, role, snapshot);
        let answer = self.ask(role, prompt, DECISION_MAX_TOKENS * 2).await?;
        Ok(ParticipationDecision::from_answer(&answer))
    }
}

/// Fill `{name}`, `{description}` and `{history}`. A template without
/// `{history}` gets the transcript appended.
fn render_template(template: &str, role: &RoleConfig, snapshot: &MessageSnapshot) -> String {
    let history = snapshot.transcript();
    let mut out = template
        .replace("{name}", &role.name)
        .replace("{description}", &role.description);
    if out.contains("{history}") {
        out = out.replace("{history}", &history);
    } else {
        out.push_str("\n\nRecent conversation:\n");
        out.push_str(&history);
    }
    out
}
