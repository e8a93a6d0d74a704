//! Per-agent behavior configuration.
//!
//! A [`RoleConfig`] is resolved once per agent at startup by
//! [`RoleRegistry`] and never mutated afterwards.

mod builtin;
mod registry;

pub use builtin::builtin_role;
pub use registry::{RoleOverride, RoleRegistry};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::types::AgentId;

/// Sentinel delay: immediate for `AlwaysOnTrigger`, oracle-chosen for `OracleDecide`.
pub const ORACLE_DELAY: u64 = 0;
/// Upper bound on the observation window.
pub const MAX_OBSERVATION_WINDOW: usize = 100;

/// How an agent decides whether to speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParticipationStrategy {
    /// Reply to every qualifying trigger without consulting the oracle.
    #[serde(rename = "always_user_question")]
    AlwaysOnTrigger,
    /// Ask the oracle whether the topic moved on and whether to join in.
    #[serde(rename = "ai_decide")]
    OracleDecide,
}

impl ParticipationStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AlwaysOnTrigger => "always_user_question",
            Self::OracleDecide => "ai_decide",
        }
    }
}

impl fmt::Display for ParticipationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ParticipationStrategy {
    type Err = ConfigError;

    /// Only the two exact literals are accepted.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "always_user_question" => Ok(Self::AlwaysOnTrigger),
            "ai_decide" => Ok(Self::OracleDecide),
            other => Err(ConfigError::InvalidValue {
                key: "strategy",
                value: other.to_owned(),
                reason: "expected always_user_question or ai_decide",
            }),
        }
    }
}

/// Fully resolved, immutable behavior of one agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleConfig {
    pub name: String,
    pub description: String,
    pub participation_strategy: ParticipationStrategy,
    /// Milliseconds; [`ORACLE_DELAY`] means "immediate" or "ask the oracle"
    /// depending on the strategy.
    pub observation_delay_ms: u64,
    pub decision_prompt_template: Option<String>,
    pub max_observation_messages: usize,
    pub refresh_before_reply: bool,
}

impl RoleConfig {
    /// Generic persona synthesized for agents nobody configured.
    pub fn generic(agent_id: &AgentId) -> Self {
        Self {
            name: agent_id.to_string(),
            description: format!("you are {agent_id}"),
            participation_strategy: ParticipationStrategy::OracleDecide,
            observation_delay_ms: 5000,
            decision_prompt_template: None,
            max_observation_messages: 10,
            refresh_before_reply: false,
        }
    }

    /// True when the timer delay must be obtained from the oracle.
    pub fn asks_oracle_for_delay(&self) -> bool {
        self.participation_strategy == ParticipationStrategy::OracleDecide
            && self.observation_delay_ms == ORACLE_DELAY
    }
}

/// Role resolution errors. Never fatal: the registry logs them and falls
/// back to a structurally complete role.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid {key} value {value:?}: {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: &'static str,
    },
    #[error("incomplete role config, missing: {}", keys.join(", "))]
    Incomplete { keys: Vec<&'static str> },
    #[error("failed to read roles file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed roles file: {0}")]
    Json(#[from] serde_json::Error),
}
