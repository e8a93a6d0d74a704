use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;

use super::{
    ConfigError, MAX_OBSERVATION_WINDOW, ORACLE_DELAY, ParticipationStrategy, RoleConfig,
    builtin_role,
};
use crate::config::{ChorusCfg, parse_flag};
use crate::types::AgentId;

/// Partial, unvalidated role settings from one configuration source.
/// Values stay raw strings until the merge validates them field by field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoleOverride {
    pub name: Option<String>,
    pub description: Option<String>,
    pub strategy: Option<String>,
    pub delay: Option<String>,
    pub max_messages: Option<String>,
    pub refresh_before_reply: Option<String>,
    pub prompt_template: Option<String>,
}

impl RoleOverride {
    /// Read `{prefix}NAME`, `{prefix}DESCRIPTION`, ... from `vars`.
    pub fn from_vars(vars: &HashMap<String, String>, prefix: &str) -> Option<Self> {
        let get = |key: &str| vars.get(&format!("{prefix}{key}")).cloned();
        let ov = Self {
            name: get("NAME"),
            description: get("DESCRIPTION"),
            strategy: get("STRATEGY"),
            delay: get("DELAY"),
            max_messages: get("MAX_MESSAGES"),
            refresh_before_reply: get("REFRESH_BEFORE_REPLY"),
            prompt_template: get("PROMPT_TEMPLATE"),
        };
        (ov != Self::default()).then_some(ov)
    }

    /// Build from one JSON object. Scalars of any JSON type are accepted
    /// and validated later like their environment counterparts.
    fn from_json(obj: &serde_json::Map<String, Value>) -> Self {
        let get = |keys: &[&str]| {
            keys.iter().find_map(|k| obj.get(*k)).and_then(|v| match v {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                Value::Bool(b) => Some(b.to_string()),
                _ => None,
            })
        };
        Self {
            name: get(&["name"]),
            description: get(&["description"]),
            strategy: get(&["strategy", "participation_strategy"]),
            delay: get(&["delay", "observation_delay_ms"]),
            max_messages: get(&["max_messages", "max_observation_messages"]),
            refresh_before_reply: get(&["refresh_before_reply"]),
            prompt_template: get(&["prompt_template", "decision_prompt_template"]),
        }
    }
}

/// Resolves [`RoleConfig`]s.
///
/// Precedence: environment override > custom override > built-in role by
/// name > generic fallback. Each field is validated on its own; an invalid
/// value is dropped with a warning and the lower-precedence value stays.
#[derive(Debug, Clone)]
pub struct RoleRegistry {
    env: HashMap<String, String>,
    custom: HashMap<AgentId, RoleOverride>,
    delay_min_ms: u64,
    delay_max_ms: u64,
}

impl RoleRegistry {
    /// Registry over an explicit environment map (tests, embedding).
    pub fn new(cfg: &ChorusCfg, env: HashMap<String, String>) -> Self {
        Self {
            env,
            custom: HashMap::new(),
            delay_min_ms: cfg.delay_min_ms,
            delay_max_ms: cfg.delay_max_ms,
        }
    }

    /// Registry over the process environment. Loads `CHORUS_ROLES_FILE`
    /// if set; a broken file is logged and ignored.
    pub fn from_env(cfg: &ChorusCfg) -> Self {
        let env: HashMap<String, String> = std::env::vars().collect();
        let file = env.get("CHORUS_ROLES_FILE").cloned();
        let mut registry = Self::new(cfg, env);
        if let Some(path) = file {
            match registry.load_file(Path::new(&path)) {
                Ok(count) => tracing::info!(path = %path, count, "custom roles loaded"),
                Err(e) => tracing::error!(path = %path, error = %e, "failed to load custom roles"),
            }
        }
        registry
    }

    /// Register a custom override for `agent_id`, replacing any previous one.
    pub fn with_custom(mut self, agent_id: impl Into<AgentId>, ov: RoleOverride) -> Self {
        self.custom.insert(agent_id.into(), ov);
        self
    }

    /// Load custom overrides from a JSON object keyed by agent id.
    pub fn load_file(&mut self, path: &Path) -> Result<usize, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        self.load_json(&raw)
    }

    pub fn load_json(&mut self, raw: &str) -> Result<usize, ConfigError> {
        let parsed: HashMap<String, serde_json::Map<String, Value>> = serde_json::from_str(raw)?;
        let count = parsed.len();
        for (agent, obj) in parsed {
            self.custom.insert(AgentId::new(agent), RoleOverride::from_json(&obj));
        }
        Ok(count)
    }

    /// Environment prefix for `agent_id`: `CHORUS_ROLE_<ID>_` with
    /// non-alphanumerics mapped to `_`.
    pub fn env_prefix(agent_id: &AgentId) -> String {
        let id: String = agent_id
            .as_str()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
            .collect();
        format!("CHORUS_ROLE_{id}_")
    }

    /// Resolve the role for `agent_id`. Always returns a complete config.
    pub fn resolve(&self, agent_id: &AgentId) -> RoleConfig {
        let base = builtin_role(agent_id.as_str()).unwrap_or_else(|| RoleConfig::generic(agent_id));
        let mut draft = RoleDraft::from(&base);

        if let Some(custom) = self.custom.get(agent_id) {
            self.apply(&mut draft, custom, agent_id, "custom");
        }
        if let Some(env) = RoleOverride::from_vars(&self.env, &Self::env_prefix(agent_id)) {
            self.apply(&mut draft, &env, agent_id, "env");
        }

        match draft.build() {
            Ok(role) => role,
            Err(e) => {
                tracing::error!(agent = %agent_id, error = %e, "merged role incomplete, using base role");
                base
            }
        }
    }

    /// Resolve every agent in `ids`, skipping duplicates.
    pub fn resolve_all(&self, ids: &[AgentId]) -> Vec<(AgentId, RoleConfig)> {
        let mut seen = Vec::with_capacity(ids.len());
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if seen.contains(id) {
                continue;
            }
            seen.push(id.clone());
            out.push((id.clone(), self.resolve(id)));
        }
        out
    }

    fn apply(&self, draft: &mut RoleDraft, ov: &RoleOverride, agent: &AgentId, source: &'static str) {
        if let Some(name) = &ov.name {
            draft.name = non_blank(name);
        }
        if let Some(desc) = &ov.description {
            draft.description = non_blank(desc);
        }
        if let Some(raw) = &ov.strategy {
            match raw.parse::<ParticipationStrategy>() {
                Ok(strategy) => draft.participation_strategy = Some(strategy),
                Err(e) => reject(agent, source, &e),
            }
        }
        if let Some(raw) = &ov.delay {
            match self.parse_delay(raw) {
                Ok(ms) => draft.observation_delay_ms = Some(ms),
                Err(e) => reject(agent, source, &e),
            }
        }
        if let Some(raw) = &ov.max_messages {
            match parse_window(raw) {
                Ok(n) => draft.max_observation_messages = Some(n),
                Err(e) => reject(agent, source, &e),
            }
        }
        if let Some(raw) = &ov.refresh_before_reply {
            match parse_flag(raw) {
                Some(flag) => draft.refresh_before_reply = Some(flag),
                None => reject(
                    agent,
                    source,
                    &ConfigError::InvalidValue {
                        key: "refresh_before_reply",
                        value: raw.clone(),
                        reason: "expected a boolean",
                    },
                ),
            }
        }
        if let Some(tpl) = &ov.prompt_template {
            draft.decision_prompt_template = Some(non_blank(tpl));
        }
    }

    /// Accept the sentinel `0` or an integer inside the delay bounds.
    fn parse_delay(&self, raw: &str) -> Result<u64, ConfigError> {
        let invalid = |reason| ConfigError::InvalidValue {
            key: "delay",
            value: raw.to_owned(),
            reason,
        };
        let ms: i64 = raw.trim().parse().map_err(|_| invalid("not an integer"))?;
        if ms == ORACLE_DELAY as i64 {
            return Ok(ORACLE_DELAY);
        }
        let ms = u64::try_from(ms).map_err(|_| invalid("negative"))?;
        if (self.delay_min_ms..=self.delay_max_ms).contains(&ms) {
            Ok(ms)
        } else {
            Err(invalid("out of range"))
        }
    }
}

fn parse_window(raw: &str) -> Result<usize, ConfigError> {
    match raw.trim().parse::<usize>() {
        Ok(n) if (1..=MAX_OBSERVATION_WINDOW).contains(&n) => Ok(n),
        _ => Err(ConfigError::InvalidValue {
            key: "max_messages",
            value: raw.to_owned(),
            reason: "expected an integer in 1..=100",
        }),
    }
}

fn non_blank(s: &str) -> Option<String> {
    let t = s.trim();
    (!t.is_empty()).then(|| t.to_owned())
}

fn reject(agent: &AgentId, source: &'static str, e: &ConfigError) {
    tracing::warn!(agent = %agent, source, error = %e, "ignoring role override");
}

/// Merge accumulator. Blank text overrides clear a field, which the final
/// completeness check catches.
#[derive(Debug, Default)]
struct RoleDraft {
    name: Option<String>,
    description: Option<String>,
    participation_strategy: Option<ParticipationStrategy>,
    observation_delay_ms: Option<u64>,
    decision_prompt_template: Option<Option<String>>,
    max_observation_messages: Option<usize>,
    refresh_before_reply: Option<bool>,
}

impl From<&RoleConfig> for RoleDraft {
    fn from(role: &RoleConfig) -> Self {
        Self {
            name: Some(role.name.clone()),
            description: Some(role.description.clone()),
            participation_strategy: Some(role.participation_strategy),
            observation_delay_ms: Some(role.observation_delay_ms),
            decision_prompt_template: Some(role.decision_prompt_template.clone()),
            max_observation_messages: Some(role.max_observation_messages),
            refresh_before_reply: Some(role.refresh_before_reply),
        }
    }
}

impl RoleDraft {
    fn build(self) -> Result<RoleConfig, ConfigError> {
        let mut missing = Vec::new();
        if self.name.is_none() {
            missing.push("name");
        }
        if self.description.is_none() {
            missing.push("description");
        }
        if self.participation_strategy.is_none() {
            missing.push("participation_strategy");
        }
        if self.observation_delay_ms.is_none() {
            missing.push("observation_delay_ms");
        }
        if self.max_observation_messages.is_none() {
            missing.push("max_observation_messages");
        }
        if self.refresh_before_reply.is_none() {
            missing.push("refresh_before_reply");
        }
        match self {
            Self {
                name: Some(name),
                description: Some(description),
                participation_strategy: Some(participation_strategy),
                observation_delay_ms: Some(observation_delay_ms),
                decision_prompt_template,
                max_observation_messages: Some(max_observation_messages),
                refresh_before_reply: Some(refresh_before_reply),
            } => Ok(RoleConfig {
                name,
                description,
                participation_strategy,
                observation_delay_ms,
                decision_prompt_template: decision_prompt_template.flatten(),
                max_observation_messages,
                refresh_before_reply,
            }),
            _ => Err(ConfigError::Incomplete { keys: missing }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn registry(pairs: &[(&str, &str)]) -> RoleRegistry {
        RoleRegistry::new(&ChorusCfg::default(), env(pairs))
    }

    #[test]
    fn unknown_agent_gets_generic_role() {
        let role = registry(&[]).resolve(&"scout".into());
        assert_eq!(role, RoleConfig::generic(&"scout".into()));
    }

    #[test]
    fn builtin_beats_generic() {
        let role = registry(&[]).resolve(&"expert".into());
        assert_eq!(role.participation_strategy, ParticipationStrategy::AlwaysOnTrigger);
    }

    #[test]
    fn env_beats_custom() {
        let reg = registry(&[("CHORUS_ROLE_CRITIC_DELAY", "9000")]).with_custom(
            "critic",
            RoleOverride {
                delay: Some("3000".into()),
                name: Some("Critic".into()),
                ..Default::default()
            },
        );
        let role = reg.resolve(&"critic".into());
        assert_eq!(role.observation_delay_ms, 9000);
        assert_eq!(role.name, "Critic");
    }

    #[test]
    fn invalid_delay_keeps_base() {
        for bad in ["abc", "-5", "1999", "15001", "7.5", ""] {
            let role = registry(&[("CHORUS_ROLE_SCOUT_DELAY", bad)]).resolve(&"scout".into());
            assert_eq!(role.observation_delay_ms, 5000, "delay {bad:?}");
        }
        let role = registry(&[("CHORUS_ROLE_SCOUT_DELAY", "15000")]).resolve(&"scout".into());
        assert_eq!(role.observation_delay_ms, 15000);
        let role = registry(&[("CHORUS_ROLE_SCOUT_DELAY", "0")]).resolve(&"scout".into());
        assert!(role.asks_oracle_for_delay());
    }

    #[test]
    fn invalid_strategy_keeps_base() {
        let role = registry(&[("CHORUS_ROLE_EXPERT_STRATEGY", "sometimes")]).resolve(&"expert".into());
        assert_eq!(role.participation_strategy, ParticipationStrategy::AlwaysOnTrigger);
        let role = registry(&[("CHORUS_ROLE_EXPERT_STRATEGY", "ai_decide")]).resolve(&"expert".into());
        assert_eq!(role.participation_strategy, ParticipationStrategy::OracleDecide);
    }

    #[test]
    fn padded_strategy_literal_is_rejected() {
        for raw in [" ai_decide ", "ai_decide\n", "AI_DECIDE"] {
            let role = registry(&[("CHORUS_ROLE_EXPERT_STRATEGY", raw)]).resolve(&"expert".into());
            assert_eq!(role.participation_strategy, ParticipationStrategy::AlwaysOnTrigger, "{raw:?}");
        }
    }

    #[test]
    fn blank_name_falls_back_to_base() {
        let reg = registry(&[
            ("CHORUS_ROLE_CRITIC_NAME", "   "),
            ("CHORUS_ROLE_CRITIC_DELAY", "9000"),
        ]);
        let role = reg.resolve(&"critic".into());
        assert_eq!(role, builtin_role("critic").unwrap());
    }

    #[test]
    fn refresh_flag_and_window() {
        let reg = registry(&[
            ("CHORUS_ROLE_SCOUT_REFRESH_BEFORE_REPLY", "on"),
            ("CHORUS_ROLE_SCOUT_MAX_MESSAGES", "25"),
        ]);
        let role = reg.resolve(&"scout".into());
        assert!(role.refresh_before_reply);
        assert_eq!(role.max_observation_messages, 25);

        let reg = registry(&[("CHORUS_ROLE_SCOUT_MAX_MESSAGES", "0")]);
        assert_eq!(reg.resolve(&"scout".into()).max_observation_messages, 10);
    }

    #[test]
    fn prefix_normalizes_ids() {
        assert_eq!(RoleRegistry::env_prefix(&"code-critic".into()), "CHORUS_ROLE_CODE_CRITIC_");
    }

    #[test]
    fn json_roles_file() {
        let mut reg = registry(&[]);
        let count = reg
            .load_json(r#"{"scout": {"strategy": "always_user_question", "delay": 4000, "refresh_before_reply": true}}"#)
            .unwrap();
        assert_eq!(count, 1);
        let role = reg.resolve(&"scout".into());
        assert_eq!(role.participation_strategy, ParticipationStrategy::AlwaysOnTrigger);
        assert_eq!(role.observation_delay_ms, 4000);
        assert!(role.refresh_before_reply);
        assert!(reg.load_json("[1, 2]").is_err());
    }

    #[test]
    fn resolve_all_dedups() {
        let roles = registry(&[]).resolve_all(&["expert".into(), "critic".into(), "expert".into()]);
        assert_eq!(roles.len(), 2);
    }

    proptest! {
        #[test]
        fn resolved_role_is_always_complete(
            agent in "[a-z]{1,8}",
            name in proptest::option::of(".{0,12}"),
            description in proptest::option::of(".{0,12}"),
            strategy in proptest::option::of(".{0,20}"),
            delay in proptest::option::of(".{0,8}"),
            max_messages in proptest::option::of(".{0,4}"),
        ) {
            let prefix = RoleRegistry::env_prefix(&AgentId::new(agent.clone()));
            let mut vars = HashMap::new();
            let mut put = |key: &str, v: &Option<String>| {
                if let Some(v) = v {
                    vars.insert(format!("{prefix}{key}"), v.clone());
                }
            };
            put("NAME", &name);
            put("DESCRIPTION", &description);
            put("STRATEGY", &strategy);
            put("DELAY", &delay);
            put("MAX_MESSAGES", &max_messages);
            let cfg = ChorusCfg::default();
            let role = RoleRegistry::new(&cfg, vars).resolve(&AgentId::new(agent));
            prop_assert!(!role.name.trim().is_empty());
            prop_assert!(!role.description.trim().is_empty());
            prop_assert!(role.max_observation_messages >= 1);
            prop_assert!(
                role.observation_delay_ms == ORACLE_DELAY
                    || cfg.delay_in_bounds(role.observation_delay_ms)
            );
        }
    }
}
