use super::{ORACLE_DELAY, ParticipationStrategy, RoleConfig};

/// Built-in persona for a well-known agent name.
pub fn builtin_role(name: &str) -> Option<RoleConfig> {
    let role = match name {
        "expert" => RoleConfig {
            name: "expert".into(),
            description: "You are a domain expert. Answer the user's question directly, \
                          precisely and with concrete detail."
                .into(),
            participation_strategy: ParticipationStrategy::AlwaysOnTrigger,
            observation_delay_ms: ORACLE_DELAY,
            decision_prompt_template: None,
            max_observation_messages: 10,
            refresh_before_reply: false,
        },
        "critic" => RoleConfig {
            name: "critic".into(),
            description: "You are a careful critic. Point out mistakes, gaps and risks in \
                          what has been said so far. Stay silent when there is nothing to add."
                .into(),
            participation_strategy: ParticipationStrategy::OracleDecide,
            observation_delay_ms: ORACLE_DELAY,
            decision_prompt_template: None,
            max_observation_messages: 10,
            refresh_before_reply: false,
        },
        "summarizer" => RoleConfig {
            name: "summarizer".into(),
            description: "You summarize the discussion so far into a short, balanced \
                          overview that reflects every participant's latest position."
                .into(),
            participation_strategy: ParticipationStrategy::OracleDecide,
            observation_delay_ms: 8000,
            decision_prompt_template: None,
            max_observation_messages: 20,
            refresh_before_reply: true,
        },
        _ => return None,
    };
    Some(role)
}
