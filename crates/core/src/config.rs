use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Protocol tunables shared by every agent in the process.
/// Loaded once at startup; role-specific settings live in [`crate::role`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChorusCfg {
    // topic-change memoization
    pub topic_cache_max: usize,
    pub topic_cache_ttl_secs: u64,

    // participation cooldown
    pub cooldown_secs: u64,

    // janitor
    pub janitor_interval_secs: u64,
    pub task_grace_secs: u64,

    // oracle
    pub oracle_timeout_secs: u64,
    pub delay_min_ms: u64,
    pub delay_max_ms: u64,
    pub delay_default_ms: u64,

    // scheduling
    pub settle_delay_ms: u64,
    pub trigger_on_agent_messages: bool,
}

impl Default for ChorusCfg {
    fn default() -> Self {
        Self {
            topic_cache_max: 10_000,
            topic_cache_ttl_secs: 3600,
            cooldown_secs: 300,
            janitor_interval_secs: 60,
            task_grace_secs: 120,
            oracle_timeout_secs: 30,
            delay_min_ms: 2000,
            delay_max_ms: 15_000,
            delay_default_ms: 5000,
            settle_delay_ms: 0,
            trigger_on_agent_messages: false,
        }
    }
}

impl ChorusCfg {
    /// Load from `CHORUS_*` environment variables, keeping defaults for
    /// anything missing or unparsable.
    pub fn from_env() -> Self {
        let map: HashMap<String, String> = std::env::vars()
            .filter_map(|(k, v)| {
                k.strip_prefix("CHORUS_")
                    .map(|key| (key.to_ascii_lowercase(), v))
            })
            .collect();
        Self::from_map(&map)
    }

    pub fn from_map(m: &HashMap<String, String>) -> Self {
        let d = Self::default();
        let cfg = Self {
            topic_cache_max: get_or(m, "topic_cache_max", d.topic_cache_max),
            topic_cache_ttl_secs: get_or(m, "topic_cache_ttl_secs", d.topic_cache_ttl_secs),
            cooldown_secs: get_or(m, "cooldown_secs", d.cooldown_secs),
            janitor_interval_secs: get_or(m, "janitor_interval_secs", d.janitor_interval_secs),
            task_grace_secs: get_or(m, "task_grace_secs", d.task_grace_secs),
            oracle_timeout_secs: get_or(m, "oracle_timeout_secs", d.oracle_timeout_secs),
            delay_min_ms: get_or(m, "delay_min_ms", d.delay_min_ms),
            delay_max_ms: get_or(m, "delay_max_ms", d.delay_max_ms),
            delay_default_ms: get_or(m, "delay_default_ms", d.delay_default_ms),
            settle_delay_ms: get_or(m, "settle_delay_ms", d.settle_delay_ms),
            trigger_on_agent_messages: m
                .get("trigger_on_agent_messages")
                .and_then(|v| parse_flag(v))
                .unwrap_or(d.trigger_on_agent_messages),
        };
        cfg.sanitized()
    }

    /// Repair inconsistent delay bounds so the documented default always
    /// lies inside `[delay_min_ms, delay_max_ms]`.
    fn sanitized(mut self) -> Self {
        let d = Self::default();
        if self.delay_min_ms > self.delay_max_ms
            || !(self.delay_min_ms..=self.delay_max_ms).contains(&self.delay_default_ms)
        {
            tracing::warn!(
                min = self.delay_min_ms,
                max = self.delay_max_ms,
                default = self.delay_default_ms,
                "inconsistent delay bounds, using built-in bounds"
            );
            self.delay_min_ms = d.delay_min_ms;
            self.delay_max_ms = d.delay_max_ms;
            self.delay_default_ms = d.delay_default_ms;
        }
        if self.topic_cache_max == 0 {
            self.topic_cache_max = d.topic_cache_max;
        }
        if self.janitor_interval_secs == 0 {
            self.janitor_interval_secs = d.janitor_interval_secs;
        }
        self
    }

    pub fn topic_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.topic_cache_ttl_secs)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn janitor_interval(&self) -> Duration {
        Duration::from_secs(self.janitor_interval_secs)
    }

    pub fn task_grace(&self) -> Duration {
        Duration::from_secs(self.task_grace_secs)
    }

    pub fn oracle_timeout(&self) -> Duration {
        Duration::from_secs(self.oracle_timeout_secs)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    /// True when `ms` is an acceptable timer delay.
    pub fn delay_in_bounds(&self, ms: u64) -> bool {
        (self.delay_min_ms..=self.delay_max_ms).contains(&ms)
    }
}

fn get_or<T: std::str::FromStr>(map: &HashMap<String, String>, key: &str, default: T) -> T {
    map.get(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Parse a boolean-ish value: `1/0`, `true/false`, `yes/no`, `on/off`.
pub fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
