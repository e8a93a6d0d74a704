use serde::{Deserialize, Serialize};

/// Interpretation of a yes/no oracle answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    Yes,
    No,
    Unclear,
}

impl Decision {
    /// Parse the oracle's textual answer.
    ///
    /// Leading punctuation and whitespace are skipped, then the first word
    /// must be exactly `yes` or `no` (any case). Everything else, including
    /// empty or hedged text, is `Unclear`.
    pub fn parse(answer: &str) -> Self {
        let body = answer.trim_start_matches(|c: char| !c.is_alphanumeric());
        let word: String = body
            .chars()
            .take_while(|c| c.is_alphanumeric())
            .collect::<String>()
            .to_ascii_uppercase();
        match word.as_str() {
            "YES" => Self::Yes,
            "NO" => Self::No,
            _ => Self::Unclear,
        }
    }
}

/// Outcome of the participation question.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipationDecision {
    pub participate: bool,
    pub decision: Decision,
    pub reason: String,
}

impl ParticipationDecision {
    /// Fail-closed mapping: only `Yes` participates.
    pub fn from_answer(answer: &str) -> Self {
        let reason = |fallback: &str| {
            let rest = answer.trim();
            if rest.is_empty() { fallback.to_owned() } else { rest.chars().take(200).collect() }
        };
        let decision = Decision::parse(answer);
        let reason = match decision {
            Decision::Yes => reason("yes"),
            Decision::No => reason("no"),
            Decision::Unclear => "unclear_decision".to_owned(),
        };
        Self {
            participate: decision == Decision::Yes,
            decision,
            reason,
        }
    }
}
