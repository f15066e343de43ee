//! Classification of the agent's diagnostic output
//!
//! The tunnel agent has no structured error channel; failures are only visible as
//! free-form lines on stderr. This module maps those lines onto [`AgentFault`]s.
//! Known phrases live in [`KNOWN_PHRASES`] so that new ones can be added without
//! touching the matching logic.

use serde::{Deserialize, Serialize};

/// Message reported when the agent rejects the supplied key/secret
pub const INVALID_CREDENTIALS_MESSAGE: &str =
    "Invalid credentials. Please supply the correct key/secret obtained from TestingBot.com";

/// A fatal condition reported by the agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum AgentFault {
    /// Key/secret were rejected
    InvalidCredentials,
    /// Account has no tunnel minutes left; carries the agent's own line
    QuotaExhausted(String),
    /// Any other line flagged as an error; carries the agent's own line
    Fatal(String),
}

impl std::fmt::Display for AgentFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentFault::InvalidCredentials => f.write_str(INVALID_CREDENTIALS_MESSAGE),
            AgentFault::QuotaExhausted(text) | AgentFault::Fatal(text) => f.write_str(text),
        }
    }
}

/// Result of classifying one diagnostic line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// Nothing actionable, log and move on
    Pass,
    /// The agent announced a newer release
    UpdateAvailable,
    /// The agent is failing; the tunnel must be shut down
    Fatal(AgentFault),
}

#[derive(Debug, Clone, Copy)]
enum PhraseKind {
    Credentials,
    Quota,
    Update,
}

/// Lower-case needles, checked in order before the generic `error` fallback.
const KNOWN_PHRASES: &[(&str, PhraseKind)] = &[
    ("error code : 401", PhraseKind::Credentials),
    ("unauthorized", PhraseKind::Credentials),
    ("error code : 402", PhraseKind::Quota),
    ("no more minutes", PhraseKind::Quota),
    ("out of minutes", PhraseKind::Quota),
    ("minutes limit", PhraseKind::Quota),
    ("is available for download", PhraseKind::Update),
];

const GENERIC_ERROR_MARKER: &str = "error";

/// Classify a single line of agent stderr.
pub fn classify(line: &str) -> Classification {
    let text = line.trim();
    if text.is_empty() {
        return Classification::Pass;
    }

    let lowered = text.to_lowercase();
    let known = KNOWN_PHRASES
        .iter()
        .find(|(needle, _)| lowered.contains(needle))
        .map(|(_, kind)| *kind);

    match known {
        Some(PhraseKind::Credentials) => Classification::Fatal(AgentFault::InvalidCredentials),
        Some(PhraseKind::Quota) => {
            Classification::Fatal(AgentFault::QuotaExhausted(text.to_string()))
        }
        Some(PhraseKind::Update) => Classification::UpdateAvailable,
        None if lowered.contains(GENERIC_ERROR_MARKER) => {
            Classification::Fatal(AgentFault::Fatal(text.to_string()))
        }
        None => Classification::Pass,
    }
}

/// Convenience wrapper returning only the fault, if any.
pub fn fault_of(line: &str) -> Option<AgentFault> {
    match classify(line) {
        Classification::Fatal(fault) => Some(fault),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unauthorized_beats_generic_error() {
        let line = "ERROR: Tunnel error code : 401 Unauthorized";
        assert_eq!(
            classify(line),
            Classification::Fatal(AgentFault::InvalidCredentials)
        );
        assert_eq!(
            fault_of(line).map(|f| f.to_string()).as_deref(),
            Some(INVALID_CREDENTIALS_MESSAGE)
        );
    }

    #[test]
    fn quota_keeps_agent_text() {
        let line = "  You have no more minutes left on your plan, error  ";
        assert_eq!(
            classify(line),
            Classification::Fatal(AgentFault::QuotaExhausted(
                "You have no more minutes left on your plan, error".to_string()
            ))
        );
    }

    #[test]
    fn generic_error_is_case_insensitive() {
        assert_eq!(
            classify("Connection Error while contacting hub"),
            Classification::Fatal(AgentFault::Fatal(
                "Connection Error while contacting hub".to_string()
            ))
        );
    }

    #[test]
    fn update_notice_is_not_fatal() {
        assert_eq!(
            classify("Version 4.2 is available for download"),
            Classification::UpdateAvailable
        );
    }

    #[test]
    fn ordinary_output_passes() {
        assert_eq!(classify("Starting tunnel on port 4445"), Classification::Pass);
        assert_eq!(classify("   "), Classification::Pass);
        assert_eq!(fault_of("all good"), None);
    }
}
