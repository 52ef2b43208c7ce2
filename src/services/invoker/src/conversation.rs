//! Multi-turn conversation correlation
//!
//! Endpoints that hold server-side dialogue state echo a correlation id in
//! each response. The invoker detects which configured response mapping key
//! plays that role, threads the caller-supplied value into the request, and
//! surfaces the endpoint's value back in the output so the next turn can
//! reuse it.

use std::collections::HashMap;

/// Exact names treated as conversation identifiers
const TIER_ONE: [&str; 4] = ["conversation_id", "session_id", "thread_id", "chat_id"];

/// Secondary names accepted when no tier-one key is configured
const TIER_TWO: [&str; 4] = ["dialog_id", "dialogue_id", "context_id", "interaction_id"];

/// The conversation field in play for one invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationContext {
    /// Response mapping key acting as the correlation field
    pub field: String,
    /// Caller-supplied value for this turn, when resuming a conversation
    pub value: Option<String>,
}

impl ConversationContext {
    pub fn new<S: Into<String>>(field: S, value: Option<String>) -> Self {
        Self {
            field: field.into(),
            value,
        }
    }
}

/// Detect which response mapping key tracks the conversation
///
/// Tier-one names win over tier-two names regardless of mapping order; within
/// a tier the first listed name that appears in the mappings is chosen.
pub fn detect_tracking_field(mappings: &HashMap<String, String>) -> Option<String> {
    for candidate in TIER_ONE.iter().chain(TIER_TWO.iter()) {
        if mappings.contains_key(*candidate) {
            return Some((*candidate).to_string());
        }
    }
    None
}

/// Whether a placeholder name may act as a conversation identifier
pub fn is_tracking_candidate(name: &str) -> bool {
    TIER_ONE.contains(&name) || TIER_TWO.contains(&name)
}
