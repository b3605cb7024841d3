//! Normalized model-call outcomes.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Normalized reason a tick's model call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Natural end of the assistant turn.
    #[default]
    Stop,
    /// The model wants tool results before continuing.
    ToolUse,
    /// Output token limit hit.
    MaxTokens,
    /// Provider-side content filtering.
    ContentFilter,
    /// The engine's tick cap was reached.
    MaxTicks,
    /// Provider reported an error stop.
    Error,
}

impl StopReason {
    /// Maps provider stop strings onto the normalized set.
    ///
    /// Returns `None` for strings no provider is known to send.
    pub fn from_provider(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "stop" | "end_turn" | "stop_sequence" | "complete" | "completed" => Some(Self::Stop),
            "tool_use" | "tool_calls" | "function_call" => Some(Self::ToolUse),
            "length" | "max_tokens" | "max_output_tokens" => Some(Self::MaxTokens),
            "content_filter" | "safety" | "refusal" => Some(Self::ContentFilter),
            "error" => Some(Self::Error),
            "max_ticks" => Some(Self::MaxTicks),
            _ => None,
        }
    }

    /// True for every reason except a tool-call continuation.
    pub fn is_terminal(self) -> bool {
        !matches!(self, StopReason::ToolUse)
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            StopReason::Stop => "stop",
            StopReason::ToolUse => "tool_use",
            StopReason::MaxTokens => "max_tokens",
            StopReason::ContentFilter => "content_filter",
            StopReason::MaxTicks => "max_ticks",
            StopReason::Error => "error",
        };
        write!(f, "{label}")
    }
}

/// Token usage for one model call (or an aggregate).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
}

impl Usage {
    pub fn add(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cache_read_input_tokens += other.cache_read_input_tokens;
        self.cache_creation_input_tokens += other.cache_creation_input_tokens;
    }

    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_stop_strings_normalize() {
        assert_eq!(StopReason::from_provider("end_turn"), Some(StopReason::Stop));
        assert_eq!(
            StopReason::from_provider("tool_calls"),
            Some(StopReason::ToolUse)
        );
        assert_eq!(
            StopReason::from_provider("LENGTH"),
            Some(StopReason::MaxTokens)
        );
        assert_eq!(StopReason::from_provider("banana"), None);
    }

    #[test]
    fn test_only_tool_use_continues() {
        assert!(!StopReason::ToolUse.is_terminal());
        assert!(StopReason::Stop.is_terminal());
        assert!(StopReason::MaxTicks.is_terminal());
    }

    #[test]
    fn test_usage_add_accumulates() {
        let mut total = Usage::default();
        total.add(&Usage {
            input_tokens: 10,
            output_tokens: 2,
            ..Usage::default()
        });
        total.add(&Usage {
            input_tokens: 5,
            output_tokens: 3,
            ..Usage::default()
        });
        assert_eq!(total.total(), 20);
    }
}
