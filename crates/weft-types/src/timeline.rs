//! Timeline entries: the append-only log of one execution.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::content::ContentBlock;
use crate::message::{Message, Role};

/// Non-message entries recorded on the timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TimelineEvent {
    UserAction {
        action: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        actor: Option<String>,
        #[serde(default)]
        details: Value,
    },
    SystemEvent {
        event: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<String>,
        #[serde(default)]
        data: Value,
    },
    StateChange {
        key: String,
        #[serde(default)]
        previous: Value,
        #[serde(default)]
        current: Value,
    },
}

impl TimelineEvent {
    pub fn to_block(&self) -> ContentBlock {
        match self.clone() {
            TimelineEvent::UserAction {
                action,
                actor,
                details,
            } => ContentBlock::UserAction {
                action,
                actor,
                details,
            },
            TimelineEvent::SystemEvent {
                event,
                source,
                data,
            } => ContentBlock::SystemEvent {
                event,
                source,
                data,
            },
            TimelineEvent::StateChange {
                key,
                previous,
                current,
            } => ContentBlock::StateChange {
                key,
                previous,
                current,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum EntryKind {
    Message(Message),
    Event(TimelineEvent),
}

/// One timeline entry, attributed to exactly one tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub tick: u32,
    #[serde(flatten)]
    pub kind: EntryKind,
}

impl TimelineEntry {
    pub fn message(tick: u32, message: Message) -> Self {
        Self {
            tick,
            kind: EntryKind::Message(message),
        }
    }

    pub fn event(tick: u32, event: TimelineEvent) -> Self {
        Self {
            tick,
            kind: EntryKind::Event(event),
        }
    }

    pub fn as_message(&self) -> Option<&Message> {
        match &self.kind {
            EntryKind::Message(message) => Some(message),
            EntryKind::Event(_) => None,
        }
    }

    /// Message view sent to the model. Events become user-role messages
    /// carrying the matching event block.
    pub fn to_model_message(&self) -> Message {
        match &self.kind {
            EntryKind::Message(message) => message.clone(),
            EntryKind::Event(event) => Message::new(Role::User, vec![event.to_block()]),
        }
    }

    /// Equality on tick, role/event and content; ignores ids and timestamps.
    pub fn same_content(&self, other: &TimelineEntry) -> bool {
        if self.tick != other.tick {
            return false;
        }
        match (&self.kind, &other.kind) {
            (EntryKind::Message(a), EntryKind::Message(b)) => a.same_content(b),
            (EntryKind::Event(a), EntryKind::Event(b)) => a == b,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_event_lowers_to_user_message() {
        let entry = TimelineEntry::event(
            2,
            TimelineEvent::UserAction {
                action: "clicked_approve".to_string(),
                actor: Some("alice".to_string()),
                details: json!({"button": "ok"}),
            },
        );
        let message = entry.to_model_message();
        assert_eq!(message.role, Role::User);
        assert!(matches!(
            &message.content[0],
            ContentBlock::UserAction { action, .. } if action == "clicked_approve"
        ));
    }

    #[test]
    fn test_entry_serializes_tick_and_kind() {
        let entry = TimelineEntry::message(1, Message::user("Hello"));
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["tick"], 1);
        assert_eq!(value["kind"], "message");
        assert_eq!(value["value"]["role"], "user");
    }
}
