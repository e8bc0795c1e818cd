use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{AgentId, ConversationId, MessageId, Role, UserId};

pub const PREVIEW_MAX_CHARS: usize = 80;

/// Single-line preview of a message body, truncated on a char boundary.
pub fn message_preview(content: &str) -> String {
    let flattened = content.split_whitespace().collect::<Vec<_>>().join(" ");
    if flattened.chars().count() <= PREVIEW_MAX_CHARS {
        return flattened;
    }
    let mut preview: String = flattened.chars().take(PREVIEW_MAX_CHARS - 1).collect();
    preview.push('…');
    preview
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationPayload {
    pub id: ConversationId,
    pub title: String,
    pub updated_at: DateTime<Utc>,
    pub pinned: bool,
    pub agent_id: AgentId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_preview: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateConversationRequest {
    pub user_id: UserId,
    pub agent_id: AgentId,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedConversation {
    pub id: ConversationId,
    pub title: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub id: MessageId,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub user_id: UserId,
    pub content: String,
}

/// Both halves of an exchange, fully formed. There is no partial wire format:
/// any progressive display happens client-side over `assistant_message`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendMessageResponse {
    pub user_message: MessagePayload,
    pub assistant_message: MessagePayload,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pinned: Option<bool>,
}

impl ConversationPatch {
    pub fn title(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            pinned: None,
        }
    }

    pub fn pinned(pinned: bool) -> Self {
        Self {
            title: None,
            pinned: Some(pinned),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.pinned.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Agent {
    pub agent_id: AgentId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    pub is_default: bool,
    pub model: String,
    pub model_provider: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversation_payload_tolerates_missing_preview() {
        let raw = r#"{
            "id": 3,
            "title": "Trip planning",
            "updated_at": "2024-01-01T00:00:00Z",
            "pinned": true,
            "agent_id": 1
        }"#;
        let payload: ConversationPayload = serde_json::from_str(raw).expect("decode");
        assert_eq!(payload.id, ConversationId(3));
        assert!(payload.pinned);
        assert_eq!(payload.last_message_preview, None);
    }

    #[test]
    fn preview_flattens_and_truncates() {
        assert_eq!(message_preview("line one\n\nline  two"), "line one line two");
        let long = "é".repeat(200);
        let preview = message_preview(&long);
        assert_eq!(preview.chars().count(), PREVIEW_MAX_CHARS);
        assert!(preview.ends_with('…'));
    }

    #[test]
    fn patch_omits_unset_fields() {
        let json = serde_json::to_value(ConversationPatch::pinned(true)).expect("encode");
        assert_eq!(json, serde_json::json!({ "pinned": true }));
        assert!(ConversationPatch::default().is_empty());
    }
}
