use std::fmt;

use chrono::{DateTime, Utc};
use shared::{
    domain::{AgentId, ConversationId, MessageId, Role},
    protocol::{ConversationPayload, CreatedConversation, MessagePayload},
};

pub const DEFAULT_CONVERSATION_TITLE: &str = "New Conversation";
const GENERATED_TITLE_MAX_CHARS: usize = 30;

/// Client-side id for a message the backend has not confirmed yet.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TempMessageId(i64);

impl TempMessageId {
    pub fn millis(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for TempMessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "temp-{}", self.0)
    }
}

/// Hands out `temp-<millis>` ids; a second request in the same millisecond
/// takes the next free value so ids stay unique within a session.
#[derive(Debug, Clone, Default)]
pub struct TempIds {
    last: i64,
}

impl TempIds {
    pub fn next(&mut self, now: DateTime<Utc>) -> TempMessageId {
        let candidate = now.timestamp_millis().max(self.last + 1);
        self.last = candidate;
        TempMessageId(candidate)
    }
}

/// Server ids and temporary ids live in separate variants, so they cannot collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageKey {
    Server(MessageId),
    Temp(TempMessageId),
}

impl MessageKey {
    pub fn is_temp(&self) -> bool {
        matches!(self, MessageKey::Temp(_))
    }
}

impl fmt::Display for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageKey::Server(id) => write!(f, "{id}"),
            MessageKey::Temp(id) => write!(f, "{id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageKey,
    pub conversation_id: Option<ConversationId>,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub streaming: bool,
    pub is_error: bool,
}

impl Message {
    pub fn optimistic_user(
        id: TempMessageId,
        conversation_id: Option<ConversationId>,
        content: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: MessageKey::Temp(id),
            conversation_id,
            role: Role::User,
            content: content.into(),
            created_at,
            streaming: false,
            is_error: false,
        }
    }

    pub fn synthetic_error(
        id: TempMessageId,
        conversation_id: Option<ConversationId>,
        content: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: MessageKey::Temp(id),
            conversation_id,
            role: Role::Assistant,
            content: content.into(),
            created_at,
            streaming: false,
            is_error: true,
        }
    }

    pub fn from_payload(conversation_id: ConversationId, payload: MessagePayload) -> Self {
        Self {
            id: MessageKey::Server(payload.id),
            conversation_id: Some(conversation_id),
            role: payload.role,
            content: payload.content,
            created_at: payload.created_at,
            streaming: false,
            is_error: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationSummary {
    pub id: ConversationId,
    pub title: String,
    pub last_message_preview: Option<String>,
    pub updated_at: DateTime<Utc>,
    pub pinned: bool,
    pub agent_id: AgentId,
}

impl ConversationSummary {
    pub fn created(created: CreatedConversation, agent_id: AgentId) -> Self {
        Self {
            id: created.id,
            title: created.title,
            last_message_preview: None,
            updated_at: created.created_at,
            pinned: false,
            agent_id,
        }
    }
}

impl From<ConversationPayload> for ConversationSummary {
    fn from(payload: ConversationPayload) -> Self {
        Self {
            id: payload.id,
            title: payload.title,
            last_message_preview: payload.last_message_preview,
            updated_at: payload.updated_at,
            pinned: payload.pinned,
            agent_id: payload.agent_id,
        }
    }
}

/// Title proposed for a conversation created from its first message.
pub fn title_from_first_message(text: &str) -> String {
    let first_line = text.lines().map(str::trim).find(|line| !line.is_empty());
    match first_line {
        Some(line) => line.chars().take(GENERATED_TITLE_MAX_CHARS).collect(),
        None => DEFAULT_CONVERSATION_TITLE.to_string(),
    }
}
