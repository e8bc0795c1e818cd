use shared::domain::ConversationId;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("message text is empty")]
    EmptyText,
    #[error("no agent selected")]
    MissingAgent,
    #[error("conversation title is empty")]
    EmptyTitle,
}

/// Failures surfaced by `ChatSession`. Backend causes are flattened into
/// strings so errors can be cloned onto the event channel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChatError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("a message is already being sent in this conversation")]
    Busy,
    #[error("failed to create conversation: {0}")]
    CreateFailed(String),
    #[error("failed to send message: {0}")]
    SendFailed(String),
    #[error("failed to load {what}: {reason}")]
    LoadFailed { what: &'static str, reason: String },
    #[error("failed to update conversation {conversation_id}: {reason}")]
    UpdateFailed {
        conversation_id: ConversationId,
        reason: String,
    },
    #[error("failed to delete conversation {conversation_id}: {reason}")]
    DeleteFailed {
        conversation_id: ConversationId,
        reason: String,
    },
    #[error("conversation {0} is not known to this session")]
    UnknownConversation(ConversationId),
}

/// Renders an anyhow chain on one line.
pub(crate) fn describe(err: &anyhow::Error) -> String {
    format!("{err:#}")
}
