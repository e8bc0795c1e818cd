use std::sync::Arc;

use async_trait::async_trait;
use shared::{
    domain::{AgentId, ConversationId, UserId},
    error::ApiError,
    protocol::{
        message_preview, Agent, ConversationPatch, ConversationPayload, CreateConversationRequest,
        CreatedConversation, MessagePayload, SendMessageRequest, SendMessageResponse,
    },
};
use storage::{Storage, StoredConversation, StoredMessage};
use tracing::{info, warn};

pub const DEFAULT_CONVERSATION_TITLE: &str = "New Conversation";
const MAX_TITLE_CHARS: usize = 120;
const MAX_MESSAGE_BYTES: usize = 32 * 1024;

/// Produces the assistant side of an exchange. `history` holds the stored
/// conversation so far; `prompt` is the user message being answered and is
/// not persisted until a reply exists.
#[async_trait]
pub trait AssistantResponder: Send + Sync {
    async fn reply(
        &self,
        agent: &Agent,
        history: &[StoredMessage],
        prompt: &str,
    ) -> anyhow::Result<String>;
}

/// Deterministic responder for local development and tests.
pub struct EchoResponder;

#[async_trait]
impl AssistantResponder for EchoResponder {
    async fn reply(
        &self,
        agent: &Agent,
        history: &[StoredMessage],
        prompt: &str,
    ) -> anyhow::Result<String> {
        let turns = (history.len() + 1).div_ceil(2);
        Ok(format!(
            "**{}** ({}/{}) received turn {turns}:\n\n> {}\n\nThis is an echo reply.",
            agent.name,
            agent.model_provider,
            agent.model,
            prompt.trim()
        ))
    }
}

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
    pub responder: Arc<dyn AssistantResponder>,
}

pub async fn list_conversations(
    ctx: &ApiContext,
    user_id: UserId,
) -> Result<Vec<ConversationPayload>, ApiError> {
    let conversations = ctx
        .storage
        .list_conversations_for_user(user_id)
        .await
        .map_err(internal)?;
    Ok(conversations
        .iter()
        .map(StoredConversation::to_payload)
        .collect())
}

pub async fn create_conversation(
    ctx: &ApiContext,
    request: CreateConversationRequest,
) -> Result<CreatedConversation, ApiError> {
    load_agent(ctx, request.agent_id).await?;

    let title = normalize_title(&request.title)?.unwrap_or(DEFAULT_CONVERSATION_TITLE);
    let conversation = ctx
        .storage
        .create_conversation(request.user_id, request.agent_id, title)
        .await
        .map_err(internal)?;
    info!(
        conversation_id = conversation.id.0,
        user_id = request.user_id.0,
        agent_id = request.agent_id.0,
        "conversation created"
    );
    Ok(CreatedConversation {
        id: conversation.id,
        title: conversation.title,
        created_at: conversation.created_at,
    })
}

pub async fn get_messages(
    ctx: &ApiContext,
    conversation_id: ConversationId,
) -> Result<Vec<MessagePayload>, ApiError> {
    load_conversation(ctx, conversation_id).await?;
    let messages = ctx
        .storage
        .list_messages(conversation_id)
        .await
        .map_err(internal)?;
    Ok(messages.iter().map(StoredMessage::to_payload).collect())
}

pub async fn send_message(
    ctx: &ApiContext,
    conversation_id: ConversationId,
    request: SendMessageRequest,
) -> Result<SendMessageResponse, ApiError> {
    let content = request.content.trim();
    if content.is_empty() {
        return Err(ApiError::validation("message content cannot be empty"));
    }
    if content.len() > MAX_MESSAGE_BYTES {
        return Err(ApiError::validation(format!(
            "message exceeds {MAX_MESSAGE_BYTES} bytes"
        )));
    }

    let conversation = load_conversation(ctx, conversation_id).await?;
    if conversation.user_id != request.user_id {
        return Err(ApiError::not_found(format!(
            "conversation {conversation_id}"
        )));
    }
    let agent = load_agent(ctx, conversation.agent_id).await?;

    let history = ctx
        .storage
        .list_messages(conversation_id)
        .await
        .map_err(internal)?;

    let reply = ctx
        .responder
        .reply(&agent, &history, content)
        .await
        .map_err(|err| {
            warn!(
                conversation_id = conversation_id.0,
                error = %err,
                "assistant responder failed"
            );
            internal(err)
        })?;

    let (user_message, assistant_message) = ctx
        .storage
        .record_exchange(conversation_id, content, &reply, &message_preview(&reply))
        .await
        .map_err(internal)?;

    Ok(SendMessageResponse {
        user_message: user_message.to_payload(),
        assistant_message: assistant_message.to_payload(),
    })
}

pub async fn update_conversation(
    ctx: &ApiContext,
    conversation_id: ConversationId,
    patch: ConversationPatch,
) -> Result<(), ApiError> {
    if patch.is_empty() {
        return Err(ApiError::validation("update must set title or pinned"));
    }
    let title = match patch.title.as_deref() {
        Some(raw) => Some(
            normalize_title(raw)?
                .ok_or_else(|| ApiError::validation("title cannot be empty"))?,
        ),
        None => None,
    };

    let updated = ctx
        .storage
        .update_conversation(conversation_id, title, patch.pinned)
        .await
        .map_err(internal)?;
    if !updated {
        return Err(ApiError::not_found(format!(
            "conversation {conversation_id}"
        )));
    }
    Ok(())
}

pub async fn delete_conversation(
    ctx: &ApiContext,
    conversation_id: ConversationId,
) -> Result<(), ApiError> {
    let deleted = ctx
        .storage
        .delete_conversation(conversation_id)
        .await
        .map_err(internal)?;
    if !deleted {
        return Err(ApiError::not_found(format!(
            "conversation {conversation_id}"
        )));
    }
    info!(conversation_id = conversation_id.0, "conversation deleted");
    Ok(())
}

pub async fn get_agent(ctx: &ApiContext, agent_id: AgentId) -> Result<Agent, ApiError> {
    load_agent(ctx, agent_id).await
}

async fn load_agent(ctx: &ApiContext, agent_id: AgentId) -> Result<Agent, ApiError> {
    ctx.storage
        .get_agent(agent_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::not_found(format!("agent {agent_id}")))
}

async fn load_conversation(
    ctx: &ApiContext,
    conversation_id: ConversationId,
) -> Result<StoredConversation, ApiError> {
    ctx.storage
        .get_conversation(conversation_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::not_found(format!("conversation {conversation_id}")))
}

fn normalize_title(raw: &str) -> Result<Option<&str>, ApiError> {
    let title = raw.trim();
    if title.is_empty() {
        return Ok(None);
    }
    if title.chars().count() > MAX_TITLE_CHARS {
        return Err(ApiError::validation(format!(
            "title exceeds {MAX_TITLE_CHARS} characters"
        )));
    }
    Ok(Some(title))
}

fn internal(err: anyhow::Error) -> ApiError {
    ApiError::internal(err.to_string())
}
