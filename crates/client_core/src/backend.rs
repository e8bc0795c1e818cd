use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Response};
use shared::{
    domain::{AgentId, ConversationId, UserId},
    error::ApiError,
    protocol::{
        Agent, ConversationPatch, ConversationPayload, CreateConversationRequest,
        CreatedConversation, MessagePayload, SendMessageRequest, SendMessageResponse,
    },
};
use url::Url;

/// Remote operations the chat session depends on.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn list_conversations(&self, user_id: UserId) -> Result<Vec<ConversationPayload>>;
    async fn create_conversation(
        &self,
        user_id: UserId,
        agent_id: AgentId,
        title: &str,
    ) -> Result<CreatedConversation>;
    async fn get_messages(&self, conversation_id: ConversationId) -> Result<Vec<MessagePayload>>;
    async fn send_message(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        text: &str,
    ) -> Result<SendMessageResponse>;
    async fn update_conversation(
        &self,
        conversation_id: ConversationId,
        patch: &ConversationPatch,
    ) -> Result<()>;
    async fn delete_conversation(&self, conversation_id: ConversationId) -> Result<()>;
    async fn get_agent(&self, agent_id: AgentId) -> Result<Agent>;
}

pub struct HttpChatBackend {
    http: Client,
    base: Url,
}

impl HttpChatBackend {
    pub fn new(server_url: &str, request_timeout: Duration) -> Result<Self> {
        let mut base =
            Url::parse(server_url).with_context(|| format!("invalid server url: {server_url}"))?;
        if base.cannot_be_a_base() {
            return Err(anyhow!("server url cannot be used as a base: {server_url}"));
        }
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let http = Client::builder()
            .timeout(request_timeout)
            .build()
            .context("failed to build http client")?;
        Ok(Self { http, base })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base
            .join(path)
            .with_context(|| format!("failed to build url for {path}"))
    }

    pub async fn default_agent(&self) -> Result<Agent> {
        let url = self.endpoint("agents/default")?;
        let response = self.http.get(url).send().await?;
        Ok(check(response).await?.json().await?)
    }

    pub async fn health(&self) -> Result<()> {
        let url = self.endpoint("healthz")?;
        check(self.http.get(url).send().await?).await?;
        Ok(())
    }
}

/// Turns non-2xx responses into errors, keeping the server's `ApiError` when
/// the body carries one.
async fn check(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    match serde_json::from_str::<ApiError>(&body) {
        Ok(api_error) => Err(anyhow::Error::new(api_error).context(format!("server returned {status}"))),
        Err(_) if body.trim().is_empty() => Err(anyhow!("server returned {status}")),
        Err(_) => Err(anyhow!("server returned {status}: {}", body.trim())),
    }
}

#[async_trait]
impl ChatBackend for HttpChatBackend {
    async fn list_conversations(&self, user_id: UserId) -> Result<Vec<ConversationPayload>> {
        let response = self
            .http
            .get(self.endpoint("conversations")?)
            .query(&[("user_id", user_id.0)])
            .send()
            .await
            .context("failed to list conversations")?;
        Ok(check(response).await?.json().await?)
    }

    async fn create_conversation(
        &self,
        user_id: UserId,
        agent_id: AgentId,
        title: &str,
    ) -> Result<CreatedConversation> {
        let response = self
            .http
            .post(self.endpoint("conversations")?)
            .json(&CreateConversationRequest {
                user_id,
                agent_id,
                title: title.to_string(),
            })
            .send()
            .await
            .context("failed to create conversation")?;
        Ok(check(response).await?.json().await?)
    }

    async fn get_messages(&self, conversation_id: ConversationId) -> Result<Vec<MessagePayload>> {
        let url = self.endpoint(&format!("conversations/{conversation_id}/messages"))?;
        let response = self
            .http
            .get(url)
            .send()
            .await
            .with_context(|| format!("failed to fetch messages for conversation {conversation_id}"))?;
        Ok(check(response).await?.json().await?)
    }

    async fn send_message(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        text: &str,
    ) -> Result<SendMessageResponse> {
        let url = self.endpoint(&format!("conversations/{conversation_id}/messages"))?;
        let response = self
            .http
            .post(url)
            .json(&SendMessageRequest {
                user_id,
                content: text.to_string(),
            })
            .send()
            .await
            .with_context(|| format!("failed to send message to conversation {conversation_id}"))?;
        Ok(check(response).await?.json().await?)
    }

    async fn update_conversation(
        &self,
        conversation_id: ConversationId,
        patch: &ConversationPatch,
    ) -> Result<()> {
        let url = self.endpoint(&format!("conversations/{conversation_id}"))?;
        let response = self.http.patch(url).json(patch).send().await?;
        check(response).await?;
        Ok(())
    }

    async fn delete_conversation(&self, conversation_id: ConversationId) -> Result<()> {
        let url = self.endpoint(&format!("conversations/{conversation_id}"))?;
        let response = self.http.delete(url).send().await?;
        check(response).await?;
        Ok(())
    }

    async fn get_agent(&self, agent_id: AgentId) -> Result<Agent> {
        let url = self.endpoint(&format!("agents/{agent_id}"))?;
        let response = self.http.get(url).send().await?;
        Ok(check(response).await?.json().await?)
    }
}

#[cfg(test)]
#[path = "tests/backend_tests.rs"]
mod tests;
