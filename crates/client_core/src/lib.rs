use std::{
    collections::HashSet,
    sync::{Arc, PoisonError},
    time::Duration,
};

use chrono::Utc;
use futures::StreamExt;
use shared::{
    domain::{AgentId, ConversationId, UserId},
    protocol::ConversationPatch,
};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

pub mod backend;
pub mod config;
pub mod conversation_store;
pub mod error;
pub mod message_log;
mod pipeline;
pub mod reveal;
pub mod scheduler;
pub mod state;
pub mod thinking;
pub mod types;

pub use backend::{ChatBackend, HttpChatBackend};
pub use config::{load_client_settings, ClientSettings};
pub use error::{ChatError, ValidationError};
pub use message_log::LogOwner;
pub use pipeline::BusyKey;
pub use reveal::{reveal, RevealFrame, RevealOptions, StreamingRevealState};
pub use state::{Followup, LoadOutcome, LoadTicket, Selection, SessionState};
pub use types::{ConversationSummary, Message, MessageKey, DEFAULT_CONVERSATION_TITLE};

use error::describe;
use pipeline::{BusySet, SendGuard, StreamStart};
use scheduler::ScheduledTask;
use thinking::{AgentDirectory, ThinkingIndicator};
use types::title_from_first_message;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    ConversationsUpdated(Vec<ConversationSummary>),
    ViewChanged {
        selection: Selection,
        title: String,
        messages: Vec<Message>,
    },
    Reveal {
        message: MessageKey,
        text: String,
        done: bool,
    },
    ScrollToLatest,
    Thinking {
        text: String,
        avatar: String,
    },
    ThinkingStopped,
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    pub user_id: UserId,
    pub reveal: RevealOptions,
    pub thinking_interval: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            user_id: UserId(1),
            reveal: RevealOptions::default(),
            thinking_interval: Duration::from_millis(1200),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendRequest {
    /// `None` creates a conversation before sending.
    pub conversation_id: Option<ConversationId>,
    pub agent_id: Option<AgentId>,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendOutcome {
    pub conversation_id: ConversationId,
    pub created: bool,
    pub user_message: Message,
    pub assistant_message: Message,
}

/// Client-side chat session: conversation list, the visible message log and
/// the send/reveal lifecycle over a `ChatBackend`.
pub struct ChatSession {
    backend: Arc<dyn ChatBackend>,
    agents: AgentDirectory,
    options: SessionOptions,
    state: Arc<Mutex<SessionState>>,
    busy: BusySet,
    reveal_task: std::sync::Mutex<Option<ScheduledTask>>,
    events: broadcast::Sender<ClientEvent>,
}

async fn transition<R>(
    state: &Mutex<SessionState>,
    apply: impl FnOnce(SessionState) -> (SessionState, R),
) -> R {
    let mut guard = state.lock().await;
    let (next, output) = apply(std::mem::take(&mut *guard));
    *guard = next;
    output
}

/// Applies a reveal frame and publishes it under the same lock, so a frame
/// is either delivered before a conversation switch or not at all.
async fn deliver_frame(
    state: &Mutex<SessionState>,
    events: &broadcast::Sender<ClientEvent>,
    stream_id: u64,
    message: &MessageKey,
    frame: RevealFrame,
) -> bool {
    transition(state, |state| {
        let (state, live) = state.apply_frame(stream_id, &frame);
        if live {
            let _ = events.send(ClientEvent::Reveal {
                message: message.clone(),
                text: frame.text,
                done: frame.done,
            });
            if frame.scroll {
                let _ = events.send(ClientEvent::ScrollToLatest);
            }
        }
        (state, live)
    })
    .await
}

impl ChatSession {
    pub fn new(backend: Arc<dyn ChatBackend>, options: SessionOptions) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        Arc::new(Self {
            agents: AgentDirectory::new(Arc::clone(&backend)),
            backend,
            options,
            state: Arc::new(Mutex::new(SessionState::default())),
            busy: Arc::new(std::sync::Mutex::new(HashSet::new())),
            reveal_task: std::sync::Mutex::new(None),
            events,
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub async fn snapshot(&self) -> SessionState {
        self.state.lock().await.clone()
    }

    pub fn is_busy(&self, key: BusyKey) -> bool {
        self.busy
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&key)
    }

    pub async fn refresh_conversations(&self) -> Result<usize, ChatError> {
        let payloads = self
            .backend
            .list_conversations(self.options.user_id)
            .await
            .map_err(|err| {
                let reason = describe(&err);
                warn!(error = %reason, "failed to list conversations");
                self.emit(ClientEvent::Error(format!("failed to load conversations: {reason}")));
                ChatError::LoadFailed {
                    what: "conversations",
                    reason,
                }
            })?;
        let summaries: Vec<ConversationSummary> = payloads.into_iter().map(Into::into).collect();
        let count = summaries.len();
        transition(&self.state, |state| (state.replace_conversations(summaries), ())).await;
        self.publish_conversations().await;
        self.publish_view().await;
        Ok(count)
    }

    /// Switches the visible log to `conversation_id` and loads its history.
    /// A result that arrives after another selection is discarded.
    pub async fn select_conversation(&self, conversation_id: ConversationId) -> LoadOutcome {
        self.cancel_reveal();
        let ticket = transition(&self.state, |state| state.select(conversation_id)).await;
        self.publish_view().await;

        let result = self
            .backend
            .get_messages(conversation_id)
            .await
            .map(|payloads| {
                payloads
                    .into_iter()
                    .map(|payload| Message::from_payload(conversation_id, payload))
                    .collect()
            })
            .map_err(|err| describe(&err));
        let outcome = transition(&self.state, |state| state.apply_load(ticket, result)).await;

        match &outcome {
            LoadOutcome::Applied { messages } => {
                debug!(conversation_id = conversation_id.0, messages, "conversation loaded");
                self.publish_view().await;
            }
            LoadOutcome::Failed(reason) => {
                warn!(conversation_id = conversation_id.0, error = %reason, "failed to load messages");
                self.publish_view().await;
                self.emit(ClientEvent::Error(format!(
                    "failed to load conversation {conversation_id}: {reason}"
                )));
            }
            LoadOutcome::Stale => {
                debug!(conversation_id = conversation_id.0, "discarding stale message load");
            }
        }
        outcome
    }

    pub async fn start_new_conversation(&self) {
        self.cancel_reveal();
        transition(&self.state, |state| (state.start_new_conversation(), ())).await;
        self.publish_view().await;
    }

    pub async fn set_search_query(&self, query: &str) -> Vec<ConversationSummary> {
        let visible = transition(&self.state, |state| {
            let state = state.set_search_query(query);
            let visible = state.visible_conversations();
            (state, visible)
        })
        .await;
        self.emit(ClientEvent::ConversationsUpdated(visible.clone()));
        visible
    }

    /// Sends into whatever is selected; a draft creates its conversation first.
    pub async fn send(&self, text: &str, agent_id: Option<AgentId>) -> Result<SendOutcome, ChatError> {
        let conversation_id = self.state.lock().await.selection().conversation_id();
        self.send_message(SendRequest {
            conversation_id,
            agent_id,
            text: text.to_string(),
        })
        .await
    }

    pub async fn send_message(&self, request: SendRequest) -> Result<SendOutcome, ChatError> {
        let text = request.text.trim();
        if text.is_empty() {
            return Err(ValidationError::EmptyText.into());
        }
        let agent_id = request.agent_id.ok_or(ValidationError::MissingAgent)?;

        let owner = match request.conversation_id {
            Some(conversation_id) => LogOwner::Conversation(conversation_id),
            None => {
                let owner = transition(&self.state, SessionState::ensure_draft).await;
                self.publish_view().await;
                owner
            }
        };
        let guard = SendGuard::claim(&self.busy, owner.into())?;
        self.run_send(guard, owner, agent_id, text).await
    }

    /// Re-asks the user message that produced `assistant`. Returns `Ok(None)`
    /// when there is no user message directly before it.
    pub async fn regenerate(
        &self,
        assistant: &MessageKey,
        fallback_agent: Option<AgentId>,
    ) -> Result<Option<SendOutcome>, ChatError> {
        let (guard, agent_id, seed) = {
            let mut state = self.state.lock().await;
            let Some(owner) = state.log_owner() else {
                return Ok(None);
            };
            let agent_id = owner
                .conversation_id()
                .and_then(|id| state.conversations().get(id))
                .map(|summary| summary.agent_id)
                .or(fallback_agent)
                .ok_or(ValidationError::MissingAgent)?;
            let guard = SendGuard::claim(&self.busy, owner.into())?;
            let (next, seed) = std::mem::take(&mut *state).prepare_regenerate(assistant);
            *state = next;
            (guard, agent_id, seed)
        };
        let Some(seed) = seed else {
            debug!(message = %assistant, "nothing to regenerate");
            return Ok(None);
        };
        self.publish_view().await;
        self.run_send(guard, seed.owner, agent_id, &seed.text)
            .await
            .map(Some)
    }

    pub async fn rename_conversation(
        &self,
        conversation_id: ConversationId,
        title: &str,
    ) -> Result<(), ChatError> {
        let title = title.trim();
        if title.is_empty() {
            return Err(ValidationError::EmptyTitle.into());
        }
        let found = transition(&self.state, |state| state.rename(conversation_id, title)).await;
        if !found {
            return Err(ChatError::UnknownConversation(conversation_id));
        }
        self.publish_conversations().await;
        self.publish_view().await;
        self.backend
            .update_conversation(conversation_id, &ConversationPatch::title(title))
            .await
            .map_err(|err| self.update_failed(conversation_id, &err))
    }

    pub async fn set_pinned(&self, conversation_id: ConversationId, pinned: bool) -> Result<(), ChatError> {
        let found = transition(&self.state, |state| state.set_pinned(conversation_id, pinned)).await;
        if !found {
            return Err(ChatError::UnknownConversation(conversation_id));
        }
        self.publish_conversations().await;
        self.backend
            .update_conversation(conversation_id, &ConversationPatch::pinned(pinned))
            .await
            .map_err(|err| self.update_failed(conversation_id, &err))
    }

    /// Flips the pin flag; returns the new value.
    pub async fn toggle_pin(&self, conversation_id: ConversationId) -> Result<bool, ChatError> {
        let pinned = self
            .state
            .lock()
            .await
            .conversations()
            .get(conversation_id)
            .map(|summary| !summary.pinned)
            .ok_or(ChatError::UnknownConversation(conversation_id))?;
        self.set_pinned(conversation_id, pinned).await?;
        Ok(pinned)
    }

    /// Deletes on the backend first; the local entry goes only on success.
    pub async fn delete_conversation(&self, conversation_id: ConversationId) -> Result<(), ChatError> {
        self.backend
            .delete_conversation(conversation_id)
            .await
            .map_err(|err| {
                let reason = describe(&err);
                warn!(conversation_id = conversation_id.0, error = %reason, "delete failed");
                self.emit(ClientEvent::Error(format!(
                    "failed to delete conversation {conversation_id}: {reason}"
                )));
                ChatError::DeleteFailed {
                    conversation_id,
                    reason,
                }
            })?;

        let followup =
            transition(&self.state, |state| state.remove_conversation(conversation_id)).await;
        info!(conversation_id = conversation_id.0, "conversation deleted");
        self.publish_conversations().await;
        match followup {
            Followup::Select(next) => {
                self.select_conversation(next).await;
            }
            Followup::StartNew => self.start_new_conversation().await,
            Followup::None => {}
        }
        Ok(())
    }

    async fn run_send(
        &self,
        mut guard: SendGuard,
        owner: LogOwner,
        agent_id: AgentId,
        text: &str,
    ) -> Result<SendOutcome, ChatError> {
        let temp = transition(&self.state, |state| state.stage_send(owner, text, Utc::now())).await;
        self.publish_view().await;
        let thinking = ThinkingIndicator::start(
            self.agents.clone(),
            agent_id,
            self.options.thinking_interval,
            self.events.clone(),
        );

        let (conversation_id, owner, created) = match owner {
            LogOwner::Conversation(conversation_id) => (conversation_id, owner, false),
            LogOwner::Draft(_) => {
                let title = title_from_first_message(text);
                match self
                    .backend
                    .create_conversation(self.options.user_id, agent_id, &title)
                    .await
                {
                    Ok(created) => {
                        let summary = ConversationSummary::created(created, agent_id);
                        let conversation_id = summary.id;
                        guard.extend(BusyKey::Conversation(conversation_id));
                        let owner =
                            transition(&self.state, |state| state.bind_created(owner, summary)).await;
                        info!(conversation_id = conversation_id.0, "conversation created");
                        self.publish_conversations().await;
                        self.publish_view().await;
                        (conversation_id, owner, true)
                    }
                    Err(err) => {
                        thinking.stop();
                        let reason = describe(&err);
                        warn!(error = %reason, "failed to create conversation");
                        self.record_failure(owner, &reason).await;
                        return Err(ChatError::CreateFailed(reason));
                    }
                }
            }
        };

        let response = self
            .backend
            .send_message(conversation_id, self.options.user_id, text)
            .await;
        thinking.stop();

        match response {
            Ok(response) => {
                let outcome = SendOutcome {
                    conversation_id,
                    created,
                    user_message: Message::from_payload(conversation_id, response.user_message.clone()),
                    assistant_message: Message::from_payload(
                        conversation_id,
                        response.assistant_message.clone(),
                    ),
                };
                let start = transition(&self.state, |state| {
                    state.reconcile(owner, &temp, conversation_id, response)
                })
                .await;
                self.publish_conversations().await;
                self.publish_view().await;
                if let Some(start) = start {
                    self.start_reveal(start);
                }
                Ok(outcome)
            }
            Err(err) => {
                let reason = describe(&err);
                warn!(conversation_id = conversation_id.0, error = %reason, "failed to send message");
                self.record_failure(owner, &reason).await;
                Err(ChatError::SendFailed(reason))
            }
        }
    }

    async fn record_failure(&self, owner: LogOwner, reason: &str) {
        transition(&self.state, |state| (state.fail_send(owner, reason, Utc::now()), ())).await;
        self.publish_view().await;
        self.emit(ClientEvent::Error(reason.to_string()));
    }

    fn update_failed(&self, conversation_id: ConversationId, err: &anyhow::Error) -> ChatError {
        let reason = describe(err);
        warn!(conversation_id = conversation_id.0, error = %reason, "conversation update failed");
        self.emit(ClientEvent::Error(format!(
            "failed to update conversation {conversation_id}: {reason}"
        )));
        ChatError::UpdateFailed {
            conversation_id,
            reason,
        }
    }

    fn start_reveal(&self, start: StreamStart) {
        let state = Arc::clone(&self.state);
        let events = self.events.clone();
        let StreamStart {
            stream_id,
            message,
            text,
        } = start;
        let frames = reveal(text, self.options.reveal);
        let task = ScheduledTask::spawn("stream-reveal", async move {
            let mut frames = Box::pin(frames);
            while let Some(frame) = frames.next().await {
                if !deliver_frame(&state, &events, stream_id, &message, frame).await {
                    debug!(stream_id, "reveal superseded");
                    break;
                }
            }
        });
        let previous = self
            .reveal_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(task);
        drop(previous);
    }

    fn cancel_reveal(&self) {
        let previous = self
            .reveal_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(previous);
    }

    /// Waits for the current reveal (if any) to finish or be cancelled.
    pub async fn wait_for_reveal(&self) {
        let done = self
            .reveal_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(ScheduledTask::done);
        if let Some(done) = done {
            done.wait().await;
        }
    }

    async fn publish_view(&self) {
        let event = {
            let state = self.state.lock().await;
            ClientEvent::ViewChanged {
                selection: state.selection(),
                title: state.title().to_string(),
                messages: state.messages().to_vec(),
            }
        };
        self.emit(event);
    }

    async fn publish_conversations(&self) {
        let visible = self.state.lock().await.visible_conversations();
        self.emit(ClientEvent::ConversationsUpdated(visible));
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
