//! Session state and its pure transitions. Every transition consumes the
//! current state and returns the next one, so the async facade only ever
//! swaps whole states under its lock.

use shared::domain::ConversationId;

use crate::{
    conversation_store::ConversationStore,
    message_log::{LogOwner, MessageLog},
    types::{ConversationSummary, Message, MessageKey, TempIds, DEFAULT_CONVERSATION_TITLE},
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Selection {
    #[default]
    Idle,
    Loading(ConversationId),
    /// `None` is a fresh draft that has no backend conversation yet.
    Ready(Option<ConversationId>),
}

impl Selection {
    pub fn conversation_id(&self) -> Option<ConversationId> {
        match self {
            Selection::Loading(id) | Selection::Ready(Some(id)) => Some(*id),
            Selection::Idle | Selection::Ready(None) => None,
        }
    }
}

/// Issued by `select`; a load result is applied only if its ticket is
/// still the latest one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadTicket {
    pub conversation_id: ConversationId,
    generation: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    Applied { messages: usize },
    Failed(String),
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Followup {
    None,
    Select(ConversationId),
    StartNew,
}

#[derive(Debug, Clone)]
pub(crate) struct ActiveStream {
    pub stream_id: u64,
    pub owner: LogOwner,
    pub message: MessageKey,
    pub visible: String,
}

#[derive(Debug, Clone, Default)]
pub struct SessionState {
    pub(crate) conversations: ConversationStore,
    pub(crate) log: MessageLog,
    pub(crate) selection: Selection,
    pub(crate) title: String,
    pub(crate) search_query: String,
    pub(crate) draft_input: String,
    pub(crate) load_generation: u64,
    pub(crate) draft_epoch: u64,
    pub(crate) stream_seq: u64,
    pub(crate) active_stream: Option<ActiveStream>,
    pub(crate) temp_ids: TempIds,
}

impl SessionState {
    pub fn selection(&self) -> Selection {
        self.selection
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn messages(&self) -> &[Message] {
        self.log.messages()
    }

    pub fn log_owner(&self) -> Option<LogOwner> {
        self.log.owner()
    }

    pub fn conversations(&self) -> &ConversationStore {
        &self.conversations
    }

    pub fn search_query(&self) -> &str {
        &self.search_query
    }

    /// Conversations after applying the current search query.
    pub fn visible_conversations(&self) -> Vec<ConversationSummary> {
        self.conversations.search(&self.search_query, false)
    }

    /// Text to re-seed the composer with after a regenerate.
    pub fn draft_input(&self) -> &str {
        &self.draft_input
    }

    /// Visible text of a message: a partial prefix while it is revealing.
    pub fn visible_text(&self, key: &MessageKey) -> Option<&str> {
        if let Some(stream) = &self.active_stream {
            if &stream.message == key && self.log.is_owned_by(&stream.owner) {
                return Some(stream.visible.as_str());
            }
        }
        self.log.get(key).map(|message| message.content.as_str())
    }

    pub fn is_revealing(&self) -> bool {
        self.active_stream.is_some()
    }

    pub fn select(mut self, conversation_id: ConversationId) -> (Self, LoadTicket) {
        self.load_generation += 1;
        self.selection = Selection::Loading(conversation_id);
        self.log
            .reset(Some(LogOwner::Conversation(conversation_id)), Vec::new());
        self.active_stream = None;
        self.title = self.title_of(conversation_id);
        let ticket = LoadTicket {
            conversation_id,
            generation: self.load_generation,
        };
        (self, ticket)
    }

    pub fn apply_load(
        mut self,
        ticket: LoadTicket,
        result: Result<Vec<Message>, String>,
    ) -> (Self, LoadOutcome) {
        let current = self.selection == Selection::Loading(ticket.conversation_id)
            && self.load_generation == ticket.generation;
        if !current {
            return (self, LoadOutcome::Stale);
        }
        self.selection = Selection::Ready(Some(ticket.conversation_id));
        let owner = Some(LogOwner::Conversation(ticket.conversation_id));
        let outcome = match result {
            Ok(messages) => {
                let count = messages.len();
                self.log.reset(owner, messages);
                LoadOutcome::Applied { messages: count }
            }
            Err(reason) => {
                self.log.reset(owner, Vec::new());
                LoadOutcome::Failed(reason)
            }
        };
        (self, outcome)
    }

    pub fn start_new_conversation(mut self) -> Self {
        self.draft_epoch += 1;
        self.load_generation += 1;
        self.selection = Selection::Ready(None);
        self.log
            .reset(Some(LogOwner::Draft(self.draft_epoch)), Vec::new());
        self.active_stream = None;
        self.title = DEFAULT_CONVERSATION_TITLE.to_string();
        self
    }

    /// Drops a conversation from the store. When it was the selected one the
    /// caller must act on the returned followup.
    pub fn remove_conversation(mut self, conversation_id: ConversationId) -> (Self, Followup) {
        self.conversations.remove(conversation_id);
        if self.selection.conversation_id() != Some(conversation_id) {
            return (self, Followup::None);
        }
        let followup = match self.conversations.head(&self.search_query) {
            Some(next) => Followup::Select(next),
            None => Followup::StartNew,
        };
        (self, followup)
    }

    pub fn replace_conversations(mut self, summaries: Vec<ConversationSummary>) -> Self {
        self.conversations.replace_all(summaries);
        if let Some(id) = self.selection.conversation_id() {
            if self.conversations.contains(id) {
                self.title = self.title_of(id);
            }
        }
        self
    }

    pub fn set_search_query(mut self, query: &str) -> Self {
        self.search_query = query.to_string();
        self
    }

    pub fn rename(mut self, conversation_id: ConversationId, title: &str) -> (Self, bool) {
        let found = self.conversations.rename(conversation_id, title);
        if found && self.selection.conversation_id() == Some(conversation_id) {
            self.title = title.to_string();
        }
        (self, found)
    }

    pub fn set_pinned(mut self, conversation_id: ConversationId, pinned: bool) -> (Self, bool) {
        let found = self.conversations.set_pinned(conversation_id, pinned);
        (self, found)
    }

    pub(crate) fn title_of(&self, conversation_id: ConversationId) -> String {
        self.conversations
            .get(conversation_id)
            .map(|summary| summary.title.clone())
            .unwrap_or_else(|| DEFAULT_CONVERSATION_TITLE.to_string())
    }
}

#[cfg(test)]
#[path = "tests/state_tests.rs"]
mod tests;
