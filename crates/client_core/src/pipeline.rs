use std::{
    collections::HashSet,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use chrono::{DateTime, Utc};
use shared::{
    domain::{ConversationId, Role},
    protocol::SendMessageResponse,
};

use crate::{
    error::ChatError,
    message_log::LogOwner,
    reveal::RevealFrame,
    state::{ActiveStream, Selection, SessionState},
    types::{ConversationSummary, Message, MessageKey},
};

/// Conversations (or drafts) with a send in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BusyKey {
    Draft(u64),
    Conversation(ConversationId),
}

impl From<LogOwner> for BusyKey {
    fn from(owner: LogOwner) -> Self {
        match owner {
            LogOwner::Draft(epoch) => BusyKey::Draft(epoch),
            LogOwner::Conversation(id) => BusyKey::Conversation(id),
        }
    }
}

pub(crate) type BusySet = Arc<Mutex<HashSet<BusyKey>>>;

fn lock(busy: &BusySet) -> MutexGuard<'_, HashSet<BusyKey>> {
    busy.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Holds busy keys for one send. Keys are released when the guard drops,
/// which also covers a cancelled send future.
#[derive(Debug)]
pub(crate) struct SendGuard {
    busy: BusySet,
    keys: Vec<BusyKey>,
}

impl SendGuard {
    pub fn claim(busy: &BusySet, key: BusyKey) -> Result<Self, ChatError> {
        if !lock(busy).insert(key) {
            return Err(ChatError::Busy);
        }
        Ok(Self {
            busy: Arc::clone(busy),
            keys: vec![key],
        })
    }

    pub fn extend(&mut self, key: BusyKey) {
        if lock(&self.busy).insert(key) {
            self.keys.push(key);
        }
    }
}

impl Drop for SendGuard {
    fn drop(&mut self) {
        let mut busy = lock(&self.busy);
        for key in &self.keys {
            busy.remove(key);
        }
    }
}

pub(crate) struct StreamStart {
    pub stream_id: u64,
    pub message: MessageKey,
    pub text: String,
}

pub(crate) struct RegenerateSeed {
    pub owner: LogOwner,
    pub text: String,
}

pub(crate) fn failure_text(reason: &str) -> String {
    format!("Sorry, something went wrong: {reason}")
}

impl SessionState {
    /// Log owner for a send without a conversation id. Reuses the open draft
    /// or starts a new one.
    pub(crate) fn ensure_draft(self) -> (Self, LogOwner) {
        match self.log.owner() {
            Some(owner @ LogOwner::Draft(_)) => (self, owner),
            _ => {
                let next = self.start_new_conversation();
                let owner = LogOwner::Draft(next.draft_epoch);
                (next, owner)
            }
        }
    }

    pub(crate) fn stage_send(
        mut self,
        owner: LogOwner,
        text: &str,
        now: DateTime<Utc>,
    ) -> (Self, MessageKey) {
        let temp = self.temp_ids.next(now);
        let key = MessageKey::Temp(temp.clone());
        if self.log.is_owned_by(&owner) {
            self.draft_input.clear();
            self.log.append(Message::optimistic_user(
                temp,
                owner.conversation_id(),
                text,
                now,
            ));
        }
        (self, key)
    }

    /// Registers a conversation created for a draft. The draft's log and the
    /// selection follow it only if that draft is still on screen.
    pub(crate) fn bind_created(
        mut self,
        draft: LogOwner,
        summary: ConversationSummary,
    ) -> (Self, LogOwner) {
        let conversation_id = summary.id;
        let title = summary.title.clone();
        self.conversations.prepend(summary);
        if self.log.is_owned_by(&draft) {
            self.log.rebind(conversation_id);
            self.selection = Selection::Ready(Some(conversation_id));
            self.title = title;
        }
        (self, LogOwner::Conversation(conversation_id))
    }

    /// Applies a successful exchange. The store is always updated; the log
    /// only when `owner` still owns it.
    pub(crate) fn reconcile(
        mut self,
        owner: LogOwner,
        temp: &MessageKey,
        conversation_id: ConversationId,
        response: SendMessageResponse,
    ) -> (Self, Option<StreamStart>) {
        let reply = response.assistant_message;
        self.conversations
            .touch(conversation_id, &reply.content, reply.created_at);
        if !self.log.is_owned_by(&owner) {
            return (self, None);
        }

        let user = Message::from_payload(conversation_id, response.user_message);
        if self.log.contains(&user.id) {
            self.log.remove(temp);
        } else if !self.log.replace(temp, user.clone()) {
            self.log.append(user);
        }

        let assistant = Message::from_payload(conversation_id, reply);
        if self.log.contains(&assistant.id) {
            return (self, None);
        }
        let key = assistant.id.clone();
        let text = assistant.content.clone();
        self.log.append(assistant);
        self.log.begin_stream(&key);

        self.stream_seq += 1;
        self.active_stream = Some(ActiveStream {
            stream_id: self.stream_seq,
            owner,
            message: key.clone(),
            visible: String::new(),
        });
        let start = StreamStart {
            stream_id: self.stream_seq,
            message: key,
            text,
        };
        (self, Some(start))
    }

    /// Records a failed create or send as an error reply. The optimistic
    /// user message stays in place.
    pub(crate) fn fail_send(mut self, owner: LogOwner, reason: &str, now: DateTime<Utc>) -> Self {
        if self.log.is_owned_by(&owner) {
            let temp = self.temp_ids.next(now);
            self.log.append(Message::synthetic_error(
                temp,
                owner.conversation_id(),
                failure_text(reason),
                now,
            ));
        }
        self
    }

    pub(crate) fn is_stream_live(&self, stream_id: u64) -> bool {
        self.active_stream
            .as_ref()
            .is_some_and(|stream| stream.stream_id == stream_id && self.log.is_owned_by(&stream.owner))
    }

    /// Applies one reveal frame. Returns false when the stream has been
    /// superseded; the frame is then ignored.
    pub(crate) fn apply_frame(mut self, stream_id: u64, frame: &RevealFrame) -> (Self, bool) {
        if !self.is_stream_live(stream_id) {
            return (self, false);
        }
        let finished = match self.active_stream.as_mut() {
            Some(stream) => {
                stream.visible.clone_from(&frame.text);
                frame.done.then(|| stream.message.clone())
            }
            None => None,
        };
        if let Some(key) = finished {
            self.log.finish_stream(&key);
            self.active_stream = None;
        }
        (self, true)
    }

    /// Drops the user message before `assistant` and everything after it.
    /// Returns the text to resend, or `None` when there is no such message.
    pub(crate) fn prepare_regenerate(mut self, assistant: &MessageKey) -> (Self, Option<RegenerateSeed>) {
        let is_assistant = self
            .log
            .get(assistant)
            .is_some_and(|message| message.role == Role::Assistant);
        let user = match (is_assistant, self.log.owner()) {
            (true, Some(owner)) => self
                .log
                .preceding_user_message(assistant)
                .map(|user| (owner, user.id.clone(), user.content.clone())),
            _ => None,
        };
        let Some((owner, user_key, text)) = user else {
            return (self, None);
        };

        self.log.truncate_from(&user_key);
        if self
            .active_stream
            .as_ref()
            .is_some_and(|stream| !self.log.contains(&stream.message))
        {
            self.active_stream = None;
        }
        self.draft_input.clone_from(&text);
        (self, Some(RegenerateSeed { owner, text }))
    }
}

#[cfg(test)]
#[path = "tests/pipeline_tests.rs"]
mod tests;
