use shared::domain::{ConversationId, Role};

use crate::types::{Message, MessageKey};

/// Who the visible log belongs to. A draft epoch changes every time the user
/// starts a new conversation, so late results for an abandoned draft never
/// match the current owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogOwner {
    Draft(u64),
    Conversation(ConversationId),
}

impl LogOwner {
    pub fn conversation_id(&self) -> Option<ConversationId> {
        match self {
            LogOwner::Conversation(id) => Some(*id),
            LogOwner::Draft(_) => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MessageLog {
    owner: Option<LogOwner>,
    messages: Vec<Message>,
}

impl MessageLog {
    pub fn owner(&self) -> Option<LogOwner> {
        self.owner
    }

    pub fn is_owned_by(&self, owner: &LogOwner) -> bool {
        self.owner.as_ref() == Some(owner)
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn reset(&mut self, owner: Option<LogOwner>, messages: Vec<Message>) {
        self.owner = owner;
        self.messages = messages;
    }

    /// Draft becomes a real conversation; untagged messages inherit the id.
    pub fn rebind(&mut self, conversation_id: ConversationId) {
        self.owner = Some(LogOwner::Conversation(conversation_id));
        for message in &mut self.messages {
            message.conversation_id.get_or_insert(conversation_id);
        }
    }

    pub fn append(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn position(&self, key: &MessageKey) -> Option<usize> {
        self.messages.iter().position(|message| &message.id == key)
    }

    pub fn get(&self, key: &MessageKey) -> Option<&Message> {
        self.messages.iter().find(|message| &message.id == key)
    }

    pub fn contains(&self, key: &MessageKey) -> bool {
        self.position(key).is_some()
    }

    /// Swaps an entry in place, keeping its position.
    pub fn replace(&mut self, key: &MessageKey, message: Message) -> bool {
        match self.position(key) {
            Some(index) => {
                self.messages[index] = message;
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, key: &MessageKey) -> Option<Message> {
        let index = self.position(key)?;
        Some(self.messages.remove(index))
    }

    /// Drops the entry with `key` and everything after it.
    pub fn truncate_from(&mut self, key: &MessageKey) -> Vec<Message> {
        match self.position(key) {
            Some(index) => self.messages.split_off(index),
            None => Vec::new(),
        }
    }

    /// Marks `key` as the single streaming message.
    pub fn begin_stream(&mut self, key: &MessageKey) -> bool {
        if !self.contains(key) {
            return false;
        }
        for message in &mut self.messages {
            message.streaming = &message.id == key;
        }
        true
    }

    pub fn finish_stream(&mut self, key: &MessageKey) -> bool {
        match self.messages.iter_mut().find(|message| &message.id == key) {
            Some(message) => {
                message.streaming = false;
                true
            }
            None => false,
        }
    }

    pub fn streaming_message(&self) -> Option<&Message> {
        self.messages.iter().find(|message| message.streaming)
    }

    /// The user message immediately before `key`, if that neighbour exists
    /// and is a user message.
    pub fn preceding_user_message(&self, key: &MessageKey) -> Option<&Message> {
        let index = self.position(key)?;
        let previous = self.messages.get(index.checked_sub(1)?)?;
        (previous.role == Role::User).then_some(previous)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use shared::domain::MessageId;

    fn server(id: i64, role: Role, content: &str) -> Message {
        Message {
            id: MessageKey::Server(MessageId(id)),
            conversation_id: Some(ConversationId(1)),
            role,
            content: content.to_string(),
            created_at: Utc::now(),
            streaming: false,
            is_error: false,
        }
    }

    fn seeded() -> MessageLog {
        let mut log = MessageLog::default();
        log.reset(
            Some(LogOwner::Conversation(ConversationId(1))),
            vec![
                server(1, Role::User, "q1"),
                server(2, Role::Assistant, "a1"),
                server(3, Role::User, "q2"),
                server(4, Role::Assistant, "a2"),
            ],
        );
        log
    }

    #[test]
    fn only_one_message_streams_at_a_time() {
        let mut log = seeded();
        assert!(log.begin_stream(&MessageKey::Server(MessageId(2))));
        assert!(log.begin_stream(&MessageKey::Server(MessageId(4))));

        let streaming: Vec<_> = log.messages().iter().filter(|m| m.streaming).collect();
        assert_eq!(streaming.len(), 1);
        assert_eq!(streaming[0].content, "a2");

        assert!(log.finish_stream(&MessageKey::Server(MessageId(4))));
        assert!(log.streaming_message().is_none());
        assert!(!log.begin_stream(&MessageKey::Server(MessageId(99))));
    }

    #[test]
    fn replace_keeps_index_and_neighbours() {
        let mut log = seeded();
        let replaced = log.replace(
            &MessageKey::Server(MessageId(2)),
            server(20, Role::Assistant, "a1 edited"),
        );
        assert!(replaced);

        let ids: Vec<_> = log.messages().iter().map(|m| m.id.clone()).collect();
        assert_eq!(
            ids,
            vec![
                MessageKey::Server(MessageId(1)),
                MessageKey::Server(MessageId(20)),
                MessageKey::Server(MessageId(3)),
                MessageKey::Server(MessageId(4)),
            ]
        );
        assert_eq!(log.messages()[1].content, "a1 edited");
        assert!(!log.replace(&MessageKey::Server(MessageId(2)), server(21, Role::User, "x")));
        assert_eq!(log.len(), 4);
    }

    #[test]
    fn truncate_removes_target_and_everything_after() {
        let mut log = seeded();
        let removed = log.truncate_from(&MessageKey::Server(MessageId(3)));
        assert_eq!(removed.len(), 2);
        assert_eq!(log.len(), 2);
        assert!(log.truncate_from(&MessageKey::Server(MessageId(3))).is_empty());
    }

    #[test]
    fn preceding_user_message_requires_user_neighbour() {
        let log = seeded();
        let found = log
            .preceding_user_message(&MessageKey::Server(MessageId(4)))
            .expect("user before a2");
        assert_eq!(found.content, "q2");
        assert!(log
            .preceding_user_message(&MessageKey::Server(MessageId(1)))
            .is_none());
        assert!(log
            .preceding_user_message(&MessageKey::Server(MessageId(3)))
            .is_none());
    }

    #[test]
    fn rebind_tags_draft_messages_with_new_conversation() {
        let mut log = MessageLog::default();
        let mut draft = server(1, Role::User, "hi");
        draft.conversation_id = None;
        log.reset(Some(LogOwner::Draft(3)), vec![draft]);

        log.rebind(ConversationId(42));
        assert!(log.is_owned_by(&LogOwner::Conversation(ConversationId(42))));
        assert_eq!(log.messages()[0].conversation_id, Some(ConversationId(42)));
    }
}
