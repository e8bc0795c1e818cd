use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use shared::{domain::ConversationId, protocol::message_preview};

use crate::types::ConversationSummary;

/// In-memory conversation summaries. Entries are kept unordered; every read
/// applies the display order (pinned first, newest first).
#[derive(Debug, Clone, Default)]
pub struct ConversationStore {
    entries: Vec<ConversationSummary>,
}

fn display_order(a: &ConversationSummary, b: &ConversationSummary) -> Ordering {
    b.pinned
        .cmp(&a.pinned)
        .then_with(|| b.updated_at.cmp(&a.updated_at))
        .then_with(|| b.id.cmp(&a.id))
}

impl ConversationStore {
    pub fn list(&self) -> Vec<ConversationSummary> {
        let mut sorted = self.entries.clone();
        sorted.sort_by(display_order);
        sorted
    }

    /// Case-insensitive substring match on the title, and optionally the
    /// preview. An empty (or whitespace) query matches everything.
    pub fn search(&self, query: &str, include_preview: bool) -> Vec<ConversationSummary> {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return self.list();
        }
        let mut matches: Vec<_> = self
            .entries
            .iter()
            .filter(|summary| {
                summary.title.to_lowercase().contains(&needle)
                    || (include_preview
                        && summary
                            .last_message_preview
                            .as_deref()
                            .is_some_and(|preview| preview.to_lowercase().contains(&needle)))
            })
            .cloned()
            .collect();
        matches.sort_by(display_order);
        matches
    }

    pub fn get(&self, id: ConversationId) -> Option<&ConversationSummary> {
        self.entries.iter().find(|summary| summary.id == id)
    }

    pub fn contains(&self, id: ConversationId) -> bool {
        self.get(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn upsert(&mut self, summary: ConversationSummary) {
        match self.entries.iter_mut().find(|entry| entry.id == summary.id) {
            Some(entry) => *entry = summary,
            None => self.entries.push(summary),
        }
    }

    /// Adds a freshly created conversation ahead of everything else.
    pub fn prepend(&mut self, summary: ConversationSummary) {
        self.entries.retain(|entry| entry.id != summary.id);
        self.entries.insert(0, summary);
    }

    pub fn replace_all(&mut self, summaries: Vec<ConversationSummary>) {
        self.entries = summaries;
    }

    pub fn remove(&mut self, id: ConversationId) -> Option<ConversationSummary> {
        let index = self.entries.iter().position(|entry| entry.id == id)?;
        Some(self.entries.remove(index))
    }

    pub fn set_pinned(&mut self, id: ConversationId, pinned: bool) -> bool {
        self.with_entry(id, |entry| entry.pinned = pinned)
    }

    pub fn rename(&mut self, id: ConversationId, title: &str) -> bool {
        self.with_entry(id, |entry| entry.title = title.to_string())
    }

    /// Records the latest exchange: preview text and activity timestamp.
    pub fn touch(&mut self, id: ConversationId, latest_content: &str, at: DateTime<Utc>) -> bool {
        self.with_entry(id, |entry| {
            entry.last_message_preview = Some(message_preview(latest_content));
            entry.updated_at = at;
        })
    }

    /// First entry of the filtered display order.
    pub fn head(&self, query: &str) -> Option<ConversationId> {
        self.search(query, false).first().map(|summary| summary.id)
    }

    fn with_entry(&mut self, id: ConversationId, apply: impl FnOnce(&mut ConversationSummary)) -> bool {
        match self.entries.iter_mut().find(|entry| entry.id == id) {
            Some(entry) => {
                apply(entry);
                true
            }
            None => false,
        }
    }
}
