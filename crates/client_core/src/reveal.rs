//! Progressive text reveal: the assistant reply is shown a few characters per
//! tick instead of all at once.

use std::time::Duration;

use futures::{stream, Stream};
use tokio::time::{interval, Interval, MissedTickBehavior};

/// Reveal progress for one message, counted in chars.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamingRevealState {
    source_text: String,
    total_chars: usize,
    revealed: usize,
    chunk_size: usize,
}

impl StreamingRevealState {
    /// A chunk size of 0 is treated as 1.
    pub fn new(source_text: impl Into<String>, chunk_size: usize) -> Self {
        let source_text = source_text.into();
        Self {
            total_chars: source_text.chars().count(),
            source_text,
            revealed: 0,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Reveals the next chunk; returns true once the whole text is visible.
    pub fn advance(&mut self) -> bool {
        self.revealed = (self.revealed + self.chunk_size).min(self.total_chars);
        self.is_complete()
    }

    pub fn is_complete(&self) -> bool {
        self.revealed >= self.total_chars
    }

    pub fn revealed_chars(&self) -> usize {
        self.revealed
    }

    pub fn source_text(&self) -> &str {
        &self.source_text
    }

    pub fn visible(&self) -> &str {
        let end = self
            .source_text
            .char_indices()
            .nth(self.revealed)
            .map(|(index, _)| index)
            .unwrap_or(self.source_text.len());
        &self.source_text[..end]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RevealOptions {
    pub chunk_size: usize,
    pub interval: Duration,
    /// Request a scroll every N ticks; 0 means only on the final frame.
    pub scroll_every: u32,
}

impl Default for RevealOptions {
    fn default() -> Self {
        Self {
            chunk_size: 3,
            interval: Duration::from_millis(30),
            scroll_every: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevealFrame {
    pub tick: u64,
    pub text: String,
    pub scroll: bool,
    pub done: bool,
}

struct Cursor {
    state: StreamingRevealState,
    options: RevealOptions,
    ticker: Option<Interval>,
    tick: u64,
}

impl Cursor {
    fn wants_scroll(&self, done: bool) -> bool {
        let every = u64::from(self.options.scroll_every);
        done || (every > 0 && self.tick % every == 0)
    }
}

/// Lazily yields growing prefixes of `full_text`, one per interval. The first
/// frame is emitted immediately and the last one has `done` set. Nothing is
/// scheduled until the stream is polled.
pub fn reveal(full_text: impl Into<String>, options: RevealOptions) -> impl Stream<Item = RevealFrame> {
    let cursor = Cursor {
        state: StreamingRevealState::new(full_text, options.chunk_size),
        options,
        ticker: None,
        tick: 0,
    };

    stream::unfold(Some(cursor), |slot| async move {
        let mut cursor = slot?;
        let ticker = cursor.ticker.get_or_insert_with(|| {
            let mut ticker = interval(cursor.options.interval.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });
        ticker.tick().await;

        cursor.tick += 1;
        let done = cursor.state.advance();
        let frame = RevealFrame {
            tick: cursor.tick,
            text: cursor.state.visible().to_string(),
            scroll: cursor.wants_scroll(done),
            done,
        };
        let next = (!done).then_some(cursor);
        Some((frame, next))
    })
}

#[cfg(test)]
#[path = "tests/reveal_tests.rs"]
mod tests;
