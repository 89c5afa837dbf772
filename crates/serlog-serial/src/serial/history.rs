//! Command history with shell-style recall.

use crate::serial::types::HistoryDirection;
use std::collections::VecDeque;

/// Bounded FIFO of sent commands plus a recall cursor.
///
/// The cursor ranges over `0..=len`; `len` is the "draft" position just
/// past the newest entry, where recall yields an empty line.
#[derive(Debug, Clone)]
pub struct CommandHistory {
    entries: VecDeque<String>,
    capacity: usize,
    cursor: usize,
}

impl CommandHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
            cursor: 0,
        }
    }

    /// Append a sent command. Empty commands and an immediate repeat of
    /// the newest entry are not stored. The cursor always returns to the
    /// draft position.
    pub fn record(&mut self, command: &str) {
        if !command.is_empty() && self.entries.back().map(String::as_str) != Some(command) {
            self.entries.push_back(command.to_string());
            while self.entries.len() > self.capacity {
                self.entries.pop_front();
            }
        }
        self.cursor = self.entries.len();
    }

    /// Move the cursor and return the entry under it. `None` when the
    /// history is empty; an empty string at the draft position.
    pub fn navigate(&mut self, direction: HistoryDirection) -> Option<String> {
        if self.entries.is_empty() {
            return None;
        }
        match direction {
            HistoryDirection::Older => {
                self.cursor = self.cursor.saturating_sub(1);
            }
            HistoryDirection::Newer => {
                if self.cursor < self.entries.len() {
                    self.cursor += 1;
                }
            }
        }
        Some(self.entries.get(self.cursor).cloned().unwrap_or_default())
    }

    /// Oldest first.
    pub fn entries(&self) -> Vec<String> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.cursor = 0;
    }
}

impl Default for CommandHistory {
    fn default() -> Self {
        Self::new(50)
    }
}
