//! Bounded, timestamped terminal log.
//!
//! Keeps the most recent entries shown to the user. When an append pushes
//! the store past capacity, the oldest block is dropped and replaced by a
//! single marker entry, so the view never grows without bound.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// Default maximum number of entries kept.
pub const DEFAULT_CAPACITY: usize = 1000;

/// Default number of oldest entries dropped on overflow.
pub const DEFAULT_TRIM_BLOCK: usize = 200;

/// Wall-clock format used for entry timestamps.
pub const TIMESTAMP_FORMAT: &str = "%H:%M:%S";

/// Origin of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogKind {
    /// A line received from the device.
    Received,
    /// A command written to the device.
    Sent,
    /// Lifecycle notices from the terminal itself.
    System,
    Error,
}

/// A single immutable log line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub message: String,
    /// Local time, `HH:MM:SS`.
    pub timestamp: String,
    pub kind: LogKind,
}

impl LogEntry {
    /// Create an entry stamped with the current local time.
    pub fn new(message: impl Into<String>, kind: LogKind) -> Self {
        Self::at(message, kind, now())
    }

    pub fn at(message: impl Into<String>, kind: LogKind, timestamp: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            timestamp: timestamp.into(),
            kind,
        }
    }
}

/// Current local time in [`TIMESTAMP_FORMAT`].
pub fn now() -> String {
    chrono::Local::now().format(TIMESTAMP_FORMAT).to_string()
}

/// Text of the marker that replaces a trimmed block.
pub fn trim_marker(removed: usize) -> String {
    format!("--- {removed} older messages removed ---")
}

fn is_trim_marker(entry: &LogEntry) -> bool {
    entry.kind == LogKind::System
        && entry.message.starts_with("--- ")
        && entry.message.ends_with(" older messages removed ---")
}

/// Text of the entry left behind by [`LogStore::clear`].
pub const CLEARED_MESSAGE: &str = "Output cleared";

/// Append-only log with capacity-bounded block trimming.
#[derive(Debug)]
pub struct LogStore {
    entries: VecDeque<LogEntry>,
    capacity: usize,
    trim_block: usize,
}

impl Default for LogStore {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_TRIM_BLOCK)
    }
}

impl LogStore {
    /// Create a store holding at most `capacity` entries.
    ///
    /// `capacity` is raised to at least 1 and `trim_block` to at least 2:
    /// a trim has to free room for its own marker.
    pub fn new(capacity: usize, trim_block: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity + 1),
            capacity,
            trim_block: trim_block.max(2),
        }
    }

    /// Append an entry.
    ///
    /// Returns the number of entries trimmed, if this append overflowed the
    /// store. The trim happens before returning, so `len() <= capacity()`
    /// always holds afterwards. The marker only counts real messages; an
    /// earlier marker caught in the block is not one of them.
    pub fn append(&mut self, entry: LogEntry) -> Option<usize> {
        self.entries.push_back(entry);
        if self.entries.len() <= self.capacity {
            return None;
        }

        let removed = self.trim_block.min(self.entries.len());
        // The marker inherits the newest dropped timestamp so ordering holds.
        let stamp = self.entries[removed - 1].timestamp.clone();
        let messages = self
            .entries
            .drain(..removed)
            .filter(|e| !is_trim_marker(e))
            .count();
        self.entries
            .push_front(LogEntry::at(trim_marker(messages), LogKind::System, stamp));
        Some(removed)
    }

    /// Drop every entry and leave a single "cleared" notice.
    pub fn clear(&mut self) -> &LogEntry {
        self.entries.clear();
        self.entries
            .push_back(LogEntry::new(CLEARED_MESSAGE, LogKind::System));
        &self.entries[0]
    }

    /// Copy of the current contents, oldest first.
    pub fn snapshot(&self) -> Vec<LogEntry> {
        self.entries.iter().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter()
    }

    pub fn last(&self) -> Option<&LogEntry> {
        self.entries.back()
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

    pub fn trim_block(&self) -> usize {
        self.trim_block
    }
}
