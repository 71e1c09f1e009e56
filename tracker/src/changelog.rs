//! Append-only change log with multi-consumer retention.
//!
//! Every directory mutation becomes a sequence-numbered [`ChangeEvent`].
//! Consumers read incrementally from a plain cursor (the sequence of the last
//! event they saw) and register that cursor here; compaction trims everything
//! at or below the minimum registered cursor, and discards the whole log when
//! nobody is listening.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::fmt;

/// The six kinds of directory change, named as they appear on the feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    #[serde(rename = "SERVER_ADD")]
    ServerAdd,
    #[serde(rename = "SERVER_UPDATE")]
    ServerUpdate,
    #[serde(rename = "SERVER_DELETE")]
    ServerDelete,
    #[serde(rename = "PLAYER_ADD")]
    PlayerAdd,
    #[serde(rename = "PLAYER_UPDATE")]
    PlayerUpdate,
    #[serde(rename = "PLAYER_DELETE")]
    PlayerDelete,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChangeKind::ServerAdd => "SERVER_ADD",
            ChangeKind::ServerUpdate => "SERVER_UPDATE",
            ChangeKind::ServerDelete => "SERVER_DELETE",
            ChangeKind::PlayerAdd => "PLAYER_ADD",
            ChangeKind::PlayerUpdate => "PLAYER_UPDATE",
            ChangeKind::PlayerDelete => "PLAYER_DELETE",
        };
        write!(f, "{}", name)
    }
}

/// One immutable entry in the log. Add events carry full snapshots; update
/// events carry the entity id plus changed fields only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub seq: u64,
    pub kind: ChangeKind,
    pub payload: Value,
}

/// The log plus the registered read cursors that drive retention.
#[derive(Debug, Default)]
pub struct ChangeLog {
    events: VecDeque<ChangeEvent>,
    next_seq: u64,
    cursors: HashMap<u64, u64>,
}

impl ChangeLog {
    pub fn new() -> Self {
        Self {
            events: VecDeque::new(),
            next_seq: 1,
            cursors: HashMap::new(),
        }
    }

    /// Sequence of the most recently appended event (0 before any append).
    pub fn head(&self) -> u64 {
        self.next_seq.saturating_sub(1)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Appends one event, assigning the next sequence number. Fire-and-forget
    /// for producers; compaction runs immediately afterwards.
    pub fn append(&mut self, kind: ChangeKind, payload: Value) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.events.push_back(ChangeEvent { seq, kind, payload });
        self.compact();
    }

    /// Returns every retained event newer than `cursor` in ascending order,
    /// plus the new cursor (unchanged when there was nothing to read).
    pub fn read_from(&self, cursor: u64) -> (Vec<ChangeEvent>, u64) {
        let events: Vec<ChangeEvent> = self
            .events
            .iter()
            .filter(|e| e.seq > cursor)
            .cloned()
            .collect();
        let new_cursor = events.last().map(|e| e.seq).unwrap_or(cursor);
        (events, new_cursor)
    }

    /// Adds a consumer's cursor to the retention set.
    pub fn register_consumer(&mut self, consumer: u64, cursor: u64) {
        self.cursors.insert(consumer, cursor);
        self.compact();
    }

    /// Drops a consumer's cursor from the retention set.
    pub fn unregister_consumer(&mut self, consumer: u64) {
        self.cursors.remove(&consumer);
        self.compact();
    }

    /// Moves a registered consumer's cursor forward after delivery.
    pub fn advance(&mut self, consumer: u64, cursor: u64) {
        if let Some(c) = self.cursors.get_mut(&consumer) {
            *c = cursor;
        }
        self.compact();
    }

    /// Trims all events no registered consumer can still need. With no
    /// consumers the whole log is discarded.
    pub fn compact(&mut self) {
        match self.cursors.values().min().copied() {
            None => self.events.clear(),
            Some(watermark) => {
                while self
                    .events
                    .front()
                    .map(|e| e.seq <= watermark)
                    .unwrap_or(false)
                {
                    self.events.pop_front();
                }
            }
        }
    }
}
