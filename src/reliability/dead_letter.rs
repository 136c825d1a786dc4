/// Dead-letter holding area for items whose enrichment kept failing.
///
/// Letters live in working-memory state and are retried, oldest first,
/// at the start of every working-memory tick.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::types::MemoryItem;

/// An item parked after exhausting its retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    /// The item as ingested, before enrichment
    pub item: MemoryItem,
    pub attempts: u32,
    pub last_error: String,
    pub first_failed_at: DateTime<Utc>,
    pub last_failed_at: DateTime<Utc>,
}

/// FIFO of dead letters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterQueue {
    letters: VecDeque<DeadLetter>,
}

impl DeadLetterQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park an item, or bump an existing letter for the same item.
    pub fn park(&mut self, item: MemoryItem, error: impl Into<String>, now: DateTime<Utc>) {
        let error = error.into();
        if let Some(existing) = self.letters.iter_mut().find(|l| l.item.id == item.id) {
            existing.attempts += 1;
            existing.last_error = error;
            existing.last_failed_at = now;
            return;
        }
        self.letters.push_back(DeadLetter {
            item,
            attempts: 1,
            last_error: error,
            first_failed_at: now,
            last_failed_at: now,
        });
    }

    /// Put a letter back after another failed attempt.
    pub fn requeue(&mut self, mut letter: DeadLetter, error: impl Into<String>, now: DateTime<Utc>) {
        letter.attempts += 1;
        letter.last_error = error.into();
        letter.last_failed_at = now;
        self.letters.push_back(letter);
    }

    /// Take up to `max` letters, oldest first.
    pub fn take(&mut self, max: usize) -> Vec<DeadLetter> {
        let n = max.min(self.letters.len());
        self.letters.drain(..n).collect()
    }

    pub fn len(&self) -> usize {
        self.letters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.letters.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeadLetter> {
        self.letters.iter()
    }
}
