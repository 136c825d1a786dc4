/// Persistence interface: versioned snapshots and atomic commits per tier.
///
/// Every tick loads a [`Versioned`] snapshot of its own tier, computes the
/// next state, and commits it against the version it started from. A
/// commit whose base version moved is refused with
/// [`RecallError::SnapshotMismatch`]; nothing is partially written.
///
/// Tiers talk to each other only through committed mailboxes:
///
/// ```text
/// WM outbox (Admitted/Exited, seq) ──► STM reads seq > wm_cursor
/// STM retire requests (seq)        ──► WM reads seq > retire_cursor
/// ```
///
/// Each side trims its mailbox up to the cursor the other side committed.
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use tokio::sync::RwLock;

use crate::error::{RecallError, RecallResult, TierKind};
use crate::memory::{AssociationGraph, EpisodeLedger};
use crate::reliability::DeadLetterQueue;
use crate::types::{Episode, EpisodeId, ItemId, MemoryItem};

/// A snapshot tagged with the version it was committed as.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Versioned<T> {
    pub version: u64,
    pub state: T,
}

/// Kind of working-memory event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkingEventKind {
    Admitted,
    Exited,
}

/// One entry of the working-memory outbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkingEvent {
    pub seq: u64,
    pub kind: WorkingEventKind,
    /// Item as it was when the event happened
    pub item: MemoryItem,
}

/// Working-memory state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkingState {
    /// Items owned by WM: residents and retained arrivals
    pub items: BTreeMap<ItemId, MemoryItem>,
    pub outbox: VecDeque<WorkingEvent>,
    pub next_seq: u64,
    /// Next feed offset to read
    pub feed_cursor: u64,
    pub dead_letters: DeadLetterQueue,
    /// Last STM retire request consumed
    pub retire_cursor: u64,
    pub retired: u64,
}

impl WorkingState {
    /// Items currently resident in working memory.
    pub fn residents(&self) -> impl Iterator<Item = &MemoryItem> {
        self.items
            .values()
            .filter(|i| i.tier == crate::types::MemoryTier::Working)
    }

    /// Append an event to the outbox.
    pub fn emit(&mut self, kind: WorkingEventKind, item: MemoryItem) {
        self.next_seq += 1;
        self.outbox.push_back(WorkingEvent {
            seq: self.next_seq,
            kind,
            item,
        });
    }

    /// Drop events the consumer has committed past.
    pub fn trim_outbox(&mut self, consumed: u64) {
        while self.outbox.front().is_some_and(|e| e.seq <= consumed) {
            self.outbox.pop_front();
        }
    }
}

/// Request from STM to retire a WM-resident item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetireRequest {
    pub seq: u64,
    pub item_id: ItemId,
    pub episode_id: EpisodeId,
}

/// Short-term state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShortTermState {
    pub ledger: EpisodeLedger,
    /// Items that left WM and are owned by STM
    pub items: BTreeMap<ItemId, MemoryItem>,
    /// Last WM event consumed
    pub wm_cursor: u64,
    pub retire_requests: VecDeque<RetireRequest>,
    pub next_retire_seq: u64,
    pub retired: u64,
}

impl ShortTermState {
    /// Queue a retire request for WM.
    pub fn request_retire(&mut self, item_id: ItemId, episode_id: EpisodeId) {
        self.next_retire_seq += 1;
        self.retire_requests.push_back(RetireRequest {
            seq: self.next_retire_seq,
            item_id,
            episode_id,
        });
    }

    /// Drop requests WM has committed past.
    pub fn trim_retire_requests(&mut self, consumed: u64) {
        while self.retire_requests.front().is_some_and(|r| r.seq <= consumed) {
            self.retire_requests.pop_front();
        }
    }
}

/// Long-term state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LongTermState {
    pub graph: AssociationGraph,
    /// Schematized episodes
    pub episodes: Vec<Episode>,
    /// Promoted items
    pub items: BTreeMap<ItemId, MemoryItem>,
}

/// Snapshot/commit access to the three tiers.
#[async_trait]
pub trait TierStore: Send + Sync {
    async fn load_working(&self) -> RecallResult<Versioned<WorkingState>>;
    async fn commit_working(&self, base: u64, state: WorkingState) -> RecallResult<u64>;

    async fn load_short_term(&self) -> RecallResult<Versioned<ShortTermState>>;
    async fn commit_short_term(&self, base: u64, state: ShortTermState) -> RecallResult<u64>;

    async fn load_long_term(&self) -> RecallResult<Versioned<LongTermState>>;
    async fn commit_long_term(&self, base: u64, state: LongTermState) -> RecallResult<u64>;
}

/// In-memory [`TierStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    working: RwLock<Versioned<WorkingState>>,
    short_term: RwLock<Versioned<ShortTermState>>,
    long_term: RwLock<Versioned<LongTermState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

async fn commit<T>(slot: &RwLock<Versioned<T>>, tier: TierKind, base: u64, state: T) -> RecallResult<u64> {
    let mut current = slot.write().await;
    if current.version != base {
        return Err(RecallError::SnapshotMismatch {
            tier,
            expected: base,
            found: current.version,
        });
    }
    current.version += 1;
    current.state = state;
    Ok(current.version)
}

#[async_trait]
impl TierStore for MemoryStore {
    async fn load_working(&self) -> RecallResult<Versioned<WorkingState>> {
        Ok(self.working.read().await.clone())
    }

    async fn commit_working(&self, base: u64, state: WorkingState) -> RecallResult<u64> {
        commit(&self.working, TierKind::Working, base, state).await
    }

    async fn load_short_term(&self) -> RecallResult<Versioned<ShortTermState>> {
        Ok(self.short_term.read().await.clone())
    }

    async fn commit_short_term(&self, base: u64, state: ShortTermState) -> RecallResult<u64> {
        commit(&self.short_term, TierKind::ShortTerm, base, state).await
    }

    async fn load_long_term(&self) -> RecallResult<Versioned<LongTermState>> {
        Ok(self.long_term.read().await.clone())
    }

    async fn commit_long_term(&self, base: u64, state: LongTermState) -> RecallResult<u64> {
        commit(&self.long_term, TierKind::LongTerm, base, state).await
    }
}
