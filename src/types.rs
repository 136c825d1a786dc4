/// Core data types for the memory hierarchy.
///
/// This module defines the records that flow through the pipeline:
///
/// - [`MemoryItem`]: a discrete content record with an activation strength
/// - [`Episode`]: a temporally coherent group of items awaiting consolidation
/// - [`ConceptNode`] / [`AssociationEdge`]: the long-term concept graph
///
/// Strengths and weights are always kept in `[0, 1]` through [`clamp_unit`].
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;

use crate::error::{RecallError, RecallResult};

/// Unique identifier for a memory item.
pub type ItemId = String;

/// Unique identifier for an episode.
pub type EpisodeId = String;

/// Number of out-of-range values corrected by [`clamp_unit`] since start.
static CLAMP_CORRECTIONS: AtomicU64 = AtomicU64::new(0);

/// Clamp a strength or weight into `[0, 1]`.
///
/// Out-of-range or NaN values are corrected, logged as a data-quality
/// warning and counted; they never propagate as errors.
pub fn clamp_unit(value: f64, what: &'static str) -> f64 {
    if value.is_nan() {
        CLAMP_CORRECTIONS.fetch_add(1, Ordering::Relaxed);
        warn!(data_quality = true, field = what, "NaN replaced with 0.0");
        return 0.0;
    }
    if !(0.0..=1.0).contains(&value) {
        CLAMP_CORRECTIONS.fetch_add(1, Ordering::Relaxed);
        let clamped = value.clamp(0.0, 1.0);
        // Accumulated float drift just past a bound is routine; only report real excursions.
        if (value - clamped).abs() > 1e-9 {
            warn!(data_quality = true, field = what, value, clamped, "value clamped into [0, 1]");
        }
        return clamped;
    }
    value
}

/// Total corrections made by [`clamp_unit`].
pub fn clamp_corrections() -> u64 {
    CLAMP_CORRECTIONS.load(Ordering::Relaxed)
}

/// Which tier currently owns an item.
///
/// Transitions only move forward (`Incoming → Working → ShortTerm →
/// LongTerm`), skipping is allowed, and any tier may be retired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemoryTier {
    /// Ingested but never admitted to working memory
    Incoming,
    /// Resident in the capacity-bounded working set
    Working,
    /// Left working memory, clustered into an episode
    ShortTerm,
    /// Promoted by a schematized episode
    LongTerm,
    /// Forgotten
    Retired,
}

impl MemoryTier {
    fn rank(self) -> u8 {
        match self {
            MemoryTier::Incoming => 0,
            MemoryTier::Working => 1,
            MemoryTier::ShortTerm => 2,
            MemoryTier::LongTerm => 3,
            MemoryTier::Retired => 4,
        }
    }

    /// Whether moving from `self` to `to` respects forward-only tiering.
    pub fn can_transition_to(self, to: MemoryTier) -> bool {
        if self == MemoryTier::Retired {
            return false;
        }
        to == MemoryTier::Retired || to.rank() > self.rank()
    }
}

impl std::fmt::Display for MemoryTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemoryTier::Incoming => write!(f, "incoming"),
            MemoryTier::Working => write!(f, "wm"),
            MemoryTier::ShortTerm => write!(f, "stm"),
            MemoryTier::LongTerm => write!(f, "ltm"),
            MemoryTier::Retired => write!(f, "retired"),
        }
    }
}

/// A discrete content record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryItem {
    pub id: ItemId,
    pub content: String,
    /// Unordered, unique concepts extracted from the content
    pub concepts: BTreeSet<String>,
    /// Short summary from the enrichment service, if any
    pub summary: Option<String>,
    /// Embedding vector from the enrichment service, if any
    pub embedding: Option<Vec<f32>>,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    /// When activation was last recomputed
    pub last_refreshed_at: DateTime<Utc>,
    pub access_count: u64,
    /// Accesses recorded since the last refresh (feed the frequency boost)
    pub pending_accesses: u32,
    /// Current salience in `[0, 1]`
    pub activation: f64,
    pub tier: MemoryTier,
    pub episode_id: Option<EpisodeId>,
    /// First refresh at which activation dropped below the forgetting floor
    pub below_floor_since: Option<DateTime<Utc>>,
}

impl MemoryItem {
    /// Create a freshly ingested item.
    pub fn new(
        content: impl Into<String>,
        created_at: DateTime<Utc>,
        concepts: impl IntoIterator<Item = String>,
        activation: f64,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            content: content.into(),
            concepts: concepts.into_iter().collect(),
            summary: None,
            embedding: None,
            created_at,
            last_accessed_at: created_at,
            last_refreshed_at: created_at,
            access_count: 0,
            pending_accesses: 0,
            activation: clamp_unit(activation, "activation"),
            tier: MemoryTier::Incoming,
            episode_id: None,
            below_floor_since: None,
        }
    }

    /// Replace the generated id (deterministic ids for tests and replays).
    pub fn with_id(mut self, id: impl Into<ItemId>) -> Self {
        self.id = id.into();
        self
    }

    /// Move the item to another tier, enforcing forward-only order.
    pub fn transition(&mut self, to: MemoryTier) -> RecallResult<()> {
        if self.tier == to {
            return Ok(());
        }
        if !self.tier.can_transition_to(to) {
            return Err(RecallError::InvalidTransition {
                item: self.id.clone(),
                from: self.tier,
                to,
            });
        }
        self.tier = to;
        Ok(())
    }

    /// Record an access at `at`.
    pub fn record_access(&mut self, at: DateTime<Utc>) {
        self.access_count += 1;
        self.pending_accesses = self.pending_accesses.saturating_add(1);
        if at > self.last_accessed_at {
            self.last_accessed_at = at;
        }
    }
}

/// Coherence class of an episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CoherenceClass {
    High,
    Medium,
    Low,
}

impl std::fmt::Display for CoherenceClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CoherenceClass::High => write!(f, "high"),
            CoherenceClass::Medium => write!(f, "medium"),
            CoherenceClass::Low => write!(f, "low"),
        }
    }
}

/// Consolidation readiness of an episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Readiness {
    /// Not yet meeting promotion criteria
    Fragmentary,
    /// Criteria met once, waiting for confirmation
    Consolidating,
    /// Promoted into long-term memory (immutable)
    Schematized,
    /// Retention window expired before consolidation (terminal)
    Discarded,
}

impl Readiness {
    /// Terminal states never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Readiness::Schematized | Readiness::Discarded)
    }
}

impl std::fmt::Display for Readiness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Readiness::Fragmentary => write!(f, "fragmentary"),
            Readiness::Consolidating => write!(f, "consolidating"),
            Readiness::Schematized => write!(f, "schematized"),
            Readiness::Discarded => write!(f, "discarded"),
        }
    }
}

/// Snapshot of an item at the moment it joined an episode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeMember {
    pub item_id: ItemId,
    pub timestamp: DateTime<Utc>,
    pub activation: f64,
    pub concepts: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

impl EpisodeMember {
    /// Snapshot an item, timestamped by its creation time.
    pub fn from_item(item: &MemoryItem) -> Self {
        Self {
            item_id: item.id.clone(),
            timestamp: item.created_at,
            activation: item.activation,
            concepts: item.concepts.clone(),
            embedding: item.embedding.clone(),
        }
    }
}

/// Interference penalties last computed for an episode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct InterferenceBreakdown {
    pub proactive: f64,
    pub retroactive: f64,
    /// Combined penalty after capping
    pub total: f64,
}

/// A temporally coherent group of items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Episode {
    pub id: EpisodeId,
    /// Members in timestamp order; the index is the member's position
    pub members: Vec<EpisodeMember>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub coherence: CoherenceClass,
    /// Interference-adjusted strength written by the resolver
    pub competition_score: f64,
    pub interference: InterferenceBreakdown,
    pub readiness: Readiness,
    /// Sealed episodes accept no more members
    pub sealed: bool,
    pub consolidating_since: Option<DateTime<Utc>>,
    pub schematized_at: Option<DateTime<Utc>>,
    pub discarded_at: Option<DateTime<Utc>>,
}

impl Episode {
    /// Open a new episode seeded with one member.
    pub fn open(first: EpisodeMember) -> Self {
        let start = first.timestamp;
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            members: vec![first],
            start,
            end: start,
            coherence: CoherenceClass::Low,
            competition_score: 0.0,
            interference: InterferenceBreakdown::default(),
            readiness: Readiness::Fragmentary,
            sealed: false,
            consolidating_since: None,
            schematized_at: None,
            discarded_at: None,
        }
    }

    /// Whether the episode may still be mutated.
    pub fn is_immutable(&self) -> bool {
        self.readiness.is_terminal()
    }

    /// Insert a member keeping timestamp order (ties keep arrival order).
    pub fn insert_member(&mut self, member: EpisodeMember) -> RecallResult<()> {
        if self.sealed || self.is_immutable() {
            return Err(RecallError::InvalidItem {
                reason: format!("episode {} no longer accepts members", self.id),
            });
        }
        let pos = self
            .members
            .partition_point(|m| m.timestamp <= member.timestamp);
        self.members.insert(pos, member);
        self.start = self.members[0].timestamp;
        self.end = self.members[self.members.len() - 1].timestamp;
        Ok(())
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Whether the episode has no members.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Mean member activation, the strength before interference.
    pub fn base_strength(&self) -> f64 {
        if self.members.is_empty() {
            return 0.0;
        }
        let sum: f64 = self.members.iter().map(|m| m.activation).sum();
        clamp_unit(sum / self.members.len() as f64, "episode.base_strength")
    }

    /// Union of member concepts.
    pub fn concepts(&self) -> BTreeSet<String> {
        self.members
            .iter()
            .flat_map(|m| m.concepts.iter().cloned())
            .collect()
    }

    /// Time since the first member.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now.signed_duration_since(self.start)
    }

    /// Mean gap between consecutive members, `None` for singletons.
    pub fn average_gap(&self) -> Option<Duration> {
        if self.members.len() < 2 {
            return None;
        }
        let span = self.end.signed_duration_since(self.start);
        Some(span / (self.members.len() as i32 - 1))
    }

    /// Mean embedding of members that carry one with matching dimensions.
    pub fn centroid(&self) -> Option<Vec<f32>> {
        let mut embedded = self.members.iter().filter_map(|m| m.embedding.as_ref());
        let first = embedded.next()?;
        let mut sum: Vec<f32> = first.clone();
        let dims = sum.len();
        let mut count = 1usize;
        for e in embedded.filter(|e| e.len() == dims) {
            for (s, v) in sum.iter_mut().zip(e) {
                *s += v;
            }
            count += 1;
        }
        for s in &mut sum {
            *s /= count as f32;
        }
        Some(sum)
    }

    /// Whether an item is a member.
    pub fn contains(&self, item_id: &str) -> bool {
        self.members.iter().any(|m| m.item_id == item_id)
    }
}

/// A concept in the long-term association graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConceptNode {
    pub label: String,
    /// Partition used for centrality bucketing
    pub region: u32,
    pub degree: usize,
    /// Sum of incident edge weights
    pub weighted_degree: f64,
    /// Ego-network betweenness proxy, normalized to `[0, 1]`
    pub betweenness: f64,
    pub first_seen: DateTime<Utc>,
    pub last_activated: DateTime<Utc>,
}

/// Unordered pair of concept labels, stored in sorted order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EdgeKey(pub String, pub String);

impl EdgeKey {
    /// Build a key; argument order does not matter.
    pub fn new(a: &str, b: &str) -> Self {
        if a <= b {
            Self(a.to_string(), b.to_string())
        } else {
            Self(b.to_string(), a.to_string())
        }
    }

    /// The endpoint opposite `label`.
    pub fn other(&self, label: &str) -> &str {
        if self.0 == label { &self.1 } else { &self.0 }
    }
}

/// A weighted association between two concepts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssociationEdge {
    pub source: String,
    pub target: String,
    /// Strength in `[0, 1]`
    pub weight: f64,
    pub last_updated: DateTime<Utc>,
    /// When the passive decay pass last touched this edge
    pub last_decayed: DateTime<Utc>,
    pub decay_rate: f64,
    /// First decay pass at which weight was below the prune threshold
    pub below_threshold_since: Option<DateTime<Utc>>,
}

impl AssociationEdge {
    /// New edge with zero weight.
    pub fn new(key: &EdgeKey, decay_rate: f64, now: DateTime<Utc>) -> Self {
        Self {
            source: key.0.clone(),
            target: key.1.clone(),
            weight: 0.0,
            last_updated: now,
            last_decayed: now,
            decay_rate,
            below_threshold_since: None,
        }
    }

    /// The key of this edge.
    pub fn key(&self) -> EdgeKey {
        EdgeKey::new(&self.source, &self.target)
    }
}
