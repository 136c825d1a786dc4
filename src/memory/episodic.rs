/// Episode Clusterer: short-term memory.
///
/// Consumes the ordered stream of WM admissions and exits and groups the
/// items into episodes. A new episode starts whenever the gap to the
/// previous item's timestamp exceeds the temporal-gap threshold:
///
/// ```text
/// t:  09:00 09:05 09:12        10:40 10:41
///      a     b     c    (gap)   d     e
///     └──── episode 1 ───┘      └─ ep 2 ─┘
/// ```
///
/// Coherence is classified from cluster size and member density:
/// `high` (≥ 3 members, mean gap under the density threshold), `medium`
/// (≥ 2 members), `low` (singletons).
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, trace, warn};

use crate::types::{CoherenceClass, Episode, EpisodeId, EpisodeMember, ItemId, MemoryItem};

/// Episode clusterer configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EpisodeConfig {
    /// Gap between consecutive items that starts a new episode
    pub temporal_gap_secs: u64,

    /// Mean gap below which a 3+ member episode counts as highly coherent
    pub density_threshold_secs: u64,

    /// Minimum member count for the high coherence class
    pub high_coherence_min_size: usize,

    /// Optional semantic boundary: cosine similarity to the open episode's
    /// centroid below this starts a new episode
    pub semantic_split_threshold: Option<f64>,
}

impl Default for EpisodeConfig {
    fn default() -> Self {
        Self {
            temporal_gap_secs: 1800,
            density_threshold_secs: 300,
            high_coherence_min_size: 3,
            semantic_split_threshold: None,
        }
    }
}

impl EpisodeConfig {
    /// Temporal gap threshold.
    pub fn temporal_gap(&self) -> Duration {
        Duration::seconds(self.temporal_gap_secs as i64)
    }

    /// Density threshold.
    pub fn density_threshold(&self) -> Duration {
        Duration::seconds(self.density_threshold_secs as i64)
    }
}

/// All episodes owned by short-term memory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EpisodeLedger {
    /// Episodes in creation order
    pub episodes: Vec<Episode>,

    /// The episode currently accepting members
    pub open: Option<EpisodeId>,

    /// Which episode each clustered item belongs to
    pub item_index: HashMap<ItemId, EpisodeId>,
}

impl EpisodeLedger {
    /// Look up an episode.
    pub fn get(&self, id: &str) -> Option<&Episode> {
        self.episodes.iter().find(|e| e.id == id)
    }

    /// Look up an episode mutably.
    pub fn get_mut(&mut self, id: &str) -> Option<&mut Episode> {
        self.episodes.iter_mut().find(|e| e.id == id)
    }

    /// Episode an item was clustered into.
    pub fn episode_of(&self, item_id: &str) -> Option<&Episode> {
        self.item_index.get(item_id).and_then(|id| self.get(id))
    }

    /// Drop terminal episodes that settled before `cutoff`.
    ///
    /// Returns the removed episodes.
    pub fn prune_settled(&mut self, cutoff: DateTime<Utc>) -> Vec<Episode> {
        let (expired, kept): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.episodes).into_iter().partition(|e| {
                let settled = e.schematized_at.or(e.discarded_at);
                e.is_immutable() && settled.is_some_and(|at| at < cutoff)
            });
        self.episodes = kept;
        if self
            .open
            .as_ref()
            .is_some_and(|open| expired.iter().any(|e| &e.id == open))
        {
            self.open = None;
        }
        for episode in &expired {
            for member in &episode.members {
                self.item_index.remove(&member.item_id);
            }
        }
        expired
    }
}

/// Where an item landed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assignment {
    /// The item was already clustered (e.g. an exit after its admission)
    AlreadyMember(EpisodeId),
    /// Appended to the open episode
    Appended(EpisodeId),
    /// Started a new episode
    Opened(EpisodeId),
}

impl Assignment {
    /// The episode the item belongs to.
    pub fn episode_id(&self) -> &EpisodeId {
        match self {
            Assignment::AlreadyMember(id) | Assignment::Appended(id) | Assignment::Opened(id) => id,
        }
    }
}

/// Summary of one clustering pass.
#[derive(Debug, Clone, Default)]
pub struct ClusterReport {
    pub appended: usize,
    pub opened: Vec<EpisodeId>,
    pub sealed: Vec<EpisodeId>,
    pub already_member: usize,
}

/// Groups the WM output stream into episodes.
#[derive(Debug, Clone)]
pub struct EpisodeClusterer {
    config: EpisodeConfig,
}

impl EpisodeClusterer {
    /// Create a clusterer.
    pub fn new(config: EpisodeConfig) -> Self {
        Self { config }
    }

    /// The configuration in use.
    pub fn config(&self) -> &EpisodeConfig {
        &self.config
    }

    /// Classify an episode's coherence.
    pub fn classify(&self, episode: &Episode) -> CoherenceClass {
        let size = episode.len();
        match episode.average_gap() {
            Some(gap)
                if size >= self.config.high_coherence_min_size
                    && gap < self.config.density_threshold() =>
            {
                CoherenceClass::High
            }
            _ if size >= 2 => CoherenceClass::Medium,
            _ => CoherenceClass::Low,
        }
    }

    /// Cluster a batch of items, processed in timestamp order.
    pub fn ingest<'a>(
        &self,
        ledger: &mut EpisodeLedger,
        items: impl IntoIterator<Item = &'a MemoryItem>,
    ) -> (Vec<(ItemId, Assignment)>, ClusterReport) {
        let mut batch: Vec<&MemoryItem> = items.into_iter().collect();
        batch.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

        let mut report = ClusterReport::default();
        let mut assignments = Vec::with_capacity(batch.len());
        for item in batch {
            let sealed_before = ledger.open.clone();
            let assignment = self.assign(ledger, item);
            if let Some(previous) = sealed_before {
                if ledger.open.as_ref() != Some(&previous) {
                    report.sealed.push(previous);
                }
            }
            match &assignment {
                Assignment::AlreadyMember(_) => report.already_member += 1,
                Assignment::Appended(_) => report.appended += 1,
                Assignment::Opened(id) => report.opened.push(id.clone()),
            }
            assignments.push((item.id.clone(), assignment));
        }
        (assignments, report)
    }

    /// Place a single item into an episode.
    pub fn assign(&self, ledger: &mut EpisodeLedger, item: &MemoryItem) -> Assignment {
        if let Some(existing) = ledger.item_index.get(&item.id) {
            return Assignment::AlreadyMember(existing.clone());
        }

        let member = EpisodeMember::from_item(item);
        let gap = self.config.temporal_gap();

        let open_id = ledger.open.clone();
        if let Some(open_id) = open_id {
            if let Some(open) = ledger.get_mut(&open_id) {
                let ts = member.timestamp;
                let fits_in_time = if ts >= open.end {
                    ts.signed_duration_since(open.end) <= gap
                } else {
                    ts >= open.start - gap
                };
                let fits_in_meaning = self.semantically_close(open, &member);

                if fits_in_time && fits_in_meaning {
                    if open.insert_member(member.clone()).is_ok() {
                        open.coherence = self.classify(open);
                        ledger.item_index.insert(item.id.clone(), open_id.clone());
                        trace!(item_id = %item.id, episode_id = %open_id, "appended to open episode");
                        return Assignment::Appended(open_id);
                    }
                } else if ts < open.start - gap {
                    // Older than anything the open episode could absorb.
                    warn!(item_id = %item.id, "late item starts its own episode");
                    let id = self.open_episode(ledger, member, false);
                    if let Some(stray) = ledger.get_mut(&id) {
                        stray.sealed = true;
                    }
                    return Assignment::Opened(id);
                }

                if let Some(open) = ledger.get_mut(&open_id) {
                    open.sealed = true;
                    debug!(episode_id = %open_id, members = open.len(), "episode boundary");
                }
            }
        }

        Assignment::Opened(self.open_episode(ledger, member, true))
    }

    fn open_episode(&self, ledger: &mut EpisodeLedger, member: EpisodeMember, make_open: bool) -> EpisodeId {
        let item_id = member.item_id.clone();
        let mut episode = Episode::open(member);
        episode.coherence = self.classify(&episode);
        let id = episode.id.clone();
        ledger.episodes.push(episode);
        ledger.item_index.insert(item_id, id.clone());
        if make_open {
            ledger.open = Some(id.clone());
        }
        id
    }

    fn semantically_close(&self, episode: &Episode, member: &EpisodeMember) -> bool {
        let (Some(threshold), Some(embedding)) =
            (self.config.semantic_split_threshold, member.embedding.as_ref())
        else {
            return true;
        };
        match episode.centroid() {
            Some(centroid) => cosine_similarity(&centroid, embedding) >= threshold,
            None => true,
        }
    }

    /// Seal the open episode if nothing arrived for a full temporal gap.
    pub fn seal_idle(&self, ledger: &mut EpisodeLedger, now: DateTime<Utc>) -> Option<EpisodeId> {
        let open_id = ledger.open.clone()?;
        let gap = self.config.temporal_gap();
        let episode = ledger.get_mut(&open_id)?;
        if now.signed_duration_since(episode.end) > gap {
            episode.sealed = true;
            let members = episode.len();
            ledger.open = None;
            debug!(episode_id = %open_id, members, "sealed idle episode");
            return Some(open_id);
        }
        None
    }
}

/// Cosine similarity, 0.0 for mismatched or zero vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let (mut dot, mut na, mut nb) = (0.0f64, 0.0f64, 0.0f64);
    for (x, y) in a.iter().zip(b) {
        dot += (*x as f64) * (*y as f64);
        na += (*x as f64).powi(2);
        nb += (*y as f64).powi(2);
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}
