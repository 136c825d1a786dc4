/// Consolidation Gate: the promotion state machine of short-term memory.
///
/// ```text
///                 criteria met             confirmed after window
/// fragmentary ───────────────► consolidating ─────────────────► schematized
///      │  ▲                         │
///      │  └──── criteria lost ──────┘  (lapse)
///      │
///      └── older than max retention ──► discarded
/// ```
///
/// The criteria are: age ≥ minimum age, competition score ≥ threshold and
/// member count ≥ minimum rehearsal. High-coherence episodes skip the
/// confirmation window. Schematized and discarded episodes are terminal;
/// evaluating them again changes nothing.
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

use crate::memory::EpisodeLedger;
use crate::types::{CoherenceClass, Episode, EpisodeId, Readiness};

/// Gate configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// Minimum episode age before promotion (seconds)
    pub min_age_secs: u64,

    /// Minimum interference-adjusted strength
    pub threshold: f64,

    /// Minimum member count
    pub min_rehearsal: usize,

    /// How long criteria must hold while consolidating (seconds)
    pub confirmation_window_secs: u64,

    /// Fragmentary episodes older than this are discarded (seconds)
    pub max_retention_secs: u64,

    /// Let high-coherence episodes skip the confirmation window
    pub fast_track_high_coherence: bool,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            min_age_secs: 3600,
            threshold: 0.5,
            min_rehearsal: 2,
            confirmation_window_secs: 3600,
            max_retention_secs: 48 * 3600,
            fast_track_high_coherence: true,
        }
    }
}

impl GateConfig {
    pub fn min_age(&self) -> Duration {
        Duration::seconds(self.min_age_secs as i64)
    }

    pub fn confirmation_window(&self) -> Duration {
        Duration::seconds(self.confirmation_window_secs as i64)
    }

    pub fn max_retention(&self) -> Duration {
        Duration::seconds(self.max_retention_secs as i64)
    }
}

/// Outcome of evaluating one episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    /// Nothing changed
    Unchanged,
    /// fragmentary → consolidating
    Promoted,
    /// → schematized; hand the episode to long-term memory
    Schematized,
    /// consolidating → fragmentary
    Lapsed,
    /// fragmentary → discarded; retire resident members
    Discarded,
}

/// Summary of one gate pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GateReport {
    pub evaluated: usize,
    pub promoted: usize,
    pub lapsed: usize,
    pub schematized: Vec<EpisodeId>,
    pub discarded: Vec<EpisodeId>,
}

/// Lifetime gate counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GateStats {
    pub evaluations: u64,
    pub promoted: u64,
    pub schematized: u64,
    pub lapsed: u64,
    pub discarded: u64,
}

/// Consolidation Gate.
#[derive(Debug)]
pub struct ConsolidationGate {
    config: GateConfig,
    evaluations: AtomicU64,
    promoted: AtomicU64,
    schematized: AtomicU64,
    lapsed: AtomicU64,
    discarded: AtomicU64,
}

impl ConsolidationGate {
    /// Create a gate.
    pub fn new(config: GateConfig) -> Self {
        Self {
            config,
            evaluations: AtomicU64::new(0),
            promoted: AtomicU64::new(0),
            schematized: AtomicU64::new(0),
            lapsed: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
        }
    }

    /// The configuration in use.
    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    /// Whether an episode currently satisfies all promotion criteria.
    pub fn criteria_met(&self, episode: &Episode, now: DateTime<Utc>) -> bool {
        episode.age(now) >= self.config.min_age()
            && episode.competition_score >= self.config.threshold
            && episode.len() >= self.config.min_rehearsal
    }

    fn fast_tracked(&self, episode: &Episode) -> bool {
        self.config.fast_track_high_coherence && episode.coherence == CoherenceClass::High
    }

    /// Advance one episode's readiness.
    pub fn evaluate(&self, episode: &mut Episode, now: DateTime<Utc>) -> GateDecision {
        if episode.is_immutable() || !episode.sealed {
            return GateDecision::Unchanged;
        }
        self.evaluations.fetch_add(1, Ordering::Relaxed);
        let met = self.criteria_met(episode, now);

        let decision = match episode.readiness {
            Readiness::Fragmentary if met && self.fast_tracked(episode) => {
                episode.readiness = Readiness::Schematized;
                episode.schematized_at = Some(now);
                GateDecision::Schematized
            }
            Readiness::Fragmentary if met => {
                episode.readiness = Readiness::Consolidating;
                episode.consolidating_since = Some(now);
                GateDecision::Promoted
            }
            Readiness::Fragmentary if episode.age(now) > self.config.max_retention() => {
                episode.readiness = Readiness::Discarded;
                episode.discarded_at = Some(now);
                GateDecision::Discarded
            }
            Readiness::Consolidating if met => {
                let since = *episode.consolidating_since.get_or_insert(now);
                if now.signed_duration_since(since) >= self.config.confirmation_window() {
                    episode.readiness = Readiness::Schematized;
                    episode.schematized_at = Some(now);
                    GateDecision::Schematized
                } else {
                    GateDecision::Unchanged
                }
            }
            Readiness::Consolidating => {
                episode.readiness = Readiness::Fragmentary;
                episode.consolidating_since = None;
                GateDecision::Lapsed
            }
            _ => GateDecision::Unchanged,
        };

        match decision {
            GateDecision::Promoted => {
                self.promoted.fetch_add(1, Ordering::Relaxed);
            }
            GateDecision::Schematized => {
                self.schematized.fetch_add(1, Ordering::Relaxed);
            }
            GateDecision::Lapsed => {
                self.lapsed.fetch_add(1, Ordering::Relaxed);
            }
            GateDecision::Discarded => {
                self.discarded.fetch_add(1, Ordering::Relaxed);
            }
            GateDecision::Unchanged => {}
        }
        if decision != GateDecision::Unchanged {
            debug!(
                episode_id = %episode.id,
                readiness = %episode.readiness,
                score = episode.competition_score,
                "gate transition"
            );
        }
        decision
    }

    /// Evaluate every episode in the ledger.
    pub fn evaluate_all(&self, ledger: &mut EpisodeLedger, now: DateTime<Utc>) -> GateReport {
        let mut report = GateReport::default();
        for episode in ledger.episodes.iter_mut() {
            if episode.is_immutable() || !episode.sealed {
                continue;
            }
            report.evaluated += 1;
            match self.evaluate(episode, now) {
                GateDecision::Promoted => report.promoted += 1,
                GateDecision::Lapsed => report.lapsed += 1,
                GateDecision::Schematized => report.schematized.push(episode.id.clone()),
                GateDecision::Discarded => report.discarded.push(episode.id.clone()),
                GateDecision::Unchanged => {}
            }
        }
        if !report.schematized.is_empty() || !report.discarded.is_empty() {
            info!(
                evaluated = report.evaluated,
                schematized = report.schematized.len(),
                discarded = report.discarded.len(),
                "consolidation gate pass"
            );
        }
        report
    }

    /// Lifetime counters.
    pub fn stats(&self) -> GateStats {
        GateStats {
            evaluations: self.evaluations.load(Ordering::Relaxed),
            promoted: self.promoted.load(Ordering::Relaxed),
            schematized: self.schematized.load(Ordering::Relaxed),
            lapsed: self.lapsed.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
        }
    }
}
