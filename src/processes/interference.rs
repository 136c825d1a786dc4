/// Interference Resolver: competition between episodes.
///
/// An episode's effective strength is reduced by other episodes that
/// compete with it for consolidation:
///
/// - **Proactive** interference comes from older competitors
/// - **Retroactive** interference comes from newer competitors
///
/// Each competitor contributes
/// `rate × proximity × competitor_strength × similarity`, where proximity
/// falls off exponentially with the distance between episode starts and
/// similarity blends a floor with the Jaccard overlap of concept sets.
/// The combined penalty is capped, so an episode keeps at least
/// `(1 − cap)` of its base strength.
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

use crate::memory::EpisodeLedger;
use crate::types::{clamp_unit, Episode, InterferenceBreakdown, Readiness};

/// Interference configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterferenceConfig {
    /// Maximum combined interference (never above 0.8)
    pub cap: f64,

    /// Weight of older competitors
    pub proactive_rate: f64,

    /// Weight of newer competitors
    pub retroactive_rate: f64,

    /// Distance between starts at which proximity falls to 1/e
    pub proximity_scale_secs: u64,

    /// Similarity of competitors sharing no concepts
    pub similarity_floor: f64,

    /// How long schematized episodes keep competing
    pub recent_window_secs: u64,
}

impl Default for InterferenceConfig {
    fn default() -> Self {
        Self {
            cap: 0.8,
            proactive_rate: 0.3,
            retroactive_rate: 0.2,
            proximity_scale_secs: 3600,
            similarity_floor: 0.5,
            recent_window_secs: 24 * 3600,
        }
    }
}

impl InterferenceConfig {
    /// Window during which consolidated episodes still compete.
    pub fn recent_window(&self) -> Duration {
        Duration::seconds(self.recent_window_secs as i64)
    }
}

/// Summary of one resolution pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct InterferenceReport {
    pub evaluated: usize,
    pub mean_interference: f64,
    pub max_interference: f64,
    /// Episodes whose raw penalty exceeded the cap
    pub capped: usize,
}

/// Running interference statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct InterferenceStats {
    pub evaluations: u64,
    pub capped: u64,
    pub last_mean: f64,
    pub last_max: f64,
}

/// Computes interference penalties and competition scores.
#[derive(Debug)]
pub struct InterferenceResolver {
    config: InterferenceConfig,
    evaluations: AtomicU64,
    capped: AtomicU64,
    last_mean_bits: AtomicU64,
    last_max_bits: AtomicU64,
}

impl InterferenceResolver {
    /// Create a resolver.
    pub fn new(config: InterferenceConfig) -> Self {
        Self {
            config,
            evaluations: AtomicU64::new(0),
            capped: AtomicU64::new(0),
            last_mean_bits: AtomicU64::new(0),
            last_max_bits: AtomicU64::new(0),
        }
    }

    /// The configuration in use.
    pub fn config(&self) -> &InterferenceConfig {
        &self.config
    }

    fn effective_cap(&self) -> f64 {
        self.config.cap.clamp(0.0, 0.8)
    }

    /// Whether `other` competes with `target` at `now`.
    pub fn competes(&self, target: &Episode, other: &Episode, now: DateTime<Utc>) -> bool {
        if other.id == target.id || other.is_empty() {
            return false;
        }
        match other.readiness {
            Readiness::Discarded => false,
            Readiness::Schematized => other
                .schematized_at
                .map(|at| now.signed_duration_since(at) <= self.config.recent_window())
                .unwrap_or(false),
            Readiness::Fragmentary | Readiness::Consolidating => true,
        }
    }

    /// Penalties `target` suffers from `competitors`, before and after capping.
    pub fn resolve<'a>(
        &self,
        target: &Episode,
        competitors: impl IntoIterator<Item = &'a Episode>,
    ) -> (InterferenceBreakdown, bool) {
        let target_concepts = target.concepts();
        let scale = self.config.proximity_scale_secs.max(1) as f64;
        let floor = clamp_unit(self.config.similarity_floor, "interference.similarity_floor");

        let mut proactive = 0.0;
        let mut retroactive = 0.0;
        for other in competitors {
            if other.id == target.id {
                continue;
            }
            let delta = other.start.signed_duration_since(target.start);
            let distance = delta.num_milliseconds().unsigned_abs() as f64 / 1000.0;
            let proximity = (-distance / scale).exp();
            let similarity = floor + (1.0 - floor) * jaccard(&target_concepts, &other.concepts());
            let pressure = proximity * other.base_strength() * similarity;

            let older = delta < Duration::zero() || (delta == Duration::zero() && other.id < target.id);
            if older {
                proactive += self.config.proactive_rate * pressure;
            } else {
                retroactive += self.config.retroactive_rate * pressure;
            }
        }

        let proactive = proactive.max(0.0);
        let retroactive = retroactive.max(0.0);
        let raw = proactive + retroactive;
        let cap = self.effective_cap();
        (
            InterferenceBreakdown {
                proactive,
                retroactive,
                total: raw.min(cap),
            },
            raw > cap,
        )
    }

    /// `base × (1 − interference)`, never below `(1 − cap) × base`.
    pub fn adjusted_strength(&self, base: f64, interference: f64) -> f64 {
        let interference = interference.clamp(0.0, self.effective_cap());
        clamp_unit(base * (1.0 - interference), "competition_score")
    }

    /// Recompute interference and competition score of every mutable episode.
    ///
    /// Competitors are read from the ledger as it was before the pass, so
    /// the result does not depend on iteration order.
    pub fn resolve_all(&self, ledger: &mut EpisodeLedger, now: DateTime<Utc>) -> InterferenceReport {
        let mut updates = Vec::new();
        let mut report = InterferenceReport::default();

        for target in ledger.episodes.iter().filter(|e| !e.is_immutable()) {
            let competitors = ledger
                .episodes
                .iter()
                .filter(|other| self.competes(target, other, now));
            let (breakdown, capped) = self.resolve(target, competitors);
            let score = self.adjusted_strength(target.base_strength(), breakdown.total);
            if capped {
                report.capped += 1;
            }
            updates.push((target.id.clone(), breakdown, score));
        }

        let mut sum = 0.0;
        for (id, breakdown, score) in updates {
            if let Some(episode) = ledger.get_mut(&id) {
                debug!(
                    episode_id = %id,
                    proactive = breakdown.proactive,
                    retroactive = breakdown.retroactive,
                    score,
                    "interference resolved"
                );
                episode.interference = breakdown;
                episode.competition_score = score;
                sum += breakdown.total;
                report.max_interference = report.max_interference.max(breakdown.total);
                report.evaluated += 1;
            }
        }
        if report.evaluated > 0 {
            report.mean_interference = sum / report.evaluated as f64;
        }

        self.evaluations
            .fetch_add(report.evaluated as u64, Ordering::Relaxed);
        self.capped.fetch_add(report.capped as u64, Ordering::Relaxed);
        self.last_mean_bits
            .store(report.mean_interference.to_bits(), Ordering::Relaxed);
        self.last_max_bits
            .store(report.max_interference.to_bits(), Ordering::Relaxed);
        report
    }

    /// Running statistics.
    pub fn stats(&self) -> InterferenceStats {
        InterferenceStats {
            evaluations: self.evaluations.load(Ordering::Relaxed),
            capped: self.capped.load(Ordering::Relaxed),
            last_mean: f64::from_bits(self.last_mean_bits.load(Ordering::Relaxed)),
            last_max: f64::from_bits(self.last_max_bits.load(Ordering::Relaxed)),
        }
    }
}

fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EpisodeMember;

    fn episode(id: &str, start: DateTime<Utc>, activation: f64, concepts: &[&str]) -> Episode {
        let mut e = Episode::open(EpisodeMember {
            item_id: format!("{id}-0"),
            timestamp: start,
            activation,
            concepts: concepts.iter().map(|s| s.to_string()).collect(),
            embedding: None,
        });
        e.id = id.to_string();
        e
    }

    #[test]
    fn test_lone_episode_has_no_interference() {
        let resolver = InterferenceResolver::new(InterferenceConfig::default());
        let target = episode("a", Utc::now(), 0.8, &["x"]);
        let (breakdown, capped) = resolver.resolve(&target, std::iter::empty());
        assert_eq!(breakdown.total, 0.0);
        assert!(!capped);
    }

    #[test]
    fn test_proactive_and_retroactive_split() {
        let resolver = InterferenceResolver::new(InterferenceConfig::default());
        let t0 = Utc::now();
        let older = episode("old", t0 - Duration::minutes(30), 0.9, &["x"]);
        let target = episode("mid", t0, 0.9, &["x"]);
        let newer = episode("new", t0 + Duration::minutes(30), 0.9, &["x"]);

        let (breakdown, _) = resolver.resolve(&target, [&older, &newer]);
        let proximity = (-0.5f64).exp();
        assert!((breakdown.proactive - 0.3 * proximity * 0.9).abs() < 1e-9);
        assert!((breakdown.retroactive - 0.2 * proximity * 0.9).abs() < 1e-9);
        assert!((breakdown.total - (breakdown.proactive + breakdown.retroactive)).abs() < 1e-12);
    }

    #[test]
    fn test_similarity_increases_pressure() {
        let resolver = InterferenceResolver::new(InterferenceConfig::default());
        let t0 = Utc::now();
        let target = episode("t", t0, 0.9, &["x", "y"]);
        let same = episode("s", t0 - Duration::minutes(10), 0.9, &["x", "y"]);
        let different = episode("d", t0 - Duration::minutes(10), 0.9, &["z"]);

        let (with_same, _) = resolver.resolve(&target, [&same]);
        let (with_diff, _) = resolver.resolve(&target, [&different]);
        assert!((with_same.total - 2.0 * with_diff.total).abs() < 1e-9);
    }

    #[test]
    fn test_cap_bounds_reduction() {
        let config = InterferenceConfig {
            proactive_rate: 1.0,
            retroactive_rate: 1.0,
            ..InterferenceConfig::default()
        };
        let resolver = InterferenceResolver::new(config);
        let t0 = Utc::now();
        let target = episode("t", t0, 1.0, &["x"]);
        let crowd: Vec<Episode> = (0..10)
            .map(|i| episode(&format!("c{i}"), t0 + Duration::seconds(i), 1.0, &["x"]))
            .collect();

        let (breakdown, capped) = resolver.resolve(&target, crowd.iter());
        assert!(capped);
        assert_eq!(breakdown.total, 0.8);
        let adjusted = resolver.adjusted_strength(1.0, breakdown.total);
        assert!(adjusted >= 0.2 - 1e-12);
    }

    #[test]
    fn test_cap_config_above_bound_is_ignored() {
        let config = InterferenceConfig {
            cap: 0.95,
            ..InterferenceConfig::default()
        };
        let resolver = InterferenceResolver::new(config);
        assert!((resolver.adjusted_strength(1.0, 0.95) - 0.2).abs() < 1e-12);
    }

    #[test]
    fn test_resolve_all_skips_terminal_and_stale() {
        let resolver = InterferenceResolver::new(InterferenceConfig::default());
        let now = Utc::now();
        let mut ledger = EpisodeLedger::default();

        let mut done = episode("done", now - Duration::hours(2), 0.9, &["x"]);
        done.readiness = Readiness::Schematized;
        done.schematized_at = Some(now - Duration::days(3));
        done.competition_score = 0.42;
        ledger.episodes.push(done);
        ledger.episodes.push(episode("live", now - Duration::hours(1), 0.9, &["x"]));

        let report = resolver.resolve_all(&mut ledger, now);
        assert_eq!(report.evaluated, 1);
        // Schematized outside the recent window no longer competes.
        let live = ledger.get("live").unwrap();
        assert_eq!(live.interference.total, 0.0);
        assert!((live.competition_score - 0.9).abs() < 1e-12);
        assert_eq!(ledger.get("done").unwrap().competition_score, 0.42);
        assert_eq!(resolver.stats().evaluations, 1);
    }
}
