/// Admission Selector: the capacity-bounded working memory.
///
/// Working memory acts like the prefrontal cortex - fast, limited capacity,
/// holds what is immediately relevant. Every WM tick the selector:
///
/// 1. Refreshes each candidate's activation (exponential recency decay plus
///    a frequency boost for accesses recorded since the last refresh)
/// 2. Retires candidates that stayed below the forgetting floor too long
/// 3. Ranks eligible candidates (activation above the plasticity threshold)
/// 4. Admits the top `capacity` items
///
/// ## Ranking
///
/// ```text
/// activation ↓, recency ↓, frequency ↓, created_at ↑, id ↑
/// ```
///
/// Residents that miss the cut, and eligible arrivals that never made it
/// in, leave as *WM exits* and seed episodes downstream instead of being
/// discarded.
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use tracing::{debug, trace, warn};

use crate::types::{clamp_unit, ItemId, MemoryItem, MemoryTier};

/// Working memory configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkingConfig {
    /// Maximum number of resident items (Miller's law: 5-9)
    pub capacity: usize,

    /// Activation must exceed this to be eligible for admission
    pub plasticity_threshold: f64,

    /// Activation assigned to freshly ingested items
    pub initial_activation: f64,

    /// Half-life of the exponential recency decay
    pub activation_half_life_secs: u64,

    /// Activation added per access recorded since the last refresh
    pub frequency_boost: f64,

    /// Time scale of the recency tie-breaker
    pub recency_scale_secs: u64,

    /// Access count at which the frequency tie-breaker reaches ~63%
    pub frequency_scale: f64,

    /// Activation below this starts the forgetting grace period
    pub forgetting_floor: f64,

    /// How long an item may stay below the floor before it is retired
    pub forgetting_grace_secs: u64,

    /// Maximum events kept in the WM outbox
    pub outbox_limit: usize,
}

impl Default for WorkingConfig {
    fn default() -> Self {
        Self {
            capacity: 7,
            plasticity_threshold: 0.6,
            initial_activation: 0.9,
            activation_half_life_secs: 1800,
            frequency_boost: 0.05,
            recency_scale_secs: 600,
            frequency_scale: 5.0,
            forgetting_floor: 0.05,
            forgetting_grace_secs: 3600,
            outbox_limit: 10_000,
        }
    }
}

impl WorkingConfig {
    /// Forgetting grace period.
    pub fn forgetting_grace(&self) -> Duration {
        Duration::seconds(self.forgetting_grace_secs as i64)
    }
}

/// Result of one admission pass.
#[derive(Debug, Clone, Default)]
pub struct AdmissionOutcome {
    /// The resident set after this pass, in rank order (never above capacity)
    pub admitted: Vec<MemoryItem>,

    /// Ids in `admitted` that were not resident before this pass
    pub newly_admitted: Vec<ItemId>,

    /// Items leaving working memory, in rank order, already moved to STM
    pub exits: Vec<MemoryItem>,

    /// Arrivals that are not eligible yet and stay as candidates
    pub retained: Vec<MemoryItem>,

    /// Items forgotten during this pass
    pub retired: Vec<MemoryItem>,

    /// Structurally invalid candidates that were dropped
    pub rejected: Vec<MemoryItem>,

    /// Number of candidates above the plasticity threshold
    pub eligible: usize,
}

/// Ranks and admits candidates into the bounded working set.
#[derive(Debug, Clone)]
pub struct AdmissionSelector {
    config: WorkingConfig,
}

impl AdmissionSelector {
    /// Create a selector.
    pub fn new(config: WorkingConfig) -> Self {
        Self { config }
    }

    /// The configuration in use.
    pub fn config(&self) -> &WorkingConfig {
        &self.config
    }

    /// Recompute activation from elapsed time and pending accesses.
    pub fn refresh(&self, item: &mut MemoryItem, now: DateTime<Utc>) {
        let elapsed = now
            .signed_duration_since(item.last_refreshed_at)
            .num_milliseconds()
            .max(0) as f64
            / 1000.0;
        let half_life = self.config.activation_half_life_secs.max(1) as f64;
        let decayed = item.activation * 0.5f64.powf(elapsed / half_life);
        let boost = self.config.frequency_boost * item.pending_accesses as f64;

        item.activation = clamp_unit(decayed + boost, "activation");
        item.pending_accesses = 0;
        if now > item.last_refreshed_at {
            item.last_refreshed_at = now;
        }

        if item.activation < self.config.forgetting_floor {
            item.below_floor_since.get_or_insert(now);
        } else {
            item.below_floor_since = None;
        }
    }

    /// Monotonically decreasing in time since last access, in `(0, 1]`.
    pub fn recency_score(&self, item: &MemoryItem, now: DateTime<Utc>) -> f64 {
        let idle = now
            .signed_duration_since(item.last_accessed_at)
            .num_milliseconds()
            .max(0) as f64
            / 1000.0;
        (-idle / self.config.recency_scale_secs.max(1) as f64).exp()
    }

    /// Monotonically increasing in access count, in `[0, 1)`.
    pub fn frequency_score(&self, item: &MemoryItem) -> f64 {
        let scale = self.config.frequency_scale.max(f64::EPSILON);
        1.0 - (-(item.access_count as f64) / scale).exp()
    }

    /// Compare two refreshed items by rank (best first).
    fn compare(&self, a: &MemoryItem, b: &MemoryItem, now: DateTime<Utc>) -> Ordering {
        b.activation
            .total_cmp(&a.activation)
            .then_with(|| {
                self.recency_score(b, now)
                    .total_cmp(&self.recency_score(a, now))
            })
            .then_with(|| self.frequency_score(b).total_cmp(&self.frequency_score(a)))
            .then_with(|| a.created_at.cmp(&b.created_at))
            .then_with(|| a.id.cmp(&b.id))
    }

    fn is_forgotten(&self, item: &MemoryItem, now: DateTime<Utc>) -> bool {
        item.below_floor_since
            .is_some_and(|since| now.signed_duration_since(since) > self.config.forgetting_grace())
    }

    /// Refresh an item held outside working memory and report whether the
    /// forgetting rule applies to it.
    pub fn should_forget(&self, item: &mut MemoryItem, now: DateTime<Utc>) -> bool {
        self.refresh(item, now);
        self.is_forgotten(item, now)
    }

    /// Run one admission pass over every candidate currently owned by WM.
    ///
    /// `candidates` holds both new arrivals (`Incoming`) and current
    /// residents (`Working`). Anything else is rejected.
    pub fn select(&self, candidates: Vec<MemoryItem>, now: DateTime<Utc>) -> AdmissionOutcome {
        let mut outcome = AdmissionOutcome::default();
        let mut eligible = Vec::new();
        let mut ineligible_residents = Vec::new();

        for mut item in candidates {
            if let Err(reason) = check_structure(&item) {
                warn!(item_id = %item.id, reason, "skipping structurally invalid candidate");
                outcome.rejected.push(item);
                continue;
            }
            if !matches!(item.tier, MemoryTier::Incoming | MemoryTier::Working) {
                warn!(item_id = %item.id, tier = %item.tier, "candidate is not owned by working memory");
                outcome.rejected.push(item);
                continue;
            }

            self.refresh(&mut item, now);

            if self.is_forgotten(&item, now) {
                trace!(item_id = %item.id, activation = item.activation, "forgetting item");
                if item.transition(MemoryTier::Retired).is_ok() {
                    outcome.retired.push(item);
                }
                continue;
            }

            if item.activation > self.config.plasticity_threshold {
                eligible.push(item);
            } else if item.tier == MemoryTier::Working {
                ineligible_residents.push(item);
            } else {
                outcome.retained.push(item);
            }
        }

        outcome.eligible = eligible.len();
        eligible.sort_by(|a, b| self.compare(a, b, now));

        let cut = self.config.capacity.min(eligible.len());
        let losers = eligible.split_off(cut);

        for mut item in eligible {
            if item.tier == MemoryTier::Incoming {
                outcome.newly_admitted.push(item.id.clone());
            }
            match item.transition(MemoryTier::Working) {
                Ok(()) => outcome.admitted.push(item),
                Err(e) => {
                    warn!(error = %e, "admission transition refused");
                    outcome.rejected.push(item);
                }
            }
        }

        ineligible_residents.sort_by(|a, b| self.compare(a, b, now));
        for mut item in losers.into_iter().chain(ineligible_residents) {
            match item.transition(MemoryTier::ShortTerm) {
                Ok(()) => outcome.exits.push(item),
                Err(e) => {
                    warn!(error = %e, "exit transition refused");
                    outcome.rejected.push(item);
                }
            }
        }

        debug!(
            admitted = outcome.admitted.len(),
            newly_admitted = outcome.newly_admitted.len(),
            exits = outcome.exits.len(),
            retained = outcome.retained.len(),
            retired = outcome.retired.len(),
            "admission pass complete"
        );

        outcome
    }
}

/// Reject items missing required fields.
pub fn check_structure(item: &MemoryItem) -> Result<(), &'static str> {
    if item.id.trim().is_empty() {
        return Err("missing id");
    }
    if item.content.trim().is_empty() {
        return Err("missing content");
    }
    if !item.activation.is_finite() {
        return Err("non-finite activation");
    }
    Ok(())
}
