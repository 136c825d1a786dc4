/// Health and metrics surface.
///
/// A [`HealthReport`] is assembled from committed tier snapshots and the
/// lifetime counters of each component. The scheduler adds its stream
/// states and stale-data warnings on top.
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::engine::EngineCounters;
use crate::error::TierKind;
use crate::memory::RegionSummary;
use crate::processes::{GateStats, InterferenceStats};
use crate::reliability::{BreakerState, ReliabilityStats};
use crate::scheduler::StreamState;

/// Overall status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Everything ticking, breaker closed
    Ok,
    /// Degraded throughput: breaker not closed, stale streams or parked items
    Degraded,
    /// At least one tier halted on a fatal error
    Halted,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Ok => write!(f, "ok"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Halted => write!(f, "halted"),
        }
    }
}

/// Item, episode and graph counts per tier.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TierPopulations {
    /// Ingested but not yet admitted
    pub incoming: usize,
    pub working: usize,
    pub short_term_items: usize,
    pub episodes_open: usize,
    pub episodes_fragmentary: usize,
    pub episodes_consolidating: usize,
    pub episodes_schematized: usize,
    pub episodes_discarded: usize,
    pub long_term_items: usize,
    pub concepts: usize,
    pub edges: usize,
    pub mean_edge_weight: f64,
    pub retired: u64,
}

/// A tier stopped by a fatal error.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HaltedTier {
    pub tier: TierKind,
    pub reason: String,
}

/// Snapshot of the whole pipeline's health.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub generated_at: DateTime<Utc>,
    pub populations: TierPopulations,
    pub consolidation: GateStats,
    pub interference: InterferenceStats,
    pub reliability: ReliabilityStats,
    pub counters: EngineCounters,
    pub dead_letters: usize,
    /// WM events not yet consumed by STM
    pub outbox_depth: usize,
    /// Retire requests not yet consumed by WM
    pub retire_queue_depth: usize,
    pub halted: Vec<HaltedTier>,
    /// Scheduler streams; empty when no scheduler is attached
    pub streams: Vec<StreamState>,
    pub warnings: Vec<String>,
    pub regions: Vec<RegionSummary>,
}

impl HealthReport {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn assemble(
        generated_at: DateTime<Utc>,
        populations: TierPopulations,
        consolidation: GateStats,
        interference: InterferenceStats,
        reliability: ReliabilityStats,
        counters: EngineCounters,
        dead_letters: usize,
        outbox_depth: usize,
        retire_queue_depth: usize,
        halted: Vec<HaltedTier>,
        regions: Vec<RegionSummary>,
    ) -> Self {
        let mut warnings = Vec::new();
        for h in &halted {
            warnings.push(format!("tier {} halted: {}", h.tier, h.reason));
        }
        if let Some(state) = reliability.breaker_state {
            if state != BreakerState::Closed {
                warnings.push(format!("enrichment circuit breaker {state}, using lexical fallback"));
            }
        }
        if dead_letters > 0 {
            warnings.push(format!("{dead_letters} item(s) waiting in dead letters"));
        }

        let mut report = Self {
            status: HealthStatus::Ok,
            generated_at,
            populations,
            consolidation,
            interference,
            reliability,
            counters,
            dead_letters,
            outbox_depth,
            retire_queue_depth,
            halted,
            streams: Vec::new(),
            warnings,
            regions,
        };
        report.status = report.derive_status();
        report
    }

    /// Attach scheduler streams and flag stale ones.
    pub fn with_streams(mut self, streams: Vec<StreamState>) -> Self {
        for stream in &streams {
            if stream.is_stale(self.generated_at) {
                self.warnings.push(format!(
                    "{} stream stale: no successful tick in {}s",
                    stream.kind,
                    3 * stream.nominal_secs
                ));
            }
            if stream.backoff_factor > 1 {
                self.warnings.push(format!(
                    "{} stream backed off x{} after {} failures",
                    stream.kind, stream.backoff_factor, stream.consecutive_failures
                ));
            }
        }
        self.streams = streams;
        self.status = self.derive_status();
        self
    }

    fn derive_status(&self) -> HealthStatus {
        if !self.halted.is_empty() {
            HealthStatus::Halted
        } else if self.warnings.is_empty() {
            HealthStatus::Ok
        } else {
            HealthStatus::Degraded
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == HealthStatus::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{Cadence, ScheduleConfig, TickKind};
    use chrono::Duration;

    fn report(halted: Vec<HaltedTier>, breaker: BreakerState) -> HealthReport {
        HealthReport::assemble(
            Utc::now(),
            TierPopulations::default(),
            GateStats::default(),
            InterferenceStats::default(),
            ReliabilityStats {
                breaker_state: Some(breaker),
                ..ReliabilityStats::default()
            },
            EngineCounters::default(),
            0,
            0,
            0,
            halted,
            Vec::new(),
        )
    }

    #[test]
    fn test_status_derivation() {
        assert_eq!(report(Vec::new(), BreakerState::Closed).status, HealthStatus::Ok);
        assert_eq!(report(Vec::new(), BreakerState::Open).status, HealthStatus::Degraded);

        let halted = vec![HaltedTier {
            tier: TierKind::ShortTerm,
            reason: "snapshot mismatch".into(),
        }];
        let r = report(halted, BreakerState::Open);
        assert_eq!(r.status, HealthStatus::Halted);
        assert!(r.warnings.iter().any(|w| w.contains("stm halted")));
    }

    #[test]
    fn test_stale_stream_degrades() {
        let healthy = report(Vec::new(), BreakerState::Closed);
        let long_ago = healthy.generated_at - Duration::hours(2);
        let cadence = Cadence::new(&ScheduleConfig::default(), long_ago);
        cadence.record_success(TickKind::Consolidation, long_ago);

        let r = healthy.with_streams(cadence.snapshot());
        assert_eq!(r.status, HealthStatus::Degraded);
        assert!(r.warnings.iter().any(|w| w.starts_with("wm stream stale")));
        assert!(!r.warnings.iter().any(|w| w.starts_with("consolidation")));
    }
}
