/// Per-stream tick bookkeeping: backoff and staleness.
///
/// After `failure_threshold` consecutive failures a stream's interval is
/// multiplied by `backoff_multiplier` per further failure, up to
/// `max_backoff_factor`. One success resets it.
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::RecallError;
use crate::scheduler::ScheduleConfig;

/// The independent tick streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TickKind {
    Working,
    ShortTerm,
    Consolidation,
    Homeostasis,
    Decay,
}

impl TickKind {
    pub const ALL: [TickKind; 5] = [
        TickKind::Working,
        TickKind::ShortTerm,
        TickKind::Consolidation,
        TickKind::Homeostasis,
        TickKind::Decay,
    ];
}

impl std::fmt::Display for TickKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TickKind::Working => write!(f, "wm"),
            TickKind::ShortTerm => write!(f, "stm"),
            TickKind::Consolidation => write!(f, "consolidation"),
            TickKind::Homeostasis => write!(f, "homeostasis"),
            TickKind::Decay => write!(f, "decay"),
        }
    }
}

impl FromStr for TickKind {
    type Err = RecallError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "wm" | "working" => Ok(TickKind::Working),
            "stm" | "short_term" => Ok(TickKind::ShortTerm),
            "consolidation" | "ltm" => Ok(TickKind::Consolidation),
            "homeostasis" => Ok(TickKind::Homeostasis),
            "decay" => Ok(TickKind::Decay),
            other => Err(RecallError::InvalidConfig(format!("unknown tick kind '{other}'"))),
        }
    }
}

/// State of one tick stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamState {
    pub kind: TickKind,
    /// Nominal interval in seconds (current phase for WM)
    pub nominal_secs: u64,
    pub backoff_factor: u32,
    pub consecutive_failures: u32,
    pub runs: u64,
    pub failures: u64,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// When the stream started, for staleness before the first success
    pub started_at: DateTime<Utc>,
}

impl StreamState {
    fn new(kind: TickKind, nominal_secs: u64, now: DateTime<Utc>) -> Self {
        Self {
            kind,
            nominal_secs,
            backoff_factor: 1,
            consecutive_failures: 0,
            runs: 0,
            failures: 0,
            last_success: None,
            last_failure: None,
            last_error: None,
            started_at: now,
        }
    }

    /// Interval including backoff.
    pub fn effective_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.nominal_secs.max(1) * self.backoff_factor as u64)
    }

    /// No success for three nominal intervals.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        let horizon = Duration::seconds(3 * self.nominal_secs.max(1) as i64);
        let reference = self.last_success.unwrap_or(self.started_at);
        now.signed_duration_since(reference) > horizon
    }
}

/// Backoff and staleness for every stream.
#[derive(Debug)]
pub struct Cadence {
    streams: DashMap<TickKind, StreamState>,
    multiplier: u32,
    failure_threshold: u32,
    max_factor: u32,
}

impl Cadence {
    /// Streams with their nominal intervals.
    pub fn new(config: &ScheduleConfig, now: DateTime<Utc>) -> Self {
        let streams = DashMap::new();
        for (kind, secs) in [
            (TickKind::Working, config.wm_awake_secs),
            (TickKind::ShortTerm, config.stm_secs),
            (TickKind::Consolidation, config.consolidation_secs),
            // Checked hourly, runs weekly.
            (TickKind::Homeostasis, 3600),
            (TickKind::Decay, config.ltm_decay_secs),
        ] {
            streams.insert(kind, StreamState::new(kind, secs, now));
        }
        Self {
            streams,
            multiplier: config.backoff_multiplier.max(1),
            failure_threshold: config.failure_threshold.max(1),
            max_factor: config.max_backoff_factor.max(1),
        }
    }

    /// Update a stream's nominal interval (WM follows the phase).
    pub fn set_nominal(&self, kind: TickKind, secs: u64) {
        if let Some(mut s) = self.streams.get_mut(&kind) {
            s.nominal_secs = secs;
        }
    }

    pub fn record_success(&self, kind: TickKind, now: DateTime<Utc>) {
        if let Some(mut s) = self.streams.get_mut(&kind) {
            s.runs += 1;
            s.consecutive_failures = 0;
            s.backoff_factor = 1;
            s.last_success = Some(now);
        }
    }

    /// Record a failure; returns the new backoff factor.
    pub fn record_failure(&self, kind: TickKind, error: &str, now: DateTime<Utc>) -> u32 {
        let Some(mut s) = self.streams.get_mut(&kind) else {
            return 1;
        };
        s.runs += 1;
        s.failures += 1;
        s.consecutive_failures += 1;
        s.last_failure = Some(now);
        s.last_error = Some(error.to_string());
        if s.consecutive_failures >= self.failure_threshold {
            s.backoff_factor = (s.backoff_factor.saturating_mul(self.multiplier)).min(self.max_factor);
        }
        s.backoff_factor
    }

    /// Interval including backoff.
    pub fn effective_interval(&self, kind: TickKind) -> std::time::Duration {
        self.streams
            .get(&kind)
            .map(|s| s.effective_interval())
            .unwrap_or(std::time::Duration::from_secs(1))
    }

    /// Copy of one stream's state.
    pub fn stream(&self, kind: TickKind) -> Option<StreamState> {
        self.streams.get(&kind).map(|s| s.clone())
    }

    /// Copy of every stream, in tick-kind order.
    pub fn snapshot(&self) -> Vec<StreamState> {
        let mut all: Vec<StreamState> = self.streams.iter().map(|s| s.value().clone()).collect();
        all.sort_by_key(|s| s.kind);
        all
    }
}
