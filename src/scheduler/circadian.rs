/// Circadian schedule: cadence and batch size by time of day.
///
/// The day is split into an awake window (`wake_start_hour` up to
/// `sleep_start_hour`, local time) and a sleep window. While awake, working
/// memory ticks often with small batches; while asleep it ticks rarely with
/// large batches. Deep consolidation runs at fixed sleep hours and synaptic
/// homeostasis once a week.
use chrono::{DateTime, Datelike, Duration, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};

/// Scheduler configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Local hour the awake window starts
    pub wake_start_hour: u32,
    /// Local hour the sleep window starts
    pub sleep_start_hour: u32,
    /// Offset of local time from UTC
    pub utc_offset_minutes: i32,

    pub wm_awake_secs: u64,
    pub wm_asleep_secs: u64,
    pub stm_secs: u64,
    pub consolidation_secs: u64,
    /// Local hours at which consolidation runs in deep mode
    pub deep_consolidation_hours: Vec<u32>,
    pub homeostasis_weekday: Weekday,
    pub homeostasis_hour: u32,
    pub ltm_decay_secs: u64,

    /// Interval multiplier applied per backoff step
    pub backoff_multiplier: u32,
    /// Consecutive failures before backing off
    pub failure_threshold: u32,
    /// Largest interval multiplier
    pub max_backoff_factor: u32,

    pub awake_batch: usize,
    pub asleep_batch: usize,

    /// How long shutdown waits for in-flight ticks
    pub shutdown_grace_ms: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            wake_start_hour: 7,
            sleep_start_hour: 23,
            utc_offset_minutes: 0,
            wm_awake_secs: 5,
            wm_asleep_secs: 60,
            stm_secs: 300,
            consolidation_secs: 3600,
            deep_consolidation_hours: vec![1, 3, 5],
            homeostasis_weekday: Weekday::Sun,
            homeostasis_hour: 4,
            ltm_decay_secs: 600,
            backoff_multiplier: 3,
            failure_threshold: 2,
            max_backoff_factor: 27,
            awake_batch: 32,
            asleep_batch: 128,
            shutdown_grace_ms: 5000,
        }
    }
}

/// Phase of the day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Awake,
    Asleep,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Awake => write!(f, "awake"),
            Phase::Asleep => write!(f, "asleep"),
        }
    }
}

/// Pure time-of-day decisions over a [`ScheduleConfig`].
#[derive(Debug, Clone)]
pub struct Circadian {
    config: ScheduleConfig,
}

impl Circadian {
    pub fn new(config: ScheduleConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ScheduleConfig {
        &self.config
    }

    fn local(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + Duration::minutes(self.config.utc_offset_minutes as i64)
    }

    /// Phase at `now`; windows may wrap around midnight.
    pub fn phase(&self, now: DateTime<Utc>) -> Phase {
        let hour = self.local(now).hour();
        let (wake, sleep) = (self.config.wake_start_hour, self.config.sleep_start_hour);
        let awake = if wake <= sleep {
            hour >= wake && hour < sleep
        } else {
            hour >= wake || hour < sleep
        };
        if awake { Phase::Awake } else { Phase::Asleep }
    }

    /// Working-memory tick interval for a phase.
    pub fn wm_interval(&self, phase: Phase) -> std::time::Duration {
        std::time::Duration::from_secs(match phase {
            Phase::Awake => self.config.wm_awake_secs,
            Phase::Asleep => self.config.wm_asleep_secs,
        })
    }

    /// Records read per working-memory tick.
    pub fn batch_size(&self, phase: Phase) -> usize {
        match phase {
            Phase::Awake => self.config.awake_batch,
            Phase::Asleep => self.config.asleep_batch,
        }
    }

    /// Whether a consolidation tick at `now` runs in deep mode.
    pub fn is_deep_hour(&self, now: DateTime<Utc>) -> bool {
        self.config
            .deep_consolidation_hours
            .contains(&self.local(now).hour())
    }

    /// Whether the weekly homeostasis pass is due.
    ///
    /// Due inside the configured weekday/hour, at most once per window.
    pub fn homeostasis_due(&self, now: DateTime<Utc>, last_run: Option<DateTime<Utc>>) -> bool {
        let local = self.local(now);
        let in_window = local.weekday() == self.config.homeostasis_weekday
            && local.hour() == self.config.homeostasis_hour;
        in_window && last_run.is_none_or(|last| now.signed_duration_since(last) >= Duration::hours(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        // 2026-01-04 is a Sunday.
        Utc.with_ymd_and_hms(2026, 1, day, hour, 0, 0).unwrap()
    }

    #[test]
    fn test_phase_boundaries() {
        let c = Circadian::new(ScheduleConfig::default());
        assert_eq!(c.phase(at(5, 6)), Phase::Asleep);
        assert_eq!(c.phase(at(5, 7)), Phase::Awake);
        assert_eq!(c.phase(at(5, 22)), Phase::Awake);
        assert_eq!(c.phase(at(5, 23)), Phase::Asleep);
        assert_eq!(c.batch_size(Phase::Awake), 32);
        assert_eq!(c.batch_size(Phase::Asleep), 128);
        assert_eq!(c.wm_interval(Phase::Asleep).as_secs(), 60);
    }

    #[test]
    fn test_wrapping_window_and_offset() {
        let c = Circadian::new(ScheduleConfig {
            wake_start_hour: 20,
            sleep_start_hour: 4,
            ..ScheduleConfig::default()
        });
        assert_eq!(c.phase(at(5, 23)), Phase::Awake);
        assert_eq!(c.phase(at(5, 2)), Phase::Awake);
        assert_eq!(c.phase(at(5, 12)), Phase::Asleep);

        let shifted = Circadian::new(ScheduleConfig {
            utc_offset_minutes: 120,
            ..ScheduleConfig::default()
        });
        // 05:00 UTC is 07:00 local.
        assert_eq!(shifted.phase(at(5, 5)), Phase::Awake);
    }

    #[test]
    fn test_deep_hours() {
        let c = Circadian::new(ScheduleConfig::default());
        assert!(c.is_deep_hour(at(5, 3)));
        assert!(!c.is_deep_hour(at(5, 2)));
    }

    #[test]
    fn test_weekly_homeostasis() {
        let c = Circadian::new(ScheduleConfig::default());
        let window = at(4, 4) + Duration::minutes(10);
        assert!(c.homeostasis_due(window, None));
        assert!(!c.homeostasis_due(window + Duration::minutes(30), Some(window)));
        assert!(!c.homeostasis_due(at(5, 4), None));
        assert!(c.homeostasis_due(at(11, 4), Some(window)));
    }
}
