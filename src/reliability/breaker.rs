/// Circuit breaker for the enrichment service.
///
/// Trips after N consecutive failures, then rejects calls for a cooldown
/// period before letting a single trial through:
///
/// - `Closed`: normal operation, calls pass through
/// - `Open`: rejecting calls (cooldown active)
/// - `HalfOpen`: cooldown expired, one trial call allowed
///
/// A successful call closes the breaker; a failed trial re-opens it for
/// another full cooldown. A trial that never reports back (its call was
/// dropped) is abandoned after one cooldown and the next caller gets a new
/// one.
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use tracing::{info, warn};

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "closed"),
            BreakerState::Open => write!(f, "open"),
            BreakerState::HalfOpen => write!(f, "half_open"),
        }
    }
}

const NO_TRIAL: i64 = i64::MIN;

#[derive(Debug)]
pub struct CircuitBreaker {
    /// Consecutive failures since the last success
    consecutive_failures: AtomicU32,
    /// When the breaker last tripped (unix millis)
    tripped_at_ms: AtomicI64,
    /// When the half-open trial was handed out (unix millis)
    trial_started_ms: AtomicI64,
    trips: AtomicU64,
    threshold: u32,
    cooldown: Duration,
}

impl CircuitBreaker {
    /// Create a closed breaker.
    pub fn new(threshold: u32, cooldown_secs: u64) -> Self {
        Self {
            consecutive_failures: AtomicU32::new(0),
            tripped_at_ms: AtomicI64::new(0),
            trial_started_ms: AtomicI64::new(NO_TRIAL),
            trips: AtomicU64::new(0),
            threshold: threshold.max(1),
            cooldown: Duration::seconds(cooldown_secs as i64),
        }
    }

    /// State at `now`.
    pub fn state(&self, now: DateTime<Utc>) -> BreakerState {
        if self.consecutive_failures.load(Ordering::Relaxed) < self.threshold {
            return BreakerState::Closed;
        }
        let tripped = self.tripped_at_ms.load(Ordering::Relaxed);
        if now.timestamp_millis() - tripped < self.cooldown.num_milliseconds() {
            BreakerState::Open
        } else {
            BreakerState::HalfOpen
        }
    }

    /// Whether a call may go through at `now`.
    ///
    /// In the half-open state only the first caller gets the trial.
    pub fn allow(&self, now: DateTime<Utc>) -> bool {
        match self.state(now) {
            BreakerState::Closed => true,
            BreakerState::Open => false,
            BreakerState::HalfOpen => {
                let now_ms = now.timestamp_millis();
                let current = self.trial_started_ms.load(Ordering::Acquire);
                if current != NO_TRIAL {
                    if now_ms - current < self.cooldown.num_milliseconds() {
                        return false;
                    }
                    warn!(breaker_state = %BreakerState::HalfOpen, "half-open trial never reported back, handing out another");
                }
                self.trial_started_ms
                    .compare_exchange(current, now_ms, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
            }
        }
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        let previous = self.consecutive_failures.swap(0, Ordering::Relaxed);
        self.trial_started_ms.store(NO_TRIAL, Ordering::Relaxed);
        if previous >= self.threshold {
            info!(breaker_state = %BreakerState::Closed, "circuit breaker closed after successful trial");
        }
    }

    /// Record a failed call at `now`; trips the breaker at the threshold.
    pub fn record_failure(&self, now: DateTime<Utc>) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        let was_trial = self.trial_started_ms.swap(NO_TRIAL, Ordering::Relaxed) != NO_TRIAL;
        if failures == self.threshold || (failures > self.threshold && was_trial) {
            self.tripped_at_ms.store(now.timestamp_millis(), Ordering::Relaxed);
            self.trips.fetch_add(1, Ordering::Relaxed);
            warn!(
                breaker_state = %BreakerState::Open,
                failures,
                cooldown_secs = self.cooldown.num_seconds(),
                "circuit breaker tripped"
            );
        }
    }

    /// Consecutive failures since the last success.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    /// Times the breaker has tripped.
    pub fn trips(&self) -> u64 {
        self.trips.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trips_and_recovers() {
        let breaker = CircuitBreaker::new(3, 60);
        let t0 = Utc::now();
        for _ in 0..2 {
            breaker.record_failure(t0);
        }
        assert_eq!(breaker.state(t0), BreakerState::Closed);
        breaker.record_failure(t0);
        assert_eq!(breaker.state(t0), BreakerState::Open);
        assert!(!breaker.allow(t0 + Duration::seconds(30)));

        let later = t0 + Duration::seconds(61);
        assert_eq!(breaker.state(later), BreakerState::HalfOpen);
        assert!(breaker.allow(later));
        assert!(!breaker.allow(later), "only one trial");

        breaker.record_success();
        assert_eq!(breaker.state(later), BreakerState::Closed);
        assert_eq!(breaker.trips(), 1);
    }

    #[test]
    fn test_failed_trial_reopens() {
        let breaker = CircuitBreaker::new(2, 10);
        let t0 = Utc::now();
        breaker.record_failure(t0);
        breaker.record_failure(t0);
        let trial_at = t0 + Duration::seconds(11);
        assert!(breaker.allow(trial_at));
        breaker.record_failure(trial_at);
        assert_eq!(breaker.state(trial_at + Duration::seconds(5)), BreakerState::Open);
        assert_eq!(breaker.trips(), 2);
    }

    #[test]
    fn test_abandoned_trial_expires() {
        let breaker = CircuitBreaker::new(2, 10);
        let t0 = Utc::now();
        breaker.record_failure(t0);
        breaker.record_failure(t0);

        let trial_at = t0 + Duration::seconds(11);
        assert!(breaker.allow(trial_at));
        // The trial's call is dropped without reporting.
        assert!(!breaker.allow(trial_at + Duration::seconds(5)));
        assert!(breaker.allow(trial_at + Duration::seconds(10)));

        breaker.record_success();
        assert_eq!(breaker.state(trial_at + Duration::seconds(10)), BreakerState::Closed);
    }

    #[test]
    fn test_success_resets_counter() {
        let breaker = CircuitBreaker::new(3, 60);
        let t0 = Utc::now();
        breaker.record_failure(t0);
        breaker.record_failure(t0);
        breaker.record_success();
        breaker.record_failure(t0);
        assert_eq!(breaker.consecutive_failures(), 1);
        assert_eq!(breaker.state(t0), BreakerState::Closed);
    }
}
