/// Scheduler: one periodic tokio task per tick stream.
///
/// The scheduler owns no memory state. It decides *when* each tier ticks
/// (circadian phase, deep hours, weekly homeostasis, failure backoff) and
/// calls the matching [`RecallEngine`] step:
///
/// | Stream        | Interval                    | Step                          |
/// |---------------|-----------------------------|-------------------------------|
/// | wm            | 5s awake / 60s asleep       | `run_working_tick(batch)`     |
/// | stm           | 5 min                       | `run_short_term_tick()`       |
/// | consolidation | hourly, deep at sleep hours | `run_consolidation_tick(deep)`|
/// | homeostasis   | checked hourly, runs weekly | `run_homeostasis()`           |
/// | decay         | 10 min                      | `run_decay_pass()`            |
///
/// Ticks within one stream never overlap: each task awaits its tick before
/// sleeping again. Shutdown stops new ticks, waits for in-flight ticks up
/// to `shutdown_grace_ms` and then aborts what is left.
pub mod cadence;
pub mod circadian;

pub use cadence::{Cadence, StreamState, TickKind};
pub use circadian::{Circadian, Phase, ScheduleConfig};

use chrono::{DateTime, TimeZone, Utc};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::engine::{RecallEngine, TickReport};
use crate::error::{RecallError, RecallResult};
use crate::health::HealthReport;

const NEVER: i64 = i64::MIN;

struct Shared {
    engine: RecallEngine,
    circadian: Circadian,
    cadence: Cadence,
    shutdown: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    /// Millis of the last homeostasis run, `NEVER` if none
    last_homeostasis: AtomicI64,
}

impl Shared {
    fn last_homeostasis(&self) -> Option<DateTime<Utc>> {
        match self.last_homeostasis.load(Ordering::Relaxed) {
            NEVER => None,
            ms => Utc.timestamp_millis_opt(ms).single(),
        }
    }

    /// Run one tick of `kind`. Scheduled homeostasis only runs when due.
    async fn run(&self, kind: TickKind, forced: bool) -> RecallResult<TickReport> {
        let engine = &self.engine;
        let now = engine.clock().now();
        let report = match kind {
            TickKind::Working => {
                let phase = self.circadian.phase(now);
                self.cadence
                    .set_nominal(kind, self.circadian.wm_interval(phase).as_secs());
                let batch = self.circadian.batch_size(phase);
                TickReport::Working(engine.run_working_tick(batch).await?)
            }
            TickKind::ShortTerm => TickReport::ShortTerm(engine.run_short_term_tick().await?),
            TickKind::Consolidation => {
                let deep = self.circadian.is_deep_hour(now);
                TickReport::Consolidation(engine.run_consolidation_tick(deep).await?)
            }
            TickKind::Homeostasis => {
                if !forced && !self.circadian.homeostasis_due(now, self.last_homeostasis()) {
                    return Ok(TickReport::Idle);
                }
                let r = engine.run_homeostasis().await?;
                self.last_homeostasis
                    .store(now.timestamp_millis(), Ordering::Relaxed);
                info!(mean_before = r.mean_before, mean_after = r.mean_after, scale = r.scale, "synaptic homeostasis");
                TickReport::Homeostasis {
                    mean_before: r.mean_before,
                    mean_after: r.mean_after,
                    scale: r.scale,
                }
            }
            TickKind::Decay => {
                let r = engine.run_decay_pass().await?;
                TickReport::Decay {
                    edges_decayed: r.edges_decayed,
                    edges_pruned: r.edges_pruned,
                }
            }
        };
        Ok(report)
    }

    /// Run a tick and record the outcome on the stream.
    async fn tick(&self, kind: TickKind, forced: bool) -> RecallResult<TickReport> {
        let result = self.run(kind, forced).await;
        let now = self.engine.clock().now();
        match &result {
            Ok(_) => self.cadence.record_success(kind, now),
            Err(e) => {
                let factor = self.cadence.record_failure(kind, &e.to_string(), now);
                warn!(stream = %kind, error = %e, backoff = factor, "tick failed");
            }
        }
        result
    }
}

/// Builds and starts the tick tasks.
pub struct Scheduler {
    engine: RecallEngine,
    config: ScheduleConfig,
}

impl Scheduler {
    /// A scheduler for `engine` using the engine's schedule configuration.
    pub fn new(engine: RecallEngine) -> Self {
        let config = engine.config().schedule.clone();
        Self { engine, config }
    }

    /// Override the schedule configuration.
    pub fn with_config(mut self, config: ScheduleConfig) -> Self {
        self.config = config;
        self
    }

    /// Spawn one task per stream and return the control handle.
    ///
    /// Must be called from inside a tokio runtime.
    pub fn start(self) -> SchedulerHandle {
        let now = self.engine.clock().now();
        let (shutdown_tx, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            cadence: Cadence::new(&self.config, now),
            circadian: Circadian::new(self.config),
            engine: self.engine,
            shutdown: AtomicBool::new(false),
            shutdown_tx,
            last_homeostasis: AtomicI64::new(NEVER),
        });

        info!(phase = %shared.circadian.phase(now), "starting scheduler");
        let tasks = TickKind::ALL
            .into_iter()
            .map(|kind| spawn_stream(Arc::clone(&shared), kind))
            .collect();

        SchedulerHandle {
            shared,
            tasks: Arc::new(Mutex::new(tasks)),
        }
    }
}

fn spawn_stream(shared: Arc<Shared>, kind: TickKind) -> JoinHandle<()> {
    let mut shutdown_rx = shared.shutdown_tx.subscribe();
    tokio::spawn(async move {
        loop {
            if shared.shutdown.load(Ordering::Relaxed) {
                break;
            }
            if let Ok(report) = shared.tick(kind, false).await {
                debug!(stream = %kind, ?report, "tick complete");
            }

            let wait = shared.cadence.effective_interval(kind);
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown_rx.changed() => break,
            }
        }
        debug!(stream = %kind, "stream stopped");
    })
}

/// Control handle for a running scheduler. Cheap to clone.
#[derive(Clone)]
pub struct SchedulerHandle {
    shared: Arc<Shared>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl std::fmt::Debug for SchedulerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerHandle")
            .field("shutting_down", &self.is_shutting_down())
            .finish_non_exhaustive()
    }
}

impl SchedulerHandle {
    pub fn engine(&self) -> &RecallEngine {
        &self.shared.engine
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.shutdown.load(Ordering::Relaxed)
    }

    /// Run one tick of `kind` now, outside its cadence.
    ///
    /// Serializes with the scheduled ticks of the same tier.
    pub async fn force_tick(&self, kind: TickKind) -> RecallResult<TickReport> {
        if self.is_shutting_down() {
            return Err(RecallError::Shutdown);
        }
        info!(stream = %kind, "forced tick");
        self.shared.tick(kind, true).await
    }

    /// Current phase of the day.
    pub fn phase(&self) -> Phase {
        self.shared
            .circadian
            .phase(self.shared.engine.clock().now())
    }

    /// Stream states.
    pub fn streams(&self) -> Vec<StreamState> {
        self.shared.cadence.snapshot()
    }

    /// Engine health plus stream states and stale warnings.
    pub async fn health(&self) -> RecallResult<HealthReport> {
        Ok(self.shared.engine.health().await?.with_streams(self.streams()))
    }

    /// Stop new ticks, drain in-flight ticks up to the grace period, then
    /// abort the rest. Returns whether every task finished in time.
    pub async fn shutdown(&self) -> bool {
        if self.shared.shutdown.swap(true, Ordering::Relaxed) {
            return true;
        }
        info!("scheduler shutting down");
        self.shared.shutdown_tx.send_replace(true);

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock().await);
        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
        let grace = std::time::Duration::from_millis(self.shared.circadian.config().shutdown_grace_ms);

        match tokio::time::timeout(grace, futures::future::join_all(handles)).await {
            Ok(_) => {
                info!("scheduler stopped");
                true
            }
            Err(_) => {
                warn!(grace_ms = grace.as_millis() as u64, "grace period elapsed, aborting in-flight ticks");
                for abort in aborts {
                    abort.abort();
                }
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::RecallConfig;
    use crate::feed::VecFeed;
    use chrono::TimeZone;

    fn engine_at(hour: u32) -> (RecallEngine, Arc<VecFeed>) {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 2, hour, 0, 0).unwrap()));
        let feed = Arc::new(VecFeed::new());
        let engine = RecallEngine::builder(RecallConfig::default())
            .clock(clock)
            .feed(Arc::clone(&feed) as Arc<dyn crate::feed::SourceFeed>)
            .build()
            .unwrap();
        (engine, feed)
    }

    #[tokio::test]
    async fn test_force_tick_refused_after_shutdown() {
        let (engine, feed) = engine_at(10);
        feed.push_content("forced tick content", engine.clock().now());
        let handle = Scheduler::new(engine).start();
        handle.shutdown().await;

        // Forced ticks are refused after shutdown.
        assert!(matches!(handle.force_tick(TickKind::Working).await, Err(RecallError::Shutdown)));
    }

    #[tokio::test]
    async fn test_streams_start_and_stop() {
        let (engine, feed) = engine_at(10);
        feed.push_content("scheduled content", engine.clock().now());
        let handle = Scheduler::new(engine).start();

        // Every stream ticks once on start.
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        let wm = handle
            .streams()
            .into_iter()
            .find(|s| s.kind == TickKind::Working)
            .unwrap();
        assert!(wm.runs >= 1);
        assert_eq!(handle.phase(), Phase::Awake);

        let health = handle.health().await.unwrap();
        assert_eq!(health.streams.len(), TickKind::ALL.len());
        assert_eq!(health.populations.working, 1);

        assert!(handle.shutdown().await);
        assert!(handle.is_shutting_down());
    }

    #[tokio::test]
    async fn test_feed_outage_backs_off_wm_stream() {
        let (engine, feed) = engine_at(10);
        feed.set_available(false);
        let handle = Scheduler::new(engine.clone()).start();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        handle.force_tick(TickKind::Working).await.unwrap_err();
        handle.force_tick(TickKind::Working).await.unwrap_err();
        let wm = handle
            .streams()
            .into_iter()
            .find(|s| s.kind == TickKind::Working)
            .unwrap();
        assert!(wm.backoff_factor > 1);
        assert!(wm.last_error.unwrap().contains("unavailable"));

        feed.set_available(true);
        handle.force_tick(TickKind::Working).await.unwrap();
        let wm = handle
            .streams()
            .into_iter()
            .find(|s| s.kind == TickKind::Working)
            .unwrap();
        assert_eq!(wm.backoff_factor, 1);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_homeostasis_waits_for_window() {
        let (engine, _feed) = engine_at(10);
        let handle = Scheduler::new(engine).start();
        // A Monday morning: scheduled pass is idle, a forced pass runs.
        assert!(matches!(
            handle.shared.run(TickKind::Homeostasis, false).await.unwrap(),
            TickReport::Idle
        ));
        assert!(matches!(
            handle.force_tick(TickKind::Homeostasis).await.unwrap(),
            TickReport::Homeostasis { .. }
        ));
        handle.shutdown().await;
    }
}
