/// Integration tests for the memory pipeline.
///
/// These drive the engine through its public API with a manual clock so
/// every time-based transition is deterministic.
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use koru_recall::memory::EpisodeClusterer;
use koru_recall::prelude::*;
use koru_recall::reliability::{BreakerState, ReliabilityConfig};
use koru_recall::store::WorkingEventKind;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()
}

struct Harness {
    engine: RecallEngine,
    clock: Arc<ManualClock>,
    feed: Arc<VecFeed>,
}

fn harness_with(config: RecallConfig, service: Option<Arc<dyn EnrichmentService>>) -> Harness {
    let clock = Arc::new(ManualClock::new(t0()));
    let feed = Arc::new(VecFeed::new());
    let mut builder = RecallEngine::builder(config)
        .clock(Arc::clone(&clock) as SharedClock)
        .feed(Arc::clone(&feed) as Arc<dyn SourceFeed>);
    if let Some(service) = service {
        builder = builder.enrichment(service);
    }
    Harness {
        engine: builder.build().unwrap(),
        clock,
        feed,
    }
}

fn harness() -> Harness {
    harness_with(RecallConfig::default(), None)
}

fn fast_reliability() -> ReliabilityConfig {
    ReliabilityConfig {
        base_delay_ms: 1,
        max_delay_ms: 2,
        ..ReliabilityConfig::default()
    }
}

// ============================================================================
// Scenario A: capacity and deterministic ranking
// ============================================================================

#[tokio::test]
async fn test_scenario_a_ten_arrivals_capacity_seven() {
    let h = harness();
    for i in 0..10 {
        h.feed
            .push_content(format!("arrival number {i}"), t0() + Duration::seconds(12 * i));
    }
    h.clock.set(t0() + Duration::minutes(2));

    let report = h.engine.run_working_tick(32).await.unwrap();
    assert_eq!(report.records_read, 10);
    assert_eq!(report.newly_admitted, 7);
    assert_eq!(report.exits, 3);
    assert_eq!(report.resident, 7);

    let wm = h.engine.store().load_working().await.unwrap().state;
    assert_eq!(wm.residents().count(), 7);

    // Equal initial strength: older arrivals have decayed further and exit.
    let mut exited: Vec<String> = wm
        .outbox
        .iter()
        .filter(|e| e.kind == WorkingEventKind::Exited)
        .map(|e| e.item.id.clone())
        .collect();
    exited.sort();
    assert_eq!(exited, vec!["rec-00000000", "rec-00000001", "rec-00000002"]);
    assert!(wm
        .outbox
        .iter()
        .filter(|e| e.kind == WorkingEventKind::Exited)
        .all(|e| e.item.tier == MemoryTier::ShortTerm));
}

#[tokio::test]
async fn test_higher_ranked_arrival_evicts_lowest_incumbent() {
    let h = harness();
    for i in 0..7 {
        h.feed.push(RawRecord {
            activation: Some(0.7 + 0.01 * i as f64),
            ..RawRecord::new(0, format!("incumbent {i}"), t0())
        });
    }
    h.engine.run_working_tick(32).await.unwrap();

    h.feed.push(RawRecord {
        activation: Some(0.95),
        ..RawRecord::new(0, "strong newcomer", t0())
    });
    let report = h.engine.run_working_tick(32).await.unwrap();
    assert_eq!(report.newly_admitted, 1);
    assert_eq!(report.exits, 1);

    let wm = h.engine.store().load_working().await.unwrap().state;
    assert_eq!(wm.residents().count(), 7);
    assert!(wm.items.contains_key("rec-00000007"));
    assert!(!wm.items.contains_key("rec-00000000"));
}

// ============================================================================
// Scenario B: temporal boundaries
// ============================================================================

#[tokio::test]
async fn test_scenario_b_forty_minute_gap_splits_episodes() {
    let h = harness();
    h.feed.push_content("first thought about gardens", t0());
    h.engine.run_working_tick(32).await.unwrap();
    h.engine.run_short_term_tick().await.unwrap();

    h.clock.advance(Duration::minutes(40));
    h.feed.push_content("second thought about gardens", h.clock.now());
    h.engine.run_working_tick(32).await.unwrap();
    let report = h.engine.run_short_term_tick().await.unwrap();
    assert_eq!(report.episodes_opened, 1);

    let stm = h.engine.store().load_short_term().await.unwrap().state;
    assert_eq!(stm.ledger.episodes.len(), 2);
    assert!(stm.ledger.episodes[0].sealed);
    assert_ne!(
        stm.ledger.item_index["rec-00000000"],
        stm.ledger.item_index["rec-00000001"]
    );
}

#[tokio::test]
async fn test_clusterer_classifies_dense_burst_as_high() {
    let h = harness();
    for i in 0..4 {
        h.feed
            .push_content(format!("dense burst {i}"), t0() + Duration::seconds(30 * i));
    }
    h.engine.run_working_tick(32).await.unwrap();
    h.engine.run_short_term_tick().await.unwrap();

    let stm = h.engine.store().load_short_term().await.unwrap().state;
    assert_eq!(stm.ledger.episodes.len(), 1);
    let clusterer = EpisodeClusterer::new(h.engine.config().episodic.clone());
    assert_eq!(
        clusterer.classify(&stm.ledger.episodes[0]),
        koru_recall::CoherenceClass::High
    );
}

// ============================================================================
// Scenario C: minimum age
// ============================================================================

#[tokio::test]
async fn test_scenario_c_young_episode_never_consolidates() {
    let h = harness();
    for i in 0..3 {
        h.feed.push(RawRecord {
            activation: Some(1.0),
            ..RawRecord::new(0, format!("vivid memory {i}"), t0())
        });
    }
    h.engine.run_working_tick(32).await.unwrap();
    h.engine.run_short_term_tick().await.unwrap();

    // Sealed after the idle gap but still younger than the minimum age.
    h.clock.advance(Duration::minutes(35));
    h.engine.run_short_term_tick().await.unwrap();
    let report = h.engine.run_consolidation_tick(false).await.unwrap();
    assert_eq!(report.promoted, 0);
    assert_eq!(report.schematized, 0);

    let stm = h.engine.store().load_short_term().await.unwrap().state;
    assert!(stm.ledger.episodes[0].sealed);
    assert_eq!(stm.ledger.episodes[0].readiness, Readiness::Fragmentary);
}

// ============================================================================
// Scenario D: malformed enrichment trips the breaker
// ============================================================================

/// Extraction always returns garbage; embedding works.
struct Garbage {
    extract_calls: AtomicU32,
}

#[async_trait]
impl EnrichmentService for Garbage {
    async fn summarize_or_extract(&self, _text: &str) -> Result<String, ServiceError> {
        self.extract_calls.fetch_add(1, Ordering::SeqCst);
        Ok("Sorry, I cannot help with that".into())
    }

    async fn embed(&self, _text: &str) -> Result<Vec<f32>, ServiceError> {
        Ok(vec![0.125; 64])
    }

    fn name(&self) -> &str {
        "garbage"
    }
}

#[tokio::test]
async fn test_scenario_d_malformed_responses_open_breaker() {
    let service = Arc::new(Garbage {
        extract_calls: AtomicU32::new(0),
    });
    let config = RecallConfig {
        reliability: fast_reliability(),
        ..RecallConfig::default()
    };
    let h = harness_with(config, Some(Arc::clone(&service) as Arc<dyn EnrichmentService>));
    for i in 0..7 {
        h.feed
            .push_content(format!("kubernetes cluster upgrade note {i}"), t0());
    }

    let report = h.engine.run_working_tick(32).await.unwrap();
    assert_eq!(report.dead_lettered, 0);
    assert_eq!(report.fallbacks, 7);
    assert_eq!(report.newly_admitted, 7);

    // Five malformed responses, then the open breaker short-circuits.
    assert_eq!(service.extract_calls.load(Ordering::SeqCst), 5);

    let health = h.engine.health().await.unwrap();
    assert_eq!(health.reliability.breaker_state, Some(BreakerState::Open));
    assert_eq!(health.reliability.malformed, 5);
    assert_eq!(health.status, HealthStatus::Degraded);

    // Items past the trip carry lexical concepts.
    let wm = h.engine.store().load_working().await.unwrap().state;
    assert!(wm.items["rec-00000006"].concepts.contains("kubernetes"));
    assert!(wm.items["rec-00000000"].concepts.is_empty());
}

// ============================================================================
// Reliability: dead letters
// ============================================================================

/// Refuses connections until switched on.
struct Flaky {
    healthy: AtomicBool,
}

#[async_trait]
impl EnrichmentService for Flaky {
    async fn summarize_or_extract(&self, _text: &str) -> Result<String, ServiceError> {
        if !self.healthy.load(Ordering::SeqCst) {
            return Err(ServiceError::Unavailable("connection refused".into()));
        }
        Ok(r#"{"concepts": ["postgres", "replication"], "summary": "db note"}"#.into())
    }

    async fn embed(&self, _text: &str) -> Result<Vec<f32>, ServiceError> {
        Ok(vec![0.0; 64])
    }
}

#[tokio::test]
async fn test_outage_parks_item_and_recovers_next_tick() {
    let service = Arc::new(Flaky {
        healthy: AtomicBool::new(false),
    });
    let config = RecallConfig {
        reliability: fast_reliability(),
        ..RecallConfig::default()
    };
    let h = harness_with(config, Some(Arc::clone(&service) as Arc<dyn EnrichmentService>));
    h.feed.push_content("replication lag on the primary", t0());

    let report = h.engine.run_working_tick(32).await.unwrap();
    assert_eq!(report.dead_lettered, 1);
    assert_eq!(report.resident, 0);
    assert_eq!(h.engine.health().await.unwrap().dead_letters, 1);

    service.healthy.store(true, Ordering::SeqCst);
    let report = h.engine.run_working_tick(32).await.unwrap();
    assert_eq!(report.dead_letters_recovered, 1);
    assert_eq!(report.newly_admitted, 1);

    let wm = h.engine.store().load_working().await.unwrap().state;
    assert!(wm.dead_letters.is_empty());
    let item = &wm.items["rec-00000000"];
    assert!(item.concepts.contains("postgres"));
    assert_eq!(item.summary.as_deref(), Some("db note"));
}

// ============================================================================
// End to end
// ============================================================================

#[tokio::test]
async fn test_burst_consolidates_into_association_graph() {
    let h = harness();
    for i in 0..4 {
        h.feed.push_content(
            format!("sourdough starter fermentation flour water batch {i}"),
            t0() + Duration::seconds(20 * i),
        );
    }
    h.engine.run_working_tick(32).await.unwrap();
    h.engine.run_short_term_tick().await.unwrap();

    // Items decay out of WM; the idle episode is sealed.
    h.clock.advance(Duration::minutes(35));
    let wm_report = h.engine.run_working_tick(32).await.unwrap();
    assert_eq!(wm_report.exits, 4);
    h.engine.run_short_term_tick().await.unwrap();

    // Old enough: high coherence is fast-tracked to schematized.
    h.clock.advance(Duration::minutes(30));
    let report = h.engine.run_consolidation_tick(true).await.unwrap();
    assert_eq!(report.schematized, 1);
    assert_eq!(report.items_promoted, 4);
    assert!(report.hebbian_pairs > 0);

    let ltm = h.engine.store().load_long_term().await.unwrap().state;
    assert_eq!(ltm.episodes.len(), 1);
    assert_eq!(ltm.items.len(), 4);
    assert!(ltm.items.values().all(|i| i.tier == MemoryTier::LongTerm));
    assert!(ltm.graph.has_edge("sourdough", "fermentation"));
    assert!(ltm.graph.edges().all(|e| (0.0..=1.0).contains(&e.weight)));
    assert!(ltm.graph.nodes().any(|n| n.degree > 0));

    // Running the gate again leaves the schematized episode untouched.
    let again = h.engine.run_consolidation_tick(false).await.unwrap();
    assert_eq!(again.schematized, 0);
    assert_eq!(again.items_promoted, 0);
    let stm = h.engine.store().load_short_term().await.unwrap().state;
    assert!(stm.items.is_empty());

    // WM trims events STM has consumed on its next tick.
    h.engine.run_working_tick(32).await.unwrap();
    let health = h.engine.health().await.unwrap();
    assert_eq!(health.populations.long_term_items, 4);
    assert_eq!(health.populations.episodes_schematized, 1);
    assert!(health.populations.concepts > 0);
    assert_eq!(health.outbox_depth, 0);
}

#[tokio::test]
async fn test_unrehearsed_episode_is_discarded_and_retired() {
    let h = harness();
    h.feed.push_content("a lonely singleton observation", t0());
    h.engine.run_working_tick(32).await.unwrap();
    h.engine.run_short_term_tick().await.unwrap();

    h.clock.advance(Duration::hours(1));
    h.engine.run_working_tick(32).await.unwrap();
    h.engine.run_short_term_tick().await.unwrap();

    h.clock.advance(Duration::hours(48));
    let report = h.engine.run_consolidation_tick(false).await.unwrap();
    assert_eq!(report.discarded, 1);
    assert_eq!(report.items_retired, 1);

    let health = h.engine.health().await.unwrap();
    assert_eq!(health.populations.episodes_discarded, 1);
    assert_eq!(health.populations.short_term_items, 0);
    assert_eq!(health.counters.items_retired, 1);
}

#[tokio::test]
async fn test_retire_request_reaches_working_memory() {
    let h = harness();
    h.feed.push_content("still resident item", t0());
    h.engine.run_working_tick(32).await.unwrap();

    let stm = h.engine.store().load_short_term().await.unwrap();
    let mut state = stm.state;
    state.request_retire("rec-00000000".into(), "episode-x".into());
    h.engine
        .store()
        .commit_short_term(stm.version, state)
        .await
        .unwrap();

    let report = h.engine.run_working_tick(32).await.unwrap();
    assert_eq!(report.retire_requests_applied, 1);
    let wm = h.engine.store().load_working().await.unwrap().state;
    assert!(wm.items.is_empty());
    assert_eq!(wm.retire_cursor, 1);

    // STM drops the request once WM has committed past it.
    h.engine.run_short_term_tick().await.unwrap();
    let stm = h.engine.store().load_short_term().await.unwrap().state;
    assert!(stm.retire_requests.is_empty());
}

#[tokio::test]
async fn test_decay_and_homeostasis_keep_weights_bounded() {
    let h = harness();
    for i in 0..3 {
        h.feed
            .push_content(format!("glacier ice meltwater river {i}"), t0());
    }
    h.engine.run_working_tick(32).await.unwrap();
    h.engine.run_short_term_tick().await.unwrap();
    h.clock.advance(Duration::minutes(35));
    h.engine.run_working_tick(32).await.unwrap();
    h.engine.run_short_term_tick().await.unwrap();
    h.clock.advance(Duration::minutes(30));
    h.engine.run_consolidation_tick(false).await.unwrap();

    let before = h.engine.store().load_long_term().await.unwrap().state;
    let w0 = before.graph.weight("glacier", "meltwater");
    assert!(w0 > 0.0);

    h.clock.advance(Duration::hours(24));
    let decay = h.engine.run_decay_pass().await.unwrap();
    assert!(decay.edges_decayed > 0);
    let after = h.engine.store().load_long_term().await.unwrap().state;
    assert!(after.graph.weight("glacier", "meltwater") < w0);

    h.engine.run_homeostasis().await.unwrap();
    let scaled = h.engine.store().load_long_term().await.unwrap().state;
    assert!(scaled.graph.edges().all(|e| (0.0..=1.0).contains(&e.weight)));
    assert_eq!(h.engine.counters().homeostasis_runs, 1);
}

#[tokio::test]
async fn test_invalid_records_are_skipped() {
    let h = harness();
    h.feed.push(RawRecord {
        content: None,
        ..RawRecord::new(0, "", t0())
    });
    h.feed.push(RawRecord {
        created_at: None,
        ..RawRecord::new(0, "no timestamp", t0())
    });
    h.feed.push_content("a valid record", t0());

    let report = h.engine.run_working_tick(32).await.unwrap();
    assert_eq!(report.records_read, 3);
    assert_eq!(report.invalid, 2);
    assert_eq!(report.resident, 1);

    // The cursor moved past the invalid records.
    let wm = h.engine.store().load_working().await.unwrap().state;
    assert_eq!(wm.feed_cursor, 3);
}
