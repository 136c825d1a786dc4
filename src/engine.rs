/// The recall engine: per-tier batch steps over versioned snapshots.
///
/// Each step follows the same shape:
///
/// 1. Take the tier's tick lock (ticks of one tier never overlap)
/// 2. Load the tier's committed snapshot, plus read-only committed
///    snapshots of neighbouring tiers' mailboxes
/// 3. Compute the next state with the pure components
/// 4. Commit against the loaded version
///
/// Locks are always taken in WM < STM < LTM order. A fatal error halts only
/// the tier it belongs to; the other tiers keep ticking.
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::clock::{SharedClock, SystemClock};
use crate::config::RecallConfig;
use crate::error::{RecallError, RecallResult, TierKind};
use crate::feed::{FeedError, SourceFeed, VecFeed};
use crate::health::{HaltedTier, HealthReport, TierPopulations};
use crate::memory::{region_summaries, AdmissionSelector, AssociationBuilder, DecayReport, EpisodeClusterer, HomeostasisReport};
use crate::processes::{ConsolidationGate, InterferenceReport, InterferenceResolver};
use crate::reliability::{EnrichmentResult, EnrichmentService, LexicalEnricher, ReliableEnricher};
use crate::store::{MemoryStore, TierStore, WorkingEventKind};
use crate::types::{clamp_corrections, EpisodeId, ItemId, MemoryItem, MemoryTier, Readiness};

/// Result of a working-memory tick.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkingTickReport {
    pub records_read: usize,
    pub invalid: usize,
    pub duplicates: usize,
    pub dead_lettered: usize,
    pub dead_letters_recovered: usize,
    pub fallbacks: usize,
    pub accesses_applied: usize,
    pub retire_requests_applied: usize,
    pub resident: usize,
    pub newly_admitted: usize,
    pub exits: usize,
    pub retained: usize,
    pub forgotten: usize,
    pub version: u64,
}

/// Result of a short-term clustering tick.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShortTermTickReport {
    pub events_consumed: usize,
    pub items_received: usize,
    pub appended: usize,
    pub episodes_opened: usize,
    pub episodes_sealed: usize,
    pub version: u64,
}

/// Result of a consolidation tick.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConsolidationTickReport {
    pub deep: bool,
    pub interference: InterferenceReport,
    pub promoted: usize,
    pub lapsed: usize,
    pub schematized: usize,
    pub discarded: usize,
    pub hebbian_pairs: usize,
    pub items_promoted: usize,
    pub items_retired: usize,
    pub retire_requests: usize,
    pub episodes_pruned: usize,
    pub stm_version: u64,
    pub ltm_version: u64,
}

/// Result of any tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TickReport {
    Working(WorkingTickReport),
    ShortTerm(ShortTermTickReport),
    Consolidation(ConsolidationTickReport),
    Homeostasis { mean_before: f64, mean_after: f64, scale: f64 },
    Decay { edges_decayed: usize, edges_pruned: usize },
    /// The tick found nothing due
    Idle,
}

/// Lifetime engine counters.
#[derive(Debug, Default)]
struct EngineStats {
    wm_ticks: AtomicU64,
    stm_ticks: AtomicU64,
    consolidation_ticks: AtomicU64,
    homeostasis_runs: AtomicU64,
    decay_passes: AtomicU64,
    feed_skips: AtomicU64,
    items_ingested: AtomicU64,
    items_invalid: AtomicU64,
    items_admitted: AtomicU64,
    wm_exits: AtomicU64,
    items_forgotten: AtomicU64,
    dead_lettered: AtomicU64,
    episodes_opened: AtomicU64,
    episodes_schematized: AtomicU64,
    episodes_discarded: AtomicU64,
    items_promoted: AtomicU64,
    items_retired: AtomicU64,
    hebbian_updates: AtomicU64,
    edges_pruned: AtomicU64,
}

/// Serializable copy of the engine counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineCounters {
    pub wm_ticks: u64,
    pub stm_ticks: u64,
    pub consolidation_ticks: u64,
    pub homeostasis_runs: u64,
    pub decay_passes: u64,
    pub feed_skips: u64,
    pub items_ingested: u64,
    pub items_invalid: u64,
    pub items_admitted: u64,
    pub wm_exits: u64,
    pub items_forgotten: u64,
    pub dead_lettered: u64,
    pub episodes_opened: u64,
    pub episodes_schematized: u64,
    pub episodes_discarded: u64,
    pub items_promoted: u64,
    pub items_retired: u64,
    pub hebbian_updates: u64,
    pub edges_pruned: u64,
    pub clamp_corrections: u64,
}

impl EngineStats {
    fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }

    fn snapshot(&self) -> EngineCounters {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        EngineCounters {
            wm_ticks: get(&self.wm_ticks),
            stm_ticks: get(&self.stm_ticks),
            consolidation_ticks: get(&self.consolidation_ticks),
            homeostasis_runs: get(&self.homeostasis_runs),
            decay_passes: get(&self.decay_passes),
            feed_skips: get(&self.feed_skips),
            items_ingested: get(&self.items_ingested),
            items_invalid: get(&self.items_invalid),
            items_admitted: get(&self.items_admitted),
            wm_exits: get(&self.wm_exits),
            items_forgotten: get(&self.items_forgotten),
            dead_lettered: get(&self.dead_lettered),
            episodes_opened: get(&self.episodes_opened),
            episodes_schematized: get(&self.episodes_schematized),
            episodes_discarded: get(&self.episodes_discarded),
            items_promoted: get(&self.items_promoted),
            items_retired: get(&self.items_retired),
            hebbian_updates: get(&self.hebbian_updates),
            edges_pruned: get(&self.edges_pruned),
            clamp_corrections: clamp_corrections(),
        }
    }
}

struct EngineInner {
    config: RecallConfig,
    clock: SharedClock,
    store: Arc<dyn TierStore>,
    feed: Arc<dyn SourceFeed>,
    enricher: ReliableEnricher,
    selector: AdmissionSelector,
    clusterer: EpisodeClusterer,
    resolver: InterferenceResolver,
    gate: ConsolidationGate,
    builder: AssociationBuilder,
    wm_lock: Mutex<()>,
    stm_lock: Mutex<()>,
    ltm_lock: Mutex<()>,
    halted: DashMap<TierKind, String>,
    pending_accesses: DashMap<ItemId, Vec<DateTime<Utc>>>,
    stats: EngineStats,
}

/// Builder for [`RecallEngine`].
pub struct EngineBuilder {
    config: RecallConfig,
    clock: Option<SharedClock>,
    store: Option<Arc<dyn TierStore>>,
    feed: Option<Arc<dyn SourceFeed>>,
    service: Option<Arc<dyn EnrichmentService>>,
}

impl EngineBuilder {
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn store(mut self, store: Arc<dyn TierStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn feed(mut self, feed: Arc<dyn SourceFeed>) -> Self {
        self.feed = Some(feed);
        self
    }

    pub fn enrichment(mut self, service: Arc<dyn EnrichmentService>) -> Self {
        self.service = Some(service);
        self
    }

    /// Validate the configuration and assemble the engine.
    ///
    /// Missing parts default to the system clock, an in-memory store, an
    /// empty in-memory feed and lexical enrichment.
    pub fn build(self) -> RecallResult<RecallEngine> {
        self.config.validate()?;
        let config = self.config;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let service = self.service.unwrap_or_else(|| {
            Arc::new(LexicalEnricher::new(
                config.reliability.fallback_max_concepts,
                config.reliability.embedding_dims,
            ))
        });

        let inner = EngineInner {
            enricher: ReliableEnricher::new(service, config.reliability.clone(), Arc::clone(&clock)),
            selector: AdmissionSelector::new(config.working.clone()),
            clusterer: EpisodeClusterer::new(config.episodic.clone()),
            resolver: InterferenceResolver::new(config.interference.clone()),
            gate: ConsolidationGate::new(config.consolidation.clone()),
            builder: AssociationBuilder::new(config.association.clone()),
            store: self.store.unwrap_or_else(|| Arc::new(MemoryStore::new())),
            feed: self.feed.unwrap_or_else(|| Arc::new(VecFeed::new())),
            clock,
            config,
            wm_lock: Mutex::new(()),
            stm_lock: Mutex::new(()),
            ltm_lock: Mutex::new(()),
            halted: DashMap::new(),
            pending_accesses: DashMap::new(),
            stats: EngineStats::default(),
        };
        Ok(RecallEngine {
            inner: Arc::new(inner),
        })
    }
}

/// Handle to the memory pipeline. Cheap to clone.
#[derive(Clone)]
pub struct RecallEngine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for RecallEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecallEngine")
            .field("feed", &self.inner.feed.name())
            .field("enricher", &self.inner.enricher)
            .finish_non_exhaustive()
    }
}

impl RecallEngine {
    /// Start building an engine.
    pub fn builder(config: RecallConfig) -> EngineBuilder {
        EngineBuilder {
            config,
            clock: None,
            store: None,
            feed: None,
            service: None,
        }
    }

    pub fn config(&self) -> &RecallConfig {
        &self.inner.config
    }

    pub fn clock(&self) -> &SharedClock {
        &self.inner.clock
    }

    pub fn store(&self) -> &Arc<dyn TierStore> {
        &self.inner.store
    }

    /// Queue an access; applied on the next working-memory tick.
    pub fn record_access(&self, item_id: impl Into<ItemId>) {
        let at = self.inner.clock.now();
        self.inner
            .pending_accesses
            .entry(item_id.into())
            .or_default()
            .push(at);
    }

    /// Halt a tier after a fatal error.
    pub fn halt(&self, tier: TierKind, reason: impl Into<String>) {
        let reason = reason.into();
        error!(%tier, reason = %reason, "tier halted");
        self.inner.halted.insert(tier, reason);
    }

    /// Clear a halt (operator action). Returns whether the tier was halted.
    pub fn resume(&self, tier: TierKind) -> bool {
        let was_halted = self.inner.halted.remove(&tier).is_some();
        if was_halted {
            info!(%tier, "tier resumed");
        }
        was_halted
    }

    pub fn is_halted(&self, tier: TierKind) -> bool {
        self.inner.halted.contains_key(&tier)
    }

    fn ensure_running(&self, tier: TierKind) -> RecallResult<()> {
        match self.inner.halted.get(&tier) {
            Some(reason) => Err(RecallError::TierHalted {
                tier,
                reason: reason.value().clone(),
            }),
            None => Ok(()),
        }
    }

    /// Halt the owning tier when `result` carries a fatal error.
    fn guard<T>(&self, fallback_tier: TierKind, result: RecallResult<T>) -> RecallResult<T> {
        if let Err(e) = &result {
            if e.is_fatal() {
                let tier = match e {
                    RecallError::SnapshotMismatch { tier, .. } => *tier,
                    _ => fallback_tier,
                };
                self.halt(tier, e.to_string());
            }
        }
        result
    }

    async fn enrich_item(&self, item: &mut MemoryItem) -> EnrichmentResult<()> {
        match self.inner.enricher.enrich(&item.content).await {
            EnrichmentResult::Success(data) => {
                data.apply_to(item);
                EnrichmentResult::Success(())
            }
            EnrichmentResult::Fallback { data, reason } => {
                data.apply_to(item);
                EnrichmentResult::Fallback { data: (), reason }
            }
            EnrichmentResult::Failed { reason } => EnrichmentResult::Failed { reason },
        }
    }

    /// Working-memory tick: ingest, enrich, admit, emit events.
    pub async fn run_working_tick(&self, batch: usize) -> RecallResult<WorkingTickReport> {
        self.ensure_running(TierKind::Working)?;
        let result = self.working_tick(batch).await;
        self.guard(TierKind::Working, result)
    }

    async fn working_tick(&self, batch: usize) -> RecallResult<WorkingTickReport> {
        let inner = &self.inner;
        let _tick = inner.wm_lock.lock().await;
        let now = inner.clock.now();
        let snapshot = inner.store.load_working().await?;
        let mut state = snapshot.state;
        let mut report = WorkingTickReport::default();

        let limit = inner.config.reliability.feed_timeout();
        let read = tokio::time::timeout(limit, inner.feed.read_batch(state.feed_cursor, batch))
            .await
            .unwrap_or(Err(FeedError::Timeout(limit)));
        let records = match read {
            Ok(records) => records,
            Err(e) => {
                inner.stats.feed_skips.fetch_add(1, Ordering::Relaxed);
                warn!(feed = inner.feed.name(), error = %e, "feed unavailable, skipping tick");
                return Err(e.into());
            }
        };
        report.records_read = records.len();

        // Retire requests committed by short-term memory.
        let stm = inner.store.load_short_term().await?;
        let cursor = state.retire_cursor;
        for request in stm.state.retire_requests.iter().filter(|r| r.seq > cursor) {
            if let Some(mut item) = state.items.remove(&request.item_id) {
                if item.transition(MemoryTier::Retired).is_ok() {
                    state.retired += 1;
                    report.retire_requests_applied += 1;
                    debug!(item_id = %item.id, episode_id = %request.episode_id, "retired on request");
                }
            }
            state.retire_cursor = request.seq;
        }

        let mut arrivals = Vec::new();

        // Dead letters first, oldest first.
        let max_attempts = inner.config.reliability.dead_letter_max_attempts;
        for letter in state.dead_letters.take(batch) {
            let mut item = letter.item.clone();
            match self.enrich_item(&mut item).await {
                EnrichmentResult::Failed { reason } if letter.attempts + 1 < max_attempts => {
                    state.dead_letters.requeue(letter, reason, now);
                }
                EnrichmentResult::Failed { reason } => {
                    warn!(item_id = %item.id, attempts = letter.attempts + 1, reason = %reason, "dead letter out of attempts, using lexical enrichment");
                    if let Some(data) = inner.enricher.give_up(&item.content).into_data() {
                        data.apply_to(&mut item);
                    }
                    report.fallbacks += 1;
                    report.dead_letters_recovered += 1;
                    arrivals.push(item);
                }
                outcome => {
                    if outcome.fallback_reason().is_some() {
                        report.fallbacks += 1;
                    }
                    report.dead_letters_recovered += 1;
                    arrivals.push(item);
                }
            }
        }

        // New records.
        let initial = inner.config.working.initial_activation;
        for record in records {
            state.feed_cursor = state.feed_cursor.max(record.offset + 1);
            let offset = record.offset;
            let mut item = match record.into_item(initial) {
                Ok(item) => item,
                Err(e) => {
                    warn!(offset, error = %e, "skipping invalid record");
                    report.invalid += 1;
                    continue;
                }
            };
            if state.items.contains_key(&item.id) || arrivals.iter().any(|a: &MemoryItem| a.id == item.id) {
                report.duplicates += 1;
                continue;
            }
            match self.enrich_item(&mut item).await {
                EnrichmentResult::Failed { reason } => {
                    warn!(item_id = %item.id, reason = %reason, "enrichment failed, parking item");
                    state.dead_letters.park(item, reason, now);
                    report.dead_lettered += 1;
                }
                outcome => {
                    if outcome.fallback_reason().is_some() {
                        report.fallbacks += 1;
                    }
                    arrivals.push(item);
                }
            }
        }

        // Queued accesses.
        let owned: HashSet<ItemId> = state
            .items
            .keys()
            .cloned()
            .chain(arrivals.iter().map(|a| a.id.clone()))
            .collect();
        let queued: Vec<ItemId> = inner.pending_accesses.iter().map(|e| e.key().clone()).collect();
        let mut accesses = Vec::new();
        for id in queued {
            if let Some((id, times)) = inner.pending_accesses.remove(&id) {
                if owned.contains(&id) {
                    accesses.push((id, times));
                } else {
                    debug!(item_id = %id, "access for item outside working memory ignored");
                }
            }
        }

        let mut candidates: Vec<MemoryItem> = std::mem::take(&mut state.items).into_values().collect();
        candidates.extend(arrivals);
        for (id, times) in accesses {
            if let Some(item) = candidates.iter_mut().find(|c| c.id == id) {
                for at in times {
                    item.record_access(at);
                    report.accesses_applied += 1;
                }
            }
        }

        let outcome = inner.selector.select(candidates, now);
        let newly: HashSet<&ItemId> = outcome.newly_admitted.iter().collect();

        for item in &outcome.admitted {
            if newly.contains(&item.id) {
                state.emit(WorkingEventKind::Admitted, item.clone());
            }
        }
        for item in &outcome.exits {
            state.emit(WorkingEventKind::Exited, item.clone());
        }
        report.resident = outcome.admitted.len();
        report.newly_admitted = outcome.newly_admitted.len();
        report.exits = outcome.exits.len();
        report.retained = outcome.retained.len();
        report.forgotten = outcome.retired.len();
        report.invalid += outcome.rejected.len();
        state.retired += outcome.retired.len() as u64;

        for item in outcome.admitted.into_iter().chain(outcome.retained) {
            state.items.insert(item.id.clone(), item);
        }

        state.trim_outbox(stm.state.wm_cursor);
        if state.outbox.len() > inner.config.working.outbox_limit {
            warn!(depth = state.outbox.len(), "working-memory outbox backing up; short-term memory is lagging");
        }

        report.version = inner.store.commit_working(snapshot.version, state).await?;

        let stats = &inner.stats;
        stats.wm_ticks.fetch_add(1, Ordering::Relaxed);
        EngineStats::add(&stats.items_ingested, report.records_read - report.duplicates);
        EngineStats::add(&stats.items_invalid, report.invalid);
        EngineStats::add(&stats.items_admitted, report.newly_admitted);
        EngineStats::add(&stats.wm_exits, report.exits);
        EngineStats::add(&stats.items_forgotten, report.forgotten);
        EngineStats::add(&stats.dead_lettered, report.dead_lettered);

        info!(
            tier = %TierKind::Working,
            read = report.records_read,
            resident = report.resident,
            admitted = report.newly_admitted,
            exits = report.exits,
            dead_letters = report.dead_lettered,
            version = report.version,
            "working-memory tick"
        );
        Ok(report)
    }

    /// Short-term tick: consume WM events and cluster them into episodes.
    pub async fn run_short_term_tick(&self) -> RecallResult<ShortTermTickReport> {
        self.ensure_running(TierKind::ShortTerm)?;
        let result = self.short_term_tick().await;
        self.guard(TierKind::ShortTerm, result)
    }

    async fn short_term_tick(&self) -> RecallResult<ShortTermTickReport> {
        let inner = &self.inner;
        let _tick = inner.stm_lock.lock().await;
        let now = inner.clock.now();
        let snapshot = inner.store.load_short_term().await?;
        let wm = inner.store.load_working().await?;
        let mut state = snapshot.state;
        let mut report = ShortTermTickReport::default();

        let events: Vec<_> = wm
            .state
            .outbox
            .iter()
            .filter(|e| e.seq > state.wm_cursor)
            .collect();
        if let Some(first) = events.first() {
            if first.seq > state.wm_cursor + 1 {
                warn!(expected = state.wm_cursor + 1, found = first.seq, "gap in working-memory event stream");
            }
        }
        report.events_consumed = events.len();

        let mut seen = HashSet::new();
        let mut to_cluster = Vec::new();
        for event in &events {
            if event.kind == WorkingEventKind::Exited {
                state.items.insert(event.item.id.clone(), event.item.clone());
                report.items_received += 1;
            }
            if seen.insert(event.item.id.clone()) {
                to_cluster.push(&event.item);
            }
            state.wm_cursor = event.seq;
        }

        let (assignments, cluster) = inner.clusterer.ingest(&mut state.ledger, to_cluster);
        for (item_id, assignment) in assignments {
            if let Some(item) = state.items.get_mut(&item_id) {
                item.episode_id = Some(assignment.episode_id().clone());
            }
        }
        // Exits of items clustered on admission in earlier ticks.
        for item in state.items.values_mut().filter(|i| i.episode_id.is_none()) {
            item.episode_id = state.ledger.item_index.get(&item.id).cloned();
        }

        report.appended = cluster.appended;
        report.episodes_opened = cluster.opened.len();
        report.episodes_sealed = cluster.sealed.len();
        if inner.clusterer.seal_idle(&mut state.ledger, now).is_some() {
            report.episodes_sealed += 1;
        }

        state.trim_retire_requests(wm.state.retire_cursor);
        report.version = inner.store.commit_short_term(snapshot.version, state).await?;

        inner.stats.stm_ticks.fetch_add(1, Ordering::Relaxed);
        EngineStats::add(&inner.stats.episodes_opened, report.episodes_opened);
        info!(
            tier = %TierKind::ShortTerm,
            events = report.events_consumed,
            opened = report.episodes_opened,
            sealed = report.episodes_sealed,
            version = report.version,
            "short-term tick"
        );
        Ok(report)
    }

    /// Consolidation tick: interference, gate, Hebbian hand-off, item moves.
    ///
    /// Deep ticks also refresh centrality.
    pub async fn run_consolidation_tick(&self, deep: bool) -> RecallResult<ConsolidationTickReport> {
        self.ensure_running(TierKind::ShortTerm)?;
        self.ensure_running(TierKind::LongTerm)?;
        let result = self.consolidation_tick(deep).await;
        self.guard(TierKind::ShortTerm, result)
    }

    async fn consolidation_tick(&self, deep: bool) -> RecallResult<ConsolidationTickReport> {
        let inner = &self.inner;
        let _stm_tick = inner.stm_lock.lock().await;
        let _ltm_tick = inner.ltm_lock.lock().await;
        let now = inner.clock.now();

        let stm = inner.store.load_short_term().await?;
        let ltm = inner.store.load_long_term().await?;
        let wm = inner.store.load_working().await?;
        let mut state = stm.state;
        let mut long_term = ltm.state;
        let mut report = ConsolidationTickReport {
            deep,
            ..ConsolidationTickReport::default()
        };

        report.interference = inner.resolver.resolve_all(&mut state.ledger, now);
        let gate = inner.gate.evaluate_all(&mut state.ledger, now);
        report.promoted = gate.promoted;
        report.lapsed = gate.lapsed;
        report.schematized = gate.schematized.len();
        report.discarded = gate.discarded.len();

        // A retry after a failed STM commit finds its episodes already archived.
        let archived: HashSet<EpisodeId> = long_term.episodes.iter().map(|e| e.id.clone()).collect();
        for id in &gate.schematized {
            if archived.contains(id) {
                debug!(episode_id = %id, "episode already archived, skipping hand-off");
                continue;
            }
            if let Some(episode) = state.ledger.get(id) {
                let hebbian = inner.builder.consolidate(&mut long_term.graph, episode, now);
                report.hebbian_pairs += hebbian.pairs_updated;
                long_term.episodes.push(episode.clone());
                info!(episode_id = %id, members = episode.len(), pairs = hebbian.pairs_updated, "episode schematized");
            }
        }

        for id in &gate.discarded {
            let Some(episode) = state.ledger.get(id) else {
                continue;
            };
            let members = episode.len();
            let resident: Vec<ItemId> = episode
                .members
                .iter()
                .filter(|m| wm.state.items.contains_key(&m.item_id))
                .map(|m| m.item_id.clone())
                .collect();
            for item_id in resident {
                state.request_retire(item_id, id.clone());
                report.retire_requests += 1;
            }
            info!(episode_id = %id, members, "episode discarded");
        }

        // Move STM-owned items of settled episodes.
        let settled: Vec<(ItemId, Readiness)> = state
            .items
            .keys()
            .filter_map(|item_id| {
                state
                    .ledger
                    .episode_of(item_id)
                    .filter(|e| e.readiness.is_terminal())
                    .map(|e| (item_id.clone(), e.readiness))
            })
            .collect();
        for (item_id, readiness) in settled {
            let Some(mut item) = state.items.remove(&item_id) else {
                continue;
            };
            if readiness == Readiness::Schematized {
                item.transition(MemoryTier::LongTerm)?;
                long_term.items.insert(item_id, item);
                report.items_promoted += 1;
            } else {
                item.transition(MemoryTier::Retired)?;
                state.retired += 1;
                report.items_retired += 1;
            }
        }

        // Items whose episode was pruned before they left WM.
        let orphans: Vec<ItemId> = state
            .items
            .keys()
            .filter(|id| state.ledger.episode_of(id).is_none())
            .cloned()
            .collect();
        if !orphans.is_empty() {
            let archived_members: HashMap<&str, &EpisodeId> = long_term
                .episodes
                .iter()
                .flat_map(|e| e.members.iter().map(move |m| (m.item_id.as_str(), &e.id)))
                .collect();
            let mut promoted = Vec::new();
            for item_id in orphans {
                let Some(item) = state.items.get_mut(&item_id) else {
                    continue;
                };
                if let Some(episode_id) = archived_members.get(item_id.as_str()) {
                    item.episode_id = Some((*episode_id).clone());
                    promoted.push(item_id);
                } else if inner.selector.should_forget(item, now) {
                    if let Some(mut item) = state.items.remove(&item_id) {
                        item.transition(MemoryTier::Retired)?;
                        state.retired += 1;
                        report.items_retired += 1;
                        debug!(item_id = %item.id, "orphaned short-term item forgotten");
                    }
                }
            }
            for item_id in promoted {
                if let Some(mut item) = state.items.remove(&item_id) {
                    item.transition(MemoryTier::LongTerm)?;
                    long_term.items.insert(item_id, item);
                    report.items_promoted += 1;
                }
            }
        }

        let cutoff = now - inner.config.interference.recent_window();
        report.episodes_pruned = state.ledger.prune_settled(cutoff).len();

        if deep {
            inner.builder.recompute_centrality(&mut long_term.graph);
            debug!(concepts = long_term.graph.node_count(), "centrality refreshed");
        }

        report.ltm_version = inner.store.commit_long_term(ltm.version, long_term).await?;
        report.stm_version = inner.store.commit_short_term(stm.version, state).await?;

        let stats = &inner.stats;
        stats.consolidation_ticks.fetch_add(1, Ordering::Relaxed);
        EngineStats::add(&stats.episodes_schematized, report.schematized);
        EngineStats::add(&stats.episodes_discarded, report.discarded);
        EngineStats::add(&stats.items_promoted, report.items_promoted);
        EngineStats::add(&stats.items_retired, report.items_retired);
        EngineStats::add(&stats.hebbian_updates, report.hebbian_pairs);

        info!(
            deep,
            evaluated = report.interference.evaluated,
            schematized = report.schematized,
            discarded = report.discarded,
            promoted_items = report.items_promoted,
            "consolidation tick"
        );
        Ok(report)
    }

    /// Weekly synaptic homeostasis over the concept graph.
    pub async fn run_homeostasis(&self) -> RecallResult<HomeostasisReport> {
        self.ensure_running(TierKind::LongTerm)?;
        let result = async {
            let _tick = self.inner.ltm_lock.lock().await;
            let snapshot = self.inner.store.load_long_term().await?;
            let mut state = snapshot.state;
            let report = self.inner.builder.homeostasis(&mut state.graph);
            self.inner
                .store
                .commit_long_term(snapshot.version, state)
                .await?;
            self.inner.stats.homeostasis_runs.fetch_add(1, Ordering::Relaxed);
            Ok(report)
        }
        .await;
        self.guard(TierKind::LongTerm, result)
    }

    /// Passive decay and pruning of association edges.
    pub async fn run_decay_pass(&self) -> RecallResult<DecayReport> {
        self.ensure_running(TierKind::LongTerm)?;
        let result = async {
            let _tick = self.inner.ltm_lock.lock().await;
            let now = self.inner.clock.now();
            let snapshot = self.inner.store.load_long_term().await?;
            let mut state = snapshot.state;
            let report = self.inner.builder.decay(&mut state.graph, now);
            self.inner
                .store
                .commit_long_term(snapshot.version, state)
                .await?;
            self.inner.stats.decay_passes.fetch_add(1, Ordering::Relaxed);
            EngineStats::add(&self.inner.stats.edges_pruned, report.edges_pruned);
            Ok(report)
        }
        .await;
        self.guard(TierKind::LongTerm, result)
    }

    /// Lifetime counters.
    pub fn counters(&self) -> EngineCounters {
        self.inner.stats.snapshot()
    }

    /// Health report from the committed state of every tier.
    pub async fn health(&self) -> RecallResult<HealthReport> {
        let inner = &self.inner;
        let wm = inner.store.load_working().await?;
        let stm = inner.store.load_short_term().await?;
        let ltm = inner.store.load_long_term().await?;

        let mut populations = TierPopulations {
            incoming: wm.state.items.values().filter(|i| i.tier == MemoryTier::Incoming).count(),
            working: wm.state.residents().count(),
            short_term_items: stm.state.items.len(),
            long_term_items: ltm.state.items.len(),
            concepts: ltm.state.graph.node_count(),
            edges: ltm.state.graph.edge_count(),
            mean_edge_weight: ltm.state.graph.mean_weight(),
            retired: wm.state.retired + stm.state.retired,
            ..TierPopulations::default()
        };
        for episode in &stm.state.ledger.episodes {
            if !episode.sealed {
                populations.episodes_open += 1;
            }
            match episode.readiness {
                Readiness::Fragmentary => populations.episodes_fragmentary += 1,
                Readiness::Consolidating => populations.episodes_consolidating += 1,
                Readiness::Schematized => populations.episodes_schematized += 1,
                Readiness::Discarded => populations.episodes_discarded += 1,
            }
        }

        let halted = inner
            .halted
            .iter()
            .map(|e| HaltedTier {
                tier: *e.key(),
                reason: e.value().clone(),
            })
            .collect();

        Ok(HealthReport::assemble(
            inner.clock.now(),
            populations,
            inner.gate.stats(),
            inner.resolver.stats(),
            inner.enricher.stats(),
            self.counters(),
            wm.state.dead_letters.len(),
            wm.state.outbox.len(),
            stm.state.retire_requests.len(),
            halted,
            region_summaries(&ltm.state.graph),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::{LongTermState, ShortTermState, Versioned, WorkingState};
    use crate::types::{Episode, EpisodeMember};
    use async_trait::async_trait;
    use chrono::{Duration, TimeZone};

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap()
    }

    fn engine(feed: Arc<VecFeed>, clock: Arc<ManualClock>) -> RecallEngine {
        RecallEngine::builder(RecallConfig::default())
            .feed(feed)
            .clock(clock)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_working_tick_admits_and_emits() {
        let clock = Arc::new(ManualClock::new(start()));
        let feed = Arc::new(VecFeed::new());
        for i in 0..3 {
            feed.push_content(format!("rust memory note {i}"), start() + Duration::seconds(i));
        }
        let engine = engine(Arc::clone(&feed), Arc::clone(&clock));

        let report = engine.run_working_tick(32).await.unwrap();
        assert_eq!(report.records_read, 3);
        assert_eq!(report.newly_admitted, 3);

        let wm = engine.store().load_working().await.unwrap();
        assert_eq!(wm.state.feed_cursor, 3);
        assert_eq!(wm.state.outbox.len(), 3);
        assert!(wm.state.residents().all(|i| i.concepts.contains("rust")));
    }

    #[tokio::test]
    async fn test_feed_outage_skips_tick() {
        let clock = Arc::new(ManualClock::new(start()));
        let feed = Arc::new(VecFeed::new());
        feed.push_content("something", start());
        feed.set_available(false);
        let engine = engine(Arc::clone(&feed), clock);

        let err = engine.run_working_tick(32).await.unwrap_err();
        assert!(matches!(err, RecallError::FeedUnavailable(_)));
        assert!(!engine.is_halted(TierKind::Working));
        assert_eq!(engine.store().load_working().await.unwrap().version, 0);
        assert_eq!(engine.counters().feed_skips, 1);
    }

    #[tokio::test]
    async fn test_record_access_applied_on_next_tick() {
        let clock = Arc::new(ManualClock::new(start()));
        let feed = Arc::new(VecFeed::new());
        feed.push_content("hello world", start());
        let engine = engine(Arc::clone(&feed), Arc::clone(&clock));
        engine.run_working_tick(32).await.unwrap();

        engine.record_access("rec-00000000");
        engine.record_access("rec-00000000");
        engine.record_access("unknown");
        let report = engine.run_working_tick(32).await.unwrap();
        assert_eq!(report.accesses_applied, 2);

        let wm = engine.store().load_working().await.unwrap();
        assert_eq!(wm.state.items["rec-00000000"].access_count, 2);
    }

    /// Store whose working-tier commits always fail.
    struct Corrupt(MemoryStore);

    #[async_trait]
    impl TierStore for Corrupt {
        async fn load_working(&self) -> RecallResult<Versioned<WorkingState>> {
            self.0.load_working().await
        }
        async fn commit_working(&self, base: u64, _state: WorkingState) -> RecallResult<u64> {
            Err(RecallError::SnapshotMismatch {
                tier: TierKind::Working,
                expected: base,
                found: base + 1,
            })
        }
        async fn load_short_term(&self) -> RecallResult<Versioned<ShortTermState>> {
            self.0.load_short_term().await
        }
        async fn commit_short_term(&self, base: u64, state: ShortTermState) -> RecallResult<u64> {
            self.0.commit_short_term(base, state).await
        }
        async fn load_long_term(&self) -> RecallResult<Versioned<LongTermState>> {
            self.0.load_long_term().await
        }
        async fn commit_long_term(&self, base: u64, state: LongTermState) -> RecallResult<u64> {
            self.0.commit_long_term(base, state).await
        }
    }

    #[tokio::test]
    async fn test_fatal_error_halts_only_its_tier() {
        let clock = Arc::new(ManualClock::new(start()));
        let engine = RecallEngine::builder(RecallConfig::default())
            .clock(clock)
            .store(Arc::new(Corrupt(MemoryStore::new())))
            .build()
            .unwrap();

        assert!(engine.run_working_tick(8).await.unwrap_err().is_fatal());
        assert!(engine.is_halted(TierKind::Working));
        assert!(matches!(
            engine.run_working_tick(8).await,
            Err(RecallError::TierHalted { .. })
        ));

        engine.run_short_term_tick().await.unwrap();
        engine.run_decay_pass().await.unwrap();

        let health = engine.health().await.unwrap();
        assert_eq!(health.halted.len(), 1);

        assert!(engine.resume(TierKind::Working));
        assert!(!engine.is_halted(TierKind::Working));
    }

    /// Feed whose reads never complete.
    struct Stalled;

    #[async_trait]
    impl SourceFeed for Stalled {
        async fn read_batch(&self, _from: u64, _max: usize) -> Result<Vec<crate::feed::RawRecord>, FeedError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_stalled_feed_times_out_and_skips_tick() {
        let mut config = RecallConfig::default();
        config.reliability.feed_timeout_ms = 50;
        let engine = RecallEngine::builder(config)
            .clock(Arc::new(ManualClock::new(start())))
            .feed(Arc::new(Stalled))
            .build()
            .unwrap();

        let result = tokio::time::timeout(std::time::Duration::from_secs(2), engine.run_working_tick(8))
            .await
            .expect("working tick must not hang on a stalled feed");
        assert!(matches!(result, Err(RecallError::FeedUnavailable(_))));
        assert!(!engine.is_halted(TierKind::Working));
        assert_eq!(engine.counters().feed_skips, 1);
        assert_eq!(engine.store().load_working().await.unwrap().version, 0);
    }

    /// Store whose next short-term commit fails once armed.
    struct FlakyShortTerm {
        inner: MemoryStore,
        fail_next: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl TierStore for FlakyShortTerm {
        async fn load_working(&self) -> RecallResult<Versioned<WorkingState>> {
            self.inner.load_working().await
        }
        async fn commit_working(&self, base: u64, state: WorkingState) -> RecallResult<u64> {
            self.inner.commit_working(base, state).await
        }
        async fn load_short_term(&self) -> RecallResult<Versioned<ShortTermState>> {
            self.inner.load_short_term().await
        }
        async fn commit_short_term(&self, base: u64, state: ShortTermState) -> RecallResult<u64> {
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(RecallError::SnapshotMismatch {
                    tier: TierKind::ShortTerm,
                    expected: base,
                    found: base + 1,
                });
            }
            self.inner.commit_short_term(base, state).await
        }
        async fn load_long_term(&self) -> RecallResult<Versioned<LongTermState>> {
            self.inner.load_long_term().await
        }
        async fn commit_long_term(&self, base: u64, state: LongTermState) -> RecallResult<u64> {
            self.inner.commit_long_term(base, state).await
        }
    }

    #[tokio::test]
    async fn test_consolidation_retry_does_not_relearn_archived_episode() {
        let clock = Arc::new(ManualClock::new(start()));
        let feed = Arc::new(VecFeed::new());
        let store = Arc::new(FlakyShortTerm {
            inner: MemoryStore::new(),
            fail_next: std::sync::atomic::AtomicBool::new(false),
        });
        let engine = RecallEngine::builder(RecallConfig::default())
            .clock(Arc::clone(&clock) as SharedClock)
            .feed(Arc::clone(&feed) as Arc<dyn SourceFeed>)
            .store(Arc::clone(&store) as Arc<dyn TierStore>)
            .build()
            .unwrap();
        for i in 0..4 {
            feed.push_content(
                format!("sourdough starter fermentation flour water batch {i}"),
                start() + Duration::seconds(20 * i),
            );
        }
        engine.run_working_tick(32).await.unwrap();
        engine.run_short_term_tick().await.unwrap();
        clock.advance(Duration::minutes(35));
        engine.run_working_tick(32).await.unwrap();
        engine.run_short_term_tick().await.unwrap();
        clock.advance(Duration::minutes(30));

        store.fail_next.store(true, Ordering::SeqCst);
        assert!(engine.run_consolidation_tick(false).await.unwrap_err().is_fatal());
        assert!(engine.is_halted(TierKind::ShortTerm));
        let learned = engine.store().load_long_term().await.unwrap().state;
        let weight = learned.graph.weight("sourdough", "fermentation");
        assert!(weight > 0.0);
        assert_eq!(learned.episodes.len(), 1);

        assert!(engine.resume(TierKind::ShortTerm));
        let retry = engine.run_consolidation_tick(false).await.unwrap();
        assert_eq!(retry.hebbian_pairs, 0);
        assert_eq!(retry.items_promoted, 4);

        let ltm = engine.store().load_long_term().await.unwrap().state;
        assert_eq!(ltm.episodes.len(), 1);
        assert_eq!(ltm.graph.weight("sourdough", "fermentation"), weight);
        assert_eq!(ltm.items.len(), 4);
        assert!(engine.store().load_short_term().await.unwrap().state.items.is_empty());
    }

    fn short_term_item(id: &str, activation: f64) -> MemoryItem {
        let mut item = MemoryItem::new(format!("{id} content"), start(), Vec::<String>::new(), activation).with_id(id);
        item.transition(MemoryTier::Working).unwrap();
        item.transition(MemoryTier::ShortTerm).unwrap();
        item
    }

    #[tokio::test]
    async fn test_orphaned_short_term_items_are_settled() {
        let clock = Arc::new(ManualClock::new(start()));
        let engine = engine(Arc::new(VecFeed::new()), Arc::clone(&clock));
        let store = engine.store();

        // One orphan belongs to an archived episode, one has faded, one is still fresh.
        let stm = store.load_short_term().await.unwrap();
        let mut state = stm.state;
        let mut faded = short_term_item("faded", 0.01);
        faded.below_floor_since = Some(start() - Duration::hours(3));
        for item in [short_term_item("kept", 0.9), faded, short_term_item("fresh", 0.9)] {
            state.items.insert(item.id.clone(), item);
        }
        store.commit_short_term(stm.version, state).await.unwrap();

        let ltm = store.load_long_term().await.unwrap();
        let mut long_term = ltm.state;
        long_term.episodes.push(Episode::open(EpisodeMember::from_item(&short_term_item("kept", 0.9))));
        let archived_id = long_term.episodes[0].id.clone();
        store.commit_long_term(ltm.version, long_term).await.unwrap();

        let report = engine.run_consolidation_tick(false).await.unwrap();
        assert_eq!(report.items_promoted, 1);
        assert_eq!(report.items_retired, 1);

        let stm = store.load_short_term().await.unwrap().state;
        assert_eq!(stm.items.keys().collect::<Vec<_>>(), vec!["fresh"]);
        assert_eq!(stm.retired, 1);
        let ltm = store.load_long_term().await.unwrap().state;
        assert_eq!(ltm.items["kept"].tier, MemoryTier::LongTerm);
        assert_eq!(ltm.items["kept"].episode_id.as_ref(), Some(&archived_id));
    }
}
