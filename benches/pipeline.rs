use chrono::{DateTime, Duration, TimeZone, Utc};
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use koru_recall::memory::{
    AdmissionSelector, AssociationBuilder, AssociationConfig, AssociationGraph, EpisodeClusterer,
    EpisodeConfig, EpisodeLedger, WorkingConfig,
};
use koru_recall::prelude::*;
use koru_recall::processes::{InterferenceConfig, InterferenceResolver};
use std::sync::Arc;
use tokio::runtime::Runtime;

const WORDS: [&str; 8] = [
    "ownership", "borrowing", "lifetimes", "tokio", "sourdough", "fermentation", "sleep", "replay",
];

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()
}

fn items(n: usize, spacing_secs: i64) -> Vec<MemoryItem> {
    (0..n)
        .map(|i| {
            MemoryItem::new(
                format!("note {i}"),
                t0() + Duration::seconds(i as i64 * spacing_secs),
                [WORDS[i % WORDS.len()], WORDS[(i * 3 + 1) % WORDS.len()]]
                    .into_iter()
                    .map(String::from),
                0.6 + (i % 40) as f64 / 100.0,
            )
            .with_id(format!("bench-{i:06}"))
        })
        .collect()
}

/// Benchmark: Admission over growing candidate sets
fn bench_admission(c: &mut Criterion) {
    let selector = AdmissionSelector::new(WorkingConfig::default());
    let mut group = c.benchmark_group("admission_select");

    for size in [10, 100, 1000] {
        let candidates = items(size, 1);
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &candidates, |b, candidates| {
            b.iter(|| black_box(selector.select(candidates.clone(), t0())))
        });
    }

    group.finish();
}

/// Benchmark: Clustering plus interference over many episodes
fn bench_interference(c: &mut Criterion) {
    let clusterer = EpisodeClusterer::new(EpisodeConfig::default());
    let resolver = InterferenceResolver::new(InterferenceConfig::default());
    let mut group = c.benchmark_group("interference_resolve_all");

    for size in [50, 200] {
        // One-hour spacing puts every item in its own episode.
        let batch = items(size, 3600);
        let mut ledger = EpisodeLedger::default();
        clusterer.ingest(&mut ledger, &batch);
        let now = t0() + Duration::seconds(size as i64 * 3600);

        group.bench_with_input(BenchmarkId::from_parameter(size), &ledger, |b, ledger| {
            b.iter(|| {
                let mut ledger = ledger.clone();
                black_box(resolver.resolve_all(&mut ledger, now))
            })
        });
    }

    group.finish();
}

/// Benchmark: Hebbian consolidation followed by decay and homeostasis
fn bench_association(c: &mut Criterion) {
    let clusterer = EpisodeClusterer::new(EpisodeConfig::default());
    let builder = AssociationBuilder::new(AssociationConfig::default());
    let mut ledger = EpisodeLedger::default();
    clusterer.ingest(&mut ledger, &items(200, 10));

    c.bench_function("association_consolidate", |b| {
        b.iter(|| {
            let mut graph = AssociationGraph::new();
            for episode in &ledger.episodes {
                builder.consolidate(&mut graph, episode, t0());
            }
            builder.decay(&mut graph, t0() + Duration::hours(12));
            black_box(builder.homeostasis(&mut graph))
        })
    });
}

/// Benchmark: A full working plus short-term tick pair through the engine
fn bench_engine_ticks(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    c.bench_function("engine_tick_pair", |b| {
        b.to_async(&rt).iter(|| async {
            let clock = Arc::new(ManualClock::new(t0()));
            let feed = Arc::new(VecFeed::new());
            for i in 0..32 {
                feed.push_content(format!("{} note {i}", WORDS[i % WORDS.len()]), t0());
            }
            let engine = RecallEngine::builder(RecallConfig::default())
                .clock(clock as SharedClock)
                .feed(feed as Arc<dyn SourceFeed>)
                .build()
                .unwrap();
            engine.run_working_tick(32).await.unwrap();
            black_box(engine.run_short_term_tick().await.unwrap())
        })
    });
}

criterion_group!(
    benches,
    bench_admission,
    bench_interference,
    bench_association,
    bench_engine_ticks
);
criterion_main!(benches);
