/// KoruRecall CLI - run and inspect the memory pipeline
///
/// Usage:
///   recall config                      - Print the effective configuration
///   recall simulate [--hours N]        - Deterministic run over synthetic records
///   recall serve --feed <file.jsonl>   - Run the scheduler over a JSON-lines feed
use anyhow::{Context, Result};
use chrono::{Duration, TimeZone, Utc};
use clap::{Parser, Subcommand};
use colored::*;
use koru_recall::prelude::*;
use koru_recall::scheduler::Circadian;
use koru_recall::HealthReport;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// KoruRecall - tiered memory consolidation
#[derive(Parser)]
#[command(name = "recall")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// JSON configuration file (missing keys use defaults)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the effective configuration as JSON
    Config,

    /// Run the pipeline on a simulated clock over synthetic records
    Simulate {
        /// Simulated hours to run
        #[arg(long, default_value_t = 30)]
        hours: u32,

        /// Print the final health report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run the scheduler against a JSON-lines feed until Ctrl-C
    Serve {
        /// Append-only JSON-lines feed
        #[arg(long)]
        feed: PathBuf,

        /// Address for the HTTP health surface
        #[arg(long, default_value = "127.0.0.1:7878")]
        bind: String,

        /// Do not start the HTTP surface
        #[arg(long)]
        no_http: bool,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<RecallConfig> {
    match path {
        Some(path) => RecallConfig::from_json_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => Ok(RecallConfig::default()),
    }
}

const TOPICS: [&[&str]; 4] = [
    &[
        "Rust ownership rules prevent data races at compile time",
        "Borrowing lets functions read data without taking ownership",
        "Lifetimes describe how long borrowed references stay valid",
    ],
    &[
        "Hippocampal replay during sleep strengthens recent memories",
        "Sleep spindles coordinate memory consolidation in the cortex",
        "Synaptic homeostasis scales down synapses during deep sleep",
    ],
    &[
        "Sourdough starter needs regular feeding with flour and water",
        "Long fermentation gives sourdough bread its sour flavour",
        "Steam in the oven helps sourdough bread develop crust",
    ],
    &[
        "Tokio tasks are cooperative futures scheduled on worker threads",
        "Async channels pass messages between tokio tasks",
        "Tokio timers drive periodic tasks with sleep and interval",
    ],
];

/// Step the pipeline every simulated five minutes.
async fn simulate(config: RecallConfig, hours: u32, json: bool) -> Result<()> {
    // A Monday morning.
    let start = Utc
        .with_ymd_and_hms(2026, 1, 5, 8, 0, 0)
        .single()
        .context("invalid simulation start")?;
    let clock = Arc::new(ManualClock::new(start));
    let feed = Arc::new(VecFeed::new());
    let circadian = Circadian::new(config.schedule.clone());
    let engine = RecallEngine::builder(config)
        .clock(Arc::clone(&clock) as SharedClock)
        .feed(Arc::clone(&feed) as Arc<dyn SourceFeed>)
        .build()
        .context("Failed to build engine")?;

    let steps = hours * 12;
    let mut records = 0;
    for step in 0..steps {
        let now = clock.now();
        let phase = circadian.phase(now);

        // Bursts of one topic during the first half hour of every two hours awake.
        let block = step / 24;
        if phase == Phase::Awake && step % 24 < 6 {
            let topic = TOPICS[block as usize % TOPICS.len()];
            for offset in 0..2 {
                let sentence = topic[(step as usize + offset) % topic.len()];
                feed.push_content(format!("{sentence} (note {records})"), now);
                records += 1;
            }
        }

        engine
            .run_working_tick(circadian.batch_size(phase))
            .await
            .context("working-memory tick failed")?;
        engine
            .run_short_term_tick()
            .await
            .context("short-term tick failed")?;
        if step % 2 == 1 {
            engine.run_decay_pass().await.context("decay pass failed")?;
        }
        if step % 12 == 11 {
            engine
                .run_consolidation_tick(circadian.is_deep_hour(now))
                .await
                .context("consolidation tick failed")?;
        }
        if circadian.homeostasis_due(now, None) && step % 12 == 0 {
            engine.run_homeostasis().await.context("homeostasis failed")?;
        }

        clock.advance(Duration::minutes(5));
    }

    let health = engine.health().await.context("Failed to read health")?;
    if json {
        println!("{}", serde_json::to_string_pretty(&health)?);
    } else {
        print_report(&health, hours, records);
    }
    Ok(())
}

fn print_report(health: &HealthReport, hours: u32, records: usize) {
    let p = &health.populations;
    let c = &health.counters;
    println!("{}", "Simulation complete".green().bold());
    println!("  Simulated: {} hours, {} records", hours.to_string().cyan(), records.to_string().cyan());
    println!();
    println!("{}", "Tiers".bold());
    println!("  Working memory:    {}", p.working);
    println!("  Short-term items:  {}", p.short_term_items);
    println!("  Long-term items:   {}", p.long_term_items);
    println!("  Retired:           {}", p.retired);
    println!();
    println!("{}", "Episodes".bold());
    println!(
        "  fragmentary {}  consolidating {}  schematized {}  discarded {}",
        p.episodes_fragmentary, p.episodes_consolidating, p.episodes_schematized, p.episodes_discarded
    );
    println!(
        "  lifetime: {} opened, {} schematized, {} discarded",
        c.episodes_opened, c.episodes_schematized, c.episodes_discarded
    );
    println!();
    println!("{}", "Association graph".bold());
    println!("  Concepts: {}  Edges: {}  Mean weight: {:.3}", p.concepts, p.edges, p.mean_edge_weight);
    for region in health.regions.iter().filter(|r| r.concepts > 0).take(5) {
        println!(
            "  region {:>2}: {} concepts, hub {}",
            region.region,
            region.concepts,
            region.hub.as_deref().unwrap_or("-").cyan()
        );
    }
    println!();
    let status = match health.status {
        HealthStatus::Ok => health.status.to_string().green(),
        HealthStatus::Degraded => health.status.to_string().yellow(),
        HealthStatus::Halted => health.status.to_string().red(),
    };
    println!("Status: {}", status.bold());
    for warning in &health.warnings {
        println!("  {}", warning.yellow());
    }
}

async fn serve(config: RecallConfig, feed: PathBuf, bind: String, no_http: bool) -> Result<()> {
    let engine = RecallEngine::builder(config)
        .feed(Arc::new(JsonlFeed::new(&feed)))
        .build()
        .context("Failed to build engine")?;
    let handle = Scheduler::new(engine).start();

    println!("{}", "KoruRecall running".green().bold());
    println!("  Feed: {}", feed.display().to_string().cyan());

    if !no_http {
        serve_http(&handle, &bind).await?;
        handle.shutdown().await;
        return Ok(());
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    println!("{}", "Shutting down...".yellow());
    if !handle.shutdown().await {
        println!("{}", "Some ticks were aborted after the grace period".yellow());
    }
    Ok(())
}

#[cfg(feature = "http")]
async fn serve_http(handle: &SchedulerHandle, bind: &str) -> Result<()> {
    println!("  Health: http://{}/health", bind.cyan());
    let signal = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    koru_recall::http::HttpServer::new(handle.clone())
        .bind_with_shutdown(bind, signal)
        .await
        .context("HTTP server failed")
}

#[cfg(not(feature = "http"))]
async fn serve_http(_handle: &SchedulerHandle, bind: &str) -> Result<()> {
    anyhow::bail!("built without the http feature; rerun with --no-http (requested {bind})")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("koru_recall=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Simulate { hours, json } => simulate(config, hours, json).await,
        Commands::Serve { feed, bind, no_http } => serve(config, feed, bind, no_http).await,
    }
}
