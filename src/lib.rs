//! # KoruRecall - Tiered Memory Consolidation
//!
//! KoruRecall moves content records through a brain-inspired memory
//! hierarchy:
//!
//! - **Working memory** - a capacity-bounded set of the most salient items
//! - **Short-term memory** - items clustered into temporally coherent episodes
//! - **Long-term memory** - a weighted concept graph learned with a Hebbian rule
//!
//! Episodes compete through proactive and retroactive interference and only
//! reach long-term memory after passing a two-step consolidation gate.
//!
//! ## Quick Start
//!
//! ```ignore
//! use koru_recall::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let feed = Arc::new(VecFeed::new());
//!     feed.push_content("Rust ownership and borrowing", Utc::now());
//!
//!     let engine = RecallEngine::builder(RecallConfig::default())
//!         .feed(feed)
//!         .build()?;
//!
//!     // Drive ticks by hand...
//!     engine.run_working_tick(32).await?;
//!     engine.run_short_term_tick().await?;
//!
//!     // ...or let the circadian scheduler do it.
//!     let handle = Scheduler::new(engine).start();
//!     println!("{:?}", handle.health().await?.status);
//!     handle.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! 1. **Pure components** (`memory`, `processes`) - admission, clustering,
//!    interference, the consolidation gate and the association builder.
//!    They take a snapshot and return the next one.
//! 2. **Engine** (`engine`, `store`) - per-tier batch steps that load a
//!    versioned snapshot, run the components and commit atomically.
//! 3. **Scheduler** (`scheduler`) - circadian cadence, backoff and the
//!    tokio task pool.
//! 4. **Reliability shell** (`reliability`) - retries, circuit breaker,
//!    response repair and the lexical fallback around enrichment.
//!
//! Tiers communicate only through committed mailboxes, so ticks of
//! different tiers can run concurrently while ticks of one tier never
//! overlap.

pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod feed;
pub mod health;
pub mod memory;
pub mod processes;
pub mod reliability;
pub mod scheduler;
pub mod store;
pub mod types;

// HTTP surface (requires http feature)
#[cfg(feature = "http")]
pub mod http;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::RecallConfig;
pub use engine::{
    ConsolidationTickReport, EngineCounters, RecallEngine, ShortTermTickReport, TickReport,
    WorkingTickReport,
};
pub use error::{RecallError, RecallResult, TierKind};
pub use feed::{JsonlFeed, RawRecord, SourceFeed, VecFeed};
pub use health::{HealthReport, HealthStatus, TierPopulations};
pub use reliability::{
    EnrichmentResult, EnrichmentService, FallbackReason, LexicalEnricher, ReliableEnricher,
    ServiceError,
};
pub use scheduler::{Phase, Scheduler, SchedulerHandle, TickKind};
pub use store::{MemoryStore, TierStore, Versioned};
pub use types::{
    clamp_unit, AssociationEdge, CoherenceClass, ConceptNode, Episode, EpisodeId, ItemId,
    MemoryItem, MemoryTier, Readiness,
};

/// Prelude module for convenient imports.
///
/// ```ignore
/// use koru_recall::prelude::*;
/// ```
pub mod prelude {
    pub use crate::clock::{Clock, ManualClock, SharedClock, SystemClock};
    pub use crate::config::RecallConfig;
    pub use crate::engine::{RecallEngine, TickReport};
    pub use crate::error::{RecallError, RecallResult, TierKind};
    pub use crate::feed::{JsonlFeed, RawRecord, SourceFeed, VecFeed};
    pub use crate::health::{HealthReport, HealthStatus};
    pub use crate::reliability::{EnrichmentResult, EnrichmentService, LexicalEnricher, ServiceError};
    pub use crate::scheduler::{Phase, Scheduler, SchedulerHandle, TickKind};
    pub use crate::types::{Episode, MemoryItem, MemoryTier, Readiness};
    pub use chrono::{DateTime, Duration, Utc};
}
