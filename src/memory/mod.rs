/// Memory tiers.
///
/// Items move through three layers, each owned by its own component:
///
/// - **Working memory**: a small, capacity-bounded set of the most active
///   items ([`AdmissionSelector`])
/// - **Short-term memory**: items that left working memory, grouped into
///   temporally coherent episodes ([`EpisodeClusterer`])
/// - **Long-term memory**: a weighted concept graph built from schematized
///   episodes ([`AssociationBuilder`])
///
/// ## The Flow
///
/// ```text
/// Ingest → Working (admission by activation)
///             ↓ exit
///          Short-term (episode clustering, interference, gating)
///             ↓ schematized
///          Long-term (Hebbian associations)
/// ```
pub mod association;
pub mod centrality;
pub mod episodic;
pub mod working;

pub use association::{
    AssociationBuilder, AssociationConfig, AssociationGraph, DecayReport, HebbianReport,
    HomeostasisReport,
};
pub use centrality::{region_for, region_summaries, RegionSummary};
pub use episodic::{
    cosine_similarity, Assignment, ClusterReport, EpisodeClusterer, EpisodeConfig, EpisodeLedger,
};
pub use working::{AdmissionOutcome, AdmissionSelector, WorkingConfig};
