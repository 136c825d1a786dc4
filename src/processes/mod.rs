/// Short-term processes that decide what reaches long-term memory.
///
/// Each pass runs over a snapshot of the episode ledger:
/// - Interference: competition between neighbouring episodes
/// - Consolidation: the readiness state machine
pub mod consolidation;
pub mod interference;

pub use consolidation::{ConsolidationGate, GateConfig, GateDecision, GateReport, GateStats};
pub use interference::{
    InterferenceConfig, InterferenceReport, InterferenceResolver, InterferenceStats,
};
