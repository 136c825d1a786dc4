/// Error types for koru-recall operations.
///
/// The taxonomy follows how failures are handled by the pipeline:
///
/// 1. **Transient** external failures (timeouts, refused connections) are
///    retried with backoff and parked in the dead-letter holding area.
/// 2. **Malformed** enrichment responses are repaired or replaced with a safe
///    default. They never reach the caller.
/// 3. **Invariant** violations (e.g. a strength outside `[0, 1]`) are clamped
///    where they occur and logged. They are not represented here.
/// 4. **Fatal** errors (snapshot mismatch, corrupted persistence) halt the
///    affected tier and surface on the health report.
use thiserror::Error;

use crate::types::MemoryTier;

/// Which pipeline stage a tier-scoped error belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum TierKind {
    /// Working memory (admission selector)
    Working,
    /// Short-term memory (episode clusterer)
    ShortTerm,
    /// Long-term memory (association network)
    LongTerm,
}

impl std::fmt::Display for TierKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TierKind::Working => write!(f, "wm"),
            TierKind::ShortTerm => write!(f, "stm"),
            TierKind::LongTerm => write!(f, "ltm"),
        }
    }
}

/// The main error type for koru-recall.
#[derive(Error, Debug)]
pub enum RecallError {
    /// A call to an external collaborator failed in a way worth retrying.
    #[error("Transient failure during {operation}: {reason}")]
    Transient {
        /// The operation that failed (e.g. "summarize_or_extract")
        operation: String,
        /// Why it failed
        reason: String,
    },

    /// The source feed could not be read this tick.
    #[error("Source feed unavailable: {0}")]
    FeedUnavailable(String),

    /// The enrichment service returned something that could not be parsed.
    #[error("Malformed enrichment response: {0}")]
    MalformedResponse(String),

    /// A record is missing required fields.
    #[error("Invalid item: {reason}")]
    InvalidItem {
        /// Description of the missing or broken field
        reason: String,
    },

    /// An item was asked to move backwards through the tiers.
    #[error("Item '{item}' cannot move from {from} to {to}")]
    InvalidTransition {
        /// The item id
        item: String,
        /// Current tier
        from: MemoryTier,
        /// Requested tier
        to: MemoryTier,
    },

    /// The committed version moved underneath a tick.
    #[error("Snapshot mismatch on {tier}: expected version {expected}, found {found}")]
    SnapshotMismatch {
        /// Tier being committed
        tier: TierKind,
        /// Version the tick started from
        expected: u64,
        /// Version found at commit time
        found: u64,
    },

    /// A previous fatal error halted this tier.
    #[error("Tier {tier} is halted: {reason}")]
    TierHalted {
        /// The halted tier
        tier: TierKind,
        /// The fatal error that halted it
        reason: String,
    },

    /// Configuration failed validation.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Serialization error when converting data to/from JSON
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error (file feeds, config files)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The scheduler is shutting down.
    #[error("Shutdown in progress")]
    Shutdown,
}

impl RecallError {
    /// Whether this error belongs to the fatal class and must halt its tier.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RecallError::SnapshotMismatch { .. })
    }

    /// Whether retrying later can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RecallError::Transient { .. } | RecallError::FeedUnavailable(_)
        )
    }
}

/// Result type alias for koru-recall operations.
pub type RecallResult<T> = Result<T, RecallError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let fatal = RecallError::SnapshotMismatch {
            tier: TierKind::ShortTerm,
            expected: 3,
            found: 4,
        };
        assert!(fatal.is_fatal());
        assert!(!fatal.is_transient());

        let feed = RecallError::FeedUnavailable("connection refused".into());
        assert!(feed.is_transient());
        assert!(!feed.is_fatal());
    }

    #[test]
    fn test_display() {
        let err = RecallError::InvalidTransition {
            item: "a".into(),
            from: MemoryTier::LongTerm,
            to: MemoryTier::Working,
        };
        assert_eq!(err.to_string(), "Item 'a' cannot move from ltm to wm");
        assert_eq!(TierKind::LongTerm.to_string(), "ltm");
    }
}
