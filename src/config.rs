/// Configuration for the whole pipeline.
///
/// Every section uses `#[serde(default)]`, so a JSON file only needs the
/// keys it wants to override:
///
/// ```json
/// { "working": { "capacity": 9 }, "schedule": { "utc_offset_minutes": 60 } }
/// ```
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{RecallError, RecallResult};
use crate::memory::{AssociationConfig, EpisodeConfig, WorkingConfig};
use crate::processes::{GateConfig, InterferenceConfig};
use crate::reliability::ReliabilityConfig;
use crate::scheduler::ScheduleConfig;

/// Aggregate configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecallConfig {
    pub working: WorkingConfig,
    pub episodic: EpisodeConfig,
    pub interference: InterferenceConfig,
    pub consolidation: GateConfig,
    pub association: AssociationConfig,
    pub schedule: ScheduleConfig,
    pub reliability: ReliabilityConfig,
}

fn unit(name: &str, value: f64) -> RecallResult<()> {
    if !(0.0..=1.0).contains(&value) {
        return Err(RecallError::InvalidConfig(format!("{name} must be in [0, 1], got {value}")));
    }
    Ok(())
}

fn hour(name: &str, value: u32) -> RecallResult<()> {
    if value >= 24 {
        return Err(RecallError::InvalidConfig(format!("{name} must be below 24, got {value}")));
    }
    Ok(())
}

impl RecallConfig {
    /// Load and validate a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> RecallResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Parse and validate JSON text.
    pub fn from_json_str(text: &str) -> RecallResult<Self> {
        let config: RecallConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Check ranges.
    pub fn validate(&self) -> RecallResult<()> {
        let w = &self.working;
        if !(5..=9).contains(&w.capacity) {
            return Err(RecallError::InvalidConfig(format!(
                "working.capacity must be in [5, 9], got {}",
                w.capacity
            )));
        }
        unit("working.plasticity_threshold", w.plasticity_threshold)?;
        unit("working.initial_activation", w.initial_activation)?;
        unit("working.frequency_boost", w.frequency_boost)?;
        unit("working.forgetting_floor", w.forgetting_floor)?;

        if let Some(t) = self.episodic.semantic_split_threshold {
            unit("episodic.semantic_split_threshold", t)?;
        }

        let i = &self.interference;
        if !(0.0..=0.8).contains(&i.cap) {
            return Err(RecallError::InvalidConfig(format!(
                "interference.cap must be in [0, 0.8], got {}",
                i.cap
            )));
        }
        unit("interference.proactive_rate", i.proactive_rate)?;
        unit("interference.retroactive_rate", i.retroactive_rate)?;
        unit("interference.similarity_floor", i.similarity_floor)?;

        unit("consolidation.threshold", self.consolidation.threshold)?;

        let a = &self.association;
        if !(a.learning_rate > 0.0 && a.learning_rate <= 1.0) {
            return Err(RecallError::InvalidConfig(format!(
                "association.learning_rate must be in (0, 1], got {}",
                a.learning_rate
            )));
        }
        unit("association.decay_rate", a.decay_rate)?;
        unit("association.prune_threshold", a.prune_threshold)?;
        unit("association.homeostasis_target", a.homeostasis_target)?;
        unit("association.homeostasis_rate", a.homeostasis_rate)?;
        if a.region_count < 1 {
            return Err(RecallError::InvalidConfig("association.region_count must be at least 1".into()));
        }

        let s = &self.schedule;
        hour("schedule.wake_start_hour", s.wake_start_hour)?;
        hour("schedule.sleep_start_hour", s.sleep_start_hour)?;
        hour("schedule.homeostasis_hour", s.homeostasis_hour)?;
        for h in &s.deep_consolidation_hours {
            hour("schedule.deep_consolidation_hours", *h)?;
        }

        let r = &self.reliability;
        if r.breaker_threshold < 1 {
            return Err(RecallError::InvalidConfig("reliability.breaker_threshold must be at least 1".into()));
        }
        unit("reliability.jitter", r.jitter)?;
        if r.call_timeout_ms == 0 || r.feed_timeout_ms == 0 {
            return Err(RecallError::InvalidConfig("reliability timeouts must be positive".into()));
        }
        if r.embedding_dims == 0 {
            return Err(RecallError::InvalidConfig("reliability.embedding_dims must be positive".into()));
        }
        Ok(())
    }
}
