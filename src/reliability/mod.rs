/// Reliability Shell around the enrichment service.
///
/// Every call to the external service goes through [`ReliableEnricher`]:
///
/// ```text
/// call ─► breaker open? ──yes──► lexical fallback
///            │ no
///            ▼
///         timeout + retry (exponential backoff, jitter) on transient errors
///            │ exhausted            │ malformed             │ ok
///            ▼                      ▼                       ▼
///         Failed (dead letter)   repair / partial / default   Success
/// ```
///
/// Downstream stages consume the uniform [`EnrichmentResult`].
pub mod backoff;
pub mod breaker;
pub mod dead_letter;
pub mod lexical;
pub mod repair;

pub use backoff::RetryPolicy;
pub use breaker::{BreakerState, CircuitBreaker};
pub use dead_letter::{DeadLetter, DeadLetterQueue};
pub use lexical::LexicalEnricher;
pub use repair::{parse_extraction, Extraction, Recovery};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::clock::SharedClock;
use crate::error::RecallError;
use crate::types::MemoryItem;

/// Reliability configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReliabilityConfig {
    /// Retries after the first attempt, transient errors only
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Relative jitter on every delay
    pub jitter: f64,
    /// Consecutive failures that open the breaker
    pub breaker_threshold: u32,
    pub breaker_cooldown_secs: u64,
    /// Timeout of each external call
    pub call_timeout_ms: u64,
    /// Timeout of each source-feed read
    pub feed_timeout_ms: u64,
    /// Concepts kept from an extraction (service or lexical)
    pub fallback_max_concepts: usize,
    /// Dimensions of embeddings (zero-vector default and lexical hashing)
    pub embedding_dims: usize,
    /// Dead-letter attempts before the lexical substitute is used instead
    pub dead_letter_max_attempts: u32,
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 200,
            max_delay_ms: 5000,
            jitter: 0.25,
            breaker_threshold: 5,
            breaker_cooldown_secs: 60,
            call_timeout_ms: 10_000,
            feed_timeout_ms: 10_000,
            fallback_max_concepts: 8,
            embedding_dims: 64,
            dead_letter_max_attempts: 10,
        }
    }
}

impl ReliabilityConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay_ms: self.base_delay_ms,
            max_delay_ms: self.max_delay_ms,
            jitter: self.jitter,
        }
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn feed_timeout(&self) -> Duration {
        Duration::from_millis(self.feed_timeout_ms)
    }
}

/// Errors reported by an enrichment service implementation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ServiceError {
    #[error("timed out")]
    Timeout,
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl ServiceError {
    /// Whether retrying can help.
    pub fn is_transient(&self) -> bool {
        matches!(self, ServiceError::Timeout | ServiceError::Unavailable(_))
    }

    /// Convert into the crate error for a named operation.
    pub fn into_recall_error(self, operation: &str) -> RecallError {
        match self {
            ServiceError::Malformed(reason) => RecallError::MalformedResponse(reason),
            other => RecallError::Transient {
                operation: operation.to_string(),
                reason: other.to_string(),
            },
        }
    }
}

/// The external summarization/extraction and embedding service.
#[async_trait]
pub trait EnrichmentService: Send + Sync {
    /// Raw structured response, expected as `{"concepts": [...], "summary": "..."}`.
    async fn summarize_or_extract(&self, text: &str) -> Result<String, ServiceError>;

    /// Embedding vector for `text`.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ServiceError>;

    /// Name used in logs.
    fn name(&self) -> &str {
        "enrichment"
    }
}

/// Enrichment payload applied to an item.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Enrichment {
    pub concepts: BTreeSet<String>,
    pub summary: Option<String>,
    pub embedding: Option<Vec<f32>>,
}

impl Enrichment {
    /// Copy the payload onto an item; existing concepts are kept.
    pub fn apply_to(&self, item: &mut MemoryItem) {
        item.concepts.extend(self.concepts.iter().cloned());
        if self.summary.is_some() {
            item.summary = self.summary.clone();
        }
        if self.embedding.is_some() {
            item.embedding = self.embedding.clone();
        }
    }
}

/// Why a fallback payload was used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackReason {
    /// Breaker open; lexical substitute
    BreakerOpen,
    /// Malformed response fixed by structural repair
    Repaired,
    /// Malformed response; fields pulled out partially
    PartialExtraction,
    /// Nothing recoverable; empty concepts / zero vector
    SafeDefault,
    /// Dead letter out of attempts; lexical substitute
    RetriesExhausted,
}

/// Uniform outcome consumed by downstream stages.
#[derive(Debug, Clone, PartialEq)]
pub enum EnrichmentResult<T> {
    Success(T),
    Fallback { data: T, reason: FallbackReason },
    Failed { reason: String },
}

impl<T> EnrichmentResult<T> {
    /// The payload, if any.
    pub fn data(&self) -> Option<&T> {
        match self {
            EnrichmentResult::Success(data) | EnrichmentResult::Fallback { data, .. } => Some(data),
            EnrichmentResult::Failed { .. } => None,
        }
    }

    pub fn into_data(self) -> Option<T> {
        match self {
            EnrichmentResult::Success(data) | EnrichmentResult::Fallback { data, .. } => Some(data),
            EnrichmentResult::Failed { .. } => None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, EnrichmentResult::Success(_))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, EnrichmentResult::Failed { .. })
    }

    pub fn fallback_reason(&self) -> Option<FallbackReason> {
        match self {
            EnrichmentResult::Fallback { reason, .. } => Some(*reason),
            _ => None,
        }
    }
}

/// Counters exposed on the health surface.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReliabilityStats {
    pub service: String,
    pub breaker_state: Option<BreakerState>,
    pub breaker_trips: u64,
    pub consecutive_failures: u32,
    pub calls: u64,
    pub retries: u64,
    pub successes: u64,
    pub fallbacks: u64,
    pub malformed: u64,
    pub failures: u64,
}

enum CallOutcome<T> {
    Ok(T),
    Malformed(String),
    BreakerOpen,
    Exhausted(String),
}

/// The enrichment service wrapped in retry, breaker and fallback logic.
pub struct ReliableEnricher {
    service: Arc<dyn EnrichmentService>,
    lexical: LexicalEnricher,
    extract_breaker: CircuitBreaker,
    embed_breaker: CircuitBreaker,
    config: ReliabilityConfig,
    clock: SharedClock,
    calls: AtomicU64,
    retries: AtomicU64,
    successes: AtomicU64,
    fallbacks: AtomicU64,
    malformed: AtomicU64,
    failures: AtomicU64,
}

impl std::fmt::Debug for ReliableEnricher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReliableEnricher")
            .field("service", &self.service.name())
            .field("extract_breaker", &self.extract_breaker)
            .field("embed_breaker", &self.embed_breaker)
            .finish_non_exhaustive()
    }
}

impl ReliableEnricher {
    /// Wrap a service.
    pub fn new(service: Arc<dyn EnrichmentService>, config: ReliabilityConfig, clock: SharedClock) -> Self {
        Self {
            lexical: LexicalEnricher::new(config.fallback_max_concepts, config.embedding_dims),
            extract_breaker: CircuitBreaker::new(config.breaker_threshold, config.breaker_cooldown_secs),
            embed_breaker: CircuitBreaker::new(config.breaker_threshold, config.breaker_cooldown_secs),
            service,
            config,
            clock,
            calls: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            fallbacks: AtomicU64::new(0),
            malformed: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &ReliabilityConfig {
        &self.config
    }

    /// Most severe state across the per-operation breakers.
    pub fn breaker_state(&self) -> BreakerState {
        let now = self.clock.now();
        match (self.extract_breaker.state(now), self.embed_breaker.state(now)) {
            (BreakerState::Open, _) | (_, BreakerState::Open) => BreakerState::Open,
            (BreakerState::HalfOpen, _) | (_, BreakerState::HalfOpen) => BreakerState::HalfOpen,
            _ => BreakerState::Closed,
        }
    }

    /// The heuristic substitute.
    pub fn lexical(&self) -> &LexicalEnricher {
        &self.lexical
    }

    async fn call<T, F, Fut>(
        &self,
        operation: &'static str,
        breaker: &CircuitBreaker,
        mut attempt_fn: F,
    ) -> CallOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        let policy = self.config.retry_policy();
        let mut attempt = 0u32;
        loop {
            if !breaker.allow(self.clock.now()) {
                return CallOutcome::BreakerOpen;
            }
            self.calls.fetch_add(1, Ordering::Relaxed);
            let result = match tokio::time::timeout(self.config.call_timeout(), attempt_fn()).await {
                Ok(result) => result,
                Err(_) => Err(ServiceError::Timeout),
            };

            match result {
                Ok(value) => return CallOutcome::Ok(value),
                Err(ServiceError::Malformed(reason)) => return CallOutcome::Malformed(reason),
                Err(error) => {
                    breaker.record_failure(self.clock.now());
                    if attempt >= self.config.max_retries {
                        return CallOutcome::Exhausted(error.to_string());
                    }
                    let delay = policy.delay(attempt);
                    debug!(operation, attempt, delay_ms = delay.as_millis() as u64, %error, "retrying enrichment call");
                    self.retries.fetch_add(1, Ordering::Relaxed);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    fn note_malformed(&self, operation: &str, breaker: &CircuitBreaker, reason: &str) {
        self.malformed.fetch_add(1, Ordering::Relaxed);
        let now = self.clock.now();
        breaker.record_failure(now);
        warn!(operation, reason, breaker_state = %breaker.state(now), "malformed enrichment response");
    }

    async fn extract(&self, text: &str) -> EnrichmentResult<(BTreeSet<String>, Option<String>)> {
        let limit = self.config.fallback_max_concepts;
        match self
            .call("summarize_or_extract", &self.extract_breaker, || {
                self.service.summarize_or_extract(text)
            })
            .await
        {
            CallOutcome::Ok(raw) => {
                let (parsed, recovery) = parse_extraction(&raw);
                let data = (parsed.concept_set(limit), parsed.summary.clone());
                let reason = match recovery {
                    Recovery::Clean => {
                        self.extract_breaker.record_success();
                        return EnrichmentResult::Success(data);
                    }
                    Recovery::Repaired => FallbackReason::Repaired,
                    Recovery::Partial => FallbackReason::PartialExtraction,
                    Recovery::SafeDefault => FallbackReason::SafeDefault,
                };
                self.note_malformed("summarize_or_extract", &self.extract_breaker, &format!("{recovery:?}"));
                EnrichmentResult::Fallback { data, reason }
            }
            CallOutcome::Malformed(reason) => {
                self.note_malformed("summarize_or_extract", &self.extract_breaker, &reason);
                EnrichmentResult::Fallback {
                    data: (BTreeSet::new(), None),
                    reason: FallbackReason::SafeDefault,
                }
            }
            CallOutcome::BreakerOpen => EnrichmentResult::Fallback {
                data: (self.lexical.concepts(text), self.lexical.summary(text)),
                reason: FallbackReason::BreakerOpen,
            },
            CallOutcome::Exhausted(reason) => EnrichmentResult::Failed { reason },
        }
    }

    async fn embed(&self, text: &str) -> EnrichmentResult<Vec<f32>> {
        let dims = self.config.embedding_dims;
        match self.call("embed", &self.embed_breaker, || self.service.embed(text)).await {
            CallOutcome::Ok(vector) if vector.len() == dims && vector.iter().all(|v| v.is_finite()) => {
                self.embed_breaker.record_success();
                EnrichmentResult::Success(vector)
            }
            CallOutcome::Ok(vector) => {
                self.note_malformed(
                    "embed",
                    &self.embed_breaker,
                    &format!("{} dims, expected {dims}", vector.len()),
                );
                EnrichmentResult::Fallback {
                    data: vec![0.0; dims],
                    reason: FallbackReason::SafeDefault,
                }
            }
            CallOutcome::Malformed(reason) => {
                self.note_malformed("embed", &self.embed_breaker, &reason);
                EnrichmentResult::Fallback {
                    data: vec![0.0; dims],
                    reason: FallbackReason::SafeDefault,
                }
            }
            CallOutcome::BreakerOpen => EnrichmentResult::Fallback {
                data: self.lexical.embedding(text),
                reason: FallbackReason::BreakerOpen,
            },
            CallOutcome::Exhausted(reason) => EnrichmentResult::Failed { reason },
        }
    }

    /// Enrich one text: concepts, summary and embedding.
    ///
    /// Never returns an error; a transient outage that outlasts the retries
    /// yields [`EnrichmentResult::Failed`] so the caller can park the item.
    pub async fn enrich(&self, text: &str) -> EnrichmentResult<Enrichment> {
        let extracted = self.extract(text).await;
        let (concepts, summary, first_reason) = match extracted {
            EnrichmentResult::Success((c, s)) => (c, s, None),
            EnrichmentResult::Fallback { data: (c, s), reason } => (c, s, Some(reason)),
            EnrichmentResult::Failed { reason } => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                return EnrichmentResult::Failed { reason };
            }
        };

        let (embedding, reason) = match self.embed(text).await {
            EnrichmentResult::Success(v) => (v, first_reason),
            EnrichmentResult::Fallback { data, reason } => (data, first_reason.or(Some(reason))),
            EnrichmentResult::Failed { reason } => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                return EnrichmentResult::Failed { reason };
            }
        };

        let data = Enrichment {
            concepts,
            summary,
            embedding: Some(embedding),
        };
        match reason {
            None => {
                self.successes.fetch_add(1, Ordering::Relaxed);
                EnrichmentResult::Success(data)
            }
            Some(reason) => {
                self.fallbacks.fetch_add(1, Ordering::Relaxed);
                EnrichmentResult::Fallback { data, reason }
            }
        }
    }

    /// Lexical enrichment for a dead letter that ran out of attempts.
    pub fn give_up(&self, text: &str) -> EnrichmentResult<Enrichment> {
        self.fallbacks.fetch_add(1, Ordering::Relaxed);
        EnrichmentResult::Fallback {
            data: self.lexical.enrich(text),
            reason: FallbackReason::RetriesExhausted,
        }
    }

    /// Counters and breaker state.
    pub fn stats(&self) -> ReliabilityStats {
        ReliabilityStats {
            service: self.service.name().to_string(),
            breaker_state: Some(self.breaker_state()),
            breaker_trips: self.extract_breaker.trips() + self.embed_breaker.trips(),
            consecutive_failures: self
                .extract_breaker
                .consecutive_failures()
                .max(self.embed_breaker.consecutive_failures()),
            calls: self.calls.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}
