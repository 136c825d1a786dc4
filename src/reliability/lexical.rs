/// Lexical stand-in for the enrichment service.
///
/// Concepts are the most frequent non-stop-word tokens; the embedding is a
/// signed feature hash of the tokens, L2-normalized. Deterministic and
/// offline, so it is always available when the real service is not.
use async_trait::async_trait;
use regex::Regex;
use std::collections::{BTreeSet, HashMap};
use std::sync::LazyLock;

use super::{Enrichment, EnrichmentService, ServiceError};

static TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\p{L}\p{N}][\p{L}\p{N}_\-']*").expect("invalid regex"));

const STOPWORDS: &[&str] = &[
    "a", "about", "after", "all", "also", "an", "and", "any", "are", "as", "at", "be", "been",
    "before", "but", "by", "can", "could", "did", "do", "does", "for", "from", "had", "has",
    "have", "he", "her", "his", "how", "i", "if", "in", "into", "is", "it", "its", "just", "me",
    "more", "my", "no", "not", "of", "on", "one", "or", "our", "out", "she", "so", "some",
    "than", "that", "the", "their", "them", "then", "there", "these", "they", "this", "those",
    "to", "too", "up", "us", "very", "was", "we", "were", "what", "when", "where", "which",
    "while", "who", "why", "will", "with", "would", "you", "your",
];

const MIN_TOKEN_LEN: usize = 3;
const SUMMARY_CHARS: usize = 160;

/// Tokenize into lowercase, stop-word-filtered terms.
pub fn tokenize(text: &str) -> Vec<String> {
    TOKEN
        .find_iter(text)
        .map(|m| m.as_str().trim_matches(|c| c == '\'' || c == '-').to_lowercase())
        .filter(|t| t.chars().count() >= MIN_TOKEN_LEN && !STOPWORDS.contains(&t.as_str()))
        .collect()
}

/// Heuristic concept extraction and hashed embeddings.
#[derive(Debug, Clone)]
pub struct LexicalEnricher {
    max_concepts: usize,
    dims: usize,
}

impl LexicalEnricher {
    pub fn new(max_concepts: usize, dims: usize) -> Self {
        Self {
            max_concepts,
            dims: dims.max(1),
        }
    }

    /// Most frequent terms; ties broken by first occurrence.
    pub fn concepts(&self, text: &str) -> BTreeSet<String> {
        let mut counts: HashMap<String, (usize, usize)> = HashMap::new();
        for (position, token) in tokenize(text).into_iter().enumerate() {
            counts.entry(token).or_insert((0, position)).0 += 1;
        }
        let mut ranked: Vec<(String, usize, usize)> = counts
            .into_iter()
            .map(|(token, (count, first))| (token, count, first))
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.2.cmp(&b.2)));
        ranked
            .into_iter()
            .take(self.max_concepts)
            .map(|(token, _, _)| token)
            .collect()
    }

    /// Signed feature-hash embedding.
    pub fn embedding(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dims];
        for token in tokenize(text) {
            let hash = blake3::hash(token.as_bytes());
            let bytes = hash.as_bytes();
            let mut prefix = [0u8; 8];
            prefix.copy_from_slice(&bytes[..8]);
            let index = (u64::from_le_bytes(prefix) % self.dims as u64) as usize;
            let sign = if bytes[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[index] += sign;
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }

    /// First sentence, truncated.
    pub fn summary(&self, text: &str) -> Option<String> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return None;
        }
        let sentence = trimmed
            .split_inclusive(['.', '!', '?'])
            .next()
            .unwrap_or(trimmed)
            .trim();
        Some(sentence.chars().take(SUMMARY_CHARS).collect())
    }

    /// Full heuristic enrichment.
    pub fn enrich(&self, text: &str) -> Enrichment {
        Enrichment {
            concepts: self.concepts(text),
            summary: self.summary(text),
            embedding: Some(self.embedding(text)),
        }
    }
}

#[async_trait]
impl EnrichmentService for LexicalEnricher {
    async fn summarize_or_extract(&self, text: &str) -> Result<String, ServiceError> {
        let body = serde_json::json!({
            "concepts": self.concepts(text),
            "summary": self.summary(text),
        });
        Ok(body.to_string())
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ServiceError> {
        Ok(self.embedding(text))
    }

    fn name(&self) -> &str {
        "lexical"
    }
}
