/// Source feeds of raw content records.
///
/// A feed is an append-only sequence addressed by offset. Working memory
/// keeps the cursor of the next offset to read in its own state, so a tick
/// that fails to commit simply re-reads the same records.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::warn;

use crate::error::{RecallError, RecallResult};
use crate::types::{clamp_unit, MemoryItem};

/// A raw record as read from a feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    /// Position in the feed
    pub offset: u64,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    /// Concepts supplied by the producer, merged with enrichment
    #[serde(default)]
    pub concepts: Vec<String>,
    /// Producer-supplied salience; the configured initial activation otherwise
    #[serde(default)]
    pub activation: Option<f64>,
}

impl RawRecord {
    /// A minimal record.
    pub fn new(offset: u64, content: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            offset,
            id: None,
            content: Some(content.into()),
            created_at: Some(created_at),
            concepts: Vec::new(),
            activation: None,
        }
    }

    /// Turn the record into an incoming item, rejecting missing fields.
    pub fn into_item(self, initial_activation: f64) -> RecallResult<MemoryItem> {
        let content = match self.content {
            Some(c) if !c.trim().is_empty() => c,
            _ => {
                return Err(RecallError::InvalidItem {
                    reason: format!("record {} has no content", self.offset),
                });
            }
        };
        let created_at = self.created_at.ok_or_else(|| RecallError::InvalidItem {
            reason: format!("record {} has no created_at", self.offset),
        })?;
        let activation = clamp_unit(self.activation.unwrap_or(initial_activation), "record.activation");
        let concepts = self
            .concepts
            .into_iter()
            .map(|c| c.trim().to_lowercase())
            .filter(|c| !c.is_empty());
        let id = self.id.unwrap_or_else(|| format!("rec-{:08}", self.offset));
        Ok(MemoryItem::new(content, created_at, concepts, activation).with_id(id))
    }
}

/// Feed read failures.
#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    #[error("feed unavailable: {0}")]
    Unavailable(String),
    #[error("feed read timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("feed I/O: {0}")]
    Io(#[from] std::io::Error),
}

impl From<FeedError> for RecallError {
    fn from(err: FeedError) -> Self {
        RecallError::FeedUnavailable(err.to_string())
    }
}

/// An append-only source of records.
#[async_trait]
pub trait SourceFeed: Send + Sync {
    /// Up to `max` records starting at offset `from`, in offset order.
    async fn read_batch(&self, from: u64, max: usize) -> Result<Vec<RawRecord>, FeedError>;

    /// Name used in logs.
    fn name(&self) -> &str {
        "feed"
    }
}

/// In-memory feed.
#[derive(Debug, Clone, Default)]
pub struct VecFeed {
    records: Arc<Mutex<Vec<RawRecord>>>,
    unavailable: Arc<AtomicBool>,
}

impl VecFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record; its offset is assigned here. Returns the offset.
    pub fn push(&self, mut record: RawRecord) -> u64 {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let offset = records.len() as u64;
        record.offset = offset;
        records.push(record);
        offset
    }

    /// Append plain content.
    pub fn push_content(&self, content: impl Into<String>, created_at: DateTime<Utc>) -> u64 {
        self.push(RawRecord::new(0, content, created_at))
    }

    /// Simulate an outage.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::Relaxed);
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl SourceFeed for VecFeed {
    async fn read_batch(&self, from: u64, max: usize) -> Result<Vec<RawRecord>, FeedError> {
        if self.unavailable.load(Ordering::Relaxed) {
            return Err(FeedError::Unavailable("in-memory feed offline".into()));
        }
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        Ok(records
            .iter()
            .skip(from as usize)
            .take(max)
            .cloned()
            .collect())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

/// Append-only JSON-lines file; the offset is the line number.
#[derive(Debug, Clone)]
pub struct JsonlFeed {
    path: PathBuf,
}

impl JsonlFeed {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SourceFeed for JsonlFeed {
    async fn read_batch(&self, from: u64, max: usize) -> Result<Vec<RawRecord>, FeedError> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(FeedError::Unavailable(format!("{} not found", self.path.display())));
            }
            Err(e) => return Err(e.into()),
        };

        let mut batch = Vec::new();
        for (line_no, line) in text.lines().enumerate().skip(from as usize) {
            if batch.len() >= max {
                break;
            }
            let offset = line_no as u64;
            if line.trim().is_empty() {
                // Blank lines keep their offset but carry nothing.
                batch.push(RawRecord {
                    offset,
                    id: None,
                    content: None,
                    created_at: None,
                    concepts: Vec::new(),
                    activation: None,
                });
                continue;
            }
            let mut value: serde_json::Value = match serde_json::from_str(line) {
                Ok(v) => v,
                Err(e) => {
                    warn!(offset, error = %e, "unparseable feed line");
                    serde_json::Value::Null
                }
            };
            if let Some(obj) = value.as_object_mut() {
                obj.insert("offset".into(), serde_json::Value::from(offset));
            }
            let record = serde_json::from_value::<RawRecord>(value).unwrap_or(RawRecord {
                offset,
                id: None,
                content: None,
                created_at: None,
                concepts: Vec::new(),
                activation: None,
            });
            batch.push(record);
        }
        Ok(batch)
    }

    fn name(&self) -> &str {
        "jsonl"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_record_validation() {
        let now = Utc::now();
        let item = RawRecord::new(3, "hello", now).into_item(0.9).unwrap();
        assert_eq!(item.id, "rec-00000003");
        assert_eq!(item.activation, 0.9);

        let mut missing = RawRecord::new(4, "x", now);
        missing.created_at = None;
        assert!(matches!(missing.into_item(0.9), Err(RecallError::InvalidItem { .. })));

        let blank = RawRecord::new(5, "   ", now);
        assert!(blank.into_item(0.9).is_err());
    }

    #[tokio::test]
    async fn test_vec_feed_offsets_and_outage() {
        let feed = VecFeed::new();
        let now = Utc::now();
        for i in 0..5 {
            feed.push_content(format!("r{i}"), now);
        }
        let batch = feed.read_batch(2, 2).await.unwrap();
        assert_eq!(batch.iter().map(|r| r.offset).collect::<Vec<_>>(), vec![2, 3]);

        feed.set_available(false);
        assert!(feed.read_batch(0, 10).await.is_err());
        feed.set_available(true);
        assert_eq!(feed.read_batch(4, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_jsonl_feed() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"content": "first", "created_at": "2026-01-05T09:00:00Z"}}"#).unwrap();
        writeln!(file, "not json").unwrap();
        writeln!(file).unwrap();
        writeln!(
            file,
            r#"{{"id": "x", "content": "fourth", "created_at": "2026-01-05T09:03:00Z", "concepts": ["Rust"]}}"#
        )
        .unwrap();

        let feed = JsonlFeed::new(file.path());
        let batch = feed.read_batch(0, 10).await.unwrap();
        assert_eq!(batch.len(), 4);
        assert_eq!(batch[1].offset, 1);
        assert!(batch[1].content.is_none());
        assert!(batch[2].content.is_none());
        assert_eq!(batch[3].offset, 3);

        let item = batch[3].clone().into_item(0.9).unwrap();
        assert_eq!(item.id, "x");
        assert!(item.concepts.contains("rust"));

        assert_eq!(feed.read_batch(3, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_file_is_unavailable() {
        let feed = JsonlFeed::new("/definitely/not/here.jsonl");
        assert!(matches!(
            feed.read_batch(0, 1).await,
            Err(FeedError::Unavailable(_))
        ));
    }
}
