//! Result sinks
//!
//! The engine hands every [`PhotoOutcome`] to a [`TagSink`]; what happens
//! next (catalog write-back, export, UI) is the sink's business.

use crate::types::{PhotoOutcome, TaggingError, TaggingResult};
use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// Consumer of per-photo results
#[async_trait]
pub trait TagSink: Send + Sync {
    async fn write(&self, batch_id: Uuid, outcome: &PhotoOutcome) -> TaggingResult<()>;
}

/// Keeps outcomes in memory (HTTP responses, tests)
#[derive(Default)]
pub struct MemorySink {
    outcomes: Mutex<Vec<PhotoOutcome>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take everything collected so far
    pub fn drain(&self) -> Vec<PhotoOutcome> {
        let mut guard = self
            .outcomes
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        std::mem::take(&mut *guard)
    }

    pub fn len(&self) -> usize {
        self.outcomes
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl TagSink for MemorySink {
    async fn write(&self, _batch_id: Uuid, outcome: &PhotoOutcome) -> TaggingResult<()> {
        self.outcomes
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(outcome.clone());
        Ok(())
    }
}

#[derive(Serialize)]
struct JsonLine<'a> {
    batch_id: Uuid,
    #[serde(flatten)]
    outcome: &'a PhotoOutcome,
}

/// Appends one JSON object per photo to a file
pub struct JsonLinesSink {
    path: PathBuf,
    file: tokio::sync::Mutex<tokio::fs::File>,
}

impl JsonLinesSink {
    /// Open (create or append) the output file
    pub async fn open(path: &Path) -> TaggingResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    TaggingError::Sink(format!("Create {} failed: {}", parent.display(), e))
                })?;
            }
        }

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| TaggingError::Sink(format!("Open {} failed: {}", path.display(), e)))?;

        Ok(Self {
            path: path.to_path_buf(),
            file: tokio::sync::Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// `tags.jsonl` -> `tags.qwen3-vl_8b.jsonl`, so model comparisons keep
/// their outcomes apart
pub fn per_model_path(path: &Path, model: &str) -> PathBuf {
    let model = model.replace([':', '/'], "_");
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{}.{}.{}", stem, model, ext.to_string_lossy()),
        None => format!("{}.{}", stem, model),
    };
    path.with_file_name(name)
}

#[async_trait]
impl TagSink for JsonLinesSink {
    async fn write(&self, batch_id: Uuid, outcome: &PhotoOutcome) -> TaggingResult<()> {
        let mut line = serde_json::to_string(&JsonLine { batch_id, outcome })
            .map_err(|e| TaggingError::Sink(e.to_string()))?;
        line.push('\n');

        let mut file = self.file.lock().await;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| TaggingError::Sink(format!("Write {} failed: {}", self.path.display(), e)))?;
        file.flush()
            .await
            .map_err(|e| TaggingError::Sink(format!("Flush {} failed: {}", self.path.display(), e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FinalTagSet, PhotoId, PhotoStatus};
    use tempfile::TempDir;

    fn outcome(id: &str) -> PhotoOutcome {
        PhotoOutcome {
            photo_id: PhotoId::new(id),
            status: PhotoStatus::Empty,
            tags: FinalTagSet::default(),
            issues: vec![],
        }
    }

    #[tokio::test]
    async fn test_memory_sink_collects() {
        let sink = MemorySink::new();
        sink.write(Uuid::nil(), &outcome("a")).await.unwrap();
        sink.write(Uuid::nil(), &outcome("b")).await.unwrap();
        assert_eq!(sink.len(), 2);

        let drained = sink.drain();
        assert_eq!(drained[1].photo_id.as_str(), "b");
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_json_lines_sink_appends() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out").join("tags.jsonl");

        let sink = JsonLinesSink::open(&path).await.unwrap();
        sink.write(Uuid::nil(), &outcome("a")).await.unwrap();
        sink.write(Uuid::nil(), &outcome("b")).await.unwrap();
        drop(sink);

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["photo_id"], "a");
        assert_eq!(lines[0]["status"], "empty");
        assert_eq!(lines[1]["batch_id"], Uuid::nil().to_string());
    }

    #[test]
    fn test_per_model_path() {
        assert_eq!(
            per_model_path(Path::new("/out/tags.jsonl"), "qwen3-vl:8b"),
            PathBuf::from("/out/tags.qwen3-vl_8b.jsonl")
        );
        assert_eq!(
            per_model_path(Path::new("tags"), "library/llava:latest"),
            PathBuf::from("tags.library_llava_latest")
        );
    }

    #[tokio::test]
    async fn test_per_model_sinks_stay_separate() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tags.jsonl");

        for (model, id) in [("qwen3-vl:8b", "a"), ("llava:latest", "b")] {
            let sink = JsonLinesSink::open(&per_model_path(&path, model)).await.unwrap();
            sink.write(Uuid::nil(), &outcome(id)).await.unwrap();
        }

        assert!(!path.exists());
        let qwen = std::fs::read_to_string(dir.path().join("tags.qwen3-vl_8b.jsonl")).unwrap();
        let llava = std::fs::read_to_string(dir.path().join("tags.llava_latest.jsonl")).unwrap();
        assert_eq!(qwen.lines().count(), 1);
        assert!(qwen.contains("\"photo_id\":\"a\""));
        assert!(llava.contains("\"photo_id\":\"b\""));
    }
}
