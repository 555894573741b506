//! Run records
//!
//! One JSON file per batch and model, holding every raw model response next
//! to the final tags so runs with different models can be compared later.

use crate::assembler::StatusCounts;
use crate::model::ModelPreset;
use crate::pipeline::{BatchReport, ClusterTrace};
use crate::types::{
    ClusterId, FinalTagSet, MergePolicy, PhotoId, PhotoMetadata, PhotoStatus, RawResponse,
    TaggingError, TaggingResult,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Persisted record of one batch run
#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    pub batch_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub model: String,
    pub model_description: String,
    pub policy: MergePolicy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    pub total_images: usize,
    pub cancelled: bool,
    pub elapsed_ms: u64,
    pub counts: StatusCounts,
    pub clusters: Vec<ClusterTrace>,
    pub photos: Vec<PhotoRecord>,
}

/// Per-photo section of a run record
#[derive(Debug, Clone, Serialize)]
pub struct PhotoRecord {
    pub photo_id: PhotoId,
    pub path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<PhotoMetadata>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster_id: Option<ClusterId>,
    pub status: PhotoStatus,
    pub responses: Vec<RawResponse>,
    pub final_tags: FinalTagSet,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub issues: Vec<String>,
}

impl RunRecord {
    /// Combine a batch report with the request context that produced it
    pub fn from_report(
        report: &BatchReport,
        preset: &ModelPreset,
        policy: MergePolicy,
        hint: Option<&str>,
    ) -> Self {
        let outcomes: HashMap<&PhotoId, _> =
            report.outcomes.iter().map(|o| (&o.photo_id, o)).collect();

        let photos = report
            .photos
            .iter()
            .map(|trace| {
                let outcome = outcomes.get(&trace.photo_id);
                PhotoRecord {
                    photo_id: trace.photo_id.clone(),
                    path: trace.path.clone(),
                    metadata: trace.metadata.clone(),
                    cluster_id: trace.cluster_id.clone(),
                    status: outcome.map(|o| o.status).unwrap_or(PhotoStatus::Error),
                    responses: trace.responses.clone(),
                    final_tags: outcome.map(|o| o.tags.clone()).unwrap_or_default(),
                    issues: outcome.map(|o| o.issues.clone()).unwrap_or_default(),
                }
            })
            .collect();

        Self {
            batch_id: report.batch_id,
            timestamp: Utc::now(),
            model: preset.name.to_string(),
            model_description: preset.description.to_string(),
            policy,
            hint: hint.map(str::to_string),
            total_images: report.outcomes.len(),
            cancelled: report.cancelled,
            elapsed_ms: report.elapsed_ms,
            counts: report.counts,
            clusters: report.clusters.clone(),
            photos,
        }
    }

    /// `run_<model>_<YYYYmmdd_HHMMSS>.json`, with `:` and `/` made path-safe
    pub fn file_name(&self) -> String {
        let model = self.model.replace([':', '/'], "_");
        format!("run_{}_{}.json", model, self.timestamp.format("%Y%m%d_%H%M%S"))
    }
}

/// Write a run record into `dir`, creating it if needed
///
/// # Returns
/// Path of the written file
pub async fn write_run_record(dir: &Path, record: &RunRecord) -> TaggingResult<PathBuf> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| TaggingError::Sink(format!("Create {} failed: {}", dir.display(), e)))?;

    let path = dir.join(record.file_name());
    let content = serde_json::to_vec_pretty(record)
        .map_err(|e| TaggingError::Internal(format!("Serialize run record failed: {}", e)))?;
    tokio::fs::write(&path, content)
        .await
        .map_err(|e| TaggingError::Sink(format!("Write {} failed: {}", path.display(), e)))?;

    tracing::info!(path = %path.display(), photos = record.total_images, "Run record written");
    Ok(path)
}
