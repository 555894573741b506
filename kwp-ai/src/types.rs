//! Core Types for the Tag Synthesis Engine
//!
//! Defines the data contracts between pipeline stages:
//! - **Input:** `PhotoInput` (raw EXIF, existing tags) → `Photo` (normalized)
//! - **Grouping:** `Cluster`
//! - **Candidates:** `TagCandidate` with `TagSource` + `SourceRef` provenance
//! - **Output:** `FinalTagSet`, `PhotoStatus`, `PhotoOutcome`
//!
//! # Architecture
//! Normalize → Cluster → Analyze (concurrent) → Merge (per photo) → Assemble

use crate::fusion::normalize::normalize_tag;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

// ============================================================================
// Identifiers
// ============================================================================

/// Photo identifier (caller-chosen or content hash)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PhotoId(pub String);

impl PhotoId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PhotoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Synthetic cluster identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClusterId(pub String);

impl ClusterId {
    /// Id of the designated group for photos without time and location
    pub const UNCLUSTERED: &'static str = "unclustered";

    /// Sequential id for the n-th cluster (1-based)
    pub fn numbered(n: usize) -> Self {
        Self(format!("cluster-{:03}", n))
    }

    pub fn unclustered() -> Self {
        Self(Self::UNCLUSTERED.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Photo & Metadata
// ============================================================================

/// GPS coordinate in decimal degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GpsCoordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl GpsCoordinate {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }
}

/// Raw EXIF fields as delivered by an [`crate::metadata::ExifReader`]
///
/// Values are untrusted strings/numbers; the normalizer validates them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawExif {
    pub date_time_original: Option<String>,
    /// Fallback when DateTimeOriginal is missing
    pub date_time: Option<String>,
    /// Degrees, minutes, seconds
    pub gps_latitude: Option<Vec<f64>>,
    /// "N" or "S"
    pub gps_latitude_ref: Option<String>,
    pub gps_longitude: Option<Vec<f64>>,
    /// "E" or "W"
    pub gps_longitude_ref: Option<String>,
    pub make: Option<String>,
    pub model: Option<String>,
    pub lens_model: Option<String>,
}

/// Canonical photo metadata (output of the Metadata Normalizer)
///
/// Absent values stay `None`; they are never defaulted to epoch or 0,0.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhotoMetadata {
    pub captured_at: Option<NaiveDateTime>,
    pub gps: Option<GpsCoordinate>,
    pub camera: Option<String>,
    pub lens: Option<String>,
}

/// Tag already assigned to a photo before this run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExistingTag {
    pub name: String,
    /// Caller-assigned weight; batch default applies when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<f32>,
}

impl ExistingTag {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            weight: None,
        }
    }

    pub fn weighted(name: impl Into<String>, weight: f32) -> Self {
        Self {
            name: name.into(),
            weight: Some(weight),
        }
    }
}

/// Photo as submitted to a batch, before normalization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhotoInput {
    pub id: PhotoId,
    /// Image file reference (owned externally)
    pub path: PathBuf,
    #[serde(default)]
    pub exif: Option<RawExif>,
    /// Set when the EXIF block could not be read at all
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exif_error: Option<String>,
    #[serde(default)]
    pub existing_tags: Vec<ExistingTag>,
}

impl PhotoInput {
    pub fn new(id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            id: PhotoId::new(id),
            path: path.into(),
            exif: None,
            exif_error: None,
            existing_tags: Vec::new(),
        }
    }

    pub fn with_exif(mut self, exif: RawExif) -> Self {
        self.exif = Some(exif);
        self
    }

    pub fn with_existing_tags(mut self, tags: Vec<ExistingTag>) -> Self {
        self.existing_tags = tags;
        self
    }
}

/// Normalized photo; immutable once loaded into a batch
#[derive(Debug, Clone, PartialEq)]
pub struct Photo {
    pub id: PhotoId,
    pub path: PathBuf,
    pub metadata: PhotoMetadata,
    pub existing_tags: Vec<ExistingTag>,
}

impl Photo {
    pub fn captured_at(&self) -> Option<NaiveDateTime> {
        self.metadata.captured_at
    }

    pub fn gps(&self) -> Option<GpsCoordinate> {
        self.metadata.gps
    }
}

// ============================================================================
// Clusters
// ============================================================================

/// Whether a cluster was formed by proximity or is the catch-all group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterKind {
    Proximity,
    Unclustered,
}

/// Mean capture time and mean position of a cluster's members
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Centroid {
    pub timestamp: Option<NaiveDateTime>,
    pub gps: Option<GpsCoordinate>,
}

/// Ordered group of photos sharing temporal/spatial proximity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub id: ClusterId,
    pub kind: ClusterKind,
    pub photo_ids: Vec<PhotoId>,
    pub centroid: Centroid,
}

impl Cluster {
    pub fn len(&self) -> usize {
        self.photo_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.photo_ids.is_empty()
    }

    /// Group-level analysis only runs for proximity clusters of 2+ photos
    pub fn wants_group_analysis(&self) -> bool {
        self.kind == ClusterKind::Proximity && self.photo_ids.len() >= 2
    }
}

// ============================================================================
// Tag Candidates & Provenance
// ============================================================================

/// Origin of a tag candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TagSource {
    PhotoAi,
    GroupAi,
    Exif,
    UserHint,
    Existing,
}

impl TagSource {
    /// Tie-break priority during ranking (higher wins)
    ///
    /// exif > group-ai > photo-ai > existing > user-hint
    pub fn priority(self) -> u8 {
        match self {
            Self::Exif => 4,
            Self::GroupAi => 3,
            Self::PhotoAi => 2,
            Self::Existing => 1,
            Self::UserHint => 0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::PhotoAi => "photo-ai",
            Self::GroupAi => "group-ai",
            Self::Exif => "exif",
            Self::UserHint => "user-hint",
            Self::Existing => "existing",
        }
    }
}

impl fmt::Display for TagSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a candidate's source observed: one photo, one cluster, or the batch
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum SourceRef {
    Photo(PhotoId),
    Cluster(ClusterId),
    /// Batch-wide context (user hint)
    Batch,
}

impl fmt::Display for SourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Photo(id) => write!(f, "photo:{}", id),
            Self::Cluster(id) => write!(f, "cluster:{}", id),
            Self::Batch => f.write_str("batch"),
        }
    }
}

/// A single proposed keyword with provenance and confidence weight
///
/// Identity = (tag, source, source_ref).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagCandidate {
    /// Normalized tag string
    pub tag: String,
    pub source: TagSource,
    pub source_ref: SourceRef,
    /// Confidence weight (0.0-1.0)
    pub weight: f32,
}

impl TagCandidate {
    /// Normalize `raw` and clamp `weight`; `None` when nothing is left
    pub fn new(raw: &str, source: TagSource, source_ref: SourceRef, weight: f32) -> Option<Self> {
        let tag = normalize_tag(raw);
        if tag.is_empty() {
            return None;
        }
        Some(Self {
            tag,
            source,
            source_ref,
            weight: clamp_weight(weight),
        })
    }

    pub fn provenance(&self) -> Provenance {
        Provenance {
            source: self.source,
            source_ref: self.source_ref.clone(),
            weight: self.weight,
        }
    }
}

/// Clamp a weight into 0.0-1.0, mapping NaN to 0.0
pub fn clamp_weight(weight: f32) -> f32 {
    if weight.is_nan() {
        0.0
    } else {
        weight.clamp(0.0, 1.0)
    }
}

/// One contributing source of a final or suppressed tag
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    pub source: TagSource,
    pub source_ref: SourceRef,
    pub weight: f32,
}

// ============================================================================
// Merge Policy & Final Output
// ============================================================================

/// Rule for combining new tags with tags already on a photo
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    /// Union existing and new tags, deduplicated
    #[default]
    Merge,
    /// Existing tags inform hierarchy resolution but never appear in output
    Ignore,
    /// Existing tags are dropped from input and output
    Replace,
}

impl MergePolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Merge => "merge",
            Self::Ignore => "ignore",
            Self::Replace => "replace",
        }
    }
}

impl FromStr for MergePolicy {
    type Err = TaggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "merge" => Ok(Self::Merge),
            "ignore" => Ok(Self::Ignore),
            "replace" => Ok(Self::Replace),
            other => Err(TaggingError::Configuration(format!(
                "Unknown merge policy '{}' (expected merge, ignore or replace)",
                other
            ))),
        }
    }
}

impl fmt::Display for MergePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tag kept in the final output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalTag {
    pub tag: String,
    pub weight: f32,
    /// Every source that proposed this tag (or a folded synonym of it)
    pub provenance: Vec<Provenance>,
    /// More general terms this tag subsumes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ancestors: Vec<String>,
    /// Equivalent spellings folded into this tag
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
}

impl FinalTag {
    /// Highest source priority among contributors
    pub fn best_priority(&self) -> u8 {
        self.provenance
            .iter()
            .map(|p| p.source.priority())
            .max()
            .unwrap_or(0)
    }

    pub fn has_source(&self, source: TagSource) -> bool {
        self.provenance.iter().any(|p| p.source == source)
    }
}

/// Why a candidate did not make it into the output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SuppressionReason {
    /// More general than a kept tag
    Subsumed { by: String },
    /// Same meaning as a better-ranked tag
    Synonym { of: String },
    /// Only existing tags proposed it and the policy hides them
    ExistingOnly,
    /// Cut by the caller's tag limit
    Truncated,
}

/// Audit entry for a dropped candidate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuppressedTag {
    pub tag: String,
    pub weight: f32,
    pub provenance: Vec<Provenance>,
    #[serde(flatten)]
    pub reason: SuppressionReason,
}

/// Per-photo ordered tags (most to least confident) plus audit trail
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FinalTagSet {
    pub tags: Vec<FinalTag>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suppressed: Vec<SuppressedTag>,
}

impl FinalTagSet {
    pub fn names(&self) -> Vec<&str> {
        self.tags.iter().map(|t| t.tag.as_str()).collect()
    }

    pub fn get(&self, tag: &str) -> Option<&FinalTag> {
        self.tags.iter().find(|t| t.tag == tag)
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }
}

/// Per-photo outcome status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhotoStatus {
    /// All contributing requests succeeded and tags survived
    Complete,
    /// A contributing request failed, timed out or was cancelled
    Degraded,
    /// Nothing failed but no tags survived
    Empty,
    /// Photo rejected before analysis (corrupt metadata)
    Error,
}

impl PhotoStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Complete => "complete",
            Self::Degraded => "degraded",
            Self::Empty => "empty",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for PhotoStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final result for one photo
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhotoOutcome {
    pub photo_id: PhotoId,
    pub status: PhotoStatus,
    pub tags: FinalTagSet,
    /// Human-readable reasons behind a degraded/error status
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub issues: Vec<String>,
}

// ============================================================================
// Batch Request
// ============================================================================

/// Engine entry point input
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRequest {
    #[serde(default = "Uuid::new_v4")]
    pub batch_id: Uuid,
    pub photos: Vec<PhotoInput>,
    #[serde(default)]
    pub policy: MergePolicy,
    #[serde(default)]
    pub hint: Option<String>,
    #[serde(default)]
    pub max_tags: Option<usize>,
}

impl BatchRequest {
    pub fn new(photos: Vec<PhotoInput>, policy: MergePolicy) -> Self {
        Self {
            batch_id: Uuid::new_v4(),
            photos,
            policy,
            hint: None,
            max_tags: None,
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn with_max_tags(mut self, max_tags: usize) -> Self {
        self.max_tags = Some(max_tags);
        self
    }
}

// ============================================================================
// Raw Responses (run record)
// ============================================================================

/// One analysis request as it happened, kept for the run record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawResponse {
    pub kind: crate::model::PromptKind,
    pub prompt: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub attempts: u32,
    pub elapsed_ms: u64,
}

// ============================================================================
// Error Types
// ============================================================================

/// Tagging engine error
#[derive(Debug, Error)]
pub enum TaggingError {
    /// Corrupt input metadata; local to one photo
    #[error("Metadata error: {0}")]
    Metadata(String),

    /// Request exceeded its timeout on every attempt
    #[error("Analysis timed out after {attempts} attempt(s) ({timeout:?} each)")]
    AnalysisTimeout { timeout: Duration, attempts: u32 },

    /// Request failed permanently or after retries
    #[error("Analysis failed: {0}")]
    AnalysisFailure(String),

    /// Batch cancellation observed before the request ran
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Invalid policy, thresholds or limits; raised before any work starts
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Sink rejected a result
    #[error("Sink error: {0}")]
    Sink(String),

    /// Internal invariant broken
    #[error("Internal error: {0}")]
    Internal(String),
}

pub type TaggingResult<T> = Result<T, TaggingError>;

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_normalizes_and_clamps() {
        let c = TagCandidate::new(
            "  Rouen   Cathedral! ",
            TagSource::PhotoAi,
            SourceRef::Photo(PhotoId::new("p1")),
            1.5,
        )
        .unwrap();
        assert_eq!(c.tag, "rouen cathedral");
        assert_eq!(c.weight, 1.0);

        let nan = TagCandidate::new("x", TagSource::Exif, SourceRef::Batch, f32::NAN).unwrap();
        assert_eq!(nan.weight, 0.0);
    }

    #[test]
    fn test_candidate_rejects_punctuation_only() {
        assert!(TagCandidate::new("...", TagSource::PhotoAi, SourceRef::Batch, 0.5).is_none());
    }

    #[test]
    fn test_source_priority_order() {
        assert!(TagSource::Exif.priority() > TagSource::GroupAi.priority());
        assert!(TagSource::GroupAi.priority() > TagSource::PhotoAi.priority());
        assert!(TagSource::PhotoAi.priority() > TagSource::Existing.priority());
        assert!(TagSource::Existing.priority() > TagSource::UserHint.priority());
    }

    #[test]
    fn test_merge_policy_parsing() {
        assert_eq!("Merge".parse::<MergePolicy>().unwrap(), MergePolicy::Merge);
        assert_eq!(" ignore ".parse::<MergePolicy>().unwrap(), MergePolicy::Ignore);
        assert_eq!("replace".parse::<MergePolicy>().unwrap(), MergePolicy::Replace);

        let err = "union".parse::<MergePolicy>().unwrap_err();
        assert!(matches!(err, TaggingError::Configuration(_)));
    }

    #[test]
    fn test_serialized_field_names_are_stable() {
        let source = serde_json::to_value(TagSource::GroupAi).unwrap();
        assert_eq!(source, "group-ai");

        let status = serde_json::to_value(PhotoStatus::Degraded).unwrap();
        assert_eq!(status, "degraded");

        let source_ref = serde_json::to_value(SourceRef::Cluster(ClusterId::numbered(2))).unwrap();
        assert_eq!(source_ref["kind"], "cluster");
        assert_eq!(source_ref["id"], "cluster-002");

        let suppressed = SuppressedTag {
            tag: "cathedral".to_string(),
            weight: 0.7,
            provenance: vec![],
            reason: SuppressionReason::Subsumed {
                by: "rouen cathedral".to_string(),
            },
        };
        let json = serde_json::to_value(&suppressed).unwrap();
        assert_eq!(json["reason"], "subsumed");
        assert_eq!(json["by"], "rouen cathedral");
    }

    #[test]
    fn test_group_analysis_requires_two_members() {
        let mut cluster = Cluster {
            id: ClusterId::numbered(1),
            kind: ClusterKind::Proximity,
            photo_ids: vec![PhotoId::new("a")],
            centroid: Centroid::default(),
        };
        assert!(!cluster.wants_group_analysis());

        cluster.photo_ids.push(PhotoId::new("b"));
        assert!(cluster.wants_group_analysis());

        cluster.kind = ClusterKind::Unclustered;
        assert!(!cluster.wants_group_analysis());
    }

    #[test]
    fn test_batch_request_deserializes_with_defaults() {
        let request: BatchRequest = serde_json::from_str(
            r#"{"photos":[{"id":"a","path":"/tmp/a.jpg"}]}"#,
        )
        .unwrap();
        assert_eq!(request.policy, MergePolicy::Merge);
        assert!(request.hint.is_none());
        assert!(request.max_tags.is_none());
        assert!(request.photos[0].existing_tags.is_empty());
    }
}
