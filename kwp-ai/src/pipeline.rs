//! Batch tagging pipeline
//!
//! Runs one batch end to end:
//! 1. Validation - policy limits, duplicate ids
//! 2. Normalization - raw EXIF to canonical metadata (bad photos become `error`)
//! 3. Clustering - temporal/spatial grouping
//! 4. Analysis - photo and group requests through the orchestrator
//! 5. Merge - per photo, in input order
//! 6. Assembly - status, sink, events
//!
//! Every photo gets exactly one outcome, whatever fails along the way.

use crate::assembler::{self, StatusCounts};
use crate::clustering::{ClusterBuilder, ClusterThresholds};
use crate::fusion::{ContainmentStrategy, MergeEngine, MergeSettings};
use crate::metadata;
use crate::model::{available_presets, find_preset, ModelPreset, PromptKind, VisionModel};
use crate::orchestrator::{AnalysisOrchestrator, CandidateStore, OrchestratorSettings};
use crate::sink::TagSink;
use crate::types::{
    BatchRequest, Cluster, ClusterId, Photo, PhotoId, PhotoMetadata, PhotoOutcome, RawResponse,
    SourceRef, TagCandidate, TagSource, TaggingError, TaggingResult,
};
use crate::utils::RetryPolicy;
use chrono::{Datelike, Utc};
use kwp_common::config::TomlConfig;
use kwp_common::events::{EventBus, TaggingEvent};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// EXIF-derived facts are certain
const EXIF_WEIGHT: f32 = 1.0;

// ============================================================================
// Configuration
// ============================================================================

/// Validated engine configuration
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub preset: ModelPreset,
    pub temperature: Option<f32>,
    pub thresholds: ClusterThresholds,
    pub orchestrator: OrchestratorSettings,
    pub merge: MergeSettings,
    pub synonyms: BTreeMap<String, Vec<String>>,
    pub user_hint_weight: f32,
    /// Weight for existing tags the caller left unweighted
    pub existing_weight: f32,
    pub exif_year_tag: bool,
}

impl PipelineConfig {
    /// Build and validate from the TOML configuration
    ///
    /// # Errors
    /// `TaggingError::Configuration` for unknown presets/prompts, zero
    /// workers or timeouts, and weights outside 0.0-1.0
    pub fn from_toml(config: &TomlConfig) -> TaggingResult<Self> {
        let model = &config.model;
        let engine = &config.engine;

        let preset = find_preset(&model.preset).copied().ok_or_else(|| {
            TaggingError::Configuration(format!(
                "Unknown model preset '{}' (available: {})",
                model.preset,
                available_presets()
            ))
        })?;

        if engine.worker_limit == 0 {
            return Err(TaggingError::Configuration(
                "worker_limit must be at least 1".to_string(),
            ));
        }
        if model.timeout_secs == 0 {
            return Err(TaggingError::Configuration(
                "timeout_secs must be at least 1".to_string(),
            ));
        }
        if let Some(t) = model.temperature {
            if !(t.is_finite() && (0.0..=2.0).contains(&t)) {
                return Err(TaggingError::Configuration(format!(
                    "temperature {} outside 0.0-2.0",
                    t
                )));
            }
        }

        let photo_prompt: PromptKind = engine
            .photo_prompt
            .parse()
            .map_err(TaggingError::Configuration)?;
        if !matches!(photo_prompt, PromptKind::Tags | PromptKind::DetailedTags) {
            return Err(TaggingError::Configuration(format!(
                "photo_prompt must be 'tags' or 'detailed_tags', got '{}'",
                engine.photo_prompt
            )));
        }

        let include_description = match engine.include_description.as_deref() {
            None => None,
            Some(raw) => {
                let kind: PromptKind = raw.parse().map_err(TaggingError::Configuration)?;
                if !matches!(kind, PromptKind::Brief | PromptKind::Description) {
                    return Err(TaggingError::Configuration(format!(
                        "include_description must be 'brief' or 'description', got '{}'",
                        raw
                    )));
                }
                Some(kind)
            }
        };

        for (name, value) in [
            ("photo_ai_weight", engine.photo_ai_weight),
            ("group_ai_weight", engine.group_ai_weight),
            ("user_hint_weight", engine.user_hint_weight),
            ("existing_weight", engine.existing_weight),
            ("ancestor_reinforcement", engine.ancestor_reinforcement),
        ] {
            validate_unit(name, value)?;
        }

        Ok(Self {
            preset,
            temperature: model.temperature,
            thresholds: ClusterThresholds::new(engine.time_gap_hours, engine.distance_km)?,
            orchestrator: OrchestratorSettings {
                worker_limit: engine.worker_limit,
                request_timeout: Duration::from_secs(model.timeout_secs),
                retry: RetryPolicy::new(
                    model.max_retries,
                    Duration::from_millis(model.backoff_initial_ms),
                    Duration::from_millis(model.backoff_max_ms),
                ),
                photo_prompt,
                include_description,
                photo_ai_weight: engine.photo_ai_weight,
                group_ai_weight: engine.group_ai_weight,
            },
            merge: MergeSettings {
                ancestor_reinforcement: engine.ancestor_reinforcement,
            },
            synonyms: engine.synonyms.clone(),
            user_hint_weight: engine.user_hint_weight,
            existing_weight: engine.existing_weight,
            exif_year_tag: engine.exif_year_tag,
        })
    }

    /// Same configuration with another model preset
    pub fn with_preset(mut self, key: &str) -> TaggingResult<Self> {
        self.preset = find_preset(key).copied().ok_or_else(|| {
            TaggingError::Configuration(format!(
                "Unknown model preset '{}' (available: {})",
                key,
                available_presets()
            ))
        })?;
        Ok(self)
    }
}

fn validate_unit(name: &str, value: f32) -> TaggingResult<()> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(TaggingError::Configuration(format!(
            "{} must be within 0.0-1.0, got {}",
            name, value
        )))
    }
}

// ============================================================================
// Batch report
// ============================================================================

/// Per-photo trace for the run record
#[derive(Debug, Clone, Serialize)]
pub struct PhotoTrace {
    pub photo_id: PhotoId,
    pub path: PathBuf,
    /// Absent when the normalizer rejected the photo
    pub metadata: Option<PhotoMetadata>,
    pub cluster_id: Option<ClusterId>,
    pub responses: Vec<RawResponse>,
}

/// Per-cluster trace for the run record
#[derive(Debug, Clone, Serialize)]
pub struct ClusterTrace {
    #[serde(flatten)]
    pub cluster: Cluster,
    pub responses: Vec<RawResponse>,
}

/// Everything a batch produced
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub batch_id: Uuid,
    /// One per input photo, in input order
    pub outcomes: Vec<PhotoOutcome>,
    pub photos: Vec<PhotoTrace>,
    pub clusters: Vec<ClusterTrace>,
    pub counts: StatusCounts,
    pub cancelled: bool,
    pub elapsed_ms: u64,
}

// ============================================================================
// Pipeline
// ============================================================================

/// Tag synthesis pipeline
pub struct TaggingPipeline {
    config: PipelineConfig,
    orchestrator: AnalysisOrchestrator,
    merge_engine: MergeEngine,
    event_bus: EventBus,
}

impl TaggingPipeline {
    /// Create a pipeline around a model backend
    ///
    /// The orchestrator's permit pool is shared by every batch this
    /// pipeline runs, so concurrent batches respect one backend limit.
    pub fn new(model: Arc<dyn VisionModel>, config: PipelineConfig, event_bus: EventBus) -> Self {
        let orchestrator = AnalysisOrchestrator::new(
            model,
            config.preset,
            config.temperature,
            config.orchestrator.clone(),
        )
        .with_event_bus(event_bus.clone());

        let merge_engine = MergeEngine::new(
            Arc::new(ContainmentStrategy::with_synonyms(&config.synonyms)),
            config.merge,
        );

        Self {
            config,
            orchestrator,
            merge_engine,
            event_bus,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    /// Run one batch to completion
    ///
    /// # Arguments
    /// * `request` - Photos, merge policy, hint, tag limit
    /// * `sink` - Receives each photo outcome as it is finalized
    /// * `cancel` - Stops new analysis requests; unfinished photos end degraded
    ///
    /// # Returns
    /// Report with one outcome per input photo (input order)
    ///
    /// # Errors
    /// `TaggingError::Configuration` before any work for invalid limits or
    /// duplicate photo ids
    pub async fn run_batch(
        &self,
        request: BatchRequest,
        sink: &dyn TagSink,
        cancel: &CancellationToken,
    ) -> TaggingResult<BatchReport> {
        let start = Instant::now();
        let batch_id = request.batch_id;

        // Phase 1: Validation
        if request.max_tags == Some(0) {
            return Err(TaggingError::Configuration(
                "max_tags must be at least 1 when given".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for photo in &request.photos {
            if !seen.insert(&photo.id) {
                return Err(TaggingError::Configuration(format!(
                    "Duplicate photo id '{}' in batch",
                    photo.id
                )));
            }
        }

        tracing::info!(
            batch_id = %batch_id,
            photos = request.photos.len(),
            policy = %request.policy,
            model = self.config.preset.name,
            "Starting tagging batch"
        );
        self.event_bus.emit_lossy(TaggingEvent::BatchStarted {
            batch_id,
            photo_count: request.photos.len(),
            timestamp: Utc::now(),
        });

        // Phase 2: Normalization
        let mut photos: Vec<Photo> = Vec::with_capacity(request.photos.len());
        let mut rejected: HashMap<PhotoId, String> = HashMap::new();
        for input in &request.photos {
            let normalized = match &input.exif_error {
                Some(e) => Err(TaggingError::Metadata(e.clone())),
                None => metadata::normalize(&input.exif.clone().unwrap_or_default()),
            };
            match normalized {
                Ok(metadata) => photos.push(Photo {
                    id: input.id.clone(),
                    path: input.path.clone(),
                    metadata,
                    existing_tags: input.existing_tags.clone(),
                }),
                Err(e) => {
                    tracing::warn!(photo_id = %input.id, error = %e, "Photo rejected");
                    rejected.insert(input.id.clone(), e.to_string());
                }
            }
        }

        // Phase 3: Clustering
        let clusters = ClusterBuilder::new(self.config.thresholds).build(&photos);
        let unclustered: usize = clusters
            .iter()
            .filter(|c| c.id.as_str() == ClusterId::UNCLUSTERED)
            .map(Cluster::len)
            .sum();
        tracing::info!(
            batch_id = %batch_id,
            clusters = clusters.len(),
            unclustered,
            "Phase 3: clusters built"
        );
        self.event_bus.emit_lossy(TaggingEvent::ClustersBuilt {
            batch_id,
            cluster_count: clusters.len(),
            unclustered,
        });

        let cluster_of: HashMap<&PhotoId, &ClusterId> = clusters
            .iter()
            .flat_map(|c| c.photo_ids.iter().map(move |id| (id, &c.id)))
            .collect();

        // Phase 4: Analysis
        let store = CandidateStore::new(
            photos
                .iter()
                .map(|p| SourceRef::Photo(p.id.clone()))
                .chain(clusters.iter().map(|c| SourceRef::Cluster(c.id.clone()))),
        );
        for photo in &photos {
            store.append(
                &SourceRef::Photo(photo.id.clone()),
                self.exif_candidates(photo),
            );
        }

        self.orchestrator
            .run(
                batch_id,
                &photos,
                &clusters,
                request.hint.as_deref(),
                &store,
                cancel,
            )
            .await;

        let cancelled = cancel.is_cancelled();
        if cancelled {
            tracing::info!(batch_id = %batch_id, "Batch cancelled, finalizing partial results");
            self.event_bus
                .emit_lossy(TaggingEvent::BatchCancelled { batch_id });
        }

        // Phase 5-6: Merge + assembly, in input order
        let hint_candidates = self.hint_candidates(request.hint.as_deref());
        let mut slots = store.into_contents();
        let mut cluster_slots: HashMap<ClusterId, (Vec<TagCandidate>, Vec<String>)> = HashMap::new();
        let mut cluster_traces = Vec::with_capacity(clusters.len());
        for cluster in &clusters {
            let slot = slots
                .remove(&SourceRef::Cluster(cluster.id.clone()))
                .unwrap_or_default();
            cluster_slots.insert(cluster.id.clone(), (slot.candidates, slot.degraded));
            cluster_traces.push(ClusterTrace {
                cluster: cluster.clone(),
                responses: slot.responses,
            });
        }
        let by_id: HashMap<&PhotoId, &Photo> = photos.iter().map(|p| (&p.id, p)).collect();

        let mut outcomes = Vec::with_capacity(request.photos.len());
        let mut traces = Vec::with_capacity(request.photos.len());
        for input in &request.photos {
            let (outcome, trace) = match by_id.get(&input.id) {
                None => {
                    let reason = rejected
                        .remove(&input.id)
                        .unwrap_or_else(|| "Photo missing after normalization".to_string());
                    (
                        assembler::rejected(input.id.clone(), reason),
                        PhotoTrace {
                            photo_id: input.id.clone(),
                            path: input.path.clone(),
                            metadata: None,
                            cluster_id: None,
                            responses: Vec::new(),
                        },
                    )
                }
                Some(photo) => {
                    let slot = slots
                        .remove(&SourceRef::Photo(photo.id.clone()))
                        .unwrap_or_default();
                    let cluster_id = cluster_of.get(&photo.id).map(|id| (*id).clone());

                    let mut candidates = slot.candidates;
                    let mut issues = slot.degraded;
                    if let Some((group_candidates, group_issues)) =
                        cluster_id.as_ref().and_then(|id| cluster_slots.get(id))
                    {
                        candidates.extend(group_candidates.iter().cloned());
                        let id = cluster_id.as_ref().map(ClusterId::as_str).unwrap_or_default();
                        issues.extend(group_issues.iter().map(|i| format!("{}: {}", id, i)));
                    }
                    candidates.extend(hint_candidates.iter().cloned());
                    candidates.extend(self.existing_candidates(photo));

                    let tags = self
                        .merge_engine
                        .merge(&candidates, request.policy, request.max_tags);
                    (
                        assembler::assemble(photo.id.clone(), tags, issues),
                        PhotoTrace {
                            photo_id: photo.id.clone(),
                            path: photo.path.clone(),
                            metadata: Some(photo.metadata.clone()),
                            cluster_id,
                            responses: slot.responses,
                        },
                    )
                }
            };

            if let Err(e) = sink.write(batch_id, &outcome).await {
                tracing::error!(photo_id = %outcome.photo_id, error = %e, "Sink rejected outcome");
            }
            tracing::debug!(
                photo_id = %outcome.photo_id,
                status = %outcome.status,
                tags = outcome.tags.len(),
                "Photo finalized"
            );
            self.event_bus.emit_lossy(TaggingEvent::PhotoFinalized {
                batch_id,
                photo_id: outcome.photo_id.to_string(),
                status: outcome.status.to_string(),
                tag_count: outcome.tags.len(),
            });

            outcomes.push(outcome);
            traces.push(trace);
        }

        let counts = StatusCounts::tally(&outcomes);
        let elapsed_ms = start.elapsed().as_millis() as u64;
        tracing::info!(
            batch_id = %batch_id,
            complete = counts.complete,
            degraded = counts.degraded,
            empty = counts.empty,
            error = counts.error,
            elapsed_ms,
            "Tagging batch completed"
        );
        self.event_bus.emit_lossy(TaggingEvent::BatchCompleted {
            batch_id,
            complete: counts.complete,
            degraded: counts.degraded,
            empty: counts.empty,
            error: counts.error,
            elapsed_ms,
        });

        Ok(BatchReport {
            batch_id,
            outcomes,
            photos: traces,
            clusters: cluster_traces,
            counts,
            cancelled,
            elapsed_ms,
        })
    }

    /// Camera, lens and (optionally) capture year
    fn exif_candidates(&self, photo: &Photo) -> Vec<TagCandidate> {
        let key = SourceRef::Photo(photo.id.clone());
        let mut values: Vec<String> = Vec::new();
        values.extend(photo.metadata.camera.clone());
        values.extend(photo.metadata.lens.clone());
        if self.config.exif_year_tag {
            values.extend(photo.captured_at().map(|ts| ts.year().to_string()));
        }

        values
            .iter()
            .filter_map(|v| TagCandidate::new(v, TagSource::Exif, key.clone(), EXIF_WEIGHT))
            .collect()
    }

    /// The hint split on commas/semicolons, one candidate per piece
    fn hint_candidates(&self, hint: Option<&str>) -> Vec<TagCandidate> {
        hint.map(|h| {
            h.split([',', ';'])
                .filter_map(|piece| {
                    TagCandidate::new(
                        piece,
                        TagSource::UserHint,
                        SourceRef::Batch,
                        self.config.user_hint_weight,
                    )
                })
                .collect()
        })
        .unwrap_or_default()
    }

    fn existing_candidates(&self, photo: &Photo) -> Vec<TagCandidate> {
        photo
            .existing_tags
            .iter()
            .filter_map(|t| {
                TagCandidate::new(
                    &t.name,
                    TagSource::Existing,
                    SourceRef::Photo(photo.id.clone()),
                    t.weight.unwrap_or(self.config.existing_weight),
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = PipelineConfig::from_toml(&TomlConfig::default()).unwrap();
        assert_eq!(config.preset.key, "qwen3-vl:8b");
        assert_eq!(config.orchestrator.worker_limit, 1);
        assert_eq!(config.orchestrator.request_timeout, Duration::from_secs(120));
        assert_eq!(config.orchestrator.photo_prompt, PromptKind::Tags);
        assert_eq!(config.existing_weight, 0.7);
    }

    #[test]
    fn test_rejects_unknown_preset() {
        let mut toml = TomlConfig::default();
        toml.model.preset = "gpt-vision".to_string();
        let err = PipelineConfig::from_toml(&toml).unwrap_err();
        assert!(err.to_string().contains("llava"), "lists available presets: {}", err);
    }

    #[test]
    fn test_rejects_bad_engine_settings() {
        let mut toml = TomlConfig::default();
        toml.engine.worker_limit = 0;
        assert!(PipelineConfig::from_toml(&toml).is_err());

        let mut toml = TomlConfig::default();
        toml.engine.photo_ai_weight = 1.5;
        assert!(PipelineConfig::from_toml(&toml).is_err());

        let mut toml = TomlConfig::default();
        toml.engine.photo_prompt = "group".to_string();
        assert!(PipelineConfig::from_toml(&toml).is_err());

        let mut toml = TomlConfig::default();
        toml.engine.include_description = Some("tags".to_string());
        assert!(PipelineConfig::from_toml(&toml).is_err());

        let mut toml = TomlConfig::default();
        toml.engine.distance_km = -1.0;
        assert!(PipelineConfig::from_toml(&toml).is_err());
    }

    #[test]
    fn test_with_preset() {
        let config = PipelineConfig::from_toml(&TomlConfig::default()).unwrap();
        let llava = config.clone().with_preset("llava").unwrap();
        assert_eq!(llava.preset.name, "llava:latest");
        assert!(config.with_preset("nope").is_err());
    }
}
