//! Analysis Orchestrator
//!
//! Issues one photo-level request per photo and one group-level request per
//! proximity cluster of 2+ photos, bounded by a counting permit. Each request
//! has a hard per-attempt timeout and bounded retries; a request that still
//! fails marks its photo or cluster degraded and the batch moves on.
//!
//! **Ordering:** a cluster's group request is built from its members'
//! parsed photo tags, so it runs after those photo requests finish.
//! Clusters themselves proceed concurrently; results land in the
//! [`CandidateStore`] in whatever order they complete.

pub mod parser;
pub mod store;

pub use store::{CandidateStore, SlotContents};

use crate::model::{
    AnalysisRequest, ContentRef, ModelConfig, ModelError, ModelPreset, PromptKind, VisionModel,
};
use crate::types::{
    Cluster, Photo, PhotoId, RawResponse, SourceRef, TagCandidate, TagSource, TaggingError,
};
use crate::utils::{retry_with_backoff, RetryPolicy};
use futures::future::join_all;
use kwp_common::events::{EventBus, TaggingEvent};
use parser::parse_tags;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Orchestrator tunables
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Concurrent model requests (at least 1)
    pub worker_limit: usize,
    /// Hard bound for one attempt
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
    /// Photo-level prompt (`tags` or `detailed_tags`)
    pub photo_prompt: PromptKind,
    /// Extra free-text request per photo, kept in the run record only
    pub include_description: Option<PromptKind>,
    pub photo_ai_weight: f32,
    pub group_ai_weight: f32,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            worker_limit: 1,
            request_timeout: Duration::from_secs(120),
            retry: RetryPolicy::default(),
            photo_prompt: PromptKind::Tags,
            include_description: None,
            photo_ai_weight: 0.7,
            group_ai_weight: 0.6,
        }
    }
}

/// Per-batch context shared by every request
struct BatchContext<'a> {
    batch_id: Uuid,
    hint: Option<&'a str>,
    store: &'a CandidateStore,
    cancel: &'a CancellationToken,
}

/// Analysis Orchestrator
pub struct AnalysisOrchestrator {
    model: Arc<dyn VisionModel>,
    preset: ModelPreset,
    model_config: ModelConfig,
    settings: OrchestratorSettings,
    permits: Arc<Semaphore>,
    event_bus: Option<EventBus>,
}

impl AnalysisOrchestrator {
    /// Create an orchestrator
    ///
    /// # Arguments
    /// * `model` - Backend implementation
    /// * `preset` - Prompt texts and default temperature
    /// * `temperature` - Overrides the preset temperature when set
    /// * `settings` - Concurrency, timeout, retry and weight settings
    pub fn new(
        model: Arc<dyn VisionModel>,
        preset: ModelPreset,
        temperature: Option<f32>,
        settings: OrchestratorSettings,
    ) -> Self {
        let model_config = ModelConfig {
            name: preset.name.to_string(),
            temperature: temperature.unwrap_or(preset.temperature),
        };
        let permits = Arc::new(Semaphore::new(settings.worker_limit.max(1)));
        Self {
            model,
            preset,
            model_config,
            settings,
            permits,
            event_bus: None,
        }
    }

    /// Emit request-level progress events on `bus`
    pub fn with_event_bus(mut self, bus: EventBus) -> Self {
        self.event_bus = Some(bus);
        self
    }

    pub fn preset(&self) -> &ModelPreset {
        &self.preset
    }

    /// Analyze every photo and cluster of a batch into `store`
    ///
    /// `store` must hold a slot for every photo and cluster. After
    /// cancellation no new request starts; requests already holding a
    /// permit run to completion or timeout.
    pub async fn run(
        &self,
        batch_id: Uuid,
        photos: &[Photo],
        clusters: &[Cluster],
        hint: Option<&str>,
        store: &CandidateStore,
        cancel: &CancellationToken,
    ) {
        let ctx = BatchContext {
            batch_id,
            hint,
            store,
            cancel,
        };
        let by_id: HashMap<&PhotoId, &Photo> = photos.iter().map(|p| (&p.id, p)).collect();

        join_all(
            clusters
                .iter()
                .map(|cluster| self.run_cluster(&ctx, cluster, &by_id)),
        )
        .await;
    }

    async fn run_cluster(
        &self,
        ctx: &BatchContext<'_>,
        cluster: &Cluster,
        by_id: &HashMap<&PhotoId, &Photo>,
    ) {
        let members: Vec<&Photo> = cluster
            .photo_ids
            .iter()
            .filter_map(|id| by_id.get(id).copied())
            .collect();

        join_all(members.iter().map(|photo| self.analyze_photo(ctx, photo))).await;

        if !cluster.wants_group_analysis() {
            return;
        }

        let cluster_key = SourceRef::Cluster(cluster.id.clone());
        let Some(summary) = summarize_members(&members, ctx.store) else {
            let reason = "Group analysis skipped: no member produced tags";
            tracing::warn!(cluster = %cluster.id, "{}", reason);
            ctx.store.mark_degraded(&cluster_key, reason);
            self.emit(TaggingEvent::RequestDegraded {
                batch_id: ctx.batch_id,
                target: cluster.id.to_string(),
                kind: PromptKind::Group.to_string(),
                reason: reason.to_string(),
            });
            return;
        };

        self.run_request(
            ctx,
            &cluster_key,
            PromptKind::Group,
            ContentRef::Summary(summary),
            TagSource::GroupAi,
            self.settings.group_ai_weight,
        )
        .await;
    }

    async fn analyze_photo(&self, ctx: &BatchContext<'_>, photo: &Photo) {
        let key = SourceRef::Photo(photo.id.clone());

        self.run_request(
            ctx,
            &key,
            self.settings.photo_prompt,
            ContentRef::Image(photo.path.clone()),
            TagSource::PhotoAi,
            self.settings.photo_ai_weight,
        )
        .await;

        if let Some(kind) = self.settings.include_description {
            self.run_request(
                ctx,
                &key,
                kind,
                ContentRef::Image(photo.path.clone()),
                TagSource::PhotoAi,
                self.settings.photo_ai_weight,
            )
            .await;
        }
    }

    /// Issue one request with timeout and retries, then record its outcome
    async fn run_request(
        &self,
        ctx: &BatchContext<'_>,
        key: &SourceRef,
        kind: PromptKind,
        content: ContentRef,
        source: TagSource,
        default_weight: f32,
    ) {
        let request = AnalysisRequest {
            content,
            kind,
            hint: ctx.hint.map(str::to_string),
            prompt: self.preset.render_prompt(kind, ctx.hint),
            model: self.model_config.clone(),
        };
        let operation = format!("{} {}", key, kind);
        let timeout = self.settings.request_timeout;
        let permits = &self.permits;
        let model = &self.model;
        let cancel = ctx.cancel;
        let request_ref = &request;

        let outcome = retry_with_backoff(
            &operation,
            &self.settings.retry,
            cancel,
            move |_attempt| async move {
                let _permit = tokio::select! {
                    _ = cancel.cancelled() => return Err(ModelError::Cancelled),
                    permit = permits.acquire() => permit.map_err(|_| ModelError::Cancelled)?,
                };
                match tokio::time::timeout(timeout, model.analyze(request_ref)).await {
                    Ok(result) => result,
                    Err(_) => Err(ModelError::Timeout(timeout)),
                }
            },
        )
        .await;

        let elapsed_ms = outcome.elapsed.as_millis() as u64;
        let target = match key {
            SourceRef::Photo(id) => id.to_string(),
            SourceRef::Cluster(id) => id.to_string(),
            SourceRef::Batch => "batch".to_string(),
        };
        // Free-text requests feed only the run record
        let contributes = kind.yields_tags();

        match outcome.result {
            Ok(text) => {
                ctx.store.record_response(
                    key,
                    RawResponse {
                        kind,
                        prompt: request.prompt.clone(),
                        success: true,
                        response: Some(text.clone()),
                        error: None,
                        attempts: outcome.attempts,
                        elapsed_ms,
                    },
                );

                if contributes {
                    let candidates: Vec<TagCandidate> = parse_tags(&text)
                        .into_iter()
                        .filter_map(|tag| {
                            TagCandidate::new(
                                &tag.text,
                                source,
                                key.clone(),
                                tag.confidence.unwrap_or(default_weight),
                            )
                        })
                        .collect();

                    if candidates.is_empty() {
                        let reason = format!("Unparseable {} response", kind);
                        tracing::warn!(subject = %target, kind = %kind, "{}", reason);
                        ctx.store.mark_degraded(key, reason.clone());
                        self.emit(TaggingEvent::RequestDegraded {
                            batch_id: ctx.batch_id,
                            target,
                            kind: kind.to_string(),
                            reason,
                        });
                        return;
                    }

                    tracing::debug!(
                        subject = %target,
                        kind = %kind,
                        candidates = candidates.len(),
                        attempts = outcome.attempts,
                        "Request completed"
                    );
                    ctx.store.append(key, candidates);
                }

                self.emit(TaggingEvent::RequestCompleted {
                    batch_id: ctx.batch_id,
                    target,
                    kind: kind.to_string(),
                    attempts: outcome.attempts,
                    elapsed_ms,
                });
            }
            Err(err) => {
                let failure = to_tagging_error(err, outcome.attempts, timeout);
                ctx.store.record_response(
                    key,
                    RawResponse {
                        kind,
                        prompt: request.prompt.clone(),
                        success: false,
                        response: None,
                        error: Some(failure.to_string()),
                        attempts: outcome.attempts,
                        elapsed_ms,
                    },
                );

                if contributes {
                    ctx.store.mark_degraded(key, failure.to_string());
                }
                self.emit(TaggingEvent::RequestDegraded {
                    batch_id: ctx.batch_id,
                    target,
                    kind: kind.to_string(),
                    reason: failure.to_string(),
                });
            }
        }
    }

    fn emit(&self, event: TaggingEvent) {
        if let Some(bus) = &self.event_bus {
            bus.emit_lossy(event);
        }
    }
}

fn to_tagging_error(err: ModelError, attempts: u32, timeout: Duration) -> TaggingError {
    match err {
        ModelError::Timeout(_) => TaggingError::AnalysisTimeout { timeout, attempts },
        ModelError::Cancelled => TaggingError::Cancelled("request not issued".to_string()),
        other => TaggingError::AnalysisFailure(other.to_string()),
    }
}

/// Text summary of a cluster's members: photo-level tags, capture time, location
///
/// `None` when no member has photo-level tags.
fn summarize_members(members: &[&Photo], store: &CandidateStore) -> Option<String> {
    let lines: Vec<String> = members
        .iter()
        .filter_map(|photo| {
            let candidates = store.candidates(&SourceRef::Photo(photo.id.clone()));
            let tags: Vec<&str> = candidates
                .iter()
                .filter(|c| c.source == TagSource::PhotoAi)
                .map(|c| c.tag.as_str())
                .collect();
            if tags.is_empty() {
                return None;
            }
            let mut line = format!("- Photo {}", photo.id);
            if let Some(ts) = photo.captured_at() {
                line.push_str(&format!(", taken {}", ts.format("%Y-%m-%d %H:%M")));
            }
            if let Some(gps) = photo.gps() {
                line.push_str(&format!(", at {:.4}, {:.4}", gps.latitude, gps.longitude));
            }
            line.push_str(&format!(": {}", tags.join(", ")));
            Some(line)
        })
        .collect();

    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::find_preset;
    use crate::types::{Centroid, ClusterId, ClusterKind, GpsCoordinate, PhotoMetadata};
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Replies by file name; records every request it sees
    struct ScriptedModel {
        replies: HashMap<String, Result<String, ModelError>>,
        seen: Mutex<Vec<AnalysisRequest>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl ScriptedModel {
        fn new(replies: Vec<(&str, Result<&str, ModelError>)>) -> Self {
            Self {
                replies: replies
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), v.map(str::to_string)))
                    .collect(),
                seen: Mutex::new(Vec::new()),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl VisionModel for ScriptedModel {
        async fn analyze(&self, request: &AnalysisRequest) -> Result<String, ModelError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            self.seen.lock().unwrap().push(request.clone());
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let key = match &request.content {
                ContentRef::Image(path) => path.file_stem().unwrap().to_string_lossy().to_string(),
                ContentRef::Summary(_) => "group".to_string(),
            };
            self.replies
                .get(&key)
                .cloned()
                .unwrap_or_else(|| Ok("generic".to_string()))
        }
    }

    fn photo(id: &str) -> Photo {
        Photo {
            id: PhotoId::new(id),
            path: PathBuf::from(format!("/photos/{}.jpg", id)),
            metadata: PhotoMetadata {
                gps: Some(GpsCoordinate::new(49.44, 1.09)),
                ..Default::default()
            },
            existing_tags: vec![],
        }
    }

    fn cluster(id: usize, members: &[&str]) -> Cluster {
        Cluster {
            id: ClusterId::numbered(id),
            kind: ClusterKind::Proximity,
            photo_ids: members.iter().map(|m| PhotoId::new(*m)).collect(),
            centroid: Centroid::default(),
        }
    }

    fn settings(worker_limit: usize) -> OrchestratorSettings {
        OrchestratorSettings {
            worker_limit,
            request_timeout: Duration::from_millis(200),
            retry: RetryPolicy::new(1, Duration::from_millis(1), Duration::from_millis(2)),
            ..Default::default()
        }
    }

    fn store_for(photos: &[Photo], clusters: &[Cluster]) -> CandidateStore {
        CandidateStore::new(
            photos
                .iter()
                .map(|p| SourceRef::Photo(p.id.clone()))
                .chain(clusters.iter().map(|c| SourceRef::Cluster(c.id.clone()))),
        )
    }

    fn orchestrator(model: Arc<ScriptedModel>, worker_limit: usize) -> AnalysisOrchestrator {
        let preset = *find_preset("llava").unwrap();
        AnalysisOrchestrator::new(model, preset, None, settings(worker_limit))
    }

    #[tokio::test]
    async fn test_photo_and_group_candidates() {
        let model = Arc::new(ScriptedModel::new(vec![
            ("a", Ok("cathedral, rouen cathedral")),
            ("b", Ok("gothic architecture")),
            ("group", Ok("normandy, travel")),
        ]));
        let photos = vec![photo("a"), photo("b")];
        let clusters = vec![cluster(1, &["a", "b"])];
        let store = store_for(&photos, &clusters);

        orchestrator(model.clone(), 1)
            .run(Uuid::new_v4(), &photos, &clusters, Some("Trip"), &store, &CancellationToken::new())
            .await;

        let a = store.snapshot(&SourceRef::Photo(PhotoId::new("a")));
        assert_eq!(a.candidates.len(), 2);
        assert!(a.degraded.is_empty());
        assert_eq!(a.responses.len(), 1);
        assert!(a.candidates.iter().all(|c| c.source == TagSource::PhotoAi && c.weight == 0.7));

        let group = store.snapshot(&SourceRef::Cluster(ClusterId::numbered(1)));
        let tags: Vec<&str> = group.candidates.iter().map(|c| c.tag.as_str()).collect();
        assert_eq!(tags, vec!["normandy", "travel"]);
        assert!(group.candidates.iter().all(|c| c.weight == 0.6));

        // Group request is text-only and carries member tags
        let seen = model.seen.lock().unwrap();
        let group_request = seen
            .iter()
            .find(|r| r.kind == PromptKind::Group)
            .unwrap();
        match &group_request.content {
            ContentRef::Summary(summary) => {
                assert!(summary.contains("rouen cathedral"));
                assert!(summary.contains("gothic architecture"));
            }
            other => panic!("Expected summary, got {:?}", other),
        }
        assert!(group_request.prompt.starts_with("Context: Trip"));
        assert_eq!(seen.last().unwrap().kind, PromptKind::Group);
    }

    #[tokio::test]
    async fn test_failure_degrades_only_its_photo() {
        let model = Arc::new(ScriptedModel::new(vec![
            ("a", Err(ModelError::Timeout(Duration::from_millis(1)))),
            ("b", Ok("harbor")),
        ]));
        let photos = vec![photo("a"), photo("b")];
        let clusters = vec![cluster(1, &["a"]), cluster(2, &["b"])];
        let store = store_for(&photos, &clusters);

        orchestrator(model.clone(), 2)
            .run(Uuid::new_v4(), &photos, &clusters, None, &store, &CancellationToken::new())
            .await;

        let a = store.snapshot(&SourceRef::Photo(PhotoId::new("a")));
        assert!(a.candidates.is_empty());
        assert_eq!(a.degraded.len(), 1);
        assert!(a.degraded[0].contains("timed out"));
        assert_eq!(a.responses[0].attempts, 2, "1 attempt + 1 retry");

        let b = store.snapshot(&SourceRef::Photo(PhotoId::new("b")));
        assert_eq!(b.candidates.len(), 1);
        assert!(b.degraded.is_empty());
    }

    #[tokio::test]
    async fn test_unparseable_response_degrades() {
        let model = Arc::new(ScriptedModel::new(vec![("a", Ok("   "))]));
        let photos = vec![photo("a")];
        let clusters = vec![cluster(1, &["a"])];
        let store = store_for(&photos, &clusters);

        orchestrator(model, 1)
            .run(Uuid::new_v4(), &photos, &clusters, None, &store, &CancellationToken::new())
            .await;

        let a = store.snapshot(&SourceRef::Photo(PhotoId::new("a")));
        assert!(a.candidates.is_empty());
        assert_eq!(a.degraded, vec!["Unparseable tags response".to_string()]);
    }

    #[tokio::test]
    async fn test_group_skipped_without_member_tags() {
        let model = Arc::new(ScriptedModel::new(vec![
            ("a", Err(ModelError::Content("unreadable".into()))),
            ("b", Err(ModelError::Content("unreadable".into()))),
        ]));
        let photos = vec![photo("a"), photo("b")];
        let clusters = vec![cluster(1, &["a", "b"])];
        let store = store_for(&photos, &clusters);

        orchestrator(model.clone(), 1)
            .run(Uuid::new_v4(), &photos, &clusters, None, &store, &CancellationToken::new())
            .await;

        let group = store.snapshot(&SourceRef::Cluster(ClusterId::numbered(1)));
        assert_eq!(group.degraded.len(), 1);
        assert!(model
            .seen
            .lock()
            .unwrap()
            .iter()
            .all(|r| r.kind != PromptKind::Group));
    }

    #[tokio::test]
    async fn test_worker_limit_bounds_concurrency() {
        let model = Arc::new(ScriptedModel::new(vec![]));
        let photos: Vec<Photo> = (0..6).map(|i| photo(&format!("p{}", i))).collect();
        let clusters: Vec<Cluster> = photos
            .iter()
            .enumerate()
            .map(|(i, p)| cluster(i + 1, &[p.id.as_str()]))
            .collect();
        let store = store_for(&photos, &clusters);

        orchestrator(model.clone(), 2)
            .run(Uuid::new_v4(), &photos, &clusters, None, &store, &CancellationToken::new())
            .await;

        assert!(model.max_in_flight.load(Ordering::SeqCst) <= 2);
        assert_eq!(model.seen.lock().unwrap().len(), 6);
    }

    #[tokio::test]
    async fn test_cancelled_batch_issues_no_requests() {
        let model = Arc::new(ScriptedModel::new(vec![]));
        let photos = vec![photo("a"), photo("b")];
        let clusters = vec![cluster(1, &["a", "b"])];
        let store = store_for(&photos, &clusters);
        let cancel = CancellationToken::new();
        cancel.cancel();

        orchestrator(model.clone(), 1)
            .run(Uuid::new_v4(), &photos, &clusters, None, &store, &cancel)
            .await;

        assert!(model.seen.lock().unwrap().is_empty());
        let a = store.snapshot(&SourceRef::Photo(PhotoId::new("a")));
        assert!(a.degraded[0].starts_with("Cancelled"));
    }

    #[tokio::test]
    async fn test_events_emitted() {
        let model = Arc::new(ScriptedModel::new(vec![("a", Ok("beach"))]));
        let photos = vec![photo("a")];
        let clusters = vec![cluster(1, &["a"])];
        let store = store_for(&photos, &clusters);
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        orchestrator(model, 1)
            .with_event_bus(bus)
            .run(Uuid::new_v4(), &photos, &clusters, None, &store, &CancellationToken::new())
            .await;

        match rx.recv().await.unwrap() {
            TaggingEvent::RequestCompleted { target, kind, attempts, .. } => {
                assert_eq!(target, "a");
                assert_eq!(kind, "tags");
                assert_eq!(attempts, 1);
            }
            other => panic!("Unexpected event {:?}", other),
        }
    }
}
