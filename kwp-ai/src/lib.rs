//! kwp-ai: photo keyword synthesis engine
//!
//! Turns a batch of photos (image references, raw EXIF, existing keywords)
//! into a ranked, deduplicated, hierarchy-aware keyword set per photo.

pub mod api;
pub mod assembler;
pub mod clustering;
pub mod error;
pub mod fusion;
pub mod metadata;
pub mod model;
pub mod orchestrator;
pub mod pipeline;
pub mod run_record;
pub mod scanner;
pub mod sink;
pub mod types;
pub mod utils;

pub use crate::error::{ApiError, ApiResult};
pub use crate::pipeline::{BatchReport, PipelineConfig, TaggingPipeline};

use axum::Router;
use chrono::{DateTime, Utc};
use kwp_common::events::EventBus;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<TaggingPipeline>,
    /// Event bus the pipeline reports progress on
    pub event_bus: EventBus,
    /// Cancellation tokens for running batches
    pub cancellation_tokens: Arc<RwLock<HashMap<Uuid, CancellationToken>>>,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
    /// Last batch error for diagnostics
    pub last_error: Arc<RwLock<Option<String>>>,
}

impl AppState {
    pub fn new(pipeline: Arc<TaggingPipeline>) -> Self {
        Self {
            event_bus: pipeline.event_bus().clone(),
            pipeline,
            cancellation_tokens: Arc::new(RwLock::new(HashMap::new())),
            startup_time: Utc::now(),
            last_error: Arc::new(RwLock::new(None)),
        }
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .merge(api::batch_routes())
        .merge(api::health_routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
