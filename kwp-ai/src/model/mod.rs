//! Vision model interface
//!
//! The orchestrator talks to inference backends only through
//! [`VisionModel`]: one request in (content reference, prompt kind, rendered
//! prompt, model settings), raw text out. Retries, timeouts and concurrency
//! limits live in the orchestrator, not here.

pub mod ollama;
pub mod presets;

pub use ollama::OllamaClient;
pub use presets::{available_presets, find_preset, ModelPreset, PRESETS};

use crate::utils::RetryableError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Kind of analysis requested from the model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptKind {
    /// Comma-separated generic tags
    Tags,
    /// Comma-separated detailed tags
    DetailedTags,
    /// Free-text detailed description (run record only)
    Description,
    /// One-sentence description (run record only)
    Brief,
    /// Contextual tags for a whole cluster
    Group,
}

impl PromptKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tags => "tags",
            Self::DetailedTags => "detailed_tags",
            Self::Description => "description",
            Self::Brief => "brief",
            Self::Group => "group",
        }
    }

    /// True for kinds whose responses are parsed into tag candidates
    pub fn yields_tags(self) -> bool {
        matches!(self, Self::Tags | Self::DetailedTags | Self::Group)
    }
}

impl fmt::Display for PromptKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PromptKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "tags" => Ok(Self::Tags),
            "detailed_tags" => Ok(Self::DetailedTags),
            "description" => Ok(Self::Description),
            "brief" => Ok(Self::Brief),
            "group" => Ok(Self::Group),
            other => Err(format!("Unknown prompt kind '{}'", other)),
        }
    }
}

/// What the model looks at
#[derive(Debug, Clone, PartialEq)]
pub enum ContentRef {
    /// Image file read by the backend client
    Image(PathBuf),
    /// Text summary of a cluster's members (group requests)
    Summary(String),
}

/// Model settings for one request
#[derive(Debug, Clone, PartialEq)]
pub struct ModelConfig {
    /// Backend model name (e.g. "qwen3-vl:8b")
    pub name: String,
    pub temperature: f32,
}

/// One analysis request
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisRequest {
    pub content: ContentRef,
    pub kind: PromptKind,
    /// Batch context hint, already folded into `prompt`
    pub hint: Option<String>,
    /// Fully rendered prompt text
    pub prompt: String,
    pub model: ModelConfig,
}

/// Vision model failure
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ModelError {
    /// Connection refused, reset, DNS failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Non-success HTTP status from the backend
    #[error("Backend returned {status}: {message}")]
    Backend { status: u16, message: String },

    /// Response body not in the expected shape
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Content could not be prepared (unreadable image)
    #[error("Content error: {0}")]
    Content(String),

    /// Attempt exceeded its hard bound
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Cancelled before the request was issued")]
    Cancelled,
}

impl RetryableError for ModelError {
    fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Timeout(_) => true,
            Self::Backend { status, .. } => *status == 429 || *status >= 500,
            Self::InvalidResponse(_) | Self::Content(_) | Self::Cancelled => false,
        }
    }

    fn cancelled() -> Self {
        Self::Cancelled
    }
}

/// Vision-language model backend
#[async_trait]
pub trait VisionModel: Send + Sync {
    /// Run one analysis request and return the raw response text
    async fn analyze(&self, request: &AnalysisRequest) -> Result<String, ModelError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_kind_round_trip_names() {
        for kind in [
            PromptKind::Tags,
            PromptKind::DetailedTags,
            PromptKind::Description,
            PromptKind::Brief,
            PromptKind::Group,
        ] {
            assert_eq!(kind.as_str().parse::<PromptKind>().unwrap(), kind);
        }
        assert_eq!("detailed-tags".parse::<PromptKind>().unwrap(), PromptKind::DetailedTags);
        assert!("haiku".parse::<PromptKind>().is_err());
    }

    #[test]
    fn test_transient_classification() {
        assert!(ModelError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(ModelError::Transport("reset".into()).is_transient());
        assert!(ModelError::Backend {
            status: 503,
            message: "busy".into()
        }
        .is_transient());
        assert!(ModelError::Backend {
            status: 429,
            message: "slow down".into()
        }
        .is_transient());
        assert!(!ModelError::Backend {
            status: 404,
            message: "model not found".into()
        }
        .is_transient());
        assert!(!ModelError::Content("unreadable".into()).is_transient());
        assert!(!ModelError::Cancelled.is_transient());
    }
}
