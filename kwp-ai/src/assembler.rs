//! Result Assembler
//!
//! Packages a photo's final tag set with its status. Side-effect free; the
//! pipeline hands the result to a sink.

use crate::types::{FinalTagSet, PhotoId, PhotoOutcome, PhotoStatus};

/// Build the outcome for one analysed photo
///
/// # Arguments
/// * `photo_id` - Photo the tags belong to
/// * `tags` - Merge engine output
/// * `issues` - Failure reasons of contributing requests (photo and cluster)
///
/// # Returns
/// `degraded` if any contributing request failed, else `empty` when no tag
/// survived, else `complete`
pub fn assemble(photo_id: PhotoId, tags: FinalTagSet, issues: Vec<String>) -> PhotoOutcome {
    let status = if !issues.is_empty() {
        PhotoStatus::Degraded
    } else if tags.is_empty() {
        PhotoStatus::Empty
    } else {
        PhotoStatus::Complete
    };

    PhotoOutcome {
        photo_id,
        status,
        tags,
        issues,
    }
}

/// Outcome for a photo rejected before analysis
pub fn rejected(photo_id: PhotoId, reason: String) -> PhotoOutcome {
    PhotoOutcome {
        photo_id,
        status: PhotoStatus::Error,
        tags: FinalTagSet::default(),
        issues: vec![reason],
    }
}

/// Status counts over a batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct StatusCounts {
    pub complete: usize,
    pub degraded: usize,
    pub empty: usize,
    pub error: usize,
}

impl StatusCounts {
    pub fn tally(outcomes: &[PhotoOutcome]) -> Self {
        outcomes.iter().fold(Self::default(), |mut counts, o| {
            match o.status {
                PhotoStatus::Complete => counts.complete += 1,
                PhotoStatus::Degraded => counts.degraded += 1,
                PhotoStatus::Empty => counts.empty += 1,
                PhotoStatus::Error => counts.error += 1,
            }
            counts
        })
    }
}
