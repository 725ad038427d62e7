use chrono::{DateTime, Utc};
use serde::Serialize;

/// Why an enrollment attempt did not produce a reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollFailure {
    /// The still image could not be read.
    Unreadable,
    /// Format conversion or decoding failed.
    Normalize,
    /// The face locator failed.
    Locator,
    NoFace,
    MultipleFaces,
    CropRegionInvalid,
    /// The embedding model is missing or failed.
    Embedding,
}

impl EnrollFailure {
    pub fn as_str(self) -> &'static str {
        match self {
            EnrollFailure::Unreadable => "unreadable",
            EnrollFailure::Normalize => "normalize",
            EnrollFailure::Locator => "locator",
            EnrollFailure::NoFace => "no_face",
            EnrollFailure::MultipleFaces => "multiple_faces",
            EnrollFailure::CropRegionInvalid => "crop_region_invalid",
            EnrollFailure::Embedding => "embedding",
        }
    }
}

impl std::fmt::Display for EnrollFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Notifications from the pipeline to the presentation layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    /// A live face matched the reference. The reference has been cleared.
    Matched { distance: f32, at: DateTime<Utc> },
    /// Outcome of an enrollment request; `error` is `None` on success.
    ReferenceEnrolled {
        error: Option<EnrollFailure>,
        at: DateTime<Utc>,
    },
    /// The reference timed out before any match.
    ReferenceExpired { at: DateTime<Utc> },
}

impl PipelineEvent {
    pub fn matched(distance: f32) -> Self {
        PipelineEvent::Matched { distance, at: Utc::now() }
    }

    pub fn enrolled(result: Result<(), EnrollFailure>) -> Self {
        PipelineEvent::ReferenceEnrolled {
            error: result.err(),
            at: Utc::now(),
        }
    }

    pub fn expired() -> Self {
        PipelineEvent::ReferenceExpired { at: Utc::now() }
    }
}
