//! facewatch-core: face cropping, embedding extraction and matching.
//!
//! Face localization and embedding extraction sit behind the
//! [`FaceLocator`] and [`EmbeddingModel`] traits; the shipped
//! implementations run ONNX models through ONNX Runtime.

pub mod crop;
pub mod embedder;
pub mod locator;
pub mod matcher;
pub mod types;

pub use crop::{crop_face, crop_region};
pub use embedder::{EmbedderError, EmbedderShape, EmbeddingModel, FaceEmbedder, OnnxEmbeddingModel};
pub use locator::{FaceLocator, LocatorError, UltraFaceLocator};
pub use matcher::{euclidean_distance, EuclideanMatcher, MatchError, DEFAULT_MATCH_THRESHOLD};
pub use types::{BoundingBox, Embedding, MatchDecision};

use std::path::PathBuf;

/// Default directory holding the ONNX model files.
///
/// `$XDG_DATA_HOME/facewatch/models`, falling back to
/// `~/.local/share/facewatch/models`.
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facewatch/models")
}
