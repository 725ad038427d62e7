//! Euclidean embedding comparison.

use crate::types::{Embedding, MatchDecision};
use thiserror::Error;

/// Distance at or below which two embeddings are considered the same person.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 1.0;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MatchError {
    #[error("embedding length mismatch: {left} vs {right}")]
    LengthMismatch { left: usize, right: usize },
}

/// Compute the Euclidean distance between two embeddings.
///
/// Fails with [`MatchError::LengthMismatch`] when the vectors differ in
/// length; that only happens when the reference and the candidate came from
/// differently configured models.
pub fn euclidean_distance(a: &Embedding, b: &Embedding) -> Result<f32, MatchError> {
    if a.values.len() != b.values.len() {
        return Err(MatchError::LengthMismatch {
            left: a.values.len(),
            right: b.values.len(),
        });
    }

    Ok(a.values
        .iter()
        .zip(b.values.iter())
        .map(|(x, y)| (x - y).powi(2))
        .sum::<f32>()
        .sqrt())
}

/// Threshold-based matcher over Euclidean distance.
#[derive(Debug, Clone, Copy)]
pub struct EuclideanMatcher {
    threshold: f32,
}

impl Default for EuclideanMatcher {
    fn default() -> Self {
        Self::new(DEFAULT_MATCH_THRESHOLD)
    }
}

impl EuclideanMatcher {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn distance(&self, a: &Embedding, b: &Embedding) -> Result<f32, MatchError> {
        euclidean_distance(a, b)
    }

    /// Lower distance = more similar; the threshold itself still matches.
    pub fn is_match(&self, distance: f32) -> bool {
        distance <= self.threshold
    }

    pub fn compare(&self, candidate: &Embedding, reference: &Embedding) -> Result<MatchDecision, MatchError> {
        let distance = euclidean_distance(candidate, reference)?;
        Ok(MatchDecision {
            distance,
            matched: self.is_match(distance),
        })
    }
}
