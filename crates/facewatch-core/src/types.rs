use serde::{Deserialize, Serialize};

/// Bounding box for a located face, in pixel coordinates of the upright frame.
///
/// Boxes produced by a locator may extend past the image edges; the cropper
/// clamps them before use.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

impl BoundingBox {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self { x, y, width, height, confidence: 1.0 }
    }

    /// Right edge (exclusive).
    pub fn right(&self) -> f32 {
        self.x + self.width
    }

    /// Bottom edge (exclusive).
    pub fn bottom(&self) -> f32 {
        self.y + self.height
    }

    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }
}

/// Face embedding vector as produced by the embedding model.
///
/// Values are the raw model output; no normalization is applied, so
/// distances are only meaningful between embeddings of the same model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl From<Vec<f32>> for Embedding {
    fn from(values: Vec<f32>) -> Self {
        Self { values }
    }
}

/// Outcome of comparing a candidate embedding against the reference.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatchDecision {
    /// Euclidean distance. Lower = more similar.
    pub distance: f32,
    pub matched: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bbox_edges() {
        let b = BoundingBox::new(10.0, 20.0, 30.0, 40.0);
        assert_eq!(b.right(), 40.0);
        assert_eq!(b.bottom(), 60.0);
        assert_eq!(b.area(), 1200.0);
    }

    #[test]
    fn test_bbox_negative_extent_has_no_area() {
        let b = BoundingBox::new(0.0, 0.0, -5.0, 10.0);
        assert_eq!(b.area(), 0.0);
    }

    #[test]
    fn test_embedding_from_vec() {
        let e: Embedding = vec![0.5, 1.5].into();
        assert_eq!(e.len(), 2);
        assert!(!e.is_empty());
    }
}
