//! Face localization.
//!
//! [`FaceLocator`] is the seam the pipeline uses to find faces.
//! [`UltraFaceLocator`] implements it with the Ultra-Light-Fast face detector
//! (RFB-320 export) via ONNX Runtime: a stretched 320×240 input, per-anchor
//! face scores and normalized corner boxes, then NMS.

use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const ULTRAFACE_INPUT_WIDTH: u32 = 320;
const ULTRAFACE_INPUT_HEIGHT: u32 = 240;
const ULTRAFACE_MEAN: f32 = 127.0;
const ULTRAFACE_STD: f32 = 128.0;
const ULTRAFACE_CONFIDENCE_THRESHOLD: f32 = 0.7;
const ULTRAFACE_NMS_THRESHOLD: f32 = 0.3;

#[derive(Error, Debug)]
pub enum LocatorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("face localization failed: {0}")]
    Failed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Finds faces in an upright RGB image.
pub trait FaceLocator: Send {
    /// Return one bounding box per face, in image pixel coordinates.
    fn locate(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, LocatorError>;
}

/// UltraFace detector.
pub struct UltraFaceLocator {
    session: Session,
    /// Output indices (scores, boxes).
    outputs: (usize, usize),
    confidence_threshold: f32,
}

impl UltraFaceLocator {
    /// Load the UltraFace ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, LocatorError> {
        if !Path::new(model_path).exists() {
            return Err(LocatorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?output_names,
            "loaded UltraFace model"
        );

        if output_names.len() < 2 {
            return Err(LocatorError::Failed(format!(
                "UltraFace model requires 2 outputs (scores, boxes), got {}",
                output_names.len()
            )));
        }

        let outputs = discover_output_indices(&output_names);
        tracing::debug!(?outputs, "UltraFace output tensor mapping");

        Ok(Self {
            session,
            outputs,
            confidence_threshold: ULTRAFACE_CONFIDENCE_THRESHOLD,
        })
    }

    pub fn with_confidence_threshold(mut self, threshold: f32) -> Self {
        self.confidence_threshold = threshold;
        self
    }

    /// Stretch to the network input and normalize into a NCHW tensor.
    fn preprocess(image: &RgbImage) -> Array4<f32> {
        let resized = imageops::resize(image, ULTRAFACE_INPUT_WIDTH, ULTRAFACE_INPUT_HEIGHT, FilterType::Triangle);
        let mut tensor = Array4::<f32>::zeros((1, 3, ULTRAFACE_INPUT_HEIGHT as usize, ULTRAFACE_INPUT_WIDTH as usize));

        for (x, y, pixel) in resized.enumerate_pixels() {
            for c in 0..3 {
                tensor[[0, c, y as usize, x as usize]] = (pixel[c] as f32 - ULTRAFACE_MEAN) / ULTRAFACE_STD;
            }
        }

        tensor
    }
}

impl FaceLocator for UltraFaceLocator {
    fn locate(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, LocatorError> {
        let input = Self::preprocess(image);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (scores_idx, boxes_idx) = self.outputs;
        let (_, scores) = outputs[scores_idx]
            .try_extract_tensor::<f32>()
            .map_err(|e| LocatorError::Failed(format!("scores: {e}")))?;
        let (_, boxes) = outputs[boxes_idx]
            .try_extract_tensor::<f32>()
            .map_err(|e| LocatorError::Failed(format!("boxes: {e}")))?;

        let detections = decode(
            scores,
            boxes,
            image.width() as f32,
            image.height() as f32,
            self.confidence_threshold,
        );
        let faces = nms(detections, ULTRAFACE_NMS_THRESHOLD);
        tracing::trace!(faces = faces.len(), "UltraFace located faces");
        Ok(faces)
    }
}

/// Map output tensors to (scores, boxes) by name, falling back to position.
fn discover_output_indices(names: &[String]) -> (usize, usize) {
    let scores = names.iter().position(|n| n == "scores");
    let boxes = names.iter().position(|n| n == "boxes");
    match (scores, boxes) {
        (Some(s), Some(b)) => (s, b),
        _ => {
            tracing::info!(?names, "UltraFace: output names not recognized, using positional mapping [0]=scores, [1]=boxes");
            (0, 1)
        }
    }
}

/// Decode per-anchor `[background, face]` scores and normalized
/// `[x1, y1, x2, y2]` boxes into image-space detections.
fn decode(scores: &[f32], boxes: &[f32], width: f32, height: f32, threshold: f32) -> Vec<BoundingBox> {
    let anchors = (scores.len() / 2).min(boxes.len() / 4);
    let mut detections = Vec::new();

    for i in 0..anchors {
        let score = scores[i * 2 + 1];
        if score <= threshold {
            continue;
        }
        let x1 = boxes[i * 4] * width;
        let y1 = boxes[i * 4 + 1] * height;
        let x2 = boxes[i * 4 + 2] * width;
        let y2 = boxes[i * 4 + 3] * height;

        detections.push(BoundingBox {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
            confidence: score,
        });
    }

    detections
}

/// Non-Maximum Suppression: remove overlapping detections, highest confidence first.
fn nms(mut detections: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep: Vec<BoundingBox> = Vec::new();
    for candidate in detections {
        if keep.iter().all(|kept| iou(kept, &candidate) <= iou_threshold) {
            keep.push(candidate);
        }
    }
    keep
}

/// Intersection-over-Union between two boxes.
fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let inter_w = (a.right().min(b.right()) - a.x.max(b.x)).max(0.0);
    let inter_h = (a.bottom().min(b.bottom()) - a.y.max(b.y)).max(0.0);
    let inter_area = inter_w * inter_h;
    let union_area = a.area() + b.area() - inter_area;

    if union_area > 0.0 {
        inter_area / union_area
    } else {
        0.0
    }
}
