//! Face embedding extraction.
//!
//! Converts a fixed-size RGB face crop into the float tensor the embedding
//! model expects and runs it through an [`EmbeddingModel`]. The ONNX Runtime
//! backed [`OnnxEmbeddingModel`] is the production model; tests plug in
//! their own.

use crate::types::Embedding;
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

// Channel rescale: [0, 255] -> [0, 1]. Must match the training pipeline.
const EMBEDDING_MEAN: f32 = 0.0;
const EMBEDDING_STD: f32 = 255.0;

/// MobileFaceNet defaults.
pub const DEFAULT_INPUT_SIZE: u32 = 112;
pub const DEFAULT_EMBEDDING_LEN: usize = 128;

#[derive(Error, Debug)]
pub enum EmbedderError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("embedding model not loaded")]
    ModelNotReady,
    #[error("inference failed: {0}")]
    Inference(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Fixed-shape numeric model mapping an NHWC face tensor to a flat vector.
pub trait EmbeddingModel: Send {
    /// Run the model on a `[1, height, width, 3]` tensor and return the
    /// first output flattened.
    fn infer(&mut self, input: &Array4<f32>) -> Result<Vec<f32>, EmbedderError>;
}

/// Embedding model executed by ONNX Runtime.
pub struct OnnxEmbeddingModel {
    session: Session,
}

impl OnnxEmbeddingModel {
    /// Load an embedding model from an ONNX file.
    pub fn load(model_path: &str) -> Result<Self, EmbedderError> {
        if !Path::new(model_path).exists() {
            return Err(EmbedderError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded embedding model"
        );

        Ok(Self { session })
    }
}

impl EmbeddingModel for OnnxEmbeddingModel {
    fn infer(&mut self, input: &Array4<f32>) -> Result<Vec<f32>, EmbedderError> {
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EmbedderError::Inference(format!("embedding extraction: {e}")))?;

        Ok(raw.to_vec())
    }
}

/// Shape contract between the cropper and the embedding model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmbedderShape {
    pub input_width: u32,
    pub input_height: u32,
    pub embedding_len: usize,
}

impl Default for EmbedderShape {
    fn default() -> Self {
        Self {
            input_width: DEFAULT_INPUT_SIZE,
            input_height: DEFAULT_INPUT_SIZE,
            embedding_len: DEFAULT_EMBEDDING_LEN,
        }
    }
}

/// Turns face crops into embeddings.
pub struct FaceEmbedder {
    model: Option<Box<dyn EmbeddingModel>>,
    shape: EmbedderShape,
}

impl FaceEmbedder {
    pub fn new(model: Box<dyn EmbeddingModel>, shape: EmbedderShape) -> Self {
        Self { model: Some(model), shape }
    }

    /// An embedder without a model; every call fails with `ModelNotReady`.
    pub fn unloaded(shape: EmbedderShape) -> Self {
        Self { model: None, shape }
    }

    pub fn shape(&self) -> EmbedderShape {
        self.shape
    }

    pub fn is_ready(&self) -> bool {
        self.model.is_some()
    }

    /// Drop the model handle, releasing the runtime session.
    pub fn unload(&mut self) {
        if self.model.take().is_some() {
            tracing::debug!("embedding model unloaded");
        }
    }

    /// Extract an embedding from a face crop of exactly the model input size.
    pub fn embed(&mut self, face: &RgbImage) -> Result<Embedding, EmbedderError> {
        let shape = self.shape;
        let model = self.model.as_mut().ok_or(EmbedderError::ModelNotReady)?;

        if face.dimensions() != (shape.input_width, shape.input_height) {
            return Err(EmbedderError::Inference(format!(
                "expected {}x{} face crop, got {}x{}",
                shape.input_width,
                shape.input_height,
                face.width(),
                face.height()
            )));
        }

        let input = preprocess(face);
        let values = model.infer(&input)?;

        if values.len() != shape.embedding_len {
            return Err(EmbedderError::Inference(format!(
                "expected {}-dim embedding, got {}",
                shape.embedding_len,
                values.len()
            )));
        }

        Ok(Embedding { values })
    }
}

/// Convert an RGB crop into a `[1, H, W, 3]` tensor with `(v - mean) / std`.
pub fn preprocess(face: &RgbImage) -> Array4<f32> {
    let (width, height) = face.dimensions();
    let mut tensor = Array4::<f32>::zeros((1, height as usize, width as usize, 3));

    for (x, y, pixel) in face.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, y as usize, x as usize, c]] = (pixel[c] as f32 - EMBEDDING_MEAN) / EMBEDDING_STD;
        }
    }

    tensor
}
