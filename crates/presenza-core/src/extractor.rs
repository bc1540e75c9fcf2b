//! ArcFace embedding extractor via ONNX Runtime.
//!
//! Crops a detected face region, resizes it to the model's fixed 112×112
//! input, and produces a 512-dimensional L2-normalized embedding. A crop that
//! would be degenerate is reported as an error rather than zero-filled — a
//! garbage embedding would corrupt matching downstream.

use crate::detector::bilinear_resize;
use crate::types::{Detection, Embedding};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const ARCFACE_INPUT_SIZE: usize = 112;
const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5; // symmetric normalization, unlike SCRFD
const ARCFACE_EMBEDDING_DIM: usize = 512;

/// Minimum fraction of the requested box that must lie inside the frame.
const MIN_IN_FRAME_FRACTION: f32 = 0.5;

#[derive(Error, Debug)]
pub enum ExtractorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("degenerate face crop: {0}")]
    DegenerateCrop(String),
    #[error("embedding extractor unavailable: {0}")]
    Unavailable(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Embedding extractor, either a loaded ArcFace backend or an explicit
/// `Unavailable` marker.
pub enum FaceExtractor {
    Loaded(ArcFaceExtractor),
    Unavailable { reason: String },
}

impl FaceExtractor {
    /// Load the ArcFace model, degrading to `Unavailable` on any failure.
    pub fn load(model_path: &str) -> Self {
        match ArcFaceExtractor::load(model_path) {
            Ok(backend) => FaceExtractor::Loaded(backend),
            Err(err) => {
                tracing::warn!(path = model_path, error = %err, "embedding extractor unavailable");
                FaceExtractor::Unavailable {
                    reason: err.to_string(),
                }
            }
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, FaceExtractor::Loaded(_))
    }

    /// Extract an embedding for one detection in a grayscale frame.
    pub fn extract(
        &mut self,
        frame: &[u8],
        width: u32,
        height: u32,
        detection: &Detection,
    ) -> Result<Embedding, ExtractorError> {
        match self {
            FaceExtractor::Loaded(b) => b.extract(frame, width, height, detection),
            FaceExtractor::Unavailable { reason } => {
                Err(ExtractorError::Unavailable(reason.clone()))
            }
        }
    }
}

/// The ArcFace ONNX backend.
pub struct ArcFaceExtractor {
    session: Session,
}

impl ArcFaceExtractor {
    pub fn load(model_path: &str) -> Result<Self, ExtractorError> {
        if !Path::new(model_path).exists() {
            return Err(ExtractorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(path = model_path, "loaded ArcFace model");
        Ok(Self { session })
    }

    pub fn extract(
        &mut self,
        frame: &[u8],
        width: u32,
        height: u32,
        detection: &Detection,
    ) -> Result<Embedding, ExtractorError> {
        let crop = crop_face(frame, width, height, detection)?;
        let input = preprocess(&crop);

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw_data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| ExtractorError::InferenceFailed(format!("embedding output: {e}")))?;
        let raw: Vec<f32> = raw_data.to_vec();

        if raw.len() != ARCFACE_EMBEDDING_DIM {
            return Err(ExtractorError::InferenceFailed(format!(
                "expected {ARCFACE_EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        Ok(Embedding::from_raw(raw))
    }
}

/// Crop the detection region and resize it to 112×112.
///
/// Fails with [`ExtractorError::DegenerateCrop`] when the clipped region has
/// zero area or when less than half of the requested box lies inside the
/// frame.
fn crop_face(
    frame: &[u8],
    width: u32,
    height: u32,
    detection: &Detection,
) -> Result<Vec<u8>, ExtractorError> {
    let requested_area = detection.area();
    if requested_area <= 0.0 {
        return Err(ExtractorError::DegenerateCrop("zero-area box".into()));
    }

    let clipped = detection.clipped(width, height);
    if clipped.area() <= 0.0 {
        return Err(ExtractorError::DegenerateCrop("box entirely outside frame".into()));
    }
    if clipped.area() / requested_area < MIN_IN_FRAME_FRACTION {
        return Err(ExtractorError::DegenerateCrop(format!(
            "only {:.0}% of the box is inside the frame",
            clipped.area() / requested_area * 100.0
        )));
    }

    let x0 = clipped.x as usize;
    let y0 = clipped.y as usize;
    let crop_w = (clipped.width as usize).max(1);
    let crop_h = (clipped.height as usize).max(1);

    let w = width as usize;
    let mut crop = Vec::with_capacity(crop_w * crop_h);
    for y in y0..y0 + crop_h {
        let row_start = y * w + x0;
        crop.extend_from_slice(&frame[row_start..row_start + crop_w]);
    }

    Ok(bilinear_resize(&crop, crop_w, crop_h, ARCFACE_INPUT_SIZE, ARCFACE_INPUT_SIZE))
}

/// Turn a 112×112 grayscale crop into an NCHW float tensor.
fn preprocess(crop: &[u8]) -> Array4<f32> {
    let size = ARCFACE_INPUT_SIZE;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for y in 0..size {
        for x in 0..size {
            let pixel = crop.get(y * size + x).copied().unwrap_or(0) as f32;
            let normalized = (pixel - ARCFACE_MEAN) / ARCFACE_STD;
            tensor[[0, 0, y, x]] = normalized;
            tensor[[0, 1, y, x]] = normalized;
            tensor[[0, 2, y, x]] = normalized;
        }
    }
    tensor
}
