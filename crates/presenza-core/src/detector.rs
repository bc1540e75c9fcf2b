//! SCRFD face detection on ONNX Runtime.
//!
//! Anchor-free 3-stride decoding with NMS post-processing. The public
//! [`FaceDetector`] is a typed capability: a backend that failed to load is
//! the `Unavailable` variant, decided once at construction, and degrades to
//! "no detections" so the capture loop stays alive.

use crate::types::Detection;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const SCRFD_INPUT_SIZE: usize = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Output tensor indices for one stride: (score_idx, bbox_idx).
type StrideOutputIndices = (usize, usize);

/// Face detector, either a loaded SCRFD backend or an explicit
/// `Unavailable` marker.
pub enum FaceDetector {
    Loaded(ScrfdDetector),
    Unavailable { reason: String },
}

impl FaceDetector {
    /// Load the SCRFD model, degrading to `Unavailable` on any failure.
    pub fn load(model_path: &str) -> Self {
        match ScrfdDetector::load(model_path) {
            Ok(backend) => FaceDetector::Loaded(backend),
            Err(err) => {
                tracing::warn!(path = model_path, error = %err, "face detector unavailable");
                FaceDetector::Unavailable {
                    reason: err.to_string(),
                }
            }
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, FaceDetector::Loaded(_))
    }

    /// Detect faces in a grayscale frame.
    ///
    /// Detections below `confidence_floor` are dropped and boxes are clipped
    /// to frame bounds; results are sorted by descending confidence. An
    /// unavailable backend or a failed inference yields an empty list.
    pub fn detect(
        &mut self,
        frame: &[u8],
        width: u32,
        height: u32,
        confidence_floor: f32,
    ) -> Vec<Detection> {
        let backend = match self {
            FaceDetector::Loaded(b) => b,
            FaceDetector::Unavailable { .. } => return Vec::new(),
        };
        match backend.detect(frame, width, height, confidence_floor) {
            Ok(detections) => detections,
            Err(err) => {
                tracing::warn!(error = %err, "detection failed; skipping frame");
                Vec::new()
            }
        }
    }
}

/// The SCRFD ONNX backend.
pub struct ScrfdDetector {
    session: Session,
    input_size: usize,
    /// Per-stride (score, bbox) output indices for strides [8, 16, 32],
    /// discovered by name at load time with a positional fallback.
    stride_indices: [StrideOutputIndices; 3],
}

impl ScrfdDetector {
    pub fn load(model_path: &str) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> =
            session.outputs().iter().map(|o| o.name().to_string()).collect();

        tracing::info!(path = model_path, outputs = ?output_names, "SCRFD model ready");

        if output_names.len() < 6 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model needs at least 6 outputs (3 strides × score/bbox), got {}",
                output_names.len()
            )));
        }

        let stride_indices = map_output_indices(&output_names);

        Ok(Self {
            session,
            input_size: SCRFD_INPUT_SIZE,
            stride_indices,
        })
    }

    fn detect(
        &mut self,
        frame: &[u8],
        width: u32,
        height: u32,
        confidence_floor: f32,
    ) -> Result<Vec<Detection>, DetectorError> {
        let (input, letterbox) =
            letterbox_preprocess(frame, width as usize, height as usize, self.input_size);

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut all = Vec::new();
        for (pos, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx) = self.stride_indices[pos];
            let (_, scores) = outputs[score_idx].try_extract_tensor::<f32>().map_err(|e| {
                DetectorError::InferenceFailed(format!("scores stride {stride}: {e}"))
            })?;
            let (_, bboxes) = outputs[bbox_idx].try_extract_tensor::<f32>().map_err(|e| {
                DetectorError::InferenceFailed(format!("bboxes stride {stride}: {e}"))
            })?;

            all.extend(decode_stride(
                scores,
                bboxes,
                stride,
                self.input_size,
                &letterbox,
                confidence_floor,
            ));
        }

        let mut result: Vec<Detection> = nms(all, SCRFD_NMS_THRESHOLD)
            .into_iter()
            .map(|d| d.clipped(width, height))
            .filter(|d| d.area() > 0.0)
            .collect();
        result.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        Ok(result)
    }
}

/// Coordinate mapping metadata for the letterbox resize.
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

/// Map SCRFD output tensors to stride slots by name, falling back to the
/// conventional positional layout ([0-2] scores, [3-5] bboxes).
fn map_output_indices(names: &[String]) -> [StrideOutputIndices; 3] {
    let find = |prefix: &str, stride: usize| -> Option<usize> {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| n == &target)
    };

    let named = SCRFD_STRIDES
        .iter()
        .all(|&s| find("score", s).is_some() && find("bbox", s).is_some());

    if named {
        std::array::from_fn(|i| {
            let stride = SCRFD_STRIDES[i];
            // Presence checked above.
            (
                find("score", stride).unwrap_or(i),
                find("bbox", stride).unwrap_or(i + 3),
            )
        })
    } else {
        tracing::info!(?names, "SCRFD output names not recognized, using positional mapping");
        [(0, 3), (1, 4), (2, 5)]
    }
}

/// Resize a grayscale frame into a letterboxed NCHW tensor, bilinear.
fn letterbox_preprocess(
    frame: &[u8],
    width: usize,
    height: usize,
    input_size: usize,
) -> (Array4<f32>, Letterbox) {
    let scale = (input_size as f32 / width as f32).min(input_size as f32 / height as f32);
    let new_w = (width as f32 * scale).round() as usize;
    let new_h = (height as f32 * scale).round() as usize;
    let pad_x = (input_size - new_w) as f32 / 2.0;
    let pad_y = (input_size - new_h) as f32 / 2.0;

    let resized = bilinear_resize(frame, width, height, new_w, new_h);

    let pad_x0 = pad_x.floor() as usize;
    let pad_y0 = pad_y.floor() as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, input_size, input_size));
    for y in 0..input_size {
        for x in 0..input_size {
            let pixel = if y >= pad_y0 && y < pad_y0 + new_h && x >= pad_x0 && x < pad_x0 + new_w {
                resized[(y - pad_y0) * new_w + (x - pad_x0)] as f32
            } else {
                SCRFD_MEAN // pad value normalizes to 0.0
            };
            let normalized = (pixel - SCRFD_MEAN) / SCRFD_STD;
            // Grayscale replicated across the three input channels.
            tensor[[0, 0, y, x]] = normalized;
            tensor[[0, 1, y, x]] = normalized;
            tensor[[0, 2, y, x]] = normalized;
        }
    }

    (tensor, Letterbox { scale, pad_x, pad_y })
}

/// Bilinear grayscale resize, shared with the extractor's crop path.
pub(crate) fn bilinear_resize(
    src: &[u8],
    src_w: usize,
    src_h: usize,
    dst_w: usize,
    dst_h: usize,
) -> Vec<u8> {
    if src_w == 0 || src_h == 0 || dst_w == 0 || dst_h == 0 {
        return vec![0; dst_w * dst_h];
    }
    let scale_x = src_w as f32 / dst_w as f32;
    let scale_y = src_h as f32 / dst_h as f32;

    let mut dst = vec![0u8; dst_w * dst_h];
    for y in 0..dst_h {
        let src_y = (y as f32 + 0.5) * scale_y - 0.5;
        let y0 = (src_y.floor() as i32).clamp(0, src_h as i32 - 1) as usize;
        let y1 = (y0 + 1).min(src_h - 1);
        let fy = (src_y - src_y.floor()).clamp(0.0, 1.0);

        for x in 0..dst_w {
            let src_x = (x as f32 + 0.5) * scale_x - 0.5;
            let x0 = (src_x.floor() as i32).clamp(0, src_w as i32 - 1) as usize;
            let x1 = (x0 + 1).min(src_w - 1);
            let fx = (src_x - src_x.floor()).clamp(0.0, 1.0);

            let tl = src[y0 * src_w + x0] as f32;
            let tr = src[y0 * src_w + x1] as f32;
            let bl = src[y1 * src_w + x0] as f32;
            let br = src[y1 * src_w + x1] as f32;

            let val = tl * (1.0 - fx) * (1.0 - fy)
                + tr * fx * (1.0 - fy)
                + bl * (1.0 - fx) * fy
                + br * fx * fy;
            dst[y * dst_w + x] = val.round().clamp(0.0, 255.0) as u8;
        }
    }
    dst
}

/// Decode score/bbox tensors for a single stride level into frame-space boxes.
fn decode_stride(
    scores: &[f32],
    bboxes: &[f32],
    stride: usize,
    input_size: usize,
    letterbox: &Letterbox,
    threshold: f32,
) -> Vec<Detection> {
    let grid = input_size / stride;
    let num_anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;

    let mut detections = Vec::new();
    for idx in 0..num_anchors {
        let score = scores.get(idx).copied().unwrap_or(0.0);
        if score <= threshold {
            continue;
        }

        let cell = idx / SCRFD_ANCHORS_PER_CELL;
        let anchor_cx = (cell % grid) as f32 * stride as f32;
        let anchor_cy = (cell / grid) as f32 * stride as f32;

        // bbox layout per anchor: [left, top, right, bottom] offsets in
        // stride units, relative to the anchor center.
        let off = idx * 4;
        if off + 3 >= bboxes.len() {
            continue;
        }
        let x1 = anchor_cx - bboxes[off] * stride as f32;
        let y1 = anchor_cy - bboxes[off + 1] * stride as f32;
        let x2 = anchor_cx + bboxes[off + 2] * stride as f32;
        let y2 = anchor_cy + bboxes[off + 3] * stride as f32;

        // Map from letterboxed space back to the original frame.
        let fx1 = (x1 - letterbox.pad_x) / letterbox.scale;
        let fy1 = (y1 - letterbox.pad_y) / letterbox.scale;
        let fx2 = (x2 - letterbox.pad_x) / letterbox.scale;
        let fy2 = (y2 - letterbox.pad_y) / letterbox.scale;

        detections.push(Detection {
            x: fx1,
            y: fy1,
            width: fx2 - fx1,
            height: fy2 - fy1,
            confidence: score,
        });
    }
    detections
}

/// Non-Maximum Suppression: drop detections overlapping a stronger one.
fn nms(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep: Vec<Detection> = Vec::with_capacity(detections.len());
    for candidate in detections {
        let overlaps = keep.iter().any(|kept| iou(kept, &candidate) > iou_threshold);
        if !overlaps {
            keep.push(candidate);
        }
    }
    keep
}

/// Intersection-over-Union of two boxes.
fn iou(a: &Detection, b: &Detection) -> f32 {
    let x1 = a.x.max(b.x);
    let y1 = a.y.max(b.y);
    let x2 = (a.x + a.width).min(b.x + b.width);
    let y2 = (a.y + a.height).min(b.y + b.height);

    let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union = a.area() + b.area() - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(x: f32, y: f32, w: f32, h: f32, conf: f32) -> Detection {
        Detection { x, y, width: w, height: h, confidence: conf }
    }

    #[test]
    fn iou_identical() {
        let a = det(0.0, 0.0, 100.0, 100.0, 1.0);
        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn iou_disjoint() {
        let a = det(0.0, 0.0, 10.0, 10.0, 1.0);
        let b = det(20.0, 20.0, 10.0, 10.0, 1.0);
        assert!(iou(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn iou_half_overlap() {
        let a = det(0.0, 0.0, 10.0, 10.0, 1.0);
        let b = det(5.0, 0.0, 10.0, 10.0, 1.0);
        // intersection 50, union 150
        assert!((iou(&a, &b) - 50.0 / 150.0).abs() < 1e-6);
    }

    #[test]
    fn nms_suppresses_overlapping_weaker_box() {
        let result = nms(
            vec![
                det(0.0, 0.0, 100.0, 100.0, 0.9),
                det(5.0, 5.0, 100.0, 100.0, 0.8),
                det(200.0, 200.0, 50.0, 50.0, 0.7),
            ],
            0.4,
        );
        assert_eq!(result.len(), 2);
        assert!((result[0].confidence - 0.9).abs() < 1e-6);
        assert!((result[1].confidence - 0.7).abs() < 1e-6);
    }

    #[test]
    fn nms_keeps_disjoint_boxes() {
        let result = nms(
            vec![det(0.0, 0.0, 10.0, 10.0, 0.9), det(50.0, 50.0, 10.0, 10.0, 0.8)],
            0.4,
        );
        assert_eq!(result.len(), 2);
    }

    #[test]
    fn nms_empty() {
        assert!(nms(vec![], 0.4).is_empty());
    }

    #[test]
    fn letterbox_roundtrip() {
        let (w, h) = (320.0f32, 240.0f32);
        let scale = (640.0 / w).min(640.0 / h);
        let lb = Letterbox {
            scale,
            pad_x: (640.0 - (w * scale).round()) / 2.0,
            pad_y: (640.0 - (h * scale).round()) / 2.0,
        };

        let (orig_x, orig_y) = (100.0f32, 50.0f32);
        let bx = orig_x * scale + lb.pad_x;
        let by = orig_y * scale + lb.pad_y;
        assert!(((bx - lb.pad_x) / lb.scale - orig_x).abs() < 0.1);
        assert!(((by - lb.pad_y) / lb.scale - orig_y).abs() < 0.1);
    }

    #[test]
    fn output_mapping_by_name() {
        let names: Vec<String> = [
            "score_8", "score_16", "score_32", "bbox_8", "bbox_16", "bbox_32",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        assert_eq!(map_output_indices(&names), [(0, 3), (1, 4), (2, 5)]);
    }

    #[test]
    fn output_mapping_shuffled_names() {
        let names: Vec<String> = [
            "bbox_8", "score_8", "bbox_16", "score_16", "bbox_32", "score_32",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        assert_eq!(map_output_indices(&names), [(1, 0), (3, 2), (5, 4)]);
    }

    #[test]
    fn output_mapping_positional_fallback() {
        let names: Vec<String> = (0..9).map(|i: usize| i.to_string()).collect();
        assert_eq!(map_output_indices(&names), [(0, 3), (1, 4), (2, 5)]);
    }

    #[test]
    fn bilinear_resize_uniform_stays_uniform() {
        let src = vec![128u8; 100 * 100];
        let dst = bilinear_resize(&src, 100, 100, 200, 200);
        assert!(dst.iter().all(|&p| p == 128));
    }

    #[test]
    fn bilinear_resize_zero_target() {
        assert!(bilinear_resize(&[1, 2, 3, 4], 2, 2, 0, 0).is_empty());
    }

    #[test]
    fn decode_drops_scores_at_or_below_floor() {
        // One 8-stride grid cell worth of anchors, all below the floor.
        let grid = 640 / 8;
        let anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
        let scores = vec![0.3f32; anchors];
        let bboxes = vec![1.0f32; anchors * 4];
        let lb = Letterbox { scale: 1.0, pad_x: 0.0, pad_y: 0.0 };
        assert!(decode_stride(&scores, &bboxes, 8, 640, &lb, 0.5).is_empty());
    }

    #[test]
    fn decode_emits_box_above_floor() {
        let grid = 640 / 8;
        let anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
        let mut scores = vec![0.0f32; anchors];
        scores[0] = 0.9;
        let bboxes = vec![2.0f32; anchors * 4];
        let lb = Letterbox { scale: 1.0, pad_x: 0.0, pad_y: 0.0 };
        let dets = decode_stride(&scores, &bboxes, 8, 640, &lb, 0.5);
        assert_eq!(dets.len(), 1);
        // Anchor (0,0), offsets 2.0 * stride 8 on each side.
        assert_eq!((dets[0].x, dets[0].y), (-16.0, -16.0));
        assert_eq!((dets[0].width, dets[0].height), (32.0, 32.0));
        assert!((dets[0].confidence - 0.9).abs() < 1e-6);
    }

    #[test]
    fn unavailable_detector_returns_no_detections() {
        let mut d = FaceDetector::load("/nonexistent/det_10g.onnx");
        assert!(!d.is_available());
        assert!(d.detect(&[0u8; 16], 4, 4, 0.5).is_empty());
    }
}
