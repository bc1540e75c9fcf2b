use serde::{Deserialize, Serialize};

/// Unique identifier of an enrolled person.
pub type IdentityId = uuid::Uuid;

/// Bounding region of a detected face, in frame coordinates.
///
/// Ephemeral: discarded once an embedding has been extracted from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Detection {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    /// Detector confidence in [0, 1].
    pub confidence: f32,
}

impl Detection {
    /// Clamp the box to `frame_width` × `frame_height`, shrinking it to the
    /// portion that actually lies inside the frame.
    pub fn clipped(&self, frame_width: u32, frame_height: u32) -> Detection {
        let fw = frame_width as f32;
        let fh = frame_height as f32;
        let x0 = self.x.clamp(0.0, fw);
        let y0 = self.y.clamp(0.0, fh);
        let x1 = (self.x + self.width).clamp(0.0, fw);
        let y1 = (self.y + self.height).clamp(0.0, fh);
        Detection {
            x: x0,
            y: y0,
            width: (x1 - x0).max(0.0),
            height: (y1 - y0).max(0.0),
            confidence: self.confidence,
        }
    }

    pub fn area(&self) -> f32 {
        self.width * self.height
    }
}

/// A face embedding vector, L2-normalized at construction.
///
/// Immutable once computed; the normalization makes cosine distance a plain
/// dot product.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    values: Vec<f32>,
}

impl Embedding {
    /// Build an embedding from raw model output, applying L2 normalization.
    ///
    /// An all-zero vector stays zero (its distance to anything is 1.0).
    pub fn from_raw(raw: Vec<f32>) -> Self {
        let norm: f32 = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
        let values = if norm > 0.0 {
            raw.iter().map(|x| x / norm).collect()
        } else {
            raw
        };
        Self { values }
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Cosine distance in [0, 2]: 0 = identical direction, 1 = orthogonal.
    pub fn cosine_distance(&self, other: &Embedding) -> f32 {
        let dot: f32 = self
            .values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| a * b)
            .sum();
        1.0 - dot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_raw_normalizes() {
        let e = Embedding::from_raw(vec![3.0, 4.0]);
        let norm: f32 = e.values().iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
    }

    #[test]
    fn zero_vector_stays_zero() {
        let e = Embedding::from_raw(vec![0.0, 0.0]);
        assert_eq!(e.values(), &[0.0, 0.0]);
    }

    #[test]
    fn distance_identical_is_zero() {
        let a = Embedding::from_raw(vec![1.0, 0.0, 0.0]);
        let b = Embedding::from_raw(vec![2.0, 0.0, 0.0]);
        assert!(a.cosine_distance(&b).abs() < 1e-6);
    }

    #[test]
    fn distance_orthogonal_is_one() {
        let a = Embedding::from_raw(vec![1.0, 0.0]);
        let b = Embedding::from_raw(vec![0.0, 1.0]);
        assert!((a.cosine_distance(&b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn distance_opposite_is_two() {
        let a = Embedding::from_raw(vec![1.0, 0.0]);
        let b = Embedding::from_raw(vec![-1.0, 0.0]);
        assert!((a.cosine_distance(&b) - 2.0).abs() < 1e-6);
    }

    #[test]
    fn clip_inside_frame_is_identity() {
        let d = Detection { x: 10.0, y: 10.0, width: 50.0, height: 50.0, confidence: 0.9 };
        let c = d.clipped(640, 480);
        assert_eq!((c.x, c.y, c.width, c.height), (10.0, 10.0, 50.0, 50.0));
    }

    #[test]
    fn clip_shrinks_overflowing_box() {
        let d = Detection { x: -20.0, y: 460.0, width: 100.0, height: 100.0, confidence: 0.9 };
        let c = d.clipped(640, 480);
        assert_eq!((c.x, c.y), (0.0, 460.0));
        assert_eq!((c.width, c.height), (80.0, 20.0));
    }

    #[test]
    fn clip_fully_outside_has_zero_area() {
        let d = Detection { x: 700.0, y: 500.0, width: 50.0, height: 50.0, confidence: 0.9 };
        assert_eq!(d.clipped(640, 480).area(), 0.0);
    }
}
