//! presenza-core — Face perception and identity matching.
//!
//! SCRFD for face detection and ArcFace for embedding extraction, both via
//! ONNX Runtime on CPU, plus the in-memory gallery of enrolled identities.

pub mod detector;
pub mod extractor;
pub mod gallery;
pub mod types;

pub use detector::FaceDetector;
pub use extractor::FaceExtractor;
pub use gallery::{Gallery, GalleryError, GalleryMatch, IdentityRecord};
pub use types::{Detection, Embedding, IdentityId};
