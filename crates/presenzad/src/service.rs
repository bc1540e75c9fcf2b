//! Public service API consumed by the D-Bus layer (and any other front-end).
//!
//! The ONNX models load on a background thread; until that finishes every
//! operation that needs them fails fast with [`ServiceError::NotReady`]
//! instead of blocking the caller.

use crate::config::Config;
use crate::pipeline::{self, Perceive, PipelineHandle, PipelineOptions};
use presenza_core::extractor::ExtractorError;
use presenza_core::{
    Detection, Embedding, FaceDetector, FaceExtractor, Gallery, GalleryError, IdentityId,
};
use presenza_hw::{CameraError, CaptureSource, Frame, V4l2Provider};
use presenza_store::{AttendanceRecorder, DayRecord, Store, StoreError};
use std::path::Path;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("service is still initializing")]
    NotReady,
    #[error("recognition unavailable: {0}")]
    RecognitionUnavailable(String),
    #[error("enrollment requires at least one reference image")]
    NoReferenceImages,
    #[error("no face found in {0}")]
    NoFaceFound(String),
    #[error("{count} faces found in {path}; reference images must contain exactly one")]
    MultipleFacesFound { path: String, count: usize },
    #[error("failed to read image {path}: {reason}")]
    ImageRead { path: String, reason: String },
    #[error("unknown identity {0}")]
    UnknownIdentity(IdentityId),
    #[error(transparent)]
    Camera(#[from] CameraError),
    #[error(transparent)]
    Gallery(#[from] GalleryError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Extractor(#[from] ExtractorError),
}

/// The loaded perception backends, shared between enrollment and the
/// pipeline's recognition thread.
pub struct Perception {
    detector: FaceDetector,
    extractor: FaceExtractor,
    confidence_floor: f32,
}

impl Perception {
    fn availability(&self) -> Result<(), ServiceError> {
        if !self.detector.is_available() {
            return Err(ServiceError::RecognitionUnavailable("face detector".into()));
        }
        if !self.extractor.is_available() {
            return Err(ServiceError::RecognitionUnavailable("embedding extractor".into()));
        }
        Ok(())
    }
}

impl Perceive for Perception {
    fn detect(&mut self, frame: &Frame) -> Vec<Detection> {
        self.detector
            .detect(&frame.data, frame.width, frame.height, self.confidence_floor)
    }

    fn extract(
        &mut self,
        frame: &Frame,
        detection: &Detection,
    ) -> Result<Embedding, ExtractorError> {
        self.extractor
            .extract(&frame.data, frame.width, frame.height, detection)
    }
}

/// The attendance core: gallery, store, perception, pipeline lifecycle.
pub struct Service {
    config: Config,
    store: Arc<Store>,
    gallery: Arc<Gallery>,
    perception: Arc<OnceLock<Arc<Mutex<Perception>>>>,
}

impl Service {
    /// Build the service: rebuild the gallery from storage synchronously,
    /// load the models in the background.
    pub fn start(config: Config, store: Arc<Store>) -> Result<Arc<Self>, ServiceError> {
        let gallery = Arc::new(Gallery::new());
        let records = store.load_identities()?;
        tracing::info!(identities = records.len(), "gallery rebuilt from store");
        gallery.rebuild(records);

        let perception: Arc<OnceLock<Arc<Mutex<Perception>>>> = Arc::new(OnceLock::new());
        {
            let perception = Arc::clone(&perception);
            let scrfd = config.scrfd_model_path();
            let arcface = config.arcface_model_path();
            let confidence_floor = config.confidence_floor;
            std::thread::Builder::new()
                .name("presenza-loader".into())
                .spawn(move || {
                    let started = Instant::now();
                    let loaded = Perception {
                        detector: FaceDetector::load(&scrfd),
                        extractor: FaceExtractor::load(&arcface),
                        confidence_floor,
                    };
                    let _ = perception.set(Arc::new(Mutex::new(loaded)));
                    tracing::info!(elapsed = ?started.elapsed(), "perception models loaded");
                })
                .expect("failed to spawn loader thread");
        }

        Ok(Arc::new(Self {
            config,
            store,
            gallery,
            perception,
        }))
    }

    pub fn is_ready(&self) -> bool {
        self.perception.get().is_some()
    }

    /// Block until the model loader finishes or `timeout` elapses.
    pub fn wait_ready(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.is_ready() {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        true
    }

    fn perception(&self) -> Result<Arc<Mutex<Perception>>, ServiceError> {
        self.perception
            .get()
            .cloned()
            .ok_or(ServiceError::NotReady)
    }

    /// Enroll a new identity from reference images.
    ///
    /// Each image must contain exactly one detectable face. On success the
    /// identity is persisted and immediately visible to gallery lookups.
    pub fn enroll_identity(
        &self,
        name: &str,
        image_paths: &[impl AsRef<Path>],
    ) -> Result<IdentityId, ServiceError> {
        if image_paths.is_empty() {
            return Err(ServiceError::NoReferenceImages);
        }
        let perception = self.perception()?;
        let mut perception = perception.lock().unwrap_or_else(|e| e.into_inner());
        perception.availability()?;

        let mut embeddings = Vec::with_capacity(image_paths.len());
        for path in image_paths {
            let path = path.as_ref();
            let frame = load_reference_image(path)?;

            let detections = perception.detect(&frame);
            let detection = match detections.len() {
                0 => return Err(ServiceError::NoFaceFound(path.display().to_string())),
                1 => &detections[0],
                count => {
                    return Err(ServiceError::MultipleFacesFound {
                        path: path.display().to_string(),
                        count,
                    })
                }
            };
            embeddings.push(perception.extract(&frame, detection)?);
        }

        let id = IdentityId::new_v4();
        self.store.add_identity(id, name, &embeddings)?;
        self.gallery.enroll(id, name, embeddings)?;
        tracing::info!(identity = %id, name, "identity enrolled");
        Ok(id)
    }

    /// Remove an identity from the gallery and the store.
    pub fn remove_identity(&self, id: IdentityId) -> Result<(), ServiceError> {
        let existed = self.store.remove_identity(id)?;
        self.gallery.remove(id);
        if !existed {
            return Err(ServiceError::UnknownIdentity(id));
        }
        tracing::info!(identity = %id, "identity removed");
        Ok(())
    }

    /// Open the camera and start the recognition pipeline.
    pub fn start_pipeline(&self) -> Result<PipelineHandle, ServiceError> {
        let perception = self.perception()?;
        let source = CaptureSource::open(
            V4l2Provider::default(),
            &self.config.device_candidates,
            self.config.read_timeout,
        )?;
        let recorder = Arc::new(AttendanceRecorder::new(
            Arc::clone(&self.store),
            self.config.cooldown,
        ));
        Ok(pipeline::start(
            source,
            perception,
            Arc::clone(&self.gallery),
            recorder,
            PipelineOptions {
                cadence: self.config.cadence,
                match_threshold: self.config.match_threshold,
                warmup_frames: self.config.warmup_frames,
            },
        ))
    }

    pub fn identity_count(&self) -> usize {
        self.gallery.len()
    }

    /// Today's attendance rows, for the D-Bus report call.
    pub fn today_report(&self) -> Result<Vec<DayRecord>, ServiceError> {
        let day = chrono::Local::now().format("%Y-%m-%d").to_string();
        Ok(self.store.daily_report(&day)?)
    }
}

/// Decode a reference image into a grayscale frame.
fn load_reference_image(path: &Path) -> Result<Frame, ServiceError> {
    let image = image::open(path).map_err(|e| ServiceError::ImageRead {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    let gray = image.to_luma8();
    Ok(Frame {
        width: gray.width(),
        height: gray.height(),
        data: gray.into_raw(),
        timestamp: Instant::now(),
        sequence: 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn test_config(dir: &Path) -> Config {
        Config {
            device_candidates: vec![0],
            model_dir: dir.to_path_buf(), // no models here: perception loads Unavailable
            db_path: dir.join("attendance.db"),
            match_threshold: 0.6,
            confidence_floor: 0.5,
            cooldown: Duration::from_secs(60),
            cadence: Duration::from_millis(100),
            read_timeout: Duration::from_millis(100),
            warmup_frames: 0,
        }
    }

    #[test]
    fn operations_fail_with_not_ready_until_loader_finishes() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open_in_memory().unwrap());
        let service = Service::start(test_config(dir.path()), store).unwrap();

        // Either the loader has not finished yet (NotReady) or it has and the
        // missing model files make recognition unavailable.
        match service.enroll_identity("Ada", &[dir.path().join("ada.png")]) {
            Err(ServiceError::NotReady) | Err(ServiceError::RecognitionUnavailable(_)) => {}
            other => panic!("expected NotReady/RecognitionUnavailable, got {other:?}"),
        }

        assert!(service.wait_ready(Duration::from_secs(10)));
        let err = service
            .enroll_identity("Ada", &[dir.path().join("ada.png")])
            .unwrap_err();
        assert!(matches!(err, ServiceError::RecognitionUnavailable(_)));
    }

    #[test]
    fn gallery_rebuilds_from_store_at_startup() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open_in_memory().unwrap());
        let id = IdentityId::new_v4();
        store
            .add_identity(id, "Ada", &[Embedding::from_raw(vec![1.0, 0.0])])
            .unwrap();

        let service = Service::start(test_config(dir.path()), store).unwrap();
        assert_eq!(service.identity_count(), 1);
    }

    #[test]
    fn enrollment_without_images_is_rejected_before_anything_runs() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open_in_memory().unwrap());
        let service = Service::start(test_config(dir.path()), Arc::clone(&store)).unwrap();

        let paths: &[PathBuf] = &[];
        let err = service.enroll_identity("Ghost", paths).unwrap_err();
        assert!(matches!(err, ServiceError::NoReferenceImages));

        // Nothing persisted, nothing enrolled.
        assert_eq!(store.identity_count().unwrap(), 0);
        assert_eq!(service.identity_count(), 0);
    }

    #[test]
    fn remove_unknown_identity_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open_in_memory().unwrap());
        let service = Service::start(test_config(dir.path()), store).unwrap();

        let err = service.remove_identity(IdentityId::new_v4()).unwrap_err();
        assert!(matches!(err, ServiceError::UnknownIdentity(_)));
    }
}
