//! Recognition pipeline: capture thread, recognition thread, latest-wins
//! frame handoff.
//!
//! The capture thread pulls frames at device rate; the recognition thread
//! consumes the most recent frame on a fixed cadence, so expensive inference
//! never stalls capture. The handoff is a single-slot buffer: a new frame
//! overwrites the previous one, nothing ever queues.

use chrono::{DateTime, Local};
use presenza_core::extractor::ExtractorError;
use presenza_core::{Detection, Embedding, Gallery, IdentityId};
use presenza_hw::{CaptureSource, DeviceProvider, Frame, SourceState};
use presenza_store::{AttendanceRecorder, SuppressReason, Transition};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Fraction of sub-32 pixels above which a frame is skipped as dark.
const DARK_FRAME_PCT: f32 = 0.95;
/// Pause before re-probing device candidates after a broken source.
const REOPEN_BACKOFF: Duration = Duration::from_millis(500);
/// Granularity of shutdown-flag checks inside waits.
const STOP_POLL: Duration = Duration::from_millis(50);

/// Perception seam: detection plus embedding extraction.
///
/// The daemon's real implementation wraps the ONNX backends; tests substitute
/// stubs.
pub trait Perceive: Send {
    fn detect(&mut self, frame: &Frame) -> Vec<Detection>;
    fn extract(&mut self, frame: &Frame, detection: &Detection)
        -> Result<Embedding, ExtractorError>;
}

/// What one recognition pass concluded for one detected face.
#[derive(Debug, Clone)]
pub enum RecognitionResult {
    CheckIn {
        id: IdentityId,
        name: String,
        at: DateTime<Local>,
    },
    CheckOut {
        id: IdentityId,
        name: String,
        at: DateTime<Local>,
    },
    /// Recognized but inside the cooldown window or after the day's
    /// check-out; nothing was stored.
    Suppressed {
        id: IdentityId,
        name: String,
        reason: SuppressReason,
    },
    /// A face was detected but matched no enrolled identity.
    NoMatch,
}

/// Single-slot latest-wins frame buffer.
#[derive(Default)]
pub(crate) struct FrameSlot {
    slot: Mutex<Option<Frame>>,
}

impl FrameSlot {
    /// Store a frame, discarding any frame not yet consumed.
    fn put(&self, frame: Frame) {
        *self.slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(frame);
    }

    /// Take the most recent frame, leaving the slot empty.
    fn take(&self) -> Option<Frame> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub cadence: Duration,
    pub match_threshold: f32,
    /// Frames discarded after each (re)open while auto-exposure settles.
    pub warmup_frames: u32,
}

type Subscriber = Box<dyn Fn(&RecognitionResult) + Send>;

/// Handle to a running pipeline. Dropping it stops the pipeline.
pub struct PipelineHandle {
    stop: Arc<AtomicBool>,
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
    capture: Option<std::thread::JoinHandle<()>>,
    recognition: Option<std::thread::JoinHandle<()>>,
}

impl PipelineHandle {
    /// Register an observer; callbacks run on the recognition thread.
    pub fn subscribe(&self, callback: impl Fn(&RecognitionResult) + Send + 'static) {
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Box::new(callback));
    }

    /// Stop both loops, joining them. The capture source is released before
    /// this returns, and any in-flight recorder transaction has completed.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(h) = self.capture.take() {
            let _ = h.join();
        }
        if let Some(h) = self.recognition.take() {
            let _ = h.join();
        }
    }
}

impl Drop for PipelineHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Spawn the capture and recognition threads over an already-validated
/// capture source.
pub fn start<P>(
    mut source: CaptureSource<P>,
    perception: Arc<Mutex<dyn Perceive>>,
    gallery: Arc<Gallery>,
    recorder: Arc<AttendanceRecorder>,
    options: PipelineOptions,
) -> PipelineHandle
where
    P: DeviceProvider + Send + 'static,
    P::Device: Send,
{
    let stop = Arc::new(AtomicBool::new(false));
    let slot = Arc::new(FrameSlot::default());
    let subscribers: Arc<Mutex<Vec<Subscriber>>> = Arc::new(Mutex::new(Vec::new()));

    let capture = {
        let stop = Arc::clone(&stop);
        let slot = Arc::clone(&slot);
        let warmup = options.warmup_frames;
        std::thread::Builder::new()
            .name("presenza-capture".into())
            .spawn(move || {
                capture_loop(&mut source, &slot, warmup, &stop);
                source.close();
            })
            .expect("failed to spawn capture thread")
    };

    let recognition = {
        let stop = Arc::clone(&stop);
        let slot = Arc::clone(&slot);
        let subscribers = Arc::clone(&subscribers);
        std::thread::Builder::new()
            .name("presenza-recognition".into())
            .spawn(move || {
                recognition_loop(
                    &slot,
                    perception,
                    &gallery,
                    &recorder,
                    &subscribers,
                    &options,
                    &stop,
                );
            })
            .expect("failed to spawn recognition thread")
    };

    PipelineHandle {
        stop,
        subscribers,
        capture: Some(capture),
        recognition: Some(recognition),
    }
}

fn capture_loop<P>(source: &mut CaptureSource<P>, slot: &FrameSlot, warmup: u32, stop: &AtomicBool)
where
    P: DeviceProvider,
{
    tracing::info!("capture loop started");
    let mut remaining_warmup = warmup;
    while !stop.load(Ordering::SeqCst) {
        if source.state() == SourceState::Broken {
            // Recoverable: back off, then re-probe the candidates.
            sleep_unless_stopped(REOPEN_BACKOFF, stop);
            match source.reopen() {
                Ok(()) => remaining_warmup = warmup,
                Err(err) => tracing::warn!(error = %err, "reopen failed; will retry"),
            }
            continue;
        }
        match source.next_frame() {
            Ok(frame) => {
                // Auto-exposure needs a few frames after a (re)open.
                if remaining_warmup > 0 {
                    remaining_warmup -= 1;
                    continue;
                }
                slot.put(frame);
            }
            // next_frame already logged and did the failure accounting; a
            // device error is never fatal to the loop.
            Err(_) => {}
        }
    }
    tracing::info!("capture loop exiting");
}

fn recognition_loop(
    slot: &FrameSlot,
    perception: Arc<Mutex<dyn Perceive>>,
    gallery: &Gallery,
    recorder: &AttendanceRecorder,
    subscribers: &Mutex<Vec<Subscriber>>,
    options: &PipelineOptions,
    stop: &AtomicBool,
) {
    tracing::info!(cadence = ?options.cadence, "recognition loop started");
    while !stop.load(Ordering::SeqCst) {
        sleep_unless_stopped(options.cadence, stop);
        if stop.load(Ordering::SeqCst) {
            break;
        }

        let Some(frame) = slot.take() else {
            continue;
        };
        if frame.is_dark(DARK_FRAME_PCT) {
            tracing::debug!(sequence = frame.sequence, "skipping dark frame");
            continue;
        }

        let detections = {
            let mut perception = perception.lock().unwrap_or_else(|e| e.into_inner());
            perception.detect(&frame)
        };

        for detection in &detections {
            let result = recognize_one(&frame, detection, &perception, gallery, recorder, options);
            let Some(result) = result else { continue };
            let subs = subscribers.lock().unwrap_or_else(|e| e.into_inner());
            for callback in subs.iter() {
                callback(&result);
            }
        }
    }
    tracing::info!("recognition loop exiting");
}

/// Run extraction, lookup and recording for one detection.
///
/// Returns `None` when the face had to be skipped (perception error) or the
/// event could not be recorded (transient storage error, retried on the next
/// match).
fn recognize_one(
    frame: &Frame,
    detection: &Detection,
    perception: &Arc<Mutex<dyn Perceive>>,
    gallery: &Gallery,
    recorder: &AttendanceRecorder,
    options: &PipelineOptions,
) -> Option<RecognitionResult> {
    let embedding = {
        let mut perception = perception.lock().unwrap_or_else(|e| e.into_inner());
        match perception.extract(frame, detection) {
            Ok(e) => e,
            Err(err) => {
                tracing::debug!(error = %err, "skipping face");
                return None;
            }
        }
    };

    let Some(m) = gallery.lookup(&embedding, options.match_threshold) else {
        return Some(RecognitionResult::NoMatch);
    };

    let at = Local::now();
    match recorder.record_match(m.id, at, m.distance) {
        Ok(Transition::CheckedIn) => Some(RecognitionResult::CheckIn {
            id: m.id,
            name: m.name,
            at,
        }),
        Ok(Transition::CheckedOut) => Some(RecognitionResult::CheckOut {
            id: m.id,
            name: m.name,
            at,
        }),
        Ok(Transition::Suppressed(reason)) => Some(RecognitionResult::Suppressed {
            id: m.id,
            name: m.name,
            reason,
        }),
        Err(err) => {
            // Not recorded; suppression state lives in storage, so the next
            // match simply retries.
            tracing::warn!(identity = %m.id, error = %err, "attendance write failed");
            None
        }
    }
}

/// Sleep for `total`, waking early if the stop flag is set.
fn sleep_unless_stopped(total: Duration, stop: &AtomicBool) {
    let mut remaining = total;
    while !remaining.is_zero() {
        if stop.load(Ordering::SeqCst) {
            return;
        }
        let step = remaining.min(STOP_POLL);
        std::thread::sleep(step);
        remaining -= step;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use presenza_hw::{CameraError, CaptureDevice};
    use presenza_store::Store;
    use std::time::Instant;
    use uuid::Uuid;

    fn frame(fill: u8, sequence: u32) -> Frame {
        Frame {
            data: vec![fill; 64],
            width: 8,
            height: 8,
            timestamp: Instant::now(),
            sequence,
        }
    }

    #[test]
    fn slot_returns_latest_frame_only() {
        let slot = FrameSlot::default();
        slot.put(frame(100, 1));
        slot.put(frame(100, 2));
        slot.put(frame(100, 3));

        let taken = slot.take().unwrap();
        assert_eq!(taken.sequence, 3);
        assert!(slot.take().is_none());
    }

    // --- end-to-end over fakes ---

    struct TickingDevice {
        sequence: u32,
    }

    impl CaptureDevice for TickingDevice {
        fn read_frame(&mut self, _timeout: Duration) -> Result<Frame, CameraError> {
            self.sequence += 1;
            std::thread::sleep(Duration::from_millis(2));
            Ok(frame(128, self.sequence))
        }
    }

    struct TickingProvider;

    impl DeviceProvider for TickingProvider {
        type Device = TickingDevice;

        fn open(&self, _index: u32) -> Result<TickingDevice, CameraError> {
            Ok(TickingDevice { sequence: 0 })
        }
    }

    /// One centered face per frame; embedding fixed along the x axis.
    struct StubPerception;

    impl Perceive for StubPerception {
        fn detect(&mut self, _frame: &Frame) -> Vec<Detection> {
            vec![Detection { x: 1.0, y: 1.0, width: 4.0, height: 4.0, confidence: 0.9 }]
        }

        fn extract(
            &mut self,
            _frame: &Frame,
            _detection: &Detection,
        ) -> Result<Embedding, ExtractorError> {
            Ok(Embedding::from_raw(vec![1.0, 0.0]))
        }
    }

    fn wait_for<F: Fn() -> bool>(cond: F) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for pipeline results");
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    fn start_test_pipeline(
        gallery: Arc<Gallery>,
        cooldown: Duration,
    ) -> (PipelineHandle, Arc<Store>) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let recorder = Arc::new(AttendanceRecorder::new(Arc::clone(&store), cooldown));
        let source =
            CaptureSource::open(TickingProvider, &[0], Duration::from_millis(100)).unwrap();
        let handle = start(
            source,
            Arc::new(Mutex::new(StubPerception)),
            gallery,
            recorder,
            // Cadence long enough that subscribers registered right after
            // start() are in place before the first recognition pass.
            PipelineOptions {
                cadence: Duration::from_millis(40),
                match_threshold: 0.6,
                warmup_frames: 0,
            },
        );
        (handle, store)
    }

    #[test]
    fn matched_face_checks_in_then_suppresses() {
        let gallery = Arc::new(Gallery::new());
        let id = Uuid::new_v4();
        gallery
            .enroll(id, "Ada", vec![Embedding::from_raw(vec![1.0, 0.0])])
            .unwrap();

        let (mut handle, store) = start_test_pipeline(Arc::clone(&gallery), Duration::from_secs(60));
        let results: Arc<Mutex<Vec<RecognitionResult>>> = Arc::new(Mutex::new(Vec::new()));
        {
            let results = Arc::clone(&results);
            handle.subscribe(move |r| results.lock().unwrap().push(r.clone()));
        }

        wait_for(|| results.lock().unwrap().len() >= 3);
        handle.stop();

        let results = results.lock().unwrap();
        assert!(matches!(&results[0], RecognitionResult::CheckIn { id: got, .. } if *got == id));
        assert!(results[1..]
            .iter()
            .all(|r| matches!(r, RecognitionResult::Suppressed { .. })));

        // Exactly one stored event despite many recognitions.
        let day = Local::now().format("%Y-%m-%d").to_string();
        assert_eq!(store.events_for_day(id, &day).unwrap().len(), 1);
    }

    #[test]
    fn unknown_face_emits_no_match_and_stores_nothing() {
        let gallery = Arc::new(Gallery::new()); // empty: nothing can match
        let (mut handle, _store) = start_test_pipeline(gallery, Duration::from_secs(60));

        let results: Arc<Mutex<Vec<RecognitionResult>>> = Arc::new(Mutex::new(Vec::new()));
        {
            let results = Arc::clone(&results);
            handle.subscribe(move |r| results.lock().unwrap().push(r.clone()));
        }

        wait_for(|| !results.lock().unwrap().is_empty());
        handle.stop();

        assert!(results
            .lock()
            .unwrap()
            .iter()
            .all(|r| matches!(r, RecognitionResult::NoMatch)));
    }

    #[test]
    fn stop_joins_both_threads_promptly() {
        let gallery = Arc::new(Gallery::new());
        let (mut handle, _store) = start_test_pipeline(gallery, Duration::from_secs(60));

        let started = Instant::now();
        handle.stop();
        assert!(started.elapsed() < Duration::from_secs(2));
        // Idempotent.
        handle.stop();
    }
}
