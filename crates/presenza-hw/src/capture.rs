//! Capture source — device-index fallback, probe validation, broken-state
//! recovery.
//!
//! The source owns the device handle exclusively while open and releases it
//! deterministically on [`CaptureSource::close`] or on the transition to
//! [`SourceState::Broken`]. It never silently retries forever: after
//! `MAX_CONSECUTIVE_FAILURES` failed reads the caller must `reopen()`.

use crate::frame::Frame;
use std::time::Duration;
use thiserror::Error;

/// Consecutive read failures tolerated before the source goes `Broken`.
const MAX_CONSECUTIVE_FAILURES: u32 = 3;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("no usable capture device among candidates {0:?}")]
    NoDeviceAvailable(Vec<u32>),
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("device busy: {0}")]
    DeviceBusy(String),
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("frame read timed out after {0:?}")]
    ReadTimeout(Duration),
    #[error("capture source is broken; call reopen()")]
    Broken,
    #[error("capture source is closed")]
    Closed,
}

/// An open video device delivering frames.
pub trait CaptureDevice: Send {
    /// Read one frame, waiting at most `timeout`.
    fn read_frame(&mut self, timeout: Duration) -> Result<Frame, CameraError>;
}

/// Opens devices by numeric index (`/dev/video{index}` for the V4L2 backend).
///
/// Tests substitute fake providers so multiple sources can be constructed
/// without device contention.
pub trait DeviceProvider {
    type Device: CaptureDevice;

    fn open(&self, index: u32) -> Result<Self::Device, CameraError>;
}

/// Lifecycle state of a [`CaptureSource`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    Open,
    Broken,
    Closed,
}

/// A validated, restartable capture source over an ordered list of device
/// index candidates.
pub struct CaptureSource<P: DeviceProvider> {
    provider: P,
    candidates: Vec<u32>,
    read_timeout: Duration,
    device: Option<P::Device>,
    /// Index of the accepted candidate, kept for reopen and diagnostics.
    active_index: u32,
    consecutive_failures: u32,
    state: SourceState,
}

impl<P: DeviceProvider> std::fmt::Debug for CaptureSource<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureSource")
            .field("candidates", &self.candidates)
            .field("read_timeout", &self.read_timeout)
            .field("active_index", &self.active_index)
            .field("consecutive_failures", &self.consecutive_failures)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl<P: DeviceProvider> CaptureSource<P> {
    /// Try each candidate index in order and accept the first that delivers a
    /// real frame within `read_timeout`.
    ///
    /// Open-success alone is not enough; some devices report open but never
    /// produce frames, so a probe read is required before acceptance.
    pub fn open(
        provider: P,
        candidates: &[u32],
        read_timeout: Duration,
    ) -> Result<Self, CameraError> {
        for &index in candidates {
            let mut device = match provider.open(index) {
                Ok(d) => d,
                Err(err) => {
                    tracing::debug!(index, error = %err, "candidate failed to open");
                    continue;
                }
            };
            match device.read_frame(read_timeout) {
                Ok(frame) => {
                    tracing::info!(
                        index,
                        width = frame.width,
                        height = frame.height,
                        "capture source validated"
                    );
                    return Ok(Self {
                        provider,
                        candidates: candidates.to_vec(),
                        read_timeout,
                        device: Some(device),
                        active_index: index,
                        consecutive_failures: 0,
                        state: SourceState::Open,
                    });
                }
                Err(err) => {
                    tracing::warn!(index, error = %err, "candidate opened but delivered no frame");
                    // device handle dropped here
                }
            }
        }
        Err(CameraError::NoDeviceAvailable(candidates.to_vec()))
    }

    /// Read the next frame.
    ///
    /// On repeated failure the source transitions to `Broken`, releases the
    /// device handle, and keeps failing until [`reopen`](Self::reopen).
    pub fn next_frame(&mut self) -> Result<Frame, CameraError> {
        match self.state {
            SourceState::Broken => return Err(CameraError::Broken),
            SourceState::Closed => return Err(CameraError::Closed),
            SourceState::Open => {}
        }
        let device = self.device.as_mut().ok_or(CameraError::Closed)?;

        match device.read_frame(self.read_timeout) {
            Ok(frame) => {
                self.consecutive_failures = 0;
                Ok(frame)
            }
            Err(err) => {
                self.consecutive_failures += 1;
                tracing::warn!(
                    index = self.active_index,
                    failures = self.consecutive_failures,
                    error = %err,
                    "frame read failed"
                );
                if self.consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                    tracing::error!(index = self.active_index, "capture source broken; releasing device");
                    self.device = None;
                    self.state = SourceState::Broken;
                }
                Err(err)
            }
        }
    }

    /// Re-run candidate selection after a `Broken` transition.
    ///
    /// The previously active index is tried first.
    pub fn reopen(&mut self) -> Result<(), CameraError> {
        if self.state == SourceState::Closed {
            return Err(CameraError::Closed);
        }
        self.device = None;

        let mut order = vec![self.active_index];
        order.extend(self.candidates.iter().copied().filter(|&i| i != self.active_index));

        for index in order {
            let Ok(mut device) = self.provider.open(index) else {
                continue;
            };
            if device.read_frame(self.read_timeout).is_ok() {
                tracing::info!(index, "capture source reopened");
                self.device = Some(device);
                self.active_index = index;
                self.consecutive_failures = 0;
                self.state = SourceState::Open;
                return Ok(());
            }
        }
        self.state = SourceState::Broken;
        Err(CameraError::NoDeviceAvailable(self.candidates.clone()))
    }

    /// Release the device handle. Terminal; a closed source cannot be reopened.
    pub fn close(&mut self) {
        if self.device.take().is_some() {
            tracing::info!(index = self.active_index, "capture source closed");
        }
        self.state = SourceState::Closed;
    }

    pub fn state(&self) -> SourceState {
        self.state
    }

    pub fn active_index(&self) -> u32 {
        self.active_index
    }
}

impl<P: DeviceProvider> Drop for CaptureSource<P> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::rc::Rc;
    use std::time::Instant;

    /// Scripted device behavior for one candidate index.
    #[derive(Clone)]
    enum Script {
        /// Fails to open at all.
        NoOpen,
        /// Opens but every read times out.
        OpensSilent,
        /// Opens and delivers frames, with optional failures injected after
        /// the first `good` reads.
        Delivers { fail_after: Option<u32> },
        /// First open behaves like `Delivers { fail_after: Some(1) }`;
        /// devices from later opens are healthy.
        FlakyThenHealthy,
    }

    struct FakeDevice {
        script: Script,
        reads: u32,
    }

    impl CaptureDevice for FakeDevice {
        fn read_frame(&mut self, timeout: Duration) -> Result<Frame, CameraError> {
            self.reads += 1;
            match self.script {
                Script::OpensSilent => Err(CameraError::ReadTimeout(timeout)),
                Script::Delivers { fail_after: Some(n) } if self.reads > n => {
                    Err(CameraError::CaptureFailed("injected".into()))
                }
                _ => Ok(Frame {
                    data: vec![128; 4],
                    width: 2,
                    height: 2,
                    timestamp: Instant::now(),
                    sequence: self.reads,
                }),
            }
        }
    }

    struct FakeProvider {
        scripts: HashMap<u32, Script>,
        open_log: Rc<RefCell<Vec<u32>>>,
        opens: RefCell<HashMap<u32, u32>>,
    }

    impl FakeProvider {
        fn new(scripts: &[(u32, Script)]) -> (Self, Rc<RefCell<Vec<u32>>>) {
            let log = Rc::new(RefCell::new(Vec::new()));
            (
                Self {
                    scripts: scripts.iter().cloned().collect(),
                    open_log: log.clone(),
                    opens: RefCell::new(HashMap::new()),
                },
                log,
            )
        }
    }

    impl DeviceProvider for FakeProvider {
        type Device = FakeDevice;

        fn open(&self, index: u32) -> Result<FakeDevice, CameraError> {
            self.open_log.borrow_mut().push(index);
            let prior_opens = {
                let mut opens = self.opens.borrow_mut();
                let n = opens.entry(index).or_insert(0);
                let prior = *n;
                *n += 1;
                prior
            };
            match self.scripts.get(&index) {
                None | Some(Script::NoOpen) => {
                    Err(CameraError::DeviceNotFound(format!("/dev/video{index}")))
                }
                Some(Script::FlakyThenHealthy) => Ok(FakeDevice {
                    script: if prior_opens == 0 {
                        Script::Delivers { fail_after: Some(1) }
                    } else {
                        Script::Delivers { fail_after: None }
                    },
                    reads: 0,
                }),
                Some(script) => Ok(FakeDevice {
                    script: script.clone(),
                    reads: 0,
                }),
            }
        }
    }

    const TIMEOUT: Duration = Duration::from_millis(10);

    #[test]
    fn first_delivering_candidate_wins_and_later_ones_are_never_probed() {
        let (provider, log) =
            FakeProvider::new(&[(1, Script::Delivers { fail_after: None }), (0, Script::Delivers { fail_after: None })]);
        let source = CaptureSource::open(provider, &[1, 0], TIMEOUT).unwrap();
        assert_eq!(source.active_index(), 1);
        assert_eq!(*log.borrow(), vec![1]);
    }

    #[test]
    fn open_without_frames_is_not_accepted() {
        let (provider, _) = FakeProvider::new(&[(0, Script::OpensSilent)]);
        let err = CaptureSource::open(provider, &[0], TIMEOUT).unwrap_err();
        assert!(matches!(err, CameraError::NoDeviceAvailable(c) if c == vec![0]));
    }

    #[test]
    fn falls_through_to_next_candidate() {
        let (provider, log) = FakeProvider::new(&[
            (0, Script::OpensSilent),
            (2, Script::NoOpen),
            (1, Script::Delivers { fail_after: None }),
        ]);
        let source = CaptureSource::open(provider, &[0, 2, 1], TIMEOUT).unwrap();
        assert_eq!(source.active_index(), 1);
        assert_eq!(*log.borrow(), vec![0, 2, 1]);
    }

    #[test]
    fn repeated_read_failures_break_the_source() {
        // Probe read succeeds, then every read fails.
        let (provider, _) = FakeProvider::new(&[(0, Script::Delivers { fail_after: Some(1) })]);
        let mut source = CaptureSource::open(provider, &[0], TIMEOUT).unwrap();

        for _ in 0..MAX_CONSECUTIVE_FAILURES {
            assert_eq!(source.state(), SourceState::Open);
            assert!(source.next_frame().is_err());
        }
        assert_eq!(source.state(), SourceState::Broken);
        assert!(matches!(source.next_frame(), Err(CameraError::Broken)));
    }

    #[test]
    fn reopen_recovers_a_broken_source() {
        let (provider, _) = FakeProvider::new(&[(0, Script::FlakyThenHealthy)]);
        let mut source = CaptureSource::open(provider, &[0], TIMEOUT).unwrap();
        for _ in 0..MAX_CONSECUTIVE_FAILURES {
            let _ = source.next_frame();
        }
        assert_eq!(source.state(), SourceState::Broken);

        // A fresh FakeDevice is handed out on reopen, so reads succeed again.
        source.reopen().unwrap();
        assert_eq!(source.state(), SourceState::Open);
        assert!(source.next_frame().is_ok());
    }

    #[test]
    fn a_successful_read_resets_the_failure_count() {
        let (provider, _) = FakeProvider::new(&[(0, Script::Delivers { fail_after: None })]);
        let mut source = CaptureSource::open(provider, &[0], TIMEOUT).unwrap();
        for _ in 0..10 {
            assert!(source.next_frame().is_ok());
        }
        assert_eq!(source.state(), SourceState::Open);
    }

    #[test]
    fn closed_source_rejects_reads_and_reopen() {
        let (provider, _) = FakeProvider::new(&[(0, Script::Delivers { fail_after: None })]);
        let mut source = CaptureSource::open(provider, &[0], TIMEOUT).unwrap();
        source.close();
        assert!(matches!(source.next_frame(), Err(CameraError::Closed)));
        assert!(matches!(source.reopen(), Err(CameraError::Closed)));
    }
}
