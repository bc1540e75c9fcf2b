//! presenza-hw — Hardware abstraction for camera capture.
//!
//! Provides V4L2-based camera access and the [`CaptureSource`] wrapper that
//! handles device-index fallback, read validation, and broken-state recovery.

pub mod capture;
pub mod frame;
pub mod v4l2;

pub use capture::{CameraError, CaptureDevice, CaptureSource, DeviceProvider, SourceState};
pub use frame::Frame;
pub use v4l2::V4l2Provider;
