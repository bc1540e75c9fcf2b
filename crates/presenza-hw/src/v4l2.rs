//! V4L2 device backend via the `v4l` crate.

use crate::capture::{CameraError, CaptureDevice, DeviceProvider};
use crate::frame::{self, Frame};
use std::os::unix::io::RawFd;
use std::path::Path;
use std::time::{Duration, Instant};
use v4l::buffer::Type as BufType;
use v4l::io::traits::{CaptureStream, Stream};
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

/// Negotiated pixel format for the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PixelFormat {
    /// YUYV 4:2:2 packed (2 bytes/pixel, extract Y channel).
    Yuyv,
    /// 8-bit grayscale (1 byte/pixel).
    Grey,
    /// 16-bit little-endian grayscale (2 bytes/pixel).
    Y16,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        if fourcc == FourCC::new(b"YUYV") {
            Some(PixelFormat::Yuyv)
        } else if fourcc == FourCC::new(b"GREY") {
            Some(PixelFormat::Grey)
        } else if fourcc == FourCC::new(b"Y16 ") || fourcc == FourCC::new(b"Y16\0") {
            Some(PixelFormat::Y16)
        } else {
            None
        }
    }
}

/// Opens `/dev/video{index}` devices at the requested capture resolution.
pub struct V4l2Provider {
    pub width: u32,
    pub height: u32,
}

impl Default for V4l2Provider {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
        }
    }
}

impl DeviceProvider for V4l2Provider {
    type Device = V4l2Device;

    fn open(&self, index: u32) -> Result<V4l2Device, CameraError> {
        V4l2Device::open(index, self.width, self.height)
    }
}

/// An open V4L2 video capture device.
pub struct V4l2Device {
    device: Device,
    width: u32,
    height: u32,
    pixel_format: PixelFormat,
    device_path: String,
}

impl V4l2Device {
    fn open(index: u32, req_width: u32, req_height: u32) -> Result<Self, CameraError> {
        let device_path = format!("/dev/video{index}");
        if !Path::new(&device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path));
        }

        let device = Device::with_path(&device_path).map_err(|e| {
            let text = e.to_string();
            if text.contains("busy") || text.contains("EBUSY") {
                CameraError::DeviceBusy(device_path.clone())
            } else {
                CameraError::DeviceNotFound(format!("{device_path}: {e}"))
            }
        })?;

        let caps = device
            .query_caps()
            .map_err(|e| CameraError::CaptureFailed(format!("query_caps on {device_path}: {e}")))?;
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::CaptureFailed(format!(
                "{device_path} has no video capture capability"
            )));
        }
        tracing::info!(device = %device_path, driver = %caps.driver, card = %caps.card, "camera opened");

        let (width, height, pixel_format) =
            negotiate_format(&device, &device_path, req_width, req_height)?;

        Ok(Self {
            device,
            width,
            height,
            pixel_format,
            device_path,
        })
    }

    fn buf_to_grayscale(&self, buf: &[u8]) -> Result<Vec<u8>, CameraError> {
        let to_capture_err = |e: frame::PixelError| CameraError::CaptureFailed(e.to_string());
        match self.pixel_format {
            PixelFormat::Grey => {
                let pixels = (self.width * self.height) as usize;
                if buf.len() < pixels {
                    return Err(CameraError::CaptureFailed(format!(
                        "short GREY buffer: {} of {pixels} bytes",
                        buf.len()
                    )));
                }
                Ok(buf[..pixels].to_vec())
            }
            PixelFormat::Y16 => {
                frame::y16_to_grayscale(buf, self.width, self.height).map_err(to_capture_err)
            }
            PixelFormat::Yuyv => {
                frame::yuyv_to_grayscale(buf, self.width, self.height).map_err(to_capture_err)
            }
        }
    }
}

/// Request YUYV at the desired resolution and accept whichever supported
/// format the driver settles on.
fn negotiate_format(
    device: &Device,
    device_path: &str,
    req_width: u32,
    req_height: u32,
) -> Result<(u32, u32, PixelFormat), CameraError> {
    let describe = |e: std::io::Error| format!("format negotiation on {device_path}: {e}");

    let mut fmt = device
        .format()
        .map_err(|e| CameraError::FormatNegotiationFailed(describe(e)))?;
    fmt.fourcc = FourCC::new(b"YUYV");
    fmt.width = req_width;
    fmt.height = req_height;

    let negotiated = device
        .set_format(&fmt)
        .map_err(|e| CameraError::FormatNegotiationFailed(describe(e)))?;

    let pixel_format = PixelFormat::from_fourcc(negotiated.fourcc).ok_or_else(|| {
        CameraError::FormatNegotiationFailed(format!(
            "{device_path} offers {:?}; need YUYV, GREY, or Y16",
            negotiated.fourcc
        ))
    })?;
    tracing::info!(
        width = negotiated.width,
        height = negotiated.height,
        format = ?pixel_format,
        "format negotiated"
    );
    Ok((negotiated.width, negotiated.height, pixel_format))
}

/// Block until `fd` is readable or `timeout` elapses. A timeout means the
/// device accepted the stream but never filled a buffer.
fn wait_for_frame(fd: RawFd, timeout: Duration) -> Result<(), CameraError> {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let millis = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;
    loop {
        let rc = unsafe { libc::poll(&mut pfd, 1, millis) };
        if rc > 0 {
            return Ok(());
        }
        if rc == 0 {
            return Err(CameraError::ReadTimeout(timeout));
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINTR) {
            return Err(CameraError::CaptureFailed(format!("poll: {err}")));
        }
    }
}

impl CaptureDevice for V4l2Device {
    fn read_frame(&mut self, timeout: Duration) -> Result<Frame, CameraError> {
        let started = Instant::now();

        let mut stream =
            MmapStream::with_buffers(&self.device, BufType::VideoCapture, 4).map_err(|e| {
                CameraError::CaptureFailed(format!("mmap stream on {}: {e}", self.device_path))
            })?;
        // Kick off STREAMON ourselves: `next` would do it lazily, but the fd
        // only signals readiness once streaming has started.
        stream
            .start()
            .map_err(|e| CameraError::CaptureFailed(format!("streamon: {e}")))?;

        // VIDIOC_DQBUF has no timeout parameter and blocks for as long as the
        // driver stays silent, so gate it behind poll(2) on the device fd.
        let remaining = timeout.saturating_sub(started.elapsed());
        if let Err(e) = wait_for_frame(self.device.handle().fd(), remaining) {
            tracing::warn!(device = %self.device_path, ?timeout, "frame wait failed: {e}");
            return Err(e);
        }

        let (buf, meta) = stream
            .next()
            .map_err(|e| CameraError::CaptureFailed(format!("dequeue: {e}")))?;

        Ok(Frame {
            data: self.buf_to_grayscale(buf)?,
            width: self.width,
            height: self.height,
            timestamp: Instant::now(),
            sequence: meta.sequence,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Pipe {
        read: RawFd,
        write: RawFd,
    }

    impl Pipe {
        fn new() -> Self {
            let mut fds = [0; 2];
            assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
            Self {
                read: fds[0],
                write: fds[1],
            }
        }
    }

    impl Drop for Pipe {
        fn drop(&mut self) {
            unsafe {
                libc::close(self.read);
                libc::close(self.write);
            }
        }
    }

    #[test]
    fn silent_fd_times_out_instead_of_blocking() {
        let pipe = Pipe::new();
        let err = wait_for_frame(pipe.read, Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, CameraError::ReadTimeout(_)));
    }

    #[test]
    fn ready_fd_returns_immediately() {
        let pipe = Pipe::new();
        let written = unsafe { libc::write(pipe.write, b"y".as_ptr().cast(), 1) };
        assert_eq!(written, 1);
        wait_for_frame(pipe.read, Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn exhausted_budget_polls_once_and_times_out() {
        let pipe = Pipe::new();
        let err = wait_for_frame(pipe.read, Duration::ZERO).unwrap_err();
        assert!(matches!(err, CameraError::ReadTimeout(_)));
    }
}
