//! Frame type and pixel conversion helpers.

/// One grayscale frame as delivered by a capture device.
///
/// Owned by the capture source until handed to the pipeline, then moved.
#[derive(Clone)]
pub struct Frame {
    /// Pixel rows, `width * height` bytes, one byte per pixel.
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp: std::time::Instant,
    pub sequence: u32,
}

impl Frame {
    /// Mean pixel value, in 0.0..=255.0.
    pub fn avg_brightness(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        let sum: f32 = self.data.iter().map(|&b| f32::from(b)).sum();
        sum / self.data.len() as f32
    }

    /// Whether the frame is essentially black (camera warming up, lens covered).
    ///
    /// True if more than `threshold_pct` of the pixels fall below 32.
    pub fn is_dark(&self, threshold_pct: f32) -> bool {
        if self.data.is_empty() {
            return true;
        }
        let dark = self.data.iter().filter(|&&p| p < 32).count();
        (dark as f32 / self.data.len() as f32) > threshold_pct
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("sequence", &self.sequence)
            .finish_non_exhaustive()
    }
}

/// Extract the luma channel from packed YUYV 4:2:2 data.
///
/// Every 4 bytes carry two pixels as [Y0, U, Y1, V]; the even bytes are
/// the grayscale values.
pub fn yuyv_to_grayscale(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, PixelError> {
    let expected = (width * height) as usize * 2;
    if yuyv.len() < expected {
        return Err(PixelError::InvalidLength {
            expected,
            actual: yuyv.len(),
        });
    }
    let gray = yuyv[..expected].iter().step_by(2).copied().collect();
    Ok(gray)
}

/// Downscale 16-bit little-endian grayscale to 8-bit.
pub fn y16_to_grayscale(buf: &[u8], width: u32, height: u32) -> Result<Vec<u8>, PixelError> {
    let pixels = (width * height) as usize;
    let expected = pixels * 2;
    if buf.len() < expected {
        return Err(PixelError::InvalidLength {
            expected,
            actual: buf.len(),
        });
    }
    let mut gray = Vec::with_capacity(pixels);
    for idx in 0..pixels {
        let value = u16::from_le_bytes([buf[idx * 2], buf[idx * 2 + 1]]);
        gray.push((value >> 8) as u8);
    }
    Ok(gray)
}

#[derive(Debug, thiserror::Error)]
pub enum PixelError {
    #[error("invalid buffer length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}
