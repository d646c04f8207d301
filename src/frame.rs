//! Captured frames, regions of interest and the capture post-processor.

use std::time::Duration;

use ndarray::{s, Array3, ArrayView3};
use serde::{Deserialize, Serialize};

use crate::traits::{CameraError, Result};

/// Wait applied to each buffer when no timeout is configured.
pub const DEFAULT_CAPTURE_TIMEOUT: Duration = Duration::from_millis(500);

/// Rectangular region in sensor pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roi {
    /// Left edge.
    pub x: u32,
    /// Top edge.
    pub y: u32,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl Roi {
    /// Create a region from its top-left corner and size.
    #[must_use]
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Centre of the region.
    #[must_use]
    pub fn center(&self) -> (f64, f64) {
        (
            f64::from(self.x) + f64::from(self.width) / 2.0,
            f64::from(self.y) + f64::from(self.height) / 2.0,
        )
    }

    /// Width and height of the region.
    #[must_use]
    pub const fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Row and column ranges of the region, clipped to a `height`×`width` frame.
    #[must_use]
    pub fn clip(&self, height: usize, width: usize) -> (std::ops::Range<usize>, std::ops::Range<usize>) {
        let span = |start: u32, len: u32, limit: usize| {
            let start = (start as usize).min(limit);
            let end = start.saturating_add(len as usize).min(limit);
            start..end
        };
        (
            span(self.y, self.height, height),
            span(self.x, self.width, width),
        )
    }
}

/// Metadata for a captured frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameMetadata {
    /// Frame sequence number.
    pub sequence: u64,
    /// Capture timestamp.
    pub timestamp: Duration,
}

/// A captured frame: `height × width × channels` samples in a 16-bit container.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Sample data indexed as `[row, column, channel]`.
    pub pixels: Array3<u16>,
    /// Number of low bits that carry data.
    pub significant_bits: u8,
    /// Frame metadata.
    pub metadata: FrameMetadata,
}

impl Frame {
    /// Wrap a sample array.
    #[must_use]
    pub fn new(pixels: Array3<u16>, significant_bits: u8) -> Self {
        Self {
            pixels,
            significant_bits,
            metadata: FrameMetadata::default(),
        }
    }

    /// Build a frame from row-major interleaved samples.
    pub fn from_samples(
        height: usize,
        width: usize,
        channels: usize,
        samples: Vec<u16>,
        significant_bits: u8,
    ) -> Result<Self> {
        let pixels = Array3::from_shape_vec((height, width, channels), samples).map_err(|err| {
            CameraError::InvalidArgument(format!(
                "samples do not fill a {height}x{width}x{channels} frame: {err}"
            ))
        })?;
        Ok(Self::new(pixels, significant_bits))
    }

    /// Attach capture metadata.
    #[must_use]
    pub const fn with_metadata(mut self, metadata: FrameMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Rows in the frame.
    #[must_use]
    pub fn height(&self) -> usize {
        self.pixels.dim().0
    }

    /// Columns in the frame.
    #[must_use]
    pub fn width(&self) -> usize {
        self.pixels.dim().1
    }

    /// Samples per pixel (1 or 3).
    #[must_use]
    pub fn channels(&self) -> usize {
        self.pixels.dim().2
    }

    /// Whether the frame holds no samples.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pixels.is_empty()
    }

    fn derive(&self, pixels: ArrayView3<'_, u16>) -> Self {
        Self {
            pixels: pixels.to_owned(),
            significant_bits: self.significant_bits,
            metadata: self.metadata,
        }
    }
}

/// Per-capture options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureOptions {
    /// Keep every n-th pixel along both axes.
    pub binning: usize,
    /// Crop to the session's main ROI when one is set.
    pub use_roi: bool,
    /// Reduce samples to 8 significant bits.
    pub force_8bit: bool,
    /// Maximum wait for a finished buffer.
    pub timeout: Duration,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            binning: 1,
            use_roi: false,
            force_8bit: false,
            timeout: DEFAULT_CAPTURE_TIMEOUT,
        }
    }
}

/// Keep every `factor`-th pixel along both axes.
pub fn bin(frame: &Frame, factor: usize) -> Result<Frame> {
    if factor == 0 {
        return Err(CameraError::InvalidArgument(
            "binning factor must be at least 1".to_owned(),
        ));
    }
    if factor == 1 {
        return Ok(frame.clone());
    }
    let step = isize::try_from(factor)
        .map_err(|_| CameraError::InvalidArgument(format!("binning factor {factor} too large")))?;
    Ok(frame.derive(frame.pixels.slice(s![..;step, ..;step, ..])))
}

/// Reverse the row order.
#[must_use]
pub fn flip_vertical(frame: &Frame) -> Frame {
    frame.derive(frame.pixels.slice(s![..;-1, .., ..]))
}

/// Crop to `roi`, clipped to the frame bounds.
///
/// Fails with `InvalidArgument` if nothing of the region lies inside the frame.
pub fn crop(frame: &Frame, roi: &Roi) -> Result<Frame> {
    let (rows, cols) = roi.clip(frame.height(), frame.width());
    if rows.is_empty() || cols.is_empty() {
        return Err(CameraError::InvalidArgument(format!(
            "{roi:?} lies outside the {}x{} frame",
            frame.width(),
            frame.height()
        )));
    }
    Ok(frame.derive(frame.pixels.slice(s![rows, cols, ..])))
}

/// Shift samples down to 8 significant bits.
#[must_use]
pub fn reduce_to_8bit(frame: &Frame) -> Frame {
    let shift = frame.significant_bits.saturating_sub(8);
    Frame {
        pixels: frame.pixels.mapv(|value| value >> shift),
        significant_bits: 8,
        metadata: frame.metadata,
    }
}

/// Bin, flip into display row order, then crop to `roi` if requested.
pub fn postprocess(frame: &Frame, options: &CaptureOptions, roi: Option<&Roi>) -> Result<Frame> {
    let binned = bin(frame, options.binning)?;
    let mut out = flip_vertical(&binned);
    if let Some(roi) = roi.filter(|_| options.use_roi) {
        out = crop(&out, roi)?;
    }
    if options.force_8bit {
        out = reduce_to_8bit(&out);
    }
    Ok(out)
}
