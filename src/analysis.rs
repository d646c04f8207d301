//! Picture analysis utilities.
//!
//! This module inspects captured or saved frames: per-channel statistics,
//! the bit depth actually used by the samples, squeezing a 16-bit container
//! down to its significant bits, and histogram density. A sparse histogram
//! (only every 16th level occupied, say) shows that the low bits of a
//! 16-bit picture carry no data.

use std::fmt;
use std::path::Path;

use ndarray::{ArrayView2, Axis};

use crate::frame::Frame;
use crate::traits::{CameraError, Result};

/// Width of the container every frame is stored in.
const CONTAINER_BITS: u8 = 16;

/// Minimum, maximum and mean of one channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelStats {
    /// Smallest sample.
    pub min: u16,
    /// Largest sample.
    pub max: u16,
    /// Arithmetic mean.
    pub mean: f64,
}

impl ChannelStats {
    fn of<'a, I: Iterator<Item = &'a u16>>(samples: I) -> Option<Self> {
        let (count, sum, min, max) = samples.fold(
            (0usize, 0f64, u16::MAX, u16::MIN),
            |(count, sum, min, max), &v| (count + 1, sum + f64::from(v), min.min(v), max.max(v)),
        );
        (count > 0).then(|| Self {
            min,
            max,
            mean: sum / count as f64,
        })
    }
}

/// Summary of a frame.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameStats {
    /// `(height, width, channels)`.
    pub shape: (usize, usize, usize),
    /// Statistics over all samples.
    pub overall: ChannelStats,
    /// Statistics per channel, in channel order.
    pub channels: Vec<ChannelStats>,
    /// Bit depth inferred from the largest sample.
    pub inferred_bits: u8,
}

impl FrameStats {
    /// Compute statistics for `frame`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the frame holds no samples.
    pub fn of(frame: &Frame) -> Result<Self> {
        let empty = || CameraError::InvalidArgument("frame holds no samples".to_owned());
        let overall = ChannelStats::of(frame.pixels.iter()).ok_or_else(empty)?;
        let channels = frame
            .pixels
            .axis_iter(Axis(2))
            .map(|plane| ChannelStats::of(plane.iter()).ok_or_else(empty))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            shape: frame.pixels.dim(),
            overall,
            channels,
            inferred_bits: inferred_bit_depth(overall.max),
        })
    }
}

impl fmt::Display for FrameStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (height, width, channels) = self.shape;
        writeln!(
            f,
            "shape = {height}x{width}x{channels} ; min = {} ; max = {} ; mean = {:.2}",
            self.overall.min, self.overall.max, self.overall.mean
        )?;
        writeln!(f, "inferred bit depth = {}", self.inferred_bits)?;
        for (index, channel) in self.channels.iter().enumerate() {
            writeln!(
                f,
                "channel {index}: min = {} ; max = {} ; mean = {:.2}",
                channel.min, channel.max, channel.mean
            )?;
        }
        Ok(())
    }
}

/// Bit depth suggested by the largest sample: `round(log2(max))`.
///
/// A 12-bit picture stored left-aligned in 16 bits reports 16; after
/// [`squeeze`] it reports 12. An all-zero picture reports 0.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn inferred_bit_depth(max: u16) -> u8 {
    if max == 0 {
        return 0;
    }
    f64::from(max).log2().round() as u8
}

/// Divide every sample by `2^(16 - bit_depth)`, mapping a left-aligned
/// 16-bit container onto `bit_depth` significant bits.
pub fn squeeze(frame: &Frame, bit_depth: u8) -> Result<Frame> {
    if !(1..=CONTAINER_BITS).contains(&bit_depth) {
        return Err(CameraError::InvalidArgument(format!(
            "cannot squeeze to {bit_depth} bits"
        )));
    }
    let shift = CONTAINER_BITS - bit_depth;
    let mut out = Frame::new(frame.pixels.mapv(|v| v >> shift), bit_depth);
    out.metadata = frame.metadata;
    Ok(out)
}

/// Sample counts per level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Histogram {
    /// `counts[v]` is the number of samples equal to `v`; levels past the end are folded into the last bin.
    pub counts: Vec<u64>,
}

impl Histogram {
    /// Histogram of one channel with `2^bit_depth` bins.
    pub fn of_channel(frame: &Frame, channel: usize, bit_depth: u8) -> Result<Self> {
        if bit_depth == 0 || bit_depth > CONTAINER_BITS {
            return Err(CameraError::InvalidArgument(format!(
                "no histogram for {bit_depth} bits"
            )));
        }
        if channel >= frame.channels() {
            return Err(CameraError::InvalidArgument(format!(
                "channel {channel} out of range for {} channels",
                frame.channels()
            )));
        }
        let plane: ArrayView2<'_, u16> = frame.pixels.index_axis(Axis(2), channel);
        let mut counts = vec![0u64; 1usize << bit_depth];
        let last = counts.len() - 1;
        for &value in &plane {
            if let Some(bin) = counts.get_mut(usize::from(value).min(last)) {
                *bin += 1;
            }
        }
        Ok(Self { counts })
    }

    /// Fraction of levels between the lowest and highest occupied level that are occupied.
    ///
    /// Close to 1 for a dense histogram; `1 / 2^k` when the lowest `k`
    /// bits are always zero. Zero for an empty histogram.
    #[must_use]
    pub fn density(&self) -> f64 {
        let occupied: Vec<usize> = self
            .counts
            .iter()
            .enumerate()
            .filter(|(_, &count)| count > 0)
            .map(|(level, _)| level)
            .collect();
        match (occupied.first(), occupied.last()) {
            (Some(first), Some(last)) => occupied.len() as f64 / (last - first + 1) as f64,
            _ => 0.0,
        }
    }
}

/// Checks that frame sequence numbers increment by exactly one.
///
/// # Errors
///
/// Returns `InvalidArgument` if `frames` is empty or a gap is found.
pub fn validate_frame_sequence(frames: &[Frame]) -> Result<()> {
    if frames.is_empty() {
        return Err(CameraError::InvalidArgument(
            "Cannot validate empty frame sequence".to_owned(),
        ));
    }
    for (index, pair) in frames.windows(2).enumerate() {
        if let [prev, curr] = pair {
            let expected = prev.metadata.sequence + 1;
            if curr.metadata.sequence != expected {
                return Err(CameraError::InvalidArgument(format!(
                    "Frame sequence gap at index {}: expected {expected}, got {}",
                    index + 1,
                    curr.metadata.sequence
                )));
            }
        }
    }
    Ok(())
}

/// Load a PNG into a frame.
///
/// Grey pictures become single-channel frames; alpha channels are dropped.
pub fn load_png(path: &Path) -> Result<Frame> {
    let picture = image::open(path)?;
    let color = picture.color();
    let depth = u8::try_from(color.bits_per_pixel() / u16::from(color.channel_count()))
        .unwrap_or(CONTAINER_BITS);

    let (width, height, channels, samples) = if color.has_color() {
        let rgb = picture.into_rgb16();
        let (width, height) = rgb.dimensions();
        (width, height, 3, rgb.into_raw())
    } else {
        let gray = picture.into_luma16();
        let (width, height) = gray.dimensions();
        (width, height, 1, gray.into_raw())
    };
    let samples = if depth <= 8 {
        // into_*16 expands 8-bit samples to 16 bits
        samples.into_iter().map(|v| v >> 8).collect()
    } else {
        samples
    };
    Frame::from_samples(
        height as usize,
        width as usize,
        channels,
        samples,
        depth.min(CONTAINER_BITS),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    fn frame(height: usize, width: usize, channels: usize, samples: Vec<u16>) -> Frame {
        Frame::from_samples(height, width, channels, samples, 16).expect("frame")
    }

    #[test]
    fn test_stats_per_channel() {
        let frame = frame(1, 2, 3, vec![1, 10, 100, 3, 30, 300]);
        let stats = FrameStats::of(&frame).expect("stats");

        assert_eq!(stats.shape, (1, 2, 3));
        assert_eq!(stats.overall.min, 1);
        assert_eq!(stats.overall.max, 300);
        assert_eq!(stats.channels.len(), 3);
        assert_eq!((stats.channels[1].min, stats.channels[1].max), (10, 30));
        assert!((stats.channels[2].mean - 200.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_stats_empty_frame() {
        let frame = Frame::new(Array3::zeros((0, 4, 1)), 8);
        assert!(FrameStats::of(&frame).is_err());
    }

    #[test]
    fn test_inferred_bit_depth() {
        assert_eq!(inferred_bit_depth(0), 0);
        assert_eq!(inferred_bit_depth(255), 8);
        assert_eq!(inferred_bit_depth(4095), 12);
        assert_eq!(inferred_bit_depth(65_520), 16);
    }

    #[test]
    fn test_squeeze_left_aligned_twelve_bit() {
        let left_aligned = frame(1, 3, 1, vec![0, 16 * 1000, 16 * 4095]);
        let squeezed = squeeze(&left_aligned, 12).expect("squeeze");

        assert_eq!(squeezed.significant_bits, 12);
        assert_eq!(squeezed.pixels.iter().copied().collect::<Vec<_>>(), vec![0, 1000, 4095]);
        assert!(squeeze(&left_aligned, 0).is_err());
        assert!(squeeze(&left_aligned, 17).is_err());
    }

    #[test]
    fn test_histogram_density_detects_sparse_low_bits() {
        let sparse = frame(1, 64, 1, (0..64).map(|v| v * 16).collect());
        let histogram = Histogram::of_channel(&sparse, 0, 16).expect("histogram");
        assert!((histogram.density() - 1.0 / 16.0).abs() < 1e-3);

        let dense = squeeze(&sparse, 12).expect("squeeze");
        let histogram = Histogram::of_channel(&dense, 0, 12).expect("histogram");
        assert!((histogram.density() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_histogram_folds_out_of_range_levels() {
        let frame = frame(1, 2, 1, vec![3, 1000]);
        let histogram = Histogram::of_channel(&frame, 0, 8).expect("histogram");
        assert_eq!(histogram.counts.len(), 256);
        assert_eq!(histogram.counts[255], 1);
        assert!(Histogram::of_channel(&frame, 1, 8).is_err());
    }

    #[test]
    fn test_validate_frame_sequence() {
        let with_sequence = |sequence| {
            let mut f = frame(1, 1, 1, vec![0]);
            f.metadata.sequence = sequence;
            f
        };
        let frames: Vec<Frame> = (4..9).map(with_sequence).collect();
        assert!(validate_frame_sequence(&frames).is_ok());

        let gap = vec![with_sequence(1), with_sequence(2), with_sequence(4)];
        assert!(validate_frame_sequence(&gap).is_err());
        assert!(validate_frame_sequence(&[]).is_err());
    }

    #[test]
    fn test_load_png_gray16() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("g.png");
        image::ImageBuffer::<image::Luma<u16>, _>::from_raw(2, 1, vec![100u16, 40_000])
            .expect("buffer")
            .save(&path)
            .expect("save");

        let loaded = load_png(&path).expect("load");
        assert_eq!((loaded.height(), loaded.width(), loaded.channels()), (1, 2, 1));
        assert_eq!(loaded.significant_bits, 16);
        assert_eq!(loaded.pixels[[0, 1, 0]], 40_000);
    }

    #[test]
    fn test_load_png_rgb8() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("c.png");
        image::RgbImage::from_raw(1, 1, vec![10, 20, 30])
            .expect("buffer")
            .save(&path)
            .expect("save");

        let loaded = load_png(&path).expect("load");
        assert_eq!(loaded.channels(), 3);
        assert_eq!(loaded.significant_bits, 8);
        assert_eq!(loaded.pixels[[0, 0, 2]], 30);
    }
}
