//! Capture persistence: 16-bit PNG, raw `f32` array and the JSON metadata sidecar.
//!
//! A capture saved at `dir/run_042.png` produces:
//! - `dir/run_042.png`, the (optionally reference-normalized) image,
//! - `dir/run_042.npy`, the unscaled `f32` samples,
//! - an entry `"run_042.png"` in `dir/run.json`.

pub mod npy;

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use image::{ImageBuffer, ImageFormat, Luma, Rgb};
use ndarray::{Array3, ArrayD, Axis};
use serde::{Deserialize, Serialize};
use serde_json::ser::PrettyFormatter;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::frame::{crop, Frame, Roi};
use crate::traits::{CameraError, Result};

/// Scale applied to reference-normalized samples before they are written as PNG.
pub const REFERENCE_CEILING: f32 = 16384.0;

/// Position and size of a region, as recorded in the sidecar.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegionRecord {
    /// Region centre `(x, y)`.
    pub center: (f64, f64),
    /// Region size `(width, height)`.
    pub size: (u32, u32),
}

impl From<&Roi> for RegionRecord {
    fn from(roi: &Roi) -> Self {
        Self {
            center: roi.center(),
            size: roi.size(),
        }
    }
}

/// Per-capture sidecar entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureRecord {
    /// Mean of the saved raw array.
    pub mean: f64,
    /// Maximum of the saved raw array.
    pub max: f64,
    /// Minimum of the saved raw array.
    pub min: f64,
    /// Centre of the main ROI, if one was applied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub center: Option<(f64, f64)>,
    /// Size of the main ROI, if one was applied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<(u32, u32)>,
    /// Reference region used for normalization.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ref_roi: Option<RegionRecord>,
}

/// Paths written by [`save`] and the statistics recorded for the capture.
#[derive(Debug, Clone, PartialEq)]
pub struct SavedCapture {
    /// PNG image.
    pub image_path: PathBuf,
    /// Raw `f32` array.
    pub raw_path: PathBuf,
    /// Sidecar that received the record; `None` when metadata could not be written.
    pub metadata_path: Option<PathBuf>,
    /// The recorded statistics.
    pub record: CaptureRecord,
}

/// Raw array path for an image path: same stem, `.npy` extension.
#[must_use]
pub fn raw_path(image_path: &Path) -> PathBuf {
    image_path.with_extension("npy")
}

/// Sidecar path for an image path: `<dir>/<name up to the first '_'>.json`.
pub fn metadata_path(image_path: &Path) -> Result<PathBuf> {
    let name = image_path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| {
            CameraError::InvalidArgument(format!("{} has no file name", image_path.display()))
        })?;
    let prefix = name.split('_').next().unwrap_or_default();
    if prefix.is_empty() {
        return Err(CameraError::InvalidArgument(format!(
            "{name} has an empty batch prefix"
        )));
    }
    let dir = image_path.parent().unwrap_or_else(|| Path::new(""));
    Ok(dir.join(format!("{prefix}.json")))
}

/// Insert `record` under `key` in the sidecar at `path`, keeping all other entries.
pub fn merge_metadata(path: &Path, key: &str, record: &CaptureRecord) -> Result<()> {
    let mut document: Map<String, Value> = if path.is_file() {
        serde_json::from_str(&fs::read_to_string(path)?)?
    } else {
        Map::new()
    };
    document.insert(key.to_owned(), serde_json::to_value(record)?);

    let mut out = Vec::new();
    let mut ser =
        serde_json::Serializer::with_formatter(&mut out, PrettyFormatter::with_indent(b"    "));
    document.serialize(&mut ser)?;

    let mut file = fs::File::create(path)?;
    file.write_all(&out)?;
    Ok(())
}

fn mean(samples: &Array3<u16>) -> f64 {
    if samples.is_empty() {
        return f64::NAN;
    }
    samples.iter().map(|&v| f64::from(v)).sum::<f64>() / samples.len() as f64
}

fn statistics(values: &Array3<f32>) -> (f64, f64, f64) {
    let (sum, min, max) = values.iter().fold(
        (0.0f64, f64::INFINITY, f64::NEG_INFINITY),
        |(sum, min, max), &v| {
            let v = f64::from(v);
            (sum + v, min.min(v), max.max(v))
        },
    );
    (sum / values.len() as f64, min, max)
}

/// Drop the channel axis of single-channel arrays so mono captures are stored as `(h, w)`.
fn raw_layout(values: Array3<f32>) -> ArrayD<f32> {
    if values.dim().2 == 1 {
        values.index_axis_move(Axis(2), 0).into_dyn()
    } else {
        values.into_dyn()
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn write_png(path: &Path, values: &Array3<f32>, scale: f32) -> Result<()> {
    let (height, width, channels) = values.dim();
    let samples: Vec<u16> = values.iter().map(|&v| (v * scale) as u16).collect();
    let too_large = || CameraError::InvalidArgument(format!("{width}x{height} frame too large"));
    let width = u32::try_from(width).map_err(|_| too_large())?;
    let height = u32::try_from(height).map_err(|_| too_large())?;
    let mismatch = || CameraError::InvalidArgument("sample count does not match frame".to_owned());

    if channels == 3 {
        ImageBuffer::<Rgb<u16>, _>::from_raw(width, height, samples)
            .ok_or_else(mismatch)?
            .save_with_format(path, ImageFormat::Png)?;
    } else {
        ImageBuffer::<Luma<u16>, _>::from_raw(width, height, samples)
            .ok_or_else(mismatch)?
            .save_with_format(path, ImageFormat::Png)?;
    }
    Ok(())
}

/// Save a capture.
///
/// The frame is cropped to `main_roi` when given. With a `reference_roi`,
/// samples are divided by the mean over that region of the uncropped
/// frame; the PNG is additionally scaled by [`REFERENCE_CEILING`], the raw
/// array is not. Existing files are overwritten. A sidecar that cannot be
/// written is logged and leaves `metadata_path` empty.
pub fn save(
    frame: &Frame,
    path: &Path,
    main_roi: Option<&Roi>,
    reference_roi: Option<&Roi>,
) -> Result<SavedCapture> {
    let cropped = match main_roi {
        Some(roi) => crop(frame, roi)?,
        None => frame.clone(),
    };
    if cropped.is_empty() {
        return Err(CameraError::InvalidArgument("cannot save an empty frame".to_owned()));
    }

    let mut values = cropped.pixels.mapv(f32::from);
    let mut scale = 1.0;
    if let Some(roi) = reference_roi {
        let reference = match crop(frame, roi) {
            Ok(region) => mean(&region.pixels),
            Err(err) => {
                debug!(%err, "reference region has no samples");
                f64::NAN
            }
        };
        if reference.is_finite() && reference > 0.0 {
            #[allow(clippy::cast_possible_truncation)]
            let reference = reference as f32;
            values.mapv_inplace(|v| v / reference);
            scale = REFERENCE_CEILING;
        } else {
            warn!(reference, ?roi, "reference region mean unusable, saving unnormalized");
        }
    }

    write_png(path, &values, scale)?;
    let raw = raw_path(path);
    let (mean, min, max) = statistics(&values);
    npy::write(&raw, &raw_layout(values))?;

    let record = CaptureRecord {
        mean,
        max,
        min,
        center: main_roi.map(Roi::center),
        size: main_roi.map(Roi::size),
        ref_roi: reference_roi.map(RegionRecord::from),
    };

    let metadata = metadata_path(path).and_then(|meta| {
        let key = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or_default();
        merge_metadata(&meta, key, &record)?;
        Ok(meta)
    });
    let metadata_path = match metadata {
        Ok(meta) => Some(meta),
        Err(err) => {
            warn!(path = %path.display(), %err, "capture metadata not written");
            None
        }
    };

    debug!(image = %path.display(), raw = %raw.display(), mean, min, max, "capture saved");
    Ok(SavedCapture {
        image_path: path.to_path_buf(),
        raw_path: raw,
        metadata_path,
        record,
    })
}

/// Load the raw array saved beside an image, or a `.npy` path directly.
pub fn load_raw(path: &Path) -> Result<ArrayD<f32>> {
    npy::read(&raw_path(path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    fn ramp(height: usize, width: usize, channels: usize) -> Frame {
        let samples = (0..height * width * channels)
            .map(|v| u16::try_from(v * 3 + 1).expect("sample fits"))
            .collect();
        Frame::from_samples(height, width, channels, samples, 12).expect("frame")
    }

    fn solid(height: usize, width: usize, value: u16) -> Frame {
        Frame::new(Array3::from_elem((height, width, 1), value), 12)
    }

    #[test]
    fn test_paths() {
        let path = Path::new("/data/run_001_a.png");
        assert_eq!(raw_path(path), PathBuf::from("/data/run_001_a.npy"));
        assert_eq!(metadata_path(path).expect("meta"), PathBuf::from("/data/run.json"));
        assert_eq!(
            metadata_path(Path::new("single.png")).expect("meta"),
            PathBuf::from("single.png.json")
        );
        assert!(metadata_path(Path::new("/data/_x.png")).is_err());
    }

    #[test]
    fn test_raw_round_trip_without_reference() {
        let dir = tempfile::tempdir().expect("tempdir");
        let frame = ramp(6, 8, 1);
        let roi = Roi::new(2, 1, 4, 3);
        let path = dir.path().join("shot_1.png");

        let saved = save(&frame, &path, Some(&roi), None).expect("save");
        let raw = load_raw(&saved.image_path).expect("load");

        let expected = crop(&frame, &roi).expect("crop");
        assert_eq!(raw.shape(), &[3, 4]);
        for ((row, col), value) in raw
            .into_dimensionality::<ndarray::Ix2>()
            .expect("2d")
            .indexed_iter()
        {
            assert_eq!(*value, f32::from(expected.pixels[[row, col, 0]]));
        }
        assert!(saved.image_path.is_file());
    }

    #[test]
    fn test_rgb_raw_keeps_channel_axis() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("rgb_1.png");
        save(&ramp(4, 5, 3), &path, None, None).expect("save");
        assert_eq!(load_raw(&path).expect("load").shape(), &[4, 5, 3]);
    }

    #[test]
    fn test_png_is_sixteen_bit() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("deep_1.png");
        save(&solid(3, 3, 4000), &path, None, None).expect("save");

        let decoded = image::open(&path).expect("open").into_luma16();
        assert_eq!(decoded.dimensions(), (3, 3));
        assert!(decoded.pixels().all(|p| p.0[0] == 4000));
    }

    #[test]
    fn test_reference_normalization() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut frame = solid(4, 4, 100);
        frame.pixels[[0, 0, 0]] = 200;
        let reference = Roi::new(2, 2, 2, 2);
        let path = dir.path().join("norm_1.png");

        let saved = save(&frame, &path, None, Some(&reference)).expect("save");

        let raw = load_raw(&path).expect("load");
        assert!((raw[[0, 0]] - 2.0).abs() < 1e-6);
        assert!((raw[[3, 3]] - 1.0).abs() < 1e-6);

        let decoded = image::open(&path).expect("open").into_luma16();
        assert_eq!(decoded.get_pixel(0, 0).0[0], 32768);
        assert_eq!(decoded.get_pixel(3, 3).0[0], 16384);

        let region = saved.record.ref_roi.expect("ref_roi recorded");
        assert_eq!(region.center, (3.0, 3.0));
        assert_eq!(region.size, (2, 2));
    }

    #[test]
    fn test_zero_reference_mean_skips_scaling() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut frame = solid(4, 4, 50);
        for row in 0..2 {
            for col in 0..2 {
                frame.pixels[[row, col, 0]] = 0;
            }
        }
        let path = dir.path().join("dark_1.png");

        save(&frame, &path, None, Some(&Roi::new(0, 0, 2, 2))).expect("save");
        let raw = load_raw(&path).expect("load");
        assert!(raw.iter().all(|v| v.is_finite()));
        assert!((raw[[3, 3]] - 50.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_reference_outside_frame_still_saves() {
        let dir = tempfile::tempdir().expect("tempdir");
        let frame = solid(4, 4, 70);
        let path = dir.path().join("edge_1.png");
        let reference = Roi::new(40, 40, 2, 2);

        let saved = save(&frame, &path, None, Some(&reference)).expect("save");
        assert!(saved.image_path.is_file());
        assert_eq!(saved.record.ref_roi.map(|r| r.size), Some((2, 2)));
        let raw = load_raw(&path).expect("load");
        assert!((raw[[0, 0]] - 70.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_sidecar_merges_entries() {
        let dir = tempfile::tempdir().expect("tempdir");
        let frame = ramp(4, 4, 1);

        save(&frame, &dir.path().join("batch_a.png"), None, None).expect("save a");
        let roi = Roi::new(0, 0, 2, 2);
        let saved = save(&frame, &dir.path().join("batch_b.png"), Some(&roi), None).expect("save b");

        let meta = saved.metadata_path.expect("metadata written");
        assert_eq!(meta, dir.path().join("batch.json"));
        let document: Map<String, Value> =
            serde_json::from_str(&fs::read_to_string(&meta).expect("read")).expect("parse");
        assert_eq!(document.len(), 2);

        let a: CaptureRecord =
            serde_json::from_value(document["batch_a.png"].clone()).expect("record a");
        assert_eq!(a.center, None);
        assert!((a.min - 1.0).abs() < f64::EPSILON);
        assert!((a.max - 46.0).abs() < f64::EPSILON);

        let b: CaptureRecord =
            serde_json::from_value(document["batch_b.png"].clone()).expect("record b");
        assert_eq!(b.center, Some((1.0, 1.0)));
        assert_eq!(b.size, Some((2, 2)));
    }

    #[test]
    fn test_sidecar_rewrite_replaces_only_that_entry() {
        let dir = tempfile::tempdir().expect("tempdir");
        let a = dir.path().join("twice_a.png");
        save(&solid(2, 2, 10), &a, None, None).expect("a");
        save(&solid(2, 2, 30), &dir.path().join("twice_b.png"), None, None).expect("b");
        let saved = save(&solid(2, 2, 20), &a, None, None).expect("a again");

        let text = fs::read_to_string(saved.metadata_path.expect("meta")).expect("read");
        let document: Map<String, Value> = serde_json::from_str(&text).expect("parse");
        assert_eq!(document.len(), 2);
        assert_eq!(document["twice_a.png"]["mean"], 20.0);
        assert_eq!(document["twice_b.png"]["mean"], 30.0);
    }

    #[test]
    fn test_sidecar_keeps_foreign_entries() {
        let dir = tempfile::tempdir().expect("tempdir");
        let meta = dir.path().join("keep.json");
        fs::write(&meta, r#"{"note": {"operator": "bench 3"}}"#).expect("seed");

        save(&ramp(2, 2, 1), &dir.path().join("keep_1.png"), None, None).expect("save");

        let text = fs::read_to_string(&meta).expect("read");
        let document: Map<String, Value> = serde_json::from_str(&text).expect("parse");
        assert_eq!(document["note"]["operator"], "bench 3");
        assert!(document.contains_key("keep_1.png"));
        assert!(text.contains("\n    \""));
    }

    #[test]
    fn test_metadata_failure_is_swallowed() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("broken.json"), "not json").expect("seed");

        let saved = save(&ramp(2, 2, 1), &dir.path().join("broken_1.png"), None, None)
            .expect("capture still saved");
        assert_eq!(saved.metadata_path, None);
        assert!(saved.raw_path.is_file());
    }

    #[test]
    fn test_save_overwrites() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("over_1.png");
        save(&solid(2, 2, 10), &path, None, None).expect("first");
        save(&solid(3, 3, 20), &path, None, None).expect("second");

        let raw = load_raw(&path).expect("load");
        assert_eq!(raw.shape(), &[3, 3]);
        assert!(raw.iter().all(|&v| (v - 20.0).abs() < f32::EPSILON));
    }
}
