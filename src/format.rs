//! Pixel formats and the bit-depth/colorness resolver.

use std::fmt;
use std::str::FromStr;

use tracing::{debug, warn};

use crate::traits::{CameraError, Result};

/// Bit depths a capture can be configured for.
pub const SUPPORTED_BIT_DEPTHS: [u8; 3] = [8, 10, 12];

/// Sensor-native and converted pixel layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// 8-bit monochrome.
    Mono8,
    /// 10-bit monochrome in a 16-bit container.
    Mono10,
    /// 12-bit monochrome in a 16-bit container.
    Mono12,
    /// 8-bit RGGB Bayer mosaic.
    BayerRG8,
    /// 10-bit RGGB Bayer mosaic.
    BayerRG10,
    /// 12-bit RGGB Bayer mosaic.
    BayerRG12,
    /// 8-bit interleaved RGB.
    Rgb8,
    /// 10-bit interleaved RGB.
    Rgb10,
    /// 12-bit interleaved RGB.
    Rgb12,
}

impl PixelFormat {
    /// Every format known to the crate, in listing order.
    pub const ALL: [Self; 9] = [
        Self::Mono8,
        Self::Mono10,
        Self::Mono12,
        Self::BayerRG8,
        Self::BayerRG10,
        Self::BayerRG12,
        Self::Rgb8,
        Self::Rgb10,
        Self::Rgb12,
    ];

    /// Significant bits per sample.
    #[must_use]
    pub const fn bit_depth(self) -> u8 {
        match self {
            Self::Mono8 | Self::BayerRG8 | Self::Rgb8 => 8,
            Self::Mono10 | Self::BayerRG10 | Self::Rgb10 => 10,
            Self::Mono12 | Self::BayerRG12 | Self::Rgb12 => 12,
        }
    }

    /// Samples per pixel once the frame reaches the caller.
    #[must_use]
    pub const fn channels(self) -> usize {
        match self {
            Self::Rgb8 | Self::Rgb10 | Self::Rgb12 => 3,
            _ => 1,
        }
    }

    /// Whether this is a raw colour-filter-array layout.
    #[must_use]
    pub const fn is_bayer(self) -> bool {
        matches!(self, Self::BayerRG8 | Self::BayerRG10 | Self::BayerRG12)
    }

    /// Device node-map name of the format.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Mono8 => "Mono8",
            Self::Mono10 => "Mono10",
            Self::Mono12 => "Mono12",
            Self::BayerRG8 => "BayerRG8",
            Self::BayerRG10 => "BayerRG10",
            Self::BayerRG12 => "BayerRG12",
            Self::Rgb8 => "RGB8",
            Self::Rgb10 => "RGB10",
            Self::Rgb12 => "RGB12",
        }
    }

    const fn mono(bit_depth: u8) -> Option<Self> {
        match bit_depth {
            8 => Some(Self::Mono8),
            10 => Some(Self::Mono10),
            12 => Some(Self::Mono12),
            _ => None,
        }
    }

    const fn bayer(bit_depth: u8) -> Option<Self> {
        match bit_depth {
            8 => Some(Self::BayerRG8),
            10 => Some(Self::BayerRG10),
            12 => Some(Self::BayerRG12),
            _ => None,
        }
    }

    const fn rgb(bit_depth: u8) -> Option<Self> {
        match bit_depth {
            8 => Some(Self::Rgb8),
            10 => Some(Self::Rgb10),
            12 => Some(Self::Rgb12),
            _ => None,
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PixelFormat {
    type Err = CameraError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|format| format.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| CameraError::InvalidArgument(format!("unknown pixel format '{s}'")))
    }
}

/// Requested colour layout of captured frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, clap::ValueEnum)]
pub enum Colorness {
    /// Single-channel frames.
    Mono,
    /// Three-channel frames.
    Rgb,
}

impl Colorness {
    /// The colorness a sensor produces without conversion.
    #[must_use]
    pub const fn native(sensor_monochrome: bool) -> Self {
        if sensor_monochrome {
            Self::Mono
        } else {
            Self::Rgb
        }
    }
}

impl FromStr for Colorness {
    type Err = CameraError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "mono" => Ok(Self::Mono),
            "rgb" => Ok(Self::Rgb),
            _ => Err(CameraError::InvalidArgument(format!("unknown colorness '{s}'"))),
        }
    }
}

/// The pair of formats a session captures with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedFormat {
    /// Format the sensor is programmed to deliver.
    pub internal: PixelFormat,
    /// Format frames are converted to before they reach the caller.
    pub external: PixelFormat,
}

impl ResolvedFormat {
    /// Bit depth shared by both formats.
    #[must_use]
    pub const fn bit_depth(&self) -> u8 {
        self.external.bit_depth()
    }
}

/// Map a requested bit depth and colorness onto internal and external formats.
///
/// `colorness` defaults to what the sensor natively produces. A colorness
/// that does not match the sensor is logged but still resolved.
pub fn resolve(
    bit_depth: u8,
    colorness: Option<Colorness>,
    sensor_monochrome: bool,
) -> Result<ResolvedFormat> {
    let colorness = colorness.unwrap_or_else(|| Colorness::native(sensor_monochrome));
    if colorness != Colorness::native(sensor_monochrome) {
        warn!(
            ?colorness,
            sensor_monochrome, "requested colorness does not match the sensor type"
        );
    }

    let unsupported = || {
        CameraError::InvalidArgument(format!(
            "bit depth {bit_depth} not supported, expected one of {SUPPORTED_BIT_DEPTHS:?}"
        ))
    };

    let resolved = match colorness {
        Colorness::Mono => ResolvedFormat {
            internal: PixelFormat::mono(bit_depth).ok_or_else(unsupported)?,
            external: PixelFormat::mono(bit_depth).ok_or_else(unsupported)?,
        },
        Colorness::Rgb => ResolvedFormat {
            internal: PixelFormat::bayer(bit_depth).ok_or_else(unsupported)?,
            external: PixelFormat::rgb(bit_depth).ok_or_else(unsupported)?,
        },
    };

    debug!(internal = %resolved.internal, external = %resolved.external, "resolved pixel format");
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rgb_on_mono_sensor_resolves_to_bayer() {
        let resolved = resolve(12, Some(Colorness::Rgb), true).expect("resolve failed");
        assert_eq!(resolved.internal, PixelFormat::BayerRG12);
        assert_eq!(resolved.external, PixelFormat::Rgb12);
    }

    #[test]
    fn test_colorness_defaults_to_sensor() {
        let mono = resolve(8, None, true).expect("resolve failed");
        assert_eq!(mono.internal, PixelFormat::Mono8);
        assert_eq!(mono.external, PixelFormat::Mono8);

        let color = resolve(10, None, false).expect("resolve failed");
        assert_eq!(color.internal, PixelFormat::BayerRG10);
        assert_eq!(color.external, PixelFormat::Rgb10);
    }

    #[test]
    fn test_mono_on_color_sensor() {
        let resolved = resolve(12, Some(Colorness::Mono), false).expect("resolve failed");
        assert_eq!(resolved.internal, PixelFormat::Mono12);
        assert_eq!(resolved.bit_depth(), 12);
    }

    #[test]
    fn test_unsupported_bit_depth() {
        for depth in [0, 7, 9, 14, 16] {
            let result = resolve(depth, Some(Colorness::Mono), true);
            assert!(
                matches!(result, Err(CameraError::InvalidArgument(_))),
                "depth {depth} should be rejected"
            );
        }
    }

    #[test]
    fn test_format_names_round_trip_through_from_str() {
        for format in PixelFormat::ALL {
            let parsed: PixelFormat = format.name().parse().expect("parse failed");
            assert_eq!(parsed, format);
        }
        assert!("BGRa8".parse::<PixelFormat>().is_err());
    }

    #[test]
    fn test_format_properties() {
        assert_eq!(PixelFormat::Rgb10.channels(), 3);
        assert_eq!(PixelFormat::BayerRG12.channels(), 1);
        assert!(PixelFormat::BayerRG8.is_bayer());
        assert!(!PixelFormat::Mono8.is_bayer());
        assert_eq!(PixelFormat::Mono10.bit_depth(), 10);
    }
}
