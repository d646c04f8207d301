//! Exposure, frame-rate and gain reconciliation.
//!
//! Requests outside what the device accepts are clamped, never rejected.
//! Each setter returns the value read back from the device after the write,
//! since firmware may round it further.

use tracing::debug;

use crate::traits::{CameraDevice, CameraError, FloatNode, IntNode, Result};

/// Microseconds in one second; a rate of `f` Hz has a period of `US_PER_SECOND / f`.
pub const US_PER_SECOND: f64 = 1e6;

/// Lowest gain the device class can meaningfully apply.
pub const UNITY_GAIN: f64 = 1.0;

/// Frame period in microseconds for a rate in hertz.
#[must_use]
pub fn frame_period_us(fps: f64) -> f64 {
    US_PER_SECOND / fps
}

/// Current exposure time in microseconds.
pub fn exposure<D: CameraDevice + ?Sized>(device: &D) -> Result<f64> {
    device.float_value(FloatNode::ExposureTime)
}

/// Current frame rate in hertz.
pub fn frame_rate<D: CameraDevice + ?Sized>(device: &D) -> Result<f64> {
    device.float_value(FloatNode::AcquisitionFrameRate)
}

/// Current gain.
pub fn gain<D: CameraDevice + ?Sized>(device: &D) -> Result<f64> {
    device.float_value(FloatNode::Gain)
}

/// Sensor resolution as `(width, height)`.
pub fn resolution<D: CameraDevice + ?Sized>(device: &D) -> Result<(u64, u64)> {
    Ok((
        device.int_value(IntNode::Width)?,
        device.int_value(IntNode::Height)?,
    ))
}

fn require_number(what: &str, value: f64) -> Result<()> {
    if value.is_nan() {
        return Err(CameraError::InvalidArgument(format!("{what} must be a number")));
    }
    Ok(())
}

/// Apply an exposure time clamped into the device's range.
pub fn set_exposure<D: CameraDevice + ?Sized>(device: &mut D, requested_us: f64) -> Result<f64> {
    require_number("exposure", requested_us)?;
    let range = device.float_range(FloatNode::ExposureTime)?;
    let target = range.clamp(requested_us);
    if (target - requested_us).abs() > f64::EPSILON {
        debug!(requested_us, target, ?range, "exposure clamped");
    }
    device.set_float_value(FloatNode::ExposureTime, target)?;
    exposure(device)
}

/// Apply a frame rate, shortening the exposure first if it no longer fits.
///
/// The rate is clamped into `[0, max]` (or the device minimum when that is
/// positive). Before the rate is written, an exposure longer than the
/// requested frame period is cut to that period. A request below the
/// device minimum uses the clamped rate's period instead, so the device
/// never sees an exposure longer than the period it runs at.
pub fn set_frame_rate<D: CameraDevice + ?Sized>(device: &mut D, requested_fps: f64) -> Result<f64> {
    require_number("frame rate", requested_fps)?;
    let range = device.float_range(FloatNode::AcquisitionFrameRate)?;
    let high = range.max.max(0.0);
    let target = requested_fps.clamp(range.min.clamp(0.0, high), high);
    if (target - requested_fps).abs() > f64::EPSILON {
        debug!(requested_fps, target, ?range, "frame rate clamped");
    }

    let fitted_fps = if requested_fps > 0.0 {
        requested_fps.max(target)
    } else {
        target
    };
    if fitted_fps > 0.0 {
        let period = frame_period_us(fitted_fps);
        let current = exposure(device)?;
        if current > period {
            debug!(current, period, "exposure exceeds frame period, shortening");
            set_exposure(device, period)?;
        }
    }

    device.set_float_value(FloatNode::AcquisitionFrameRate, target)?;
    frame_rate(device)
}

/// Apply the highest frame rate the current exposure allows.
pub fn set_max_frame_rate<D: CameraDevice + ?Sized>(device: &mut D) -> Result<f64> {
    let range = device.float_range(FloatNode::AcquisitionFrameRate)?;
    let current = exposure(device)?;
    let target = range.max.min(frame_period_us(current));
    debug!(exposure_us = current, target, "setting maximum frame rate");
    device.set_float_value(FloatNode::AcquisitionFrameRate, target)?;
    frame_rate(device)
}

/// Apply a gain floored at unity.
pub fn set_gain<D: CameraDevice + ?Sized>(device: &mut D, requested: f64) -> Result<f64> {
    require_number("gain", requested)?;
    let range = device.float_range(FloatNode::Gain)?;
    let target = requested.max(UNITY_GAIN).min(range.max.max(UNITY_GAIN));
    if (target - requested).abs() > f64::EPSILON {
        debug!(requested, target, "gain clamped");
    }
    device.set_float_value(FloatNode::Gain, target)?;
    gain(device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulated::{SimulatedBackend, SimulatedConfig, SimulatedDevice};
    use crate::traits::{CameraBackend, NodeRange};

    fn device(config: SimulatedConfig) -> SimulatedDevice {
        SimulatedBackend::new(vec![config]).open(0).expect("open failed")
    }

    fn default_device() -> SimulatedDevice {
        device(
            SimulatedConfig::builder()
                .exposure_range(NodeRange::new(10.0, 2_000_000.0))
                .frame_rate_range(NodeRange::new(0.5, 200.0))
                .gain_range(NodeRange::new(1.0, 16.0))
                .build(),
        )
    }

    #[test]
    fn test_set_exposure_clamps_into_range() {
        let mut dev = default_device();
        for requested in [-5.0, 0.0, 1.0, 9.99, 3e6, f64::INFINITY, f64::NEG_INFINITY] {
            let applied = set_exposure(&mut dev, requested).expect("set_exposure failed");
            assert!(
                (10.0..=2_000_000.0).contains(&applied),
                "requested {requested} applied {applied}"
            );
        }
    }

    #[test]
    fn test_set_exposure_returns_read_back_value() {
        let mut dev = device(
            SimulatedConfig::builder()
                .exposure_range(NodeRange::new(10.0, 1_000_000.0))
                .exposure_increment(10.0)
                .build(),
        );
        let applied = set_exposure(&mut dev, 1234.0).expect("set_exposure failed");
        assert!((applied - 1230.0).abs() < 1e-9);
        assert!((exposure(&dev).expect("exposure") - applied).abs() < 1e-9);
    }

    #[test]
    fn test_set_exposure_rejects_nan() {
        let mut dev = default_device();
        assert!(matches!(
            set_exposure(&mut dev, f64::NAN),
            Err(CameraError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_set_frame_rate_keeps_exposure_within_period() {
        for requested in [0.5, 1.0, 3.3, 25.0, 100.0, 199.0, 500.0, 1e9] {
            let mut dev = default_device();
            set_exposure(&mut dev, 1_500_000.0).expect("set_exposure failed");
            let applied = set_frame_rate(&mut dev, requested).expect("set_frame_rate failed");
            let current = exposure(&dev).expect("exposure");
            assert!(
                current <= frame_period_us(applied) + 1e-6,
                "fps {applied} exposure {current}"
            );
        }
    }

    #[test]
    fn test_set_frame_rate_clamps_to_max() {
        let mut dev = default_device();
        let applied = set_frame_rate(&mut dev, 10_000.0).expect("set_frame_rate failed");
        assert!((applied - 200.0).abs() < 1e-9);
    }

    #[test]
    fn test_set_frame_rate_above_max_fits_exposure_to_requested_period() {
        let mut dev = default_device();
        set_exposure(&mut dev, 10_000.0).expect("set_exposure failed");
        let applied = set_frame_rate(&mut dev, 1000.0).expect("set_frame_rate failed");
        assert!((applied - 200.0).abs() < 1e-9);
        assert!((exposure(&dev).expect("exposure") - 1000.0).abs() < 1e-9);
    }

    #[test]
    fn test_set_frame_rate_below_minimum_keeps_invariant() {
        let mut dev = default_device();
        set_exposure(&mut dev, 1_900_000.0).expect("set_exposure failed");
        let applied = set_frame_rate(&mut dev, 0.1).expect("set_frame_rate failed");
        assert!((applied - 0.5).abs() < 1e-9);
        assert!(exposure(&dev).expect("exposure") <= frame_period_us(applied));
    }

    #[test]
    fn test_set_frame_rate_leaves_short_exposure_alone() {
        let mut dev = default_device();
        set_exposure(&mut dev, 1000.0).expect("set_exposure failed");
        set_frame_rate(&mut dev, 50.0).expect("set_frame_rate failed");
        assert!((exposure(&dev).expect("exposure") - 1000.0).abs() < 1e-9);
    }

    #[test]
    fn test_set_max_frame_rate() {
        let mut dev = default_device();

        set_exposure(&mut dev, 20_000.0).expect("set_exposure failed");
        let applied = set_max_frame_rate(&mut dev).expect("set_max_frame_rate failed");
        assert!((applied - 50.0).abs() < 1e-9);

        set_exposure(&mut dev, 100.0).expect("set_exposure failed");
        let applied = set_max_frame_rate(&mut dev).expect("set_max_frame_rate failed");
        assert!((applied - 200.0).abs() < 1e-9);
    }

    #[test]
    fn test_set_gain_floors_at_unity() {
        let mut dev = default_device();
        for requested in [-3.0, 0.0, 0.5, 1.0] {
            let applied = set_gain(&mut dev, requested).expect("set_gain failed");
            assert!((applied - 1.0).abs() < 1e-9, "requested {requested}");
        }
        let applied = set_gain(&mut dev, 4.5).expect("set_gain failed");
        assert!((applied - 4.5).abs() < 1e-9);
        let applied = set_gain(&mut dev, 100.0).expect("set_gain failed");
        assert!((applied - 16.0).abs() < 1e-9);
    }

    #[test]
    fn test_resolution() {
        let dev = device(SimulatedConfig::builder().resolution(320, 240).build());
        assert_eq!(resolution(&dev).expect("resolution"), (320, 240));
    }
}
