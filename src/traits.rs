//! Core traits and types for the camera device boundary.

use std::time::Duration;

use thiserror::Error;

use crate::format::PixelFormat;
use crate::frame::Frame;

/// Identity of an enumerated camera.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Model name reported by the device.
    pub model_name: String,
    /// Serial number reported by the device.
    pub serial_number: String,
    /// Whether the sensor has no colour filter array.
    pub monochrome: bool,
}

/// Floating-point parameters exposed by a device node map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FloatNode {
    /// Analog gain, unity at 1.0.
    Gain,
    /// Exposure time in microseconds.
    ExposureTime,
    /// Frame rate in hertz.
    AcquisitionFrameRate,
}

impl FloatNode {
    /// Node-map name of the parameter.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Gain => "Gain",
            Self::ExposureTime => "ExposureTime",
            Self::AcquisitionFrameRate => "AcquisitionFrameRate",
        }
    }
}

/// Integer parameters exposed by a device node map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntNode {
    /// Sensor width in pixels.
    Width,
    /// Sensor height in pixels.
    Height,
    /// Size in bytes of one delivered buffer.
    PayloadSize,
}

impl IntNode {
    /// Node-map name of the parameter.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Width => "Width",
            Self::Height => "Height",
            Self::PayloadSize => "PayloadSize",
        }
    }
}

/// Inclusive range a device accepts for a parameter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NodeRange {
    /// Smallest accepted value.
    pub min: f64,
    /// Largest accepted value.
    pub max: f64,
}

impl NodeRange {
    /// Create a range; bounds are swapped if given in the wrong order.
    #[must_use]
    pub fn new(min: f64, max: f64) -> Self {
        if min <= max {
            Self { min, max }
        } else {
            Self { min: max, max: min }
        }
    }

    /// Clamp `value` into the range.
    #[must_use]
    pub fn clamp(&self, value: f64) -> f64 {
        value.clamp(self.min, self.max)
    }

    /// Whether `value` lies inside the range.
    #[must_use]
    pub fn contains(&self, value: f64) -> bool {
        (self.min..=self.max).contains(&value)
    }
}

/// Error type for camera operations.
#[derive(Debug, Error)]
pub enum CameraError {
    /// No device exists at the given index.
    #[error("Device {0} not found")]
    NotFound(usize),
    /// The resource exists but cannot be used right now.
    #[error("Not available: {0}")]
    NotAvailable(String),
    /// The device rejected the requested pixel format.
    #[error("Pixel format {requested} not supported (device accepts {accepted:?})")]
    UnsupportedFormat {
        /// Format that was rejected.
        requested: PixelFormat,
        /// Formats the device reported as accepted.
        accepted: Vec<PixelFormat>,
    },
    /// The operation is not valid in the current acquisition state.
    #[error("Not ready: {0}")]
    NotReady(String),
    /// A request was outside what this layer supports.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    /// No buffer was delivered within the wait timeout.
    #[error("Timed out after {0:?} waiting for a frame")]
    Timeout(Duration),
    /// Failure reported by the device layer.
    #[error("Device error: {0}")]
    Device(String),
    /// Raw array artifact could not be written or read.
    #[error("Raw array error: {0}")]
    Npy(String),
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Image encoding or decoding error.
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
    /// Metadata serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for camera operations.
pub type Result<T> = std::result::Result<T, CameraError>;

/// Enumeration and opening of cameras.
pub trait CameraBackend {
    /// The handle type returned by `open`.
    type Device: CameraDevice;

    /// List the cameras currently attached.
    fn devices(&self) -> Result<Vec<DeviceInfo>>;

    /// Open the camera at `index` for control.
    ///
    /// Fails with `NotFound` for an unknown index and `NotAvailable` when the
    /// camera is already in use.
    fn open(&self, index: usize) -> Result<Self::Device>;
}

/// Node map and data stream of one opened camera.
pub trait CameraDevice {
    /// Identity of the opened camera.
    fn info(&self) -> &DeviceInfo;

    /// Read a floating-point parameter.
    fn float_value(&self, node: FloatNode) -> Result<f64>;

    /// Write a floating-point parameter. The device may round the value.
    fn set_float_value(&mut self, node: FloatNode, value: f64) -> Result<()>;

    /// Range the device currently accepts for a floating-point parameter.
    fn float_range(&self, node: FloatNode) -> Result<NodeRange>;

    /// Read an integer parameter.
    fn int_value(&self, node: IntNode) -> Result<u64>;

    /// Load the default parameter bank. Devices without one return `NotAvailable`.
    fn load_default_user_set(&mut self) -> Result<()>;

    /// Program the sensor-native pixel format.
    fn set_pixel_format(&mut self, format: PixelFormat) -> Result<()>;

    /// Formats the device accepts for `set_pixel_format`.
    fn supported_pixel_formats(&mut self) -> Result<Vec<PixelFormat>>;

    /// Open the data stream. Fails with `NotAvailable` if the device has none.
    fn open_stream(&mut self) -> Result<()>;

    /// Minimum number of buffers the stream needs announced.
    fn min_buffer_count(&self) -> Result<u32>;

    /// Allocate, announce and queue `count` buffers of `payload_size` bytes.
    fn announce_buffers(&mut self, count: u32, payload_size: u64) -> Result<()>;

    /// Lock or unlock transport-layer parameters.
    fn set_params_locked(&mut self, locked: bool) -> Result<()>;

    /// Start acquisition, returning once the device has confirmed it.
    fn start_acquisition(&mut self) -> Result<()>;

    /// Stop acquisition.
    fn stop_acquisition(&mut self) -> Result<()>;

    /// Interrupt a pending `wait_for_frame`.
    fn kill_wait(&mut self) -> Result<()>;

    /// Discard every buffer currently in flight.
    fn flush(&mut self) -> Result<()>;

    /// Wait for the next finished buffer, convert it to `output` and requeue it.
    fn wait_for_frame(&mut self, timeout: Duration, output: PixelFormat) -> Result<Frame>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_range_orders_bounds() {
        let range = NodeRange::new(10.0, 2.0);
        assert!((range.min - 2.0).abs() < f64::EPSILON);
        assert!((range.max - 10.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_node_range_clamp() {
        let range = NodeRange::new(10.0, 1000.0);
        assert!((range.clamp(1.0) - 10.0).abs() < f64::EPSILON);
        assert!((range.clamp(5000.0) - 1000.0).abs() < f64::EPSILON);
        assert!((range.clamp(42.0) - 42.0).abs() < f64::EPSILON);
        assert!(range.contains(10.0));
        assert!(!range.contains(1000.5));
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(CameraError::NotFound(3).to_string(), "Device 3 not found");
        let err = CameraError::UnsupportedFormat {
            requested: PixelFormat::Mono12,
            accepted: vec![PixelFormat::Mono8],
        };
        assert!(err.to_string().contains("Mono12"));
    }
}
