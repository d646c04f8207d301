//! Capture source selection: real hardware or the simulated camera.

use std::time::Duration;

use tracing::{info, warn};

use crate::device::{V4L2Backend, V4L2Device};
use crate::format::PixelFormat;
use crate::frame::Frame;
use crate::simulated::{SimulatedBackend, SimulatedDevice};
use crate::traits::{
    CameraBackend, CameraDevice, DeviceInfo, FloatNode, IntNode, NodeRange, Result,
};

/// Backend chosen when the camera layer is constructed.
#[derive(Debug, Clone)]
pub enum CaptureSource {
    /// Physical cameras through V4L2.
    Hardware(V4L2Backend),
    /// Synthetic cameras.
    Simulated(SimulatedBackend),
}

impl CaptureSource {
    /// Use hardware when at least one camera is attached, else the simulated camera.
    #[must_use]
    pub fn detect() -> Self {
        let hardware = V4L2Backend::new();
        match hardware.devices() {
            Ok(devices) if !devices.is_empty() => {
                info!(count = devices.len(), "using hardware cameras");
                Self::Hardware(hardware)
            }
            Ok(_) => {
                warn!("no camera found, falling back to the simulated camera");
                Self::Simulated(SimulatedBackend::default())
            }
            Err(err) => {
                warn!(%err, "camera enumeration failed, falling back to the simulated camera");
                Self::Simulated(SimulatedBackend::default())
            }
        }
    }

    /// Whether frames are synthetic.
    #[must_use]
    pub const fn is_simulated(&self) -> bool {
        matches!(self, Self::Simulated(_))
    }
}

impl From<V4L2Backend> for CaptureSource {
    fn from(backend: V4L2Backend) -> Self {
        Self::Hardware(backend)
    }
}

impl From<SimulatedBackend> for CaptureSource {
    fn from(backend: SimulatedBackend) -> Self {
        Self::Simulated(backend)
    }
}

/// A device opened from a [`CaptureSource`].
#[derive(Debug)]
pub enum SourceDevice {
    /// Physical camera.
    Hardware(V4L2Device),
    /// Synthetic camera.
    Simulated(SimulatedDevice),
}

impl CameraBackend for CaptureSource {
    type Device = SourceDevice;

    fn devices(&self) -> Result<Vec<DeviceInfo>> {
        match self {
            Self::Hardware(backend) => backend.devices(),
            Self::Simulated(backend) => backend.devices(),
        }
    }

    fn open(&self, index: usize) -> Result<SourceDevice> {
        match self {
            Self::Hardware(backend) => backend.open(index).map(SourceDevice::Hardware),
            Self::Simulated(backend) => backend.open(index).map(SourceDevice::Simulated),
        }
    }
}

macro_rules! dispatch {
    ($self:ident, $device:ident => $call:expr) => {
        match $self {
            SourceDevice::Hardware($device) => $call,
            SourceDevice::Simulated($device) => $call,
        }
    };
}

impl CameraDevice for SourceDevice {
    fn info(&self) -> &DeviceInfo {
        dispatch!(self, device => device.info())
    }

    fn float_value(&self, node: FloatNode) -> Result<f64> {
        dispatch!(self, device => device.float_value(node))
    }

    fn set_float_value(&mut self, node: FloatNode, value: f64) -> Result<()> {
        dispatch!(self, device => device.set_float_value(node, value))
    }

    fn float_range(&self, node: FloatNode) -> Result<NodeRange> {
        dispatch!(self, device => device.float_range(node))
    }

    fn int_value(&self, node: IntNode) -> Result<u64> {
        dispatch!(self, device => device.int_value(node))
    }

    fn load_default_user_set(&mut self) -> Result<()> {
        dispatch!(self, device => device.load_default_user_set())
    }

    fn set_pixel_format(&mut self, format: PixelFormat) -> Result<()> {
        dispatch!(self, device => device.set_pixel_format(format))
    }

    fn supported_pixel_formats(&mut self) -> Result<Vec<PixelFormat>> {
        dispatch!(self, device => device.supported_pixel_formats())
    }

    fn open_stream(&mut self) -> Result<()> {
        dispatch!(self, device => device.open_stream())
    }

    fn min_buffer_count(&self) -> Result<u32> {
        dispatch!(self, device => device.min_buffer_count())
    }

    fn announce_buffers(&mut self, count: u32, payload_size: u64) -> Result<()> {
        dispatch!(self, device => device.announce_buffers(count, payload_size))
    }

    fn set_params_locked(&mut self, locked: bool) -> Result<()> {
        dispatch!(self, device => device.set_params_locked(locked))
    }

    fn start_acquisition(&mut self) -> Result<()> {
        dispatch!(self, device => device.start_acquisition())
    }

    fn stop_acquisition(&mut self) -> Result<()> {
        dispatch!(self, device => device.stop_acquisition())
    }

    fn kill_wait(&mut self) -> Result<()> {
        dispatch!(self, device => device.kill_wait())
    }

    fn flush(&mut self) -> Result<()> {
        dispatch!(self, device => device.flush())
    }

    fn wait_for_frame(&mut self, timeout: Duration, output: PixelFormat) -> Result<Frame> {
        dispatch!(self, device => device.wait_for_frame(timeout, output))
    }
}
