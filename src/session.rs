//! Acquisition sequencing.
//!
//! A [`Session`] walks one camera through
//! `Idle → DeviceSelected → StreamConfigured → Acquiring → Stopped` and only
//! issues device operations that are valid in the current state. [`Camera`]
//! owns a backend and remembers the pixel format chosen for each index.

use std::collections::HashMap;
use std::fmt;

use tracing::{debug, info, warn};

use crate::format::{self, Colorness, PixelFormat, ResolvedFormat};
use crate::frame::{self, CaptureOptions, Frame, Roi};
use crate::reconcile;
use crate::traits::{
    CameraBackend, CameraDevice, CameraError, DeviceInfo, IntNode, Result,
};

/// Bit depth used when no format was chosen for a device.
pub const DEFAULT_BIT_DEPTH: u8 = 8;

/// Where a session is in the acquisition lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionState {
    /// No device bound.
    Idle,
    /// Device opened, stream not yet set up.
    DeviceSelected,
    /// Stream open with buffers queued.
    StreamConfigured,
    /// Frames are being delivered; parameters are locked.
    Acquiring,
    /// Acquisition stopped; may be restarted.
    Stopped,
}

impl fmt::Display for AcquisitionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Steps of the stop sequence, in the order they run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopStep {
    /// Stop acquisition on the device and stream.
    StopAcquisition,
    /// Interrupt any pending buffer wait.
    KillWait,
    /// Discard in-flight buffers.
    Flush,
    /// Unlock transport-layer parameters.
    UnlockParams,
}

impl StopStep {
    const SEQUENCE: [Self; 4] = [
        Self::StopAcquisition,
        Self::KillWait,
        Self::Flush,
        Self::UnlockParams,
    ];

    fn run<D: CameraDevice + ?Sized>(self, device: &mut D) -> Result<()> {
        match self {
            Self::StopAcquisition => device.stop_acquisition(),
            Self::KillWait => device.kill_wait(),
            Self::Flush => device.flush(),
            Self::UnlockParams => device.set_params_locked(false),
        }
    }
}

/// Failures collected while releasing a session.
#[derive(Debug, Default)]
pub struct ReleaseReport {
    /// Each step that failed with its error.
    pub failures: Vec<(StopStep, CameraError)>,
}

impl ReleaseReport {
    /// Whether every step succeeded.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// One camera's acquisition session.
pub struct Session<D: CameraDevice> {
    index: Option<usize>,
    device: Option<D>,
    format: ResolvedFormat,
    state: AcquisitionState,
    roi: Option<Roi>,
    reference_roi: Option<Roi>,
}

impl<D: CameraDevice> fmt::Debug for Session<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("index", &self.index)
            .field("format", &self.format)
            .field("state", &self.state)
            .field("roi", &self.roi)
            .field("reference_roi", &self.reference_roi)
            .finish_non_exhaustive()
    }
}

impl<D: CameraDevice> Session<D> {
    /// Create an idle session that will capture with `format`.
    #[must_use]
    pub const fn new(format: ResolvedFormat) -> Self {
        Self {
            index: None,
            device: None,
            format,
            state: AcquisitionState::Idle,
            roi: None,
            reference_roi: None,
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> AcquisitionState {
        self.state
    }

    /// Index of the bound device.
    #[must_use]
    pub const fn device_index(&self) -> Option<usize> {
        self.index
    }

    /// Identity of the bound device.
    #[must_use]
    pub fn device_info(&self) -> Option<&DeviceInfo> {
        self.device.as_ref().map(CameraDevice::info)
    }

    /// Formats this session captures with.
    #[must_use]
    pub const fn format(&self) -> ResolvedFormat {
        self.format
    }

    /// Main region of interest.
    #[must_use]
    pub const fn roi(&self) -> Option<Roi> {
        self.roi
    }

    /// Reference region used to normalise saved frames.
    #[must_use]
    pub const fn reference_roi(&self) -> Option<Roi> {
        self.reference_roi
    }

    /// Replace the main region of interest.
    pub fn set_roi(&mut self, roi: Roi) {
        self.roi = Some(roi);
    }

    /// Replace the reference region.
    pub fn set_reference_roi(&mut self, roi: Roi) {
        self.reference_roi = Some(roi);
    }

    /// Forget both regions.
    pub fn clear_roi(&mut self) {
        self.roi = None;
        self.reference_roi = None;
    }

    fn not_ready(&self, operation: &str) -> CameraError {
        CameraError::NotReady(format!("cannot {operation} while {}", self.state))
    }

    fn device_mut(&mut self, operation: &str) -> Result<&mut D> {
        let state = self.state;
        self.device
            .as_mut()
            .ok_or_else(|| CameraError::NotReady(format!("cannot {operation} while {state}")))
    }

    fn device_ref(&self, operation: &str) -> Result<&D> {
        self.device.as_ref().ok_or_else(|| self.not_ready(operation))
    }

    /// Device for a parameter write; refused while parameters are locked.
    fn configurable_device(&mut self, operation: &str) -> Result<&mut D> {
        if self.state == AcquisitionState::Acquiring {
            return Err(self.not_ready(operation));
        }
        self.device_mut(operation)
    }

    /// Bind the camera at `index`.
    pub fn select<B>(&mut self, backend: &B, index: usize) -> Result<()>
    where
        B: CameraBackend<Device = D>,
    {
        if self.state != AcquisitionState::Idle {
            return Err(self.not_ready("select a device"));
        }
        let device = backend.open(index)?;
        info!(
            index,
            model = %device.info().model_name,
            serial = %device.info().serial_number,
            "device selected"
        );
        self.device = Some(device);
        self.index = Some(index);
        self.state = AcquisitionState::DeviceSelected;
        Ok(())
    }

    /// Open the data stream, apply the pixel format and queue buffers.
    pub fn configure_stream(&mut self) -> Result<()> {
        if self.state != AcquisitionState::DeviceSelected {
            return Err(self.not_ready("configure the stream"));
        }
        let internal = self.format.internal;
        let device = self.device_mut("configure the stream")?;

        device.open_stream()?;

        if let Err(err) = device.load_default_user_set() {
            debug!(%err, "default user set not loaded");
        }

        match device.set_pixel_format(internal) {
            Ok(()) => {}
            Err(CameraError::UnsupportedFormat { requested, .. }) => {
                let accepted = device.supported_pixel_formats().unwrap_or_default();
                warn!(%requested, ?accepted, "pixel format rejected by device");
                return Err(CameraError::UnsupportedFormat {
                    requested,
                    accepted,
                });
            }
            Err(err) => return Err(err),
        }

        let payload_size = device.int_value(IntNode::PayloadSize)?;
        let count = device.min_buffer_count()?;
        device.announce_buffers(count, payload_size)?;
        debug!(count, payload_size, %internal, "stream configured");

        self.state = AcquisitionState::StreamConfigured;
        Ok(())
    }

    /// Lock parameters and start acquisition.
    pub fn start(&mut self) -> Result<()> {
        if !matches!(
            self.state,
            AcquisitionState::StreamConfigured | AcquisitionState::Stopped
        ) {
            return Err(self.not_ready("start acquisition"));
        }
        let device = self.device_mut("start acquisition")?;
        device.set_params_locked(true)?;
        if let Err(err) = device.start_acquisition() {
            if let Err(unlock) = device.set_params_locked(false) {
                warn!(%unlock, "failed to unlock parameters after start failure");
            }
            return Err(err);
        }
        info!(index = ?self.index, "acquisition started");
        self.state = AcquisitionState::Acquiring;
        Ok(())
    }

    /// Stop acquisition, interrupt pending waits, flush the stream and unlock parameters.
    pub fn stop(&mut self) -> Result<()> {
        if self.state != AcquisitionState::Acquiring {
            return Err(self.not_ready("stop acquisition"));
        }
        let device = self.device_mut("stop acquisition")?;
        for step in StopStep::SEQUENCE {
            step.run(device)?;
        }
        info!(index = ?self.index, "acquisition stopped");
        self.state = AcquisitionState::Stopped;
        Ok(())
    }

    /// Wait for the next frame and post-process it.
    pub fn capture(&mut self, options: &CaptureOptions) -> Result<Frame> {
        if self.state != AcquisitionState::Acquiring {
            return Err(self.not_ready("capture"));
        }
        let external = self.format.external;
        let roi = self.roi;
        let device = self.device_mut("capture")?;
        let raw = device.wait_for_frame(options.timeout, external)?;
        frame::postprocess(&raw, options, roi.as_ref())
    }

    /// Stop if needed and unbind the device.
    ///
    /// Every stop step runs even if an earlier one fails; failures are
    /// logged and returned in the report instead of propagated.
    pub fn release(&mut self) -> ReleaseReport {
        let mut report = ReleaseReport::default();
        let Some(mut device) = self.device.take() else {
            self.state = AcquisitionState::Idle;
            return report;
        };

        if self.state == AcquisitionState::Acquiring {
            for step in StopStep::SEQUENCE {
                if let Err(err) = step.run(&mut device) {
                    warn!(?step, %err, "release step failed");
                    report.failures.push((step, err));
                }
            }
        }

        drop(device);
        info!(index = ?self.index, "device released");
        self.index = None;
        self.state = AcquisitionState::Idle;
        report
    }

    /// Current exposure in microseconds.
    pub fn exposure(&self) -> Result<f64> {
        reconcile::exposure(self.device_ref("read exposure")?)
    }

    /// Current frame rate in hertz.
    pub fn frame_rate(&self) -> Result<f64> {
        reconcile::frame_rate(self.device_ref("read frame rate")?)
    }

    /// Current gain.
    pub fn gain(&self) -> Result<f64> {
        reconcile::gain(self.device_ref("read gain")?)
    }

    /// Sensor resolution as `(width, height)`.
    pub fn resolution(&self) -> Result<(u64, u64)> {
        reconcile::resolution(self.device_ref("read resolution")?)
    }

    /// Formats the bound device accepts.
    pub fn supported_formats(&mut self) -> Result<Vec<PixelFormat>> {
        self.device_mut("list pixel formats")?
            .supported_pixel_formats()
    }

    /// See [`reconcile::set_exposure`].
    pub fn set_exposure(&mut self, requested_us: f64) -> Result<f64> {
        reconcile::set_exposure(self.configurable_device("set exposure")?, requested_us)
    }

    /// See [`reconcile::set_frame_rate`].
    pub fn set_frame_rate(&mut self, requested_fps: f64) -> Result<f64> {
        reconcile::set_frame_rate(self.configurable_device("set frame rate")?, requested_fps)
    }

    /// See [`reconcile::set_max_frame_rate`].
    pub fn set_max_frame_rate(&mut self) -> Result<f64> {
        reconcile::set_max_frame_rate(self.configurable_device("set frame rate")?)
    }

    /// See [`reconcile::set_gain`].
    pub fn set_gain(&mut self, requested: f64) -> Result<f64> {
        reconcile::set_gain(self.configurable_device("set gain")?, requested)
    }
}

impl<D: CameraDevice> Drop for Session<D> {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

/// A camera backend plus the pixel format chosen for each device index.
#[derive(Debug)]
pub struct Camera<B: CameraBackend> {
    backend: B,
    formats: HashMap<usize, ResolvedFormat>,
}

impl<B: CameraBackend> Camera<B> {
    /// Wrap a backend.
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            formats: HashMap::new(),
        }
    }

    /// Cameras currently attached.
    pub fn devices(&self) -> Result<Vec<DeviceInfo>> {
        self.backend.devices()
    }

    fn device_info(&self, index: usize) -> Result<DeviceInfo> {
        self.backend
            .devices()?
            .into_iter()
            .nth(index)
            .ok_or(CameraError::NotFound(index))
    }

    /// Resolve and record the formats later sessions on `index` capture with.
    pub fn set_pixel_format(
        &mut self,
        index: usize,
        bit_depth: u8,
        colorness: Option<Colorness>,
    ) -> Result<ResolvedFormat> {
        let info = self.device_info(index)?;
        let resolved = format::resolve(bit_depth, colorness, info.monochrome)?;
        self.formats.insert(index, resolved);
        Ok(resolved)
    }

    /// Format recorded for `index`, if any.
    pub fn pixel_format(&self, index: usize) -> Option<ResolvedFormat> {
        self.formats.get(&index).copied()
    }

    /// Formats the device at `index` accepts as its sensor-native format.
    pub fn supported_formats(&self, index: usize) -> Result<Vec<PixelFormat>> {
        self.backend.open(index)?.supported_pixel_formats()
    }

    /// Select the device at `index` and configure its stream.
    ///
    /// Without a recorded format the session captures at
    /// [`DEFAULT_BIT_DEPTH`] in the sensor's native colorness.
    pub fn open_session(&self, index: usize) -> Result<Session<B::Device>> {
        let format = match self.pixel_format(index) {
            Some(format) => format,
            None => {
                let info = self.device_info(index)?;
                format::resolve(DEFAULT_BIT_DEPTH, None, info.monochrome)?
            }
        };
        let mut session = Session::new(format);
        session.select(&self.backend, index)?;
        session.configure_stream()?;
        Ok(session)
    }
}
