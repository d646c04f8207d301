//! Simulated camera for running without hardware.
//!
//! The simulated backend stands in when no physical camera is attached and
//! doubles as the test device: its parameter ranges, accepted formats and
//! failure modes are all configurable.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::claims::{Claim, DeviceClaims};
use crate::format::PixelFormat;
use crate::frame::{Frame, FrameMetadata};
use crate::reconcile::frame_period_us;
use crate::session::StopStep;
use crate::traits::{
    CameraBackend, CameraDevice, CameraError, DeviceInfo, FloatNode, IntNode, NodeRange, Result,
};

/// Relative slack when checking an exposure against a frame period.
const PERIOD_TOLERANCE: f64 = 1e-9;

/// Test pattern types for simulated frame generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestPattern {
    /// Uniform random samples over the full bit depth.
    Noise,
    /// Horizontal gradient from zero to full scale.
    Gradient,
    /// Every sample set to the same value.
    Solid(u16),
}

/// Stop steps run on a simulated camera, in call order.
///
/// Clones share the same record, so a log handed to a configuration can
/// still be read after the device it was given to is dropped.
#[derive(Debug, Clone, Default)]
pub struct StopLog {
    steps: Arc<Mutex<Vec<StopStep>>>,
}

impl StopLog {
    /// Create an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Steps recorded so far.
    #[must_use]
    pub fn steps(&self) -> Vec<StopStep> {
        self.steps
            .lock()
            .map(|steps| steps.clone())
            .unwrap_or_default()
    }

    fn record(&self, step: StopStep) {
        if let Ok(mut steps) = self.steps.lock() {
            steps.push(step);
        }
    }
}

/// Behaviour of one simulated camera.
#[derive(Debug, Clone)]
pub struct SimulatedConfig {
    info: DeviceInfo,
    width: u32,
    height: u32,
    exposure_range: NodeRange,
    exposure_increment: f64,
    frame_rate_range: NodeRange,
    gain_range: NodeRange,
    default_exposure: f64,
    default_frame_rate: f64,
    accepted_formats: Vec<PixelFormat>,
    has_stream: bool,
    has_user_set: bool,
    min_buffers: u32,
    pattern: TestPattern,
    realtime: bool,
    seed: u64,
    failing_step: Option<StopStep>,
    stop_log: StopLog,
}

impl Default for SimulatedConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl SimulatedConfig {
    /// Start building a configuration.
    #[must_use]
    pub fn builder() -> SimulatedConfigBuilder {
        SimulatedConfigBuilder::default()
    }

    /// Identity the camera reports.
    #[must_use]
    pub const fn info(&self) -> &DeviceInfo {
        &self.info
    }
}

/// Builder for [`SimulatedConfig`].
#[derive(Debug, Default)]
pub struct SimulatedConfigBuilder {
    model_name: Option<String>,
    serial_number: Option<String>,
    monochrome: Option<bool>,
    resolution: Option<(u32, u32)>,
    exposure_range: Option<NodeRange>,
    exposure_increment: Option<f64>,
    frame_rate_range: Option<NodeRange>,
    gain_range: Option<NodeRange>,
    accepted_formats: Option<Vec<PixelFormat>>,
    has_stream: Option<bool>,
    has_user_set: Option<bool>,
    min_buffers: Option<u32>,
    pattern: Option<TestPattern>,
    realtime: Option<bool>,
    seed: Option<u64>,
    failing_step: Option<StopStep>,
    stop_log: Option<StopLog>,
}

impl SimulatedConfigBuilder {
    /// Model name and serial number.
    #[must_use]
    pub fn identity(mut self, model_name: &str, serial_number: &str) -> Self {
        self.model_name = Some(model_name.to_owned());
        self.serial_number = Some(serial_number.to_owned());
        self
    }

    /// Whether the sensor is monochrome.
    #[must_use]
    pub const fn monochrome(mut self, monochrome: bool) -> Self {
        self.monochrome = Some(monochrome);
        self
    }

    /// Sensor width and height.
    #[must_use]
    pub const fn resolution(mut self, width: u32, height: u32) -> Self {
        self.resolution = Some((width, height));
        self
    }

    /// Accepted exposure times in microseconds.
    #[must_use]
    pub const fn exposure_range(mut self, range: NodeRange) -> Self {
        self.exposure_range = Some(range);
        self
    }

    /// Granularity the firmware rounds exposure writes down to (0 disables).
    #[must_use]
    pub const fn exposure_increment(mut self, increment: f64) -> Self {
        self.exposure_increment = Some(increment);
        self
    }

    /// Accepted frame rates in hertz.
    #[must_use]
    pub const fn frame_rate_range(mut self, range: NodeRange) -> Self {
        self.frame_rate_range = Some(range);
        self
    }

    /// Accepted gains.
    #[must_use]
    pub const fn gain_range(mut self, range: NodeRange) -> Self {
        self.gain_range = Some(range);
        self
    }

    /// Pixel formats the sensor can be programmed with.
    #[must_use]
    pub fn accepted_formats(mut self, formats: Vec<PixelFormat>) -> Self {
        self.accepted_formats = Some(formats);
        self
    }

    /// Whether the camera exposes a data stream.
    #[must_use]
    pub const fn has_stream(mut self, has_stream: bool) -> Self {
        self.has_stream = Some(has_stream);
        self
    }

    /// Whether the camera has a default user set to load.
    #[must_use]
    pub const fn has_user_set(mut self, has_user_set: bool) -> Self {
        self.has_user_set = Some(has_user_set);
        self
    }

    /// Minimum number of buffers the stream requires.
    #[must_use]
    pub const fn min_buffers(mut self, count: u32) -> Self {
        self.min_buffers = Some(count);
        self
    }

    /// Pattern written into generated frames.
    #[must_use]
    pub const fn pattern(mut self, pattern: TestPattern) -> Self {
        self.pattern = Some(pattern);
        self
    }

    /// Pace frame delivery at the configured frame rate.
    #[must_use]
    pub const fn realtime(mut self, realtime: bool) -> Self {
        self.realtime = Some(realtime);
        self
    }

    /// Seed for the noise generator.
    #[must_use]
    pub const fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Make one stop step fail every time it runs.
    #[must_use]
    pub const fn failing_step(mut self, step: StopStep) -> Self {
        self.failing_step = Some(step);
        self
    }

    /// Record every stop step into `log`.
    #[must_use]
    pub fn stop_log(mut self, log: StopLog) -> Self {
        self.stop_log = Some(log);
        self
    }

    /// Finish the configuration.
    #[must_use]
    pub fn build(self) -> SimulatedConfig {
        let monochrome = self.monochrome.unwrap_or(true);
        let (width, height) = self.resolution.unwrap_or((100, 100));
        let exposure_range = self
            .exposure_range
            .unwrap_or_else(|| NodeRange::new(10.0, 1_000_000.0));
        let frame_rate_range = self
            .frame_rate_range
            .unwrap_or_else(|| NodeRange::new(1.0, 100.0));
        let accepted_formats = self.accepted_formats.unwrap_or_else(|| {
            if monochrome {
                vec![PixelFormat::Mono8, PixelFormat::Mono10, PixelFormat::Mono12]
            } else {
                PixelFormat::ALL
                    .into_iter()
                    .filter(|format| format.channels() == 1)
                    .collect()
            }
        });
        let default_frame_rate = frame_rate_range.clamp(25.0);
        let default_exposure = exposure_range.clamp(frame_period_us(default_frame_rate) / 4.0);

        SimulatedConfig {
            info: DeviceInfo {
                model_name: self.model_name.unwrap_or_else(|| "Simulated".to_owned()),
                serial_number: self.serial_number.unwrap_or_else(|| "-1".to_owned()),
                monochrome,
            },
            width,
            height,
            exposure_range,
            exposure_increment: self.exposure_increment.unwrap_or(0.0),
            frame_rate_range,
            gain_range: self.gain_range.unwrap_or_else(|| NodeRange::new(1.0, 8.0)),
            default_exposure,
            default_frame_rate,
            accepted_formats,
            has_stream: self.has_stream.unwrap_or(true),
            has_user_set: self.has_user_set.unwrap_or(true),
            min_buffers: self.min_buffers.unwrap_or(3),
            pattern: self.pattern.unwrap_or(TestPattern::Noise),
            realtime: self.realtime.unwrap_or(false),
            seed: self.seed.unwrap_or(0x5eed),
            failing_step: self.failing_step,
            stop_log: self.stop_log.unwrap_or_default(),
        }
    }
}

/// Backend serving a fixed set of simulated cameras.
#[derive(Debug, Clone)]
pub struct SimulatedBackend {
    cameras: Vec<SimulatedConfig>,
    claims: DeviceClaims,
}

impl Default for SimulatedBackend {
    fn default() -> Self {
        Self::new(vec![SimulatedConfig::default()])
    }
}

impl SimulatedBackend {
    /// Create a backend with one camera per configuration.
    #[must_use]
    pub fn new(cameras: Vec<SimulatedConfig>) -> Self {
        Self {
            cameras,
            claims: DeviceClaims::new(),
        }
    }
}

impl CameraBackend for SimulatedBackend {
    type Device = SimulatedDevice;

    fn devices(&self) -> Result<Vec<DeviceInfo>> {
        Ok(self.cameras.iter().map(|config| config.info.clone()).collect())
    }

    fn open(&self, index: usize) -> Result<SimulatedDevice> {
        let config = self.cameras.get(index).ok_or(CameraError::NotFound(index))?;
        let claim = self.claims.claim(index)?;
        debug!(index, model = %config.info.model_name, "opened simulated device");
        Ok(SimulatedDevice::new(config.clone(), claim))
    }
}

/// One opened simulated camera.
#[derive(Debug)]
pub struct SimulatedDevice {
    config: SimulatedConfig,
    _claim: Claim,
    exposure: f64,
    frame_rate: f64,
    gain: f64,
    pixel_format: PixelFormat,
    stream_open: bool,
    buffers: u32,
    locked: bool,
    acquiring: bool,
    sequence: u64,
    started: Option<Instant>,
    last_frame: Option<Instant>,
    rng: StdRng,
}

impl SimulatedDevice {
    fn new(config: SimulatedConfig, claim: Claim) -> Self {
        let pixel_format = config
            .accepted_formats
            .first()
            .copied()
            .unwrap_or(PixelFormat::Mono8);
        Self {
            exposure: config.default_exposure,
            frame_rate: config.default_frame_rate,
            gain: config.gain_range.min.max(1.0),
            rng: StdRng::seed_from_u64(config.seed),
            config,
            _claim: claim,
            pixel_format,
            stream_open: false,
            buffers: 0,
            locked: false,
            acquiring: false,
            sequence: 0,
            started: None,
            last_frame: None,
        }
    }

    /// Whether transport-layer parameters are currently locked.
    #[must_use]
    pub const fn params_locked(&self) -> bool {
        self.locked
    }

    /// Whether the device is acquiring.
    #[must_use]
    pub const fn is_acquiring(&self) -> bool {
        self.acquiring
    }

    /// Number of buffers currently announced.
    #[must_use]
    pub const fn announced_buffers(&self) -> u32 {
        self.buffers
    }

    /// Sensor-native format currently programmed.
    #[must_use]
    pub const fn pixel_format(&self) -> PixelFormat {
        self.pixel_format
    }

    fn stop_step(&self, step: StopStep) -> Result<()> {
        self.config.stop_log.record(step);
        if self.config.failing_step == Some(step) {
            return Err(CameraError::Device(format!("simulated {step:?} failure")));
        }
        Ok(())
    }

    fn out_of_range(node: FloatNode, value: f64, range: NodeRange) -> CameraError {
        CameraError::Device(format!(
            "{} value {value} outside [{}, {}]",
            node.name(),
            range.min,
            range.max
        ))
    }

    fn pace(&mut self) {
        if !self.config.realtime || self.frame_rate <= 0.0 {
            return;
        }
        let period = Duration::from_secs_f64(1.0 / self.frame_rate);
        if let Some(last) = self.last_frame {
            if let Some(remaining) = period.checked_sub(last.elapsed()) {
                thread::sleep(remaining);
            }
        }
    }

    fn generate(&mut self, output: PixelFormat) -> Result<Frame> {
        let width = self.config.width as usize;
        let height = self.config.height as usize;
        let channels = output.channels();
        let depth = output.bit_depth();
        let full_scale = (1u32 << depth) - 1;

        let pattern = self.config.pattern;
        let samples: Vec<u16> = match pattern {
            TestPattern::Noise => (0..height * width * channels)
                .map(|_| self.rng.gen_range(0..=full_scale))
                .map(|value| u16::try_from(value).unwrap_or(u16::MAX))
                .collect(),
            TestPattern::Gradient => {
                let span = width.saturating_sub(1).max(1);
                (0..height * width * channels)
                    .map(|i| {
                        let x = (i / channels) % width;
                        u16::try_from(x * full_scale as usize / span).unwrap_or(u16::MAX)
                    })
                    .collect()
            }
            TestPattern::Solid(value) => {
                let value = value.min(u16::try_from(full_scale).unwrap_or(u16::MAX));
                vec![value; height * width * channels]
            }
        };

        Frame::from_samples(height, width, channels, samples, depth)
    }
}

impl CameraDevice for SimulatedDevice {
    fn info(&self) -> &DeviceInfo {
        &self.config.info
    }

    fn float_value(&self, node: FloatNode) -> Result<f64> {
        Ok(match node {
            FloatNode::Gain => self.gain,
            FloatNode::ExposureTime => self.exposure,
            FloatNode::AcquisitionFrameRate => self.frame_rate,
        })
    }

    fn set_float_value(&mut self, node: FloatNode, value: f64) -> Result<()> {
        let range = self.float_range(node)?;
        if !range.contains(value) {
            return Err(Self::out_of_range(node, value, range));
        }
        match node {
            FloatNode::Gain => self.gain = value,
            FloatNode::ExposureTime => {
                let increment = self.config.exposure_increment;
                self.exposure = if increment > 0.0 {
                    ((value / increment).floor() * increment).max(range.min)
                } else {
                    value
                };
            }
            FloatNode::AcquisitionFrameRate => {
                let period = frame_period_us(value);
                if self.exposure > period * (1.0 + PERIOD_TOLERANCE) {
                    return Err(CameraError::Device(format!(
                        "frame rate {value} incompatible with exposure {}",
                        self.exposure
                    )));
                }
                self.frame_rate = value;
            }
        }
        Ok(())
    }

    fn float_range(&self, node: FloatNode) -> Result<NodeRange> {
        Ok(match node {
            FloatNode::Gain => self.config.gain_range,
            FloatNode::ExposureTime => self.config.exposure_range,
            FloatNode::AcquisitionFrameRate => self.config.frame_rate_range,
        })
    }

    fn int_value(&self, node: IntNode) -> Result<u64> {
        let width = u64::from(self.config.width);
        let height = u64::from(self.config.height);
        Ok(match node {
            IntNode::Width => width,
            IntNode::Height => height,
            IntNode::PayloadSize => {
                let bytes = if self.pixel_format.bit_depth() > 8 { 2 } else { 1 };
                width * height * bytes
            }
        })
    }

    fn load_default_user_set(&mut self) -> Result<()> {
        if !self.config.has_user_set {
            return Err(CameraError::NotAvailable("no default user set".to_owned()));
        }
        self.exposure = self.config.default_exposure;
        self.frame_rate = self.config.default_frame_rate;
        self.gain = self.config.gain_range.min.max(1.0);
        Ok(())
    }

    fn set_pixel_format(&mut self, format: PixelFormat) -> Result<()> {
        if self.locked {
            return Err(CameraError::Device(
                "PixelFormat is locked while parameters are locked".to_owned(),
            ));
        }
        if !self.config.accepted_formats.contains(&format) {
            return Err(CameraError::UnsupportedFormat {
                requested: format,
                accepted: self.config.accepted_formats.clone(),
            });
        }
        self.pixel_format = format;
        Ok(())
    }

    fn supported_pixel_formats(&mut self) -> Result<Vec<PixelFormat>> {
        Ok(self.config.accepted_formats.clone())
    }

    fn open_stream(&mut self) -> Result<()> {
        if !self.config.has_stream {
            return Err(CameraError::NotAvailable("device has no data stream".to_owned()));
        }
        self.stream_open = true;
        Ok(())
    }

    fn min_buffer_count(&self) -> Result<u32> {
        Ok(self.config.min_buffers)
    }

    fn announce_buffers(&mut self, count: u32, payload_size: u64) -> Result<()> {
        if !self.stream_open {
            return Err(CameraError::Device("data stream not open".to_owned()));
        }
        debug!(count, payload_size, "announcing simulated buffers");
        self.buffers = count;
        Ok(())
    }

    fn set_params_locked(&mut self, locked: bool) -> Result<()> {
        if !locked {
            self.stop_step(StopStep::UnlockParams)?;
        }
        self.locked = locked;
        Ok(())
    }

    fn start_acquisition(&mut self) -> Result<()> {
        if !self.stream_open || self.buffers == 0 {
            return Err(CameraError::Device(
                "no buffers queued on the data stream".to_owned(),
            ));
        }
        self.acquiring = true;
        self.started = Some(Instant::now());
        Ok(())
    }

    fn stop_acquisition(&mut self) -> Result<()> {
        self.stop_step(StopStep::StopAcquisition)?;
        self.acquiring = false;
        Ok(())
    }

    fn kill_wait(&mut self) -> Result<()> {
        self.stop_step(StopStep::KillWait)
    }

    fn flush(&mut self) -> Result<()> {
        self.stop_step(StopStep::Flush)?;
        self.last_frame = None;
        Ok(())
    }

    fn wait_for_frame(&mut self, timeout: Duration, output: PixelFormat) -> Result<Frame> {
        if !self.acquiring {
            return Err(CameraError::Timeout(timeout));
        }
        self.pace();

        let frame = self.generate(output)?;
        let sequence = self.sequence;
        self.sequence += 1;
        self.last_frame = Some(Instant::now());
        let timestamp = self.started.map(|start| start.elapsed()).unwrap_or_default();

        Ok(frame.with_metadata(FrameMetadata {
            sequence,
            timestamp,
        }))
    }
}
