//! V4L2 device implementation using the v4l crate.

use std::fmt;
use std::io::{self, Cursor};
use std::time::Duration;

use bayer::{BayerDepth, Demosaic, RasterDepth, RasterMut, CFA};
use tracing::{debug, trace, warn};
use v4l::buffer::Type;
use v4l::context;
use v4l::control::{Control, Value};
use v4l::frameinterval::FrameIntervalEnum;
use v4l::io::mmap::Stream;
use v4l::io::traits::{CaptureStream as V4lCaptureStream, Stream as V4lStream};
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Device, Fraction};

use crate::claims::{Claim, DeviceClaims};
use crate::format::PixelFormat;
use crate::frame::{Frame, FrameMetadata};
use crate::traits::{
    CameraBackend, CameraDevice, CameraError, DeviceInfo, FloatNode, IntNode, NodeRange, Result,
};

/// `V4L2_CID_EXPOSURE_AUTO`.
const CID_EXPOSURE_AUTO: u32 = 0x009a_0901;
/// `V4L2_CID_EXPOSURE_ABSOLUTE`, in units of 100 µs.
const CID_EXPOSURE_ABSOLUTE: u32 = 0x009a_0902;
/// `V4L2_CID_GAIN`.
const CID_GAIN: u32 = 0x0098_0913;
/// `V4L2_EXPOSURE_MANUAL`.
const EXPOSURE_MANUAL: i64 = 1;
/// Microseconds per `V4L2_CID_EXPOSURE_ABSOLUTE` unit.
const EXPOSURE_UNIT_US: f64 = 100.0;
/// Denominator resolution used when writing a frame interval.
const INTERVAL_SCALE: f64 = 1000.0;
/// Buffers mmapped per stream.
const MIN_BUFFERS: u32 = 4;

fn fourcc(format: PixelFormat) -> Option<v4l::FourCC> {
    let code = match format {
        PixelFormat::Mono8 => b"GREY",
        PixelFormat::Mono10 => b"Y10 ",
        PixelFormat::Mono12 => b"Y12 ",
        PixelFormat::BayerRG8 => b"RGGB",
        PixelFormat::BayerRG10 => b"RG10",
        PixelFormat::BayerRG12 => b"RG12",
        PixelFormat::Rgb8 | PixelFormat::Rgb10 | PixelFormat::Rgb12 => return None,
    };
    Some(v4l::FourCC::new(code))
}

fn pixel_format(fourcc: v4l::FourCC) -> Option<PixelFormat> {
    PixelFormat::ALL
        .into_iter()
        .find(|format| self::fourcc(*format) == Some(fourcc))
}

fn device_error(err: &io::Error) -> CameraError {
    CameraError::Device(err.to_string())
}

fn fps(interval: Fraction) -> f64 {
    if interval.numerator == 0 {
        return 0.0;
    }
    f64::from(interval.denominator) / f64::from(interval.numerator)
}

/// Backend enumerating `/dev/video*` capture nodes.
#[derive(Debug, Clone, Default)]
pub struct V4L2Backend {
    claims: DeviceClaims,
}

impl V4L2Backend {
    /// Create a backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Streaming capture nodes, in kernel node order.
    ///
    /// Nodes that cannot be opened or queried, and nodes without a
    /// streaming video-capture interface (UVC metadata nodes, for one), are
    /// skipped. Device indices are positions in this list.
    fn capture_nodes() -> Vec<(usize, Device, DeviceInfo)> {
        let mut nodes: Vec<usize> = context::enum_devices()
            .into_iter()
            .map(|node| node.index())
            .collect();
        nodes.sort_unstable();

        nodes
            .into_iter()
            .filter_map(|node| match Device::new(node) {
                Ok(device) => Some((node, device)),
                Err(err) => {
                    debug!(node, %err, "skipping node that cannot be opened");
                    None
                }
            })
            .filter_map(|(node, device)| match Self::describe(&device) {
                Ok(Some(info)) => Some((node, device, info)),
                Ok(None) => {
                    trace!(node, "skipping node without streaming capture");
                    None
                }
                Err(err) => {
                    debug!(node, %err, "skipping node that cannot be queried");
                    None
                }
            })
            .collect()
    }

    /// Identity of a streaming capture node, `None` for any other node.
    fn describe(device: &Device) -> Result<Option<DeviceInfo>> {
        let caps = device
            .query_caps()
            .map_err(|err| CameraError::NotAvailable(err.to_string()))?;
        let can_capture = caps
            .capabilities
            .contains(v4l::capability::Flags::VIDEO_CAPTURE);
        let can_stream = caps.capabilities.contains(v4l::capability::Flags::STREAMING);
        if !(can_capture && can_stream) {
            return Ok(None);
        }

        let monochrome = device
            .enum_formats()
            .map(|formats| {
                !formats
                    .iter()
                    .filter_map(|desc| pixel_format(desc.fourcc))
                    .any(PixelFormat::is_bayer)
            })
            .unwrap_or(true);

        Ok(Some(DeviceInfo {
            model_name: caps.card,
            serial_number: caps.bus,
            monochrome,
        }))
    }
}

impl CameraBackend for V4L2Backend {
    type Device = V4L2Device;

    fn devices(&self) -> Result<Vec<DeviceInfo>> {
        Ok(Self::capture_nodes()
            .into_iter()
            .map(|(_, _, info)| info)
            .collect())
    }

    fn open(&self, index: usize) -> Result<V4L2Device> {
        let (node, device, info) = Self::capture_nodes()
            .into_iter()
            .nth(index)
            .ok_or(CameraError::NotFound(index))?;
        let claim = self.claims.claim(index)?;
        debug!(index, node, card = %info.model_name, "opened V4L2 device");

        Ok(V4L2Device {
            device,
            info,
            stream: None,
            stream_open: false,
            format: None,
            locked: false,
            _claim: claim,
        })
    }
}

/// Geometry and layout of the programmed capture format.
#[derive(Debug, Clone, Copy)]
struct ActiveFormat {
    pixel_format: PixelFormat,
    width: u32,
    height: u32,
    /// Bytes per line including driver padding.
    stride: u32,
}

/// An opened V4L2 capture device.
pub struct V4L2Device {
    device: Device,
    info: DeviceInfo,
    stream: Option<Stream<'static>>,
    stream_open: bool,
    format: Option<ActiveFormat>,
    locked: bool,
    _claim: Claim,
}

impl fmt::Debug for V4L2Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("V4L2Device")
            .field("info", &self.info)
            .field("stream_open", &self.stream_open)
            .field("format", &self.format)
            .field("locked", &self.locked)
            .finish_non_exhaustive()
    }
}

impl V4L2Device {
    fn control_range(&self, id: u32) -> Result<NodeRange> {
        let controls = self.device.query_controls().map_err(|err| device_error(&err))?;
        let desc = controls
            .iter()
            .find(|desc| desc.id == id)
            .ok_or_else(|| CameraError::NotAvailable(format!("control {id:#x} not present")))?;
        Ok(NodeRange::new(desc.minimum as f64, desc.maximum as f64))
    }

    fn control_value(&self, id: u32) -> Result<f64> {
        let control = self.device.control(id).map_err(|err| device_error(&err))?;
        match control.value {
            Value::Integer(value) => Ok(value as f64),
            Value::Boolean(value) => Ok(f64::from(u8::from(value))),
            _ => Err(CameraError::Device(format!(
                "control {id:#x} is not numeric"
            ))),
        }
    }

    fn set_control(&self, id: u32, value: i64) -> Result<()> {
        self.device
            .set_control(Control {
                id,
                value: Value::Integer(value),
            })
            .map_err(|err| device_error(&err))
    }

    #[allow(clippy::cast_possible_truncation)]
    fn write_exposure(&self, value_us: f64) -> Result<()> {
        if let Err(err) = self.set_control(CID_EXPOSURE_AUTO, EXPOSURE_MANUAL) {
            trace!(%err, "manual exposure mode not set");
        }
        self.set_control(CID_EXPOSURE_ABSOLUTE, (value_us / EXPOSURE_UNIT_US).round() as i64)
    }

    fn frame_rate_range(&self) -> Result<NodeRange> {
        let current = self.device.format().map_err(|err| device_error(&err))?;
        let intervals = self
            .device
            .enum_frameintervals(current.fourcc, current.width, current.height)
            .unwrap_or_default();

        let rates: Vec<f64> = intervals
            .iter()
            .flat_map(|interval| match &interval.interval {
                FrameIntervalEnum::Discrete(fraction) => vec![fps(*fraction)],
                FrameIntervalEnum::Stepwise(step) => vec![fps(step.min), fps(step.max)],
            })
            .filter(|rate| *rate > 0.0)
            .collect();

        if rates.is_empty() {
            let rate = self.float_value(FloatNode::AcquisitionFrameRate)?;
            return Ok(NodeRange::new(rate, rate));
        }
        let min = rates.iter().copied().fold(f64::INFINITY, f64::min);
        let max = rates.iter().copied().fold(0.0, f64::max);
        Ok(NodeRange::new(min, max))
    }

    fn stream_mut(&mut self) -> Result<&mut Stream<'static>> {
        self.stream
            .as_mut()
            .ok_or_else(|| CameraError::NotReady("no buffers announced".to_owned()))
    }

    fn active_format(&self) -> Result<ActiveFormat> {
        if let Some(active) = self.format {
            return Ok(active);
        }
        let current = self.device.format().map_err(|err| device_error(&err))?;
        let pixel_format = pixel_format(current.fourcc).ok_or_else(|| {
            CameraError::Device(format!("unsupported native format {}", current.fourcc))
        })?;
        Ok(ActiveFormat {
            pixel_format,
            width: current.width,
            height: current.height,
            stride: current.stride,
        })
    }
}

impl CameraDevice for V4L2Device {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn float_value(&self, node: FloatNode) -> Result<f64> {
        match node {
            FloatNode::Gain => self.control_value(CID_GAIN),
            FloatNode::ExposureTime => {
                Ok(self.control_value(CID_EXPOSURE_ABSOLUTE)? * EXPOSURE_UNIT_US)
            }
            FloatNode::AcquisitionFrameRate => {
                let params = self.device.params().map_err(|err| device_error(&err))?;
                Ok(fps(params.interval))
            }
        }
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn set_float_value(&mut self, node: FloatNode, value: f64) -> Result<()> {
        match node {
            FloatNode::Gain => self.set_control(CID_GAIN, value.round() as i64),
            FloatNode::ExposureTime => self.write_exposure(value),
            FloatNode::AcquisitionFrameRate => {
                if value <= 0.0 {
                    return Err(CameraError::Device(format!("frame rate {value} not positive")));
                }
                let interval = Fraction::new(
                    INTERVAL_SCALE as u32,
                    (value * INTERVAL_SCALE).round() as u32,
                );
                self.device
                    .set_params(&Parameters::new(interval))
                    .map_err(|err| device_error(&err))?;
                Ok(())
            }
        }
    }

    fn float_range(&self, node: FloatNode) -> Result<NodeRange> {
        match node {
            FloatNode::Gain => self.control_range(CID_GAIN),
            FloatNode::ExposureTime => {
                let range = self.control_range(CID_EXPOSURE_ABSOLUTE)?;
                Ok(NodeRange::new(
                    range.min * EXPOSURE_UNIT_US,
                    range.max * EXPOSURE_UNIT_US,
                ))
            }
            FloatNode::AcquisitionFrameRate => self.frame_rate_range(),
        }
    }

    fn int_value(&self, node: IntNode) -> Result<u64> {
        let format = self.device.format().map_err(|err| device_error(&err))?;
        Ok(match node {
            IntNode::Width => u64::from(format.width),
            IntNode::Height => u64::from(format.height),
            IntNode::PayloadSize => u64::from(format.size),
        })
    }

    fn load_default_user_set(&mut self) -> Result<()> {
        let controls = self.device.query_controls().map_err(|err| device_error(&err))?;
        let defaults: Vec<(u32, i64)> = controls
            .iter()
            .filter(|desc| matches!(desc.id, CID_EXPOSURE_ABSOLUTE | CID_GAIN))
            .map(|desc| (desc.id, desc.default))
            .collect();
        if defaults.is_empty() {
            return Err(CameraError::NotAvailable("no default controls".to_owned()));
        }
        for (id, value) in defaults {
            if let Err(err) = self.set_control(id, value) {
                warn!(id, %err, "failed to restore control default");
            }
        }
        Ok(())
    }

    fn set_pixel_format(&mut self, format: PixelFormat) -> Result<()> {
        if self.locked {
            return Err(CameraError::Device(
                "PixelFormat is locked while parameters are locked".to_owned(),
            ));
        }
        let unsupported = |this: &mut Self| CameraError::UnsupportedFormat {
            requested: format,
            accepted: this.supported_pixel_formats().unwrap_or_default(),
        };
        let Some(code) = fourcc(format) else {
            return Err(unsupported(self));
        };

        let mut fmt = self.device.format().map_err(|err| device_error(&err))?;
        fmt.fourcc = code;
        let applied = self
            .device
            .set_format(&fmt)
            .map_err(|err| device_error(&err))?;
        if applied.fourcc != code {
            return Err(unsupported(self));
        }

        self.format = Some(ActiveFormat {
            pixel_format: format,
            width: applied.width,
            height: applied.height,
            stride: applied.stride,
        });
        Ok(())
    }

    fn supported_pixel_formats(&mut self) -> Result<Vec<PixelFormat>> {
        let formats = self
            .device
            .enum_formats()
            .map_err(|err| device_error(&err))?;
        Ok(formats
            .iter()
            .filter_map(|desc| pixel_format(desc.fourcc))
            .collect())
    }

    fn open_stream(&mut self) -> Result<()> {
        self.stream_open = true;
        Ok(())
    }

    fn min_buffer_count(&self) -> Result<u32> {
        Ok(MIN_BUFFERS)
    }

    fn announce_buffers(&mut self, count: u32, payload_size: u64) -> Result<()> {
        if !self.stream_open {
            return Err(CameraError::NotReady("data stream not open".to_owned()));
        }
        let stream = Stream::with_buffers(&self.device, Type::VideoCapture, count)
            .map_err(|err| CameraError::NotAvailable(err.to_string()))?;
        debug!(count, payload_size, "mmap buffers queued");
        self.stream = Some(stream);
        Ok(())
    }

    fn set_params_locked(&mut self, locked: bool) -> Result<()> {
        self.locked = locked;
        Ok(())
    }

    fn start_acquisition(&mut self) -> Result<()> {
        self.stream_mut()?
            .start()
            .map_err(|err| device_error(&err))
    }

    fn stop_acquisition(&mut self) -> Result<()> {
        self.stream_mut()?
            .stop()
            .map_err(|err| device_error(&err))
    }

    fn kill_wait(&mut self) -> Result<()> {
        // Waits are bounded by the stream timeout on this thread.
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        // STREAMOFF has already dequeued every buffer.
        trace!("stream flushed");
        Ok(())
    }

    fn wait_for_frame(&mut self, timeout: Duration, output: PixelFormat) -> Result<Frame> {
        let active = self.active_format()?;
        let stream = self.stream_mut()?;
        stream.set_timeout(timeout);

        let (buf, meta) = stream.next().map_err(|err| {
            if err.kind() == io::ErrorKind::TimedOut {
                CameraError::Timeout(timeout)
            } else {
                device_error(&err)
            }
        })?;

        // Safe conversions: V4L2 timestamps are always non-negative in practice
        #[allow(clippy::cast_sign_loss)]
        let secs = meta.timestamp.sec.max(0) as u64;
        #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
        let nanos = (meta.timestamp.usec.max(0) as u32).saturating_mul(1000);
        let metadata = FrameMetadata {
            sequence: u64::from(meta.sequence),
            timestamp: Duration::new(secs, nanos),
        };

        let used = (meta.bytesused as usize).min(buf.len());
        let frame = convert(buf.get(..used).unwrap_or(buf), active, output)?;
        Ok(frame.with_metadata(metadata))
    }
}

/// Convert one delivered buffer from the sensor format to `output`.
fn convert(data: &[u8], active: ActiveFormat, output: PixelFormat) -> Result<Frame> {
    let width = active.width as usize;
    let height = active.height as usize;
    let depth = active.pixel_format.bit_depth();
    let bytes_per_sample = if depth > 8 { 2 } else { 1 };
    let row_bytes = width * bytes_per_sample;
    let stride = (active.stride as usize).max(row_bytes);
    let short = || {
        CameraError::Device(format!(
            "short buffer: {} bytes for {height} rows of {row_bytes} with stride {stride}",
            data.len()
        ))
    };
    let rows = (0..height)
        .map(|row| {
            let start = row * stride;
            data.get(start..start + row_bytes).ok_or_else(short)
        })
        .collect::<Result<Vec<_>>>()?;
    let data = rows.concat();
    let data = data.as_slice();

    if active.pixel_format.is_bayer() && output.channels() == 3 {
        return demosaic(data, width, height, depth);
    }

    let samples: Vec<u16> = if bytes_per_sample == 1 {
        data.iter().map(|&v| u16::from(v)).collect()
    } else {
        data.chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect()
    };

    if output.channels() == 3 {
        let rgb = samples.iter().flat_map(|&v| [v, v, v]).collect();
        return Frame::from_samples(height, width, 3, rgb, depth);
    }
    Frame::from_samples(height, width, 1, samples, depth)
}

fn demosaic(data: &[u8], width: usize, height: usize, depth: u8) -> Result<Frame> {
    let (bayer_depth, raster_depth, bytes) = if depth <= 8 {
        (BayerDepth::Depth8, RasterDepth::Depth8, 1)
    } else {
        (BayerDepth::Depth16LE, RasterDepth::Depth16, 2)
    };

    let mut out = vec![0u8; width * height * 3 * bytes];
    let mut raster = RasterMut::new(width, height, raster_depth, &mut out);
    bayer::run_demosaic(
        &mut Cursor::new(data),
        bayer_depth,
        CFA::RGGB,
        Demosaic::Linear,
        &mut raster,
    )
    .map_err(|err| CameraError::Device(format!("demosaic failed: {err:?}")))?;

    let samples = if bytes == 1 {
        out.iter().map(|&v| u16::from(v)).collect()
    } else {
        out.chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect()
    };
    Frame::from_samples(height, width, 3, samples, depth)
}
