//! Lab-cam-capture binary: list cameras, capture and save frames, analyze pictures.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use tracing::{info, info_span, warn};

use lab_cam_capture::analysis::{self, FrameStats, Histogram};
use lab_cam_capture::logger;
use lab_cam_capture::persist;
use lab_cam_capture::{
    CaptureOptions, CaptureSource, Camera, Colorness, Roi, SimulatedBackend,
};

/// Scientific camera capture tool.
///
/// Drives a V4L2 camera (or the simulated camera when none is attached)
/// and saves frames as 16-bit PNG plus raw `.npy` arrays with a JSON
/// metadata sidecar per batch.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Use the simulated camera even when hardware is attached
    #[arg(long, global = true, env = "SIMULATE")]
    simulate: bool,

    /// Enable debug logging (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List attached cameras
    List,
    /// Print the pixel formats a camera accepts
    Formats {
        /// Camera index
        #[arg(short, long, env = "CAMERA_INDEX", default_value_t = 0)]
        index: usize,
    },
    /// Capture frames and save them
    Capture(CaptureArgs),
    /// Print statistics of a saved picture
    Analyze {
        /// PNG picture to analyze
        path: PathBuf,
        /// Squeeze a left-aligned 16-bit picture to this many bits first
        #[arg(long)]
        squeeze: Option<u8>,
    },
}

#[derive(Args, Debug)]
struct CaptureArgs {
    /// Camera index
    #[arg(short, long, env = "CAMERA_INDEX", default_value_t = 0)]
    index: usize,

    /// Bits per sample (8, 10 or 12)
    #[arg(short, long, env = "BIT_DEPTH", default_value_t = 8)]
    bit_depth: u8,

    /// Colorness; defaults to what the sensor natively produces
    #[arg(long, value_enum)]
    colorness: Option<Colorness>,

    /// Frame rate in Hz
    #[arg(long, env = "FPS")]
    fps: Option<f64>,

    /// Run at the fastest rate the exposure allows
    #[arg(long, conflicts_with = "fps")]
    max_fps: bool,

    /// Exposure time in milliseconds
    #[arg(short, long, env = "EXPOSURE_MS")]
    exposure_ms: Option<f64>,

    /// Analog gain (at least 1)
    #[arg(short, long, env = "GAIN")]
    gain: Option<f64>,

    /// Number of frames to capture
    #[arg(short = 'n', long, default_value_t = 1)]
    count: usize,

    /// Keep every n-th pixel along both axes
    #[arg(long, default_value_t = 1)]
    binning: usize,

    /// Reduce samples to 8 significant bits
    #[arg(long)]
    force_8bit: bool,

    /// Per-frame wait in milliseconds
    #[arg(long, default_value_t = 500)]
    timeout_ms: u64,

    /// Main region to save: x,y,width,height
    #[arg(long, value_delimiter = ',', num_args = 4)]
    roi: Option<Vec<u32>>,

    /// Reference region to normalize by: x,y,width,height
    #[arg(long, value_delimiter = ',', num_args = 4)]
    reference: Option<Vec<u32>>,

    /// Output directory
    #[arg(short, long, default_value = ".")]
    output: PathBuf,

    /// Batch name; files are written as <prefix>_<n>.png
    #[arg(short, long, default_value = "capture")]
    prefix: String,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logger::init(if cli.verbose {
        "debug"
    } else {
        logger::DEFAULT_FILTER
    });

    let source = if cli.simulate {
        CaptureSource::from(SimulatedBackend::default())
    } else {
        CaptureSource::detect()
    };

    match cli.command {
        Command::List => list(&Camera::new(source)),
        Command::Formats { index } => formats(&Camera::new(source), index),
        Command::Capture(args) => capture(Camera::new(source), &args),
        Command::Analyze { path, squeeze } => analyze(&path, squeeze),
    }
}

fn list(camera: &Camera<CaptureSource>) -> anyhow::Result<()> {
    let devices = camera.devices()?;
    if devices.is_empty() {
        println!("No cameras found");
    }
    for (index, device) in devices.iter().enumerate() {
        println!(
            "{index}: {} (serial {}, {})",
            device.model_name,
            device.serial_number,
            if device.monochrome { "mono" } else { "color" }
        );
    }
    Ok(())
}

fn formats(camera: &Camera<CaptureSource>, index: usize) -> anyhow::Result<()> {
    let accepted = camera.supported_formats(index)?;
    println!("Camera {index} accepts:");
    for format in accepted {
        println!("  {format} ({} bit, {} channel)", format.bit_depth(), format.channels());
    }
    Ok(())
}

fn parse_roi(values: Option<&Vec<u32>>) -> anyhow::Result<Option<Roi>> {
    match values.map(Vec::as_slice) {
        None => Ok(None),
        Some(&[x, y, width, height]) => Ok(Some(Roi::new(x, y, width, height))),
        Some(other) => bail!("a region needs x,y,width,height, got {other:?}"),
    }
}

fn capture(mut camera: Camera<CaptureSource>, args: &CaptureArgs) -> anyhow::Result<()> {
    let main_roi = parse_roi(args.roi.as_ref())?;
    let reference_roi = parse_roi(args.reference.as_ref())?;

    let format = camera.set_pixel_format(args.index, args.bit_depth, args.colorness)?;
    let mut session = camera
        .open_session(args.index)
        .with_context(|| format!("opening camera {}", args.index))?;
    info!(
        index = args.index,
        internal = %format.internal,
        external = %format.external,
        "camera ready"
    );

    if let Some(exposure_ms) = args.exposure_ms {
        let applied = session.set_exposure(exposure_ms * 1000.0)?;
        info!(requested_us = exposure_ms * 1000.0, applied_us = applied, "exposure set");
    }
    if let Some(fps) = args.fps {
        let applied = session.set_frame_rate(fps)?;
        info!(requested = fps, applied, "frame rate set");
    } else if args.max_fps {
        let applied = session.set_max_frame_rate()?;
        info!(applied, "frame rate set to maximum");
    }
    if let Some(gain) = args.gain {
        let applied = session.set_gain(gain)?;
        info!(requested = gain, applied, "gain set");
    }

    let options = CaptureOptions {
        binning: args.binning,
        use_roi: false,
        force_8bit: args.force_8bit,
        timeout: Duration::from_millis(args.timeout_ms),
    };

    std::fs::create_dir_all(&args.output)
        .with_context(|| format!("creating {}", args.output.display()))?;

    session.start()?;
    let span = info_span!("capture", count = args.count);
    let result = span.in_scope(|| -> anyhow::Result<()> {
        for n in 0..args.count {
            let frame = session.capture(&options)?;
            let path = args.output.join(format!("{}_{n:03}.png", args.prefix));
            let saved =
                persist::save(&frame, &path, main_roi.as_ref(), reference_roi.as_ref())?;
            info!(
                path = %saved.image_path.display(),
                sequence = frame.metadata.sequence,
                mean = saved.record.mean,
                max = saved.record.max,
                "frame saved"
            );
        }
        Ok(())
    });

    if let Err(err) = session.stop() {
        warn!(%err, "stop failed");
    }
    let report = session.release();
    if !report.is_clean() {
        warn!(failures = report.failures.len(), "release was not clean");
    }
    result
}

fn analyze(path: &Path, squeeze: Option<u8>) -> anyhow::Result<()> {
    let raw = analysis::load_png(path).with_context(|| format!("loading {}", path.display()))?;
    println!("{}", FrameStats::of(&raw)?);

    let frame = match squeeze {
        Some(bits) => {
            let squeezed = analysis::squeeze(&raw, bits)?;
            println!("squeezed to {bits} bits:\n{}", FrameStats::of(&squeezed)?);
            squeezed
        }
        None => raw,
    };

    let stats = FrameStats::of(&frame)?;
    let bits = squeeze.unwrap_or(stats.inferred_bits).max(1);
    for channel in 0..frame.channels() {
        let histogram = Histogram::of_channel(&frame, channel, bits)?;
        println!(
            "channel {channel}: histogram density {:.3} over {} levels",
            histogram.density(),
            histogram.counts.len()
        );
    }
    Ok(())
}
