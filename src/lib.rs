//! Lab-Cam-Capture: a scientific camera acquisition wrapper.
//!
//! This library drives a camera through an explicit acquisition state
//! machine, reconciles exposure, frame rate and gain against the device's
//! limits, post-processes captured frames (binning, flip, ROI crop) and
//! persists them as 16-bit PNG plus raw `f32` arrays with a JSON sidecar.
//! Devices sit behind trait abstractions so the same code drives V4L2
//! hardware or the built-in simulated camera.

pub mod analysis;
pub mod claims;
pub mod device;
pub mod format;
pub mod frame;
pub mod logger;
pub mod persist;
pub mod reconcile;
pub mod session;
pub mod simulated;
pub mod source;
pub mod traits;

pub use device::{V4L2Backend, V4L2Device};
pub use format::{resolve, Colorness, PixelFormat, ResolvedFormat};
pub use frame::{CaptureOptions, Frame, FrameMetadata, Roi};
pub use persist::{save, SavedCapture};
pub use session::{AcquisitionState, Camera, ReleaseReport, Session, StopStep};
pub use simulated::{SimulatedBackend, SimulatedConfig, SimulatedDevice, StopLog, TestPattern};
pub use source::{CaptureSource, SourceDevice};
pub use traits::{
    CameraBackend, CameraDevice, CameraError, DeviceInfo, FloatNode, IntNode, NodeRange,
};
