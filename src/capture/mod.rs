//! Capture-subsystem boundary.
//!
//! A backend owns the stream and the buffers currently queued to it. Buffers
//! travel by value: `allocate_buffer` creates a pool slot, `enqueue_buffer`
//! hands it to the device, `get_buffer` blocks until the device hands a filled
//! one back, `release_buffer` retires it for good.

pub mod decoder;
pub mod frame;
pub mod synthetic;
#[cfg(feature = "v4l2")]
pub mod v4l2;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use decoder::DecodeError;
pub use frame::{BufferId, Frame, FrameMetadata, PixelFormat};
pub use synthetic::{Pattern, SyntheticCapture};
#[cfg(feature = "v4l2")]
pub use v4l2::V4l2Capture;

use crate::CaptureConfig;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to open capture stream: {0}")]
    Open(String),
    #[error("failed to allocate capture buffer: {0}")]
    Allocate(String),
    #[error("failed to map capture buffer {0}")]
    Map(BufferId),
    #[error("failed to enqueue buffer {id}: {reason}")]
    Enqueue { id: BufferId, reason: String },
    #[error("failed to start capture stream: {0}")]
    Start(String),
    #[error("failed to fetch frame: {0}")]
    Fetch(String),
    #[error("capture stream closed")]
    Closed,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A buffer the backend refused to take back. Ownership returns to the caller.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct RecycleError {
    pub frame: Frame,
    #[source]
    pub error: CaptureError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn area(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Geometry and layout of an opened stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamInfo {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

impl StreamInfo {
    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }
}

pub trait CaptureBackend: Send + Sync {
    fn stream_info(&self) -> StreamInfo;

    fn allocate_buffer(&self) -> Result<Frame, CaptureError>;

    fn enqueue_buffer(&self, frame: Frame) -> Result<(), RecycleError>;

    /// Block until the device delivers a filled buffer.
    ///
    /// Returns [`CaptureError::Closed`] once [`close`](Self::close) has been
    /// called, even if the caller was already blocked.
    fn get_buffer(&self) -> Result<Frame, CaptureError>;

    fn release_buffer(&self, frame: Frame);

    fn start(&self) -> Result<(), CaptureError>;

    /// Close the stream, wake any blocked `get_buffer` and release every
    /// buffer still queued to the device.
    fn close(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Synthetic,
    V4l2,
}

/// Resolutions the configured source can deliver, for stream sizing.
pub fn probe_resolutions(config: &CaptureConfig) -> Result<Vec<Resolution>, CaptureError> {
    match config.backend {
        BackendKind::Synthetic => Ok(config.resolutions.clone()),
        #[cfg(feature = "v4l2")]
        BackendKind::V4l2 => v4l2::probe_resolutions(config),
        #[cfg(not(feature = "v4l2"))]
        BackendKind::V4l2 => Err(unsupported_backend()),
    }
}

/// Open the configured backend at the chosen resolution.
pub fn open_backend(
    config: &CaptureConfig,
    resolution: Resolution,
) -> Result<Arc<dyn CaptureBackend>, CaptureError> {
    let info = StreamInfo {
        width: resolution.width,
        height: resolution.height,
        format: config.format,
    };
    match config.backend {
        BackendKind::Synthetic => {
            let mut capture = SyntheticCapture::open(info)?.with_pattern(config.pattern.clone());
            if config.fps > 0 {
                capture = capture.with_frame_interval(std::time::Duration::from_secs_f64(
                    1.0 / f64::from(config.fps),
                ));
            }
            Ok(Arc::new(capture))
        }
        #[cfg(feature = "v4l2")]
        BackendKind::V4l2 => Ok(Arc::new(V4l2Capture::open(config, info)?)),
        #[cfg(not(feature = "v4l2"))]
        BackendKind::V4l2 => Err(unsupported_backend()),
    }
}

#[cfg(not(feature = "v4l2"))]
fn unsupported_backend() -> CaptureError {
    CaptureError::Open("built without the `v4l2` feature".into())
}
