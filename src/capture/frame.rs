use std::fmt;
use std::time::Instant;

use image::RgbImage;
use serde::{Deserialize, Serialize};

use super::decoder::{self, DecodeError};

/// Identity of one buffer in the capture pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub usize);

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Pixel formats we support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    Rgb24,
    Bgr24,
    Yuyv4,
    Mjpeg,
    Nv12,
}

impl PixelFormat {
    /// Bytes needed to hold one frame of the given size.
    ///
    /// MJPEG payloads are variable; the pool reserves room for an uncompressed
    /// RGB frame, which bounds any sane encoder output.
    pub fn frame_size(self, width: u32, height: u32) -> usize {
        let pixels = width as usize * height as usize;
        match self {
            PixelFormat::Rgb24 | PixelFormat::Bgr24 | PixelFormat::Mjpeg => pixels * 3,
            PixelFormat::Yuyv4 => pixels * 2,
            PixelFormat::Nv12 => pixels * 3 / 2,
        }
    }
}

/// Frame metadata
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Capture timestamp for latency tracking
    pub timestamp: Option<Instant>,
}

/// One reusable capture buffer.
///
/// A `Frame` is allocated once per pool slot and moved between the capture
/// backend, the provider queues and the consumer. It is deliberately not
/// `Clone`: whoever holds the value owns the slot.
pub struct Frame {
    id: BufferId,
    data: Vec<u8>,
    len: usize,
    meta: FrameMetadata,
}

impl Frame {
    pub fn new(id: BufferId, width: u32, height: u32, format: PixelFormat) -> Self {
        let capacity = format.frame_size(width, height);
        Self {
            id,
            data: vec![0; capacity],
            len: capacity,
            meta: FrameMetadata {
                sequence: 0,
                width,
                height,
                format,
                timestamp: None,
            },
        }
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn meta(&self) -> &FrameMetadata {
        &self.meta
    }

    pub fn sequence(&self) -> u64 {
        self.meta.sequence
    }

    pub fn width(&self) -> u32 {
        self.meta.width
    }

    pub fn height(&self) -> u32 {
        self.meta.height
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Valid payload bytes of the last capture.
    pub fn payload(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// Whole backing store, for backends that paint in place.
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Copy an encoded or raw capture into the buffer, truncating to capacity.
    pub fn fill_from(&mut self, bytes: &[u8]) -> usize {
        let n = bytes.len().min(self.data.len());
        self.data[..n].copy_from_slice(&bytes[..n]);
        self.len = n;
        n
    }

    /// Stamp the buffer as freshly captured.
    pub fn mark_captured(&mut self, sequence: u64) {
        self.meta.sequence = sequence;
        self.meta.timestamp = Some(Instant::now());
        if self.meta.format != PixelFormat::Mjpeg {
            self.len = self.data.len();
        }
    }

    /// Decode the payload into an RGB image for analysis.
    pub fn to_rgb(&self) -> Result<RgbImage, DecodeError> {
        decoder::decode_frame(self.payload(), self.meta.width, self.meta.height, self.meta.format)
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("id", &self.id)
            .field("sequence", &self.meta.sequence)
            .field("size", &(self.meta.width, self.meta.height))
            .field("format", &self.meta.format)
            .field("len", &self.len)
            .finish()
    }
}
