//! Deterministic test-pattern source.
//!
//! Behaves like a device with an explicit buffer strategy: only buffers that
//! were enqueued can be filled, and `get_buffer` starves when the application
//! holds all of them.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::decoder::rgb_to_yuv;
use super::{BufferId, CaptureBackend, CaptureError, Frame, PixelFormat, RecycleError, StreamInfo};

/// What the synthetic source paints into every frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind")]
pub enum Pattern {
    Uniform {
        color: [u8; 3],
    },
    /// A solid rectangle on a solid background.
    Patch {
        background: [u8; 3],
        color: [u8; 3],
        x: u32,
        y: u32,
        width: u32,
        height: u32,
    },
}

impl Default for Pattern {
    fn default() -> Self {
        Pattern::Uniform { color: [0, 0, 0] }
    }
}

impl Pattern {
    fn color_at(&self, px: u32, py: u32) -> [u8; 3] {
        match *self {
            Pattern::Uniform { color } => color,
            Pattern::Patch {
                background,
                color,
                x,
                y,
                width,
                height,
            } => {
                let inside = px >= x
                    && py >= y
                    && u64::from(px) < u64::from(x) + u64::from(width)
                    && u64::from(py) < u64::from(y) + u64::from(height);
                if inside {
                    color
                } else {
                    background
                }
            }
        }
    }
}

struct DeviceQueue {
    queued: VecDeque<Frame>,
    delivered: u64,
}

pub struct SyntheticCapture {
    info: StreamInfo,
    pattern: RwLock<Pattern>,
    device: Mutex<DeviceQueue>,
    buffer_ready: Condvar,
    next_id: AtomicUsize,
    released: AtomicUsize,
    started: AtomicBool,
    closed: AtomicBool,
    frame_interval: Option<Duration>,
    frame_limit: Option<u64>,
    allocation_limit: Option<usize>,
    sequence: AtomicU64,
}

impl SyntheticCapture {
    pub fn open(info: StreamInfo) -> Result<Self, CaptureError> {
        if info.format == PixelFormat::Mjpeg {
            return Err(CaptureError::Open(
                "synthetic source cannot produce mjpeg".into(),
            ));
        }
        if info.width == 0 || info.height == 0 {
            return Err(CaptureError::Open(format!(
                "invalid stream size {}x{}",
                info.width, info.height
            )));
        }
        let odd = match info.format {
            PixelFormat::Nv12 => info.width % 2 != 0 || info.height % 2 != 0,
            PixelFormat::Yuyv4 => info.width % 2 != 0,
            _ => false,
        };
        if odd {
            return Err(CaptureError::Open(format!(
                "{:?} needs even dimensions, got {}x{}",
                info.format, info.width, info.height
            )));
        }
        info!(
            "Opened synthetic stream {}x{} {:?}",
            info.width, info.height, info.format
        );
        Ok(Self {
            info,
            pattern: RwLock::new(Pattern::default()),
            device: Mutex::new(DeviceQueue {
                queued: VecDeque::new(),
                delivered: 0,
            }),
            buffer_ready: Condvar::new(),
            next_id: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            frame_interval: None,
            frame_limit: None,
            allocation_limit: None,
            sequence: AtomicU64::new(0),
        })
    }

    pub fn with_pattern(self, pattern: Pattern) -> Self {
        self.set_pattern(pattern);
        self
    }

    /// Pace delivery like a real sensor.
    pub fn with_frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = Some(interval);
        self
    }

    /// Stop producing after `limit` frames; `get_buffer` then blocks until closed.
    pub fn with_frame_limit(mut self, limit: u64) -> Self {
        self.frame_limit = Some(limit);
        self
    }

    /// Fail every allocation after the first `limit`.
    pub fn fail_allocation_after(mut self, limit: usize) -> Self {
        self.allocation_limit = Some(limit);
        self
    }

    pub fn set_pattern(&self, pattern: Pattern) {
        match self.pattern.write() {
            Ok(mut guard) => *guard = pattern,
            Err(poisoned) => *poisoned.into_inner() = pattern,
        }
    }

    /// Buffers currently owned by the device.
    pub fn queued_len(&self) -> usize {
        self.lock_device().queued.len()
    }

    pub fn frames_delivered(&self) -> u64 {
        self.lock_device().delivered
    }

    pub fn released_count(&self) -> usize {
        self.released.load(Ordering::Acquire)
    }

    pub fn allocated_count(&self) -> usize {
        self.next_id.load(Ordering::Acquire)
    }

    fn lock_device(&self) -> MutexGuard<'_, DeviceQueue> {
        self.device.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn paint(&self, frame: &mut Frame) {
        let pattern = match self.pattern.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        let StreamInfo {
            width,
            height,
            format,
        } = self.info;
        let w = width as usize;
        let data = frame.data_mut();
        match format {
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => {
                for y in 0..height {
                    for x in 0..width {
                        let mut c = pattern.color_at(x, y);
                        if format == PixelFormat::Bgr24 {
                            c.swap(0, 2);
                        }
                        let at = (y as usize * w + x as usize) * 3;
                        data[at..at + 3].copy_from_slice(&c);
                    }
                }
            }
            PixelFormat::Yuyv4 => {
                for y in 0..height {
                    for x in (0..width).step_by(2) {
                        let [y0, u, v] = rgb_to_yuv(pattern.color_at(x, y));
                        let [y1, _, _] = rgb_to_yuv(pattern.color_at((x + 1).min(width - 1), y));
                        let at = (y as usize * w + x as usize) * 2;
                        if let Some(quad) = data.get_mut(at..at + 4) {
                            quad.copy_from_slice(&[y0, u, y1, v]);
                        }
                    }
                }
            }
            PixelFormat::Nv12 => {
                let (luma, chroma) = data.split_at_mut(w * height as usize);
                for y in 0..height {
                    for x in 0..width {
                        let [l, u, v] = rgb_to_yuv(pattern.color_at(x, y));
                        luma[y as usize * w + x as usize] = l;
                        if y % 2 == 0 && x % 2 == 0 {
                            let at = (y as usize / 2) * w + x as usize;
                            if let Some(pair) = chroma.get_mut(at..at + 2) {
                                pair.copy_from_slice(&[u, v]);
                            }
                        }
                    }
                }
            }
            // Rejected in `open`
            PixelFormat::Mjpeg => {}
        }
    }
}

impl CaptureBackend for SyntheticCapture {
    fn stream_info(&self) -> StreamInfo {
        self.info
    }

    fn allocate_buffer(&self) -> Result<Frame, CaptureError> {
        let limit = self.allocation_limit.unwrap_or(usize::MAX);
        let index = self
            .next_id
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < limit).then_some(n + 1))
            .map_err(|n| {
                CaptureError::Allocate(format!("buffer pool exhausted after {n} buffers"))
            })?;
        Ok(Frame::new(
            BufferId(index),
            self.info.width,
            self.info.height,
            self.info.format,
        ))
    }

    fn enqueue_buffer(&self, frame: Frame) -> Result<(), RecycleError> {
        if self.closed.load(Ordering::Acquire) {
            let id = frame.id();
            return Err(RecycleError {
                frame,
                error: CaptureError::Enqueue {
                    id,
                    reason: "stream closed".into(),
                },
            });
        }
        self.lock_device().queued.push_back(frame);
        self.buffer_ready.notify_one();
        Ok(())
    }

    fn get_buffer(&self) -> Result<Frame, CaptureError> {
        let mut frame = {
            let mut device = self.lock_device();
            loop {
                if self.closed.load(Ordering::Acquire) {
                    return Err(CaptureError::Closed);
                }
                let exhausted = self
                    .frame_limit
                    .is_some_and(|limit| device.delivered >= limit);
                if self.started.load(Ordering::Acquire) && !exhausted {
                    if let Some(frame) = device.queued.pop_front() {
                        device.delivered += 1;
                        break frame;
                    }
                }
                device = self
                    .buffer_ready
                    .wait(device)
                    .unwrap_or_else(|e| e.into_inner());
            }
        };

        if let Some(interval) = self.frame_interval {
            std::thread::sleep(interval);
        }
        self.paint(&mut frame);
        let sequence = self.sequence.fetch_add(1, Ordering::AcqRel) + 1;
        frame.mark_captured(sequence);
        debug!("Synthetic frame {} in buffer {}", sequence, frame.id());
        Ok(frame)
    }

    fn release_buffer(&self, frame: Frame) {
        debug!("Releasing buffer {}", frame.id());
        self.released.fetch_add(1, Ordering::AcqRel);
    }

    fn start(&self) -> Result<(), CaptureError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CaptureError::Start("stream already closed".into()));
        }
        self.started.store(true, Ordering::Release);
        self.buffer_ready.notify_all();
        Ok(())
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let drained: Vec<Frame> = self.lock_device().queued.drain(..).collect();
        for frame in drained {
            self.release_buffer(frame);
        }
        self.buffer_ready.notify_all();
        info!("Synthetic stream closed");
    }
}
