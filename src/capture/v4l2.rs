//! V4L2 capture into pool buffers

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

use tracing::{debug, info, instrument, warn};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::framesize::FrameSizeEnum;
use v4l::io::traits::{CaptureStream, Stream};
use v4l::prelude::MmapStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use super::{
    BufferId, CaptureBackend, CaptureError, Frame, PixelFormat, RecycleError, Resolution,
    StreamInfo,
};
use crate::CaptureConfig;

/// Driver-side buffers; frames are copied out of these into pool buffers.
const DRIVER_BUFFERS: u32 = 4;

/// Bounds how long `get_buffer` can stay blocked after `close`.
const POLL_TIMEOUT: Duration = Duration::from_millis(200);

fn fourcc(format: PixelFormat) -> FourCC {
    match format {
        PixelFormat::Mjpeg => FourCC::new(b"MJPG"),
        PixelFormat::Yuyv4 => FourCC::new(b"YUYV"),
        PixelFormat::Nv12 => FourCC::new(b"NV12"),
        PixelFormat::Rgb24 => FourCC::new(b"RGB3"),
        PixelFormat::Bgr24 => FourCC::new(b"BGR3"),
    }
}

fn device_path(config: &CaptureConfig) -> String {
    config
        .device
        .clone()
        .unwrap_or_else(|| "/dev/video0".to_string())
}

/// Discrete frame sizes the device offers for the configured format.
pub fn probe_resolutions(config: &CaptureConfig) -> Result<Vec<Resolution>, CaptureError> {
    let device = Device::with_path(device_path(config))?;
    let sizes = device.enum_framesizes(fourcc(config.format))?;
    Ok(sizes
        .into_iter()
        .filter_map(|size| match size.size {
            FrameSizeEnum::Discrete(d) => Some(Resolution::new(d.width, d.height)),
            _ => None,
        })
        .collect())
}

/// Memory-mapped V4L2 stream feeding an explicit buffer pool
pub struct V4l2Capture {
    _device: Device,
    stream: Mutex<MmapStream<'static>>,
    info: StreamInfo,
    queued: Mutex<VecDeque<Frame>>,
    buffer_ready: Condvar,
    next_id: AtomicUsize,
    sequence: AtomicU64,
    closed: AtomicBool,
}

impl V4l2Capture {
    #[instrument(skip(config))]
    pub fn open(config: &CaptureConfig, info: StreamInfo) -> Result<Self, CaptureError> {
        let path = device_path(config);
        info!("Initializing V4L2 capture: {}", path);

        let device = Device::with_path(&path)?;

        // Query capabilities
        let caps = device.query_caps()?;
        info!("Device: {} ({})", caps.card, caps.driver);

        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(CaptureError::Open(format!(
                "{path} doesn't support video capture"
            )));
        }

        // Set format
        let mut fmt = device.format()?;
        fmt.width = info.width;
        fmt.height = info.height;
        fmt.fourcc = fourcc(info.format);
        let fmt = device.set_format(&fmt)?;
        if fmt.width != info.width || fmt.height != info.height || fmt.fourcc != fourcc(info.format)
        {
            return Err(CaptureError::Open(format!(
                "driver negotiated {}x{} {} instead of {}x{} {:?}",
                fmt.width, fmt.height, fmt.fourcc, info.width, info.height, info.format
            )));
        }

        let mut stream = MmapStream::with_buffers(&device, Type::VideoCapture, DRIVER_BUFFERS)?;
        stream.set_timeout(POLL_TIMEOUT);

        Ok(Self {
            _device: device,
            stream: Mutex::new(stream),
            info,
            queued: Mutex::new(VecDeque::new()),
            buffer_ready: Condvar::new(),
            next_id: AtomicUsize::new(0),
            sequence: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        })
    }

    fn lock_queue(&self) -> MutexGuard<'_, VecDeque<Frame>> {
        self.queued.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn take_queued(&self) -> Result<Frame, CaptureError> {
        let mut queued = self.lock_queue();
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(CaptureError::Closed);
            }
            if let Some(frame) = queued.pop_front() {
                return Ok(frame);
            }
            queued = self
                .buffer_ready
                .wait(queued)
                .unwrap_or_else(|e| e.into_inner());
        }
    }
}

impl CaptureBackend for V4l2Capture {
    fn stream_info(&self) -> StreamInfo {
        self.info
    }

    fn allocate_buffer(&self) -> Result<Frame, CaptureError> {
        let id = BufferId(self.next_id.fetch_add(1, Ordering::AcqRel));
        Ok(Frame::new(id, self.info.width, self.info.height, self.info.format))
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
        self.lock_queue().push_back(frame);
        self.buffer_ready.notify_one();
        Ok(())
    }

    fn get_buffer(&self) -> Result<Frame, CaptureError> {
        let mut frame = self.take_queued()?;

        let mut stream = self.stream.lock().unwrap_or_else(|e| e.into_inner());
        let result = loop {
            match stream.next() {
                Ok((buf, meta)) => {
                    let used = (meta.bytesused as usize).min(buf.len());
                    frame.fill_from(&buf[..used]);
                    break Ok(());
                }
                Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                    if self.closed.load(Ordering::Acquire) {
                        break Err(CaptureError::Closed);
                    }
                }
                Err(e) => break Err(CaptureError::Fetch(e.to_string())),
            }
        };
        drop(stream);

        match result {
            Ok(()) => {
                let sequence = self.sequence.fetch_add(1, Ordering::AcqRel) + 1;
                frame.mark_captured(sequence);
                Ok(frame)
            }
            Err(CaptureError::Closed) => {
                self.release_buffer(frame);
                Err(CaptureError::Closed)
            }
            Err(e) => {
                // The pool slot goes back to the device queue; only the capture failed.
                self.lock_queue().push_front(frame);
                Err(e)
            }
        }
    }

    fn release_buffer(&self, frame: Frame) {
        debug!("Releasing buffer {}", frame.id());
    }

    fn start(&self) -> Result<(), CaptureError> {
        let mut stream = self.stream.lock().unwrap_or_else(|e| e.into_inner());
        stream
            .start()
            .map_err(|e| CaptureError::Start(e.to_string()))?;
        info!("Capture stream started with {} driver buffers", DRIVER_BUFFERS);
        Ok(())
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let drained: Vec<Frame> = self.lock_queue().drain(..).collect();
        for frame in drained {
            self.release_buffer(frame);
        }
        self.buffer_ready.notify_all();
        if let Ok(mut stream) = self.stream.try_lock() {
            if let Err(e) = stream.stop() {
                warn!("Failed to stop V4L2 stream: {}", e);
            }
        }
        info!("V4L2 stream closed");
    }
}
