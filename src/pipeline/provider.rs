//! Frame provider between the capture backend and the analysis consumer.
//!
//! A fetcher thread pulls filled buffers from the backend into the delivered
//! queue and hands buffers back to the backend, preferring the ones the
//! consumer returned through the processed queue. The consumer always takes
//! the newest delivered frame.
//!
//! Every buffer is owned by exactly one of: the backend, the delivered queue,
//! the consumer or the processed queue. Buffers move by value, so a slot can
//! never be held twice.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use crossbeam::utils::CachePadded;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::capture::{CaptureBackend, CaptureError, Frame, RecycleError};

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("frame provider already started")]
    AlreadyStarted,
    #[error("capture setup failed: {0}")]
    Setup(#[source] CaptureError),
    #[error("failed to spawn frame fetcher: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("frame fetcher thread panicked")]
    Join,
}

#[derive(Debug, Clone, Copy)]
pub struct ProviderConfig {
    /// Buffers allocated for the pool.
    pub buffer_count: usize,
    /// Older frames kept behind the newest one while the consumer is idle.
    pub retention: usize,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            buffer_count: 8,
            retention: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProviderStats {
    pub frames_delivered: u64,
    pub frames_recycled: u64,
    pub frames_dropped: u64,
    pub capture_errors: u64,
    pub recycle_errors: u64,
}

#[derive(Default)]
struct Stats {
    frames_delivered: AtomicU64,
    frames_recycled: AtomicU64,
    frames_dropped: AtomicU64,
    capture_errors: AtomicU64,
    recycle_errors: AtomicU64,
}

#[derive(Default)]
struct Queues {
    delivered: VecDeque<Frame>,
    processed: VecDeque<Frame>,
}

struct Shared {
    queues: Mutex<Queues>,
    frame_delivered: Condvar,
    shutdown: AtomicBool,
    stats: CachePadded<Stats>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Queues> {
        self.queues.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub struct FrameProvider {
    backend: Arc<dyn CaptureBackend>,
    config: ProviderConfig,
    shared: Arc<Shared>,
    fetcher: Mutex<Option<JoinHandle<()>>>,
}

impl FrameProvider {
    pub fn new(backend: Arc<dyn CaptureBackend>, config: ProviderConfig) -> Self {
        Self {
            backend,
            config,
            shared: Arc::new(Shared {
                queues: Mutex::new(Queues::default()),
                frame_delivered: Condvar::new(),
                shutdown: AtomicBool::new(false),
                stats: CachePadded::new(Stats::default()),
            }),
            fetcher: Mutex::new(None),
        }
    }

    pub fn config(&self) -> ProviderConfig {
        self.config
    }

    /// Allocate and queue the buffer pool, start streaming and spawn the fetcher.
    ///
    /// Any setup failure closes the backend, releasing whatever was allocated.
    #[instrument(skip(self), fields(buffers = self.config.buffer_count, retention = self.config.retention))]
    pub fn start(&self) -> Result<(), ProviderError> {
        let mut fetcher = self.fetcher.lock().unwrap_or_else(|e| e.into_inner());
        if fetcher.is_some() || self.shared.shutdown.load(Ordering::Acquire) {
            return Err(ProviderError::AlreadyStarted);
        }

        if let Err(e) = self.setup_buffers() {
            self.backend.close();
            return Err(ProviderError::Setup(e));
        }
        if let Err(e) = self.backend.start() {
            self.backend.close();
            return Err(ProviderError::Setup(e));
        }

        let shared = self.shared.clone();
        let backend = self.backend.clone();
        let retention = self.config.retention;
        let handle = thread::Builder::new()
            .name("frame-fetcher".into())
            .spawn(move || {
                while !shared.shutdown.load(Ordering::Acquire) {
                    if !run_iteration(&shared, backend.as_ref(), retention) {
                        break;
                    }
                }
                debug!("Frame fetcher exiting");
            })
            .map_err(|e| {
                self.backend.close();
                ProviderError::Spawn(e)
            })?;

        *fetcher = Some(handle);
        info!("Frame fetching started");
        Ok(())
    }

    fn setup_buffers(&self) -> Result<(), CaptureError> {
        let mut pool = Vec::with_capacity(self.config.buffer_count);
        for _ in 0..self.config.buffer_count {
            match self.backend.allocate_buffer() {
                Ok(frame) => pool.push(frame),
                Err(e) => {
                    warn!("Failed creating capture buffer: {}", e);
                    for frame in pool {
                        self.backend.release_buffer(frame);
                    }
                    return Err(e);
                }
            }
        }

        let mut pool = pool.into_iter();
        while let Some(frame) = pool.next() {
            if let Err(RecycleError { frame, error }) = self.backend.enqueue_buffer(frame) {
                warn!("Failed enqueueing capture buffer: {}", error);
                self.backend.release_buffer(frame);
                for frame in pool {
                    self.backend.release_buffer(frame);
                }
                return Err(error);
            }
        }
        Ok(())
    }

    /// Block until a frame is available and take the most recent one.
    ///
    /// Returns `None` once the provider has been stopped and nothing is left
    /// to deliver.
    pub fn get_newest_frame(&self) -> Option<Frame> {
        let mut queues = self.shared.lock();
        loop {
            if let Some(frame) = queues.delivered.pop_back() {
                return Some(frame);
            }
            if self.shared.shutdown.load(Ordering::Acquire) {
                return None;
            }
            queues = self
                .shared
                .frame_delivered
                .wait(queues)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Hand a consumed frame back for recycling.
    pub fn return_frame(&self, frame: Frame) {
        self.shared.lock().processed.push_back(frame);
    }

    /// Stop fetching and join the fetcher.
    ///
    /// The stream is closed before joining so that a fetcher blocked in the
    /// backend wakes up. Safe to call repeatedly or without a blocked consumer.
    pub fn stop(&self) -> Result<(), ProviderError> {
        self.shared.shutdown.store(true, Ordering::Release);
        self.backend.close();
        {
            // Take the lock so a consumer between its check and its wait
            // cannot miss the wakeup.
            let _queues = self.shared.lock();
            self.shared.frame_delivered.notify_all();
        }

        let handle = self
            .fetcher
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.join().map_err(|_| ProviderError::Join)?;
            info!("Frame fetching stopped");
        }
        Ok(())
    }

    /// Lengths of the delivered and processed queues.
    pub fn queue_lengths(&self) -> (usize, usize) {
        let queues = self.shared.lock();
        (queues.delivered.len(), queues.processed.len())
    }

    pub fn stats(&self) -> ProviderStats {
        let stats = &self.shared.stats;
        ProviderStats {
            frames_delivered: stats.frames_delivered.load(Ordering::Relaxed),
            frames_recycled: stats.frames_recycled.load(Ordering::Relaxed),
            frames_dropped: stats.frames_dropped.load(Ordering::Relaxed),
            capture_errors: stats.capture_errors.load(Ordering::Relaxed),
            recycle_errors: stats.recycle_errors.load(Ordering::Relaxed),
        }
    }
}

impl Drop for FrameProvider {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

/// One fetch-deliver-recycle step. Returns `false` once the stream is closed.
fn run_iteration(shared: &Shared, backend: &dyn CaptureBackend, retention: usize) -> bool {
    let frame = match backend.get_buffer() {
        Ok(frame) => frame,
        Err(CaptureError::Closed) => return false,
        Err(e) => {
            // Transient: the stream is expected to recover.
            warn!("Failed fetching frame: {}", e);
            shared.stats.capture_errors.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("capture_errors").increment(1);
            return true;
        }
    };

    let recycle = {
        let mut queues = shared.lock();
        queues.delivered.push_back(frame);
        shared.stats.frames_delivered.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("capture_frames_delivered").increment(1);

        // Buffers the consumer is done with go back first. Otherwise keep the
        // newest frame plus `retention` older ones and recycle the oldest.
        let recycle = match queues.processed.pop_front() {
            Some(frame) => Some(frame),
            // `+ 1` for the newest frame: 8 buffers, retention 2 and 10
            // frames with no consumer leave 3 delivered and 5 with the device.
            None if queues.delivered.len() > retention + 1 => {
                shared.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                queues.delivered.pop_front()
            }
            None => None,
        };
        shared.frame_delivered.notify_one();
        recycle
    };

    if let Some(frame) = recycle {
        match backend.enqueue_buffer(frame) {
            Ok(()) => {
                shared.stats.frames_recycled.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("capture_frames_recycled").increment(1);
            }
            Err(RecycleError { frame, error }) => {
                if shared.shutdown.load(Ordering::Acquire) {
                    backend.release_buffer(frame);
                    return false;
                }
                warn!("Failed enqueueing buffer {}: {}", frame.id(), error);
                shared.stats.recycle_errors.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("capture_recycle_errors").increment(1);
                // Retry this buffer first on the next iteration.
                shared.lock().processed.push_front(frame);
            }
        }
    }
    true
}
