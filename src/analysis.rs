//! Analysis loop: newest frame in, within-tolerance state out.
//!
//! Each tick runs under one loop-wide lock. Parameter changes and pick
//! requests arrive over channels and are taken into that lock at the start of
//! a tick, so a tick always sees one consistent configuration.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use image::RgbImage;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use crate::capture::{DecodeError, Frame};
use crate::color_area::{
    Color, ColorArea, ColorAreaError, MarkerShape, RegionGeometry, UnknownMarkerShape,
};
use crate::params::{ParamChange, ParamStore};
use crate::pipeline::FrameProvider;
use crate::publish::StateReporter;

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("failed to decode frame: {0}")]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    ColorArea(#[from] ColorAreaError),
    #[error("invalid marker configuration: {0}")]
    MarkerShape(#[from] UnknownMarkerShape),
    #[error("analysis state lock poisoned")]
    Poisoned,
}

impl AnalysisError {
    /// Whether the loop has to stop. Undecodable frames are skipped.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, AnalysisError::Decode(_))
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PickError {
    #[error("no frame was analysed in time")]
    Timeout,
    #[error("analysis loop is not running")]
    Unavailable,
}

type PickReply = flume::Sender<Color>;

/// Requests the current average color of the marker region.
#[derive(Clone)]
pub struct Picker {
    requests: flume::Sender<PickReply>,
    timeout: Duration,
}

impl Picker {
    /// Wait for the loop to serve the request on one of its next ticks.
    pub async fn pick(&self) -> Result<Color, PickError> {
        let (tx, rx) = flume::bounded(1);
        self.requests
            .send_async(tx)
            .await
            .map_err(|_| PickError::Unavailable)?;
        match tokio::time::timeout(self.timeout, rx.recv_async()).await {
            Ok(Ok(color)) => Ok(color),
            Ok(Err(_)) => Err(PickError::Unavailable),
            Err(_) => Err(PickError::Timeout),
        }
    }
}

/// A within-tolerance state and when the loop published it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Published {
    pub value: bool,
    pub at: SystemTime,
}

/// Last published within-tolerance state; `None` until a frame was analysed.
#[derive(Debug, Default)]
pub struct DerivedState {
    last: Mutex<Option<Published>>,
}

impl DerivedState {
    pub fn get(&self) -> Option<bool> {
        self.published().map(|p| p.value)
    }

    pub fn published(&self) -> Option<Published> {
        *self.last.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set(&self, value: bool) {
        *self.last.lock().unwrap_or_else(|e| e.into_inner()) = Some(Published {
            value,
            at: SystemTime::now(),
        });
    }
}

#[derive(Debug, Clone, Default)]
pub struct AnalysisSettings {
    pub pick_timeout: Duration,
    /// Where crop and mask snapshots go on each evaluator rebuild.
    pub debug_dir: Option<PathBuf>,
}

struct LoopState {
    evaluator: Option<ColorArea>,
    reporter: StateReporter,
    pending_picks: Vec<PickReply>,
}

pub struct AnalysisLoop {
    provider: Arc<FrameProvider>,
    params: Arc<ParamStore>,
    changes: flume::Receiver<ParamChange>,
    picks: flume::Receiver<PickReply>,
    state: Mutex<LoopState>,
    derived: Arc<DerivedState>,
    debug_dir: Option<PathBuf>,
}

impl AnalysisLoop {
    pub fn new(
        provider: Arc<FrameProvider>,
        params: Arc<ParamStore>,
        reporter: StateReporter,
        settings: AnalysisSettings,
    ) -> (Self, Picker) {
        let (pick_tx, pick_rx) = flume::unbounded();
        let changes = params.subscribe();
        let analysis = Self {
            provider,
            params,
            changes,
            picks: pick_rx,
            state: Mutex::new(LoopState {
                evaluator: None,
                reporter,
                pending_picks: Vec::new(),
            }),
            derived: Arc::new(DerivedState::default()),
            debug_dir: settings.debug_dir,
        };
        let picker = Picker {
            requests: pick_tx,
            timeout: settings.pick_timeout,
        };
        (analysis, picker)
    }

    pub fn derived_state(&self) -> Arc<DerivedState> {
        Arc::clone(&self.derived)
    }

    /// Tick until the frame provider stops.
    pub fn run(&self) -> Result<(), AnalysisError> {
        info!("Analysis loop started");
        while let Some(frame) = self.provider.get_newest_frame() {
            let result = self.tick(&frame);
            self.provider.return_frame(frame);
            match result {
                Ok(_) => {}
                Err(e) if e.is_fatal() => {
                    error!("Analysis loop failed: {}", e);
                    self.drop_pending_picks();
                    return Err(e);
                }
                Err(e) => warn!("Skipping frame: {}", e),
            }
        }
        self.drop_pending_picks();
        info!("Analysis loop stopped");
        Ok(())
    }

    /// Evaluate one frame and publish the result.
    #[instrument(level = "trace", skip_all, fields(seq = frame.sequence()))]
    pub fn tick(&self, frame: &Frame) -> Result<bool, AnalysisError> {
        let started = Instant::now();
        let image = frame.to_rgb()?;

        let mut guard = self.state.lock().map_err(|_| AnalysisError::Poisoned)?;
        let state = &mut *guard;

        for change in self.changes.try_iter() {
            if change.name.affects_evaluator() && state.evaluator.take().is_some() {
                info!("{} changed, recalibrating", change.name);
            }
        }

        state.pending_picks.extend(self.picks.try_iter());
        if !state.pending_picks.is_empty() {
            if let Some(evaluator) = state.evaluator.take() {
                let color = evaluator.average_color(&image)?;
                self.params.record_picked_color(color);
                for reply in state.pending_picks.drain(..) {
                    // The requester may have given up already
                    let _ = reply.send(color);
                }
            }
        }

        let evaluator = match state.evaluator.take() {
            Some(evaluator) => evaluator,
            None => self.build_evaluator(&image)?,
        };
        let within = evaluator.is_within_tolerance(&image);
        state.evaluator = Some(evaluator);
        let within = within?;

        state.reporter.report(within, Instant::now());
        self.derived.set(within);

        metrics::histogram!("analysis_tick_us").record(started.elapsed().as_micros() as f64);
        debug!("Frame {} within tolerance: {}", frame.sequence(), within);
        Ok(within)
    }

    fn build_evaluator(&self, image: &RgbImage) -> Result<ColorArea, AnalysisError> {
        let params = self.params.snapshot();
        let shape = MarkerShape::try_from(params.marker_shape)?;
        let geometry = RegionGeometry {
            center_x: params.center_x,
            center_y: params.center_y,
            width: params.marker_width,
            height: params.marker_height,
            shape,
        };
        let evaluator = ColorArea::new(image, geometry, params.color(), params.tolerance);
        if let Some(dir) = &self.debug_dir {
            save_snapshots(&evaluator, image, dir);
        }
        Ok(evaluator)
    }

    fn drop_pending_picks(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.pending_picks.clear();
        }
        // Requests still in the channel are dropped with it
        for _ in self.picks.try_iter() {}
    }
}

fn save_snapshots(evaluator: &ColorArea, image: &RgbImage, dir: &std::path::Path) {
    let result = std::fs::create_dir_all(dir)
        .map_err(image::ImageError::IoError)
        .and_then(|_| match evaluator.crop_image(image) {
            Ok(crop) => crop.save(dir.join("crop.png")),
            Err(e) => {
                warn!("No crop snapshot: {}", e);
                Ok(())
            }
        })
        .and_then(|_| evaluator.mask_image().save(dir.join("mask.png")));
    if let Err(e) = result {
        warn!("Failed to write marker snapshots to {}: {}", dir.display(), e);
    }
}
