use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};

use colorcheck::analysis::{AnalysisError, AnalysisLoop, AnalysisSettings, PickError, Picker};
use colorcheck::capture::{CaptureBackend, Pattern, PixelFormat, StreamInfo, SyntheticCapture};
use colorcheck::color_area::Color;
use colorcheck::params::{ParamStore, Params};
use colorcheck::pipeline::{FrameProvider, ProviderConfig};
use colorcheck::publish::{EventEmitter, PolledVariable, StateReporter};

const PATCH: [u8; 3] = [200, 100, 50];

struct Harness {
    backend: Arc<SyntheticCapture>,
    provider: Arc<FrameProvider>,
    params: Arc<ParamStore>,
    events: Arc<EventEmitter>,
    variable: Arc<PolledVariable>,
}

fn harness(params: Params, frame_limit: Option<u64>) -> (Harness, AnalysisLoop, Picker) {
    let mut capture = SyntheticCapture::open(StreamInfo {
        width: 64,
        height: 48,
        format: PixelFormat::Rgb24,
    })
    .unwrap()
    .with_pattern(Pattern::Patch {
        background: [0, 0, 0],
        color: PATCH,
        x: 16,
        y: 12,
        width: 32,
        height: 24,
    })
    .with_frame_interval(Duration::from_millis(2));
    if let Some(limit) = frame_limit {
        capture = capture.with_frame_limit(limit);
    }
    let backend = Arc::new(capture);
    let dyn_backend: Arc<dyn CaptureBackend> = backend.clone();
    let provider = Arc::new(FrameProvider::new(dyn_backend, ProviderConfig::default()));

    let params = Arc::new(ParamStore::new(params));
    let variable = Arc::new(PolledVariable::new(false, Duration::from_millis(1000)));
    let events = Arc::new(EventEmitter::declare());
    let (analysis, picker) = AnalysisLoop::new(
        Arc::clone(&provider),
        Arc::clone(&params),
        StateReporter::new(Arc::clone(&variable), Arc::clone(&events)),
        AnalysisSettings {
            pick_timeout: Duration::from_secs(2),
            debug_dir: None,
        },
    );
    (
        Harness {
            backend,
            provider,
            params,
            events,
            variable,
        },
        analysis,
        picker,
    )
}

fn marker_params() -> Params {
    Params {
        center_x: 32,
        center_y: 24,
        marker_width: 16,
        marker_height: 12,
        color_r: 0.0,
        color_g: 0.0,
        color_b: 0.0,
        tolerance: 10,
        ..Params::default()
    }
}

fn spawn(analysis: AnalysisLoop) -> (Arc<AnalysisLoop>, JoinHandle<Result<(), AnalysisError>>) {
    let analysis = Arc::new(analysis);
    let handle = {
        let analysis = Arc::clone(&analysis);
        thread::spawn(move || analysis.run())
    };
    (analysis, handle)
}

fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn tick_reports_match_against_reference() {
    let params = Params {
        color_r: 200.0,
        color_g: 100.0,
        color_b: 50.0,
        ..marker_params()
    };
    let (h, analysis, _picker) = harness(params, Some(3));
    h.provider.start().unwrap();

    assert!(analysis.derived_state().published().is_none());
    let before = SystemTime::now();
    let frame = h.provider.get_newest_frame().unwrap();
    assert!(analysis.tick(&frame).unwrap());
    h.provider.return_frame(frame);

    let published = analysis.derived_state().published().unwrap();
    assert!(published.value);
    assert!(published.at >= before);
    assert_eq!(analysis.derived_state().get(), Some(true));
    assert!(h.variable.read());
    assert!(h.events.active());
    h.provider.stop().unwrap();
}

#[test]
fn parameter_change_forces_recalibration() {
    let (h, analysis, _picker) = harness(marker_params(), None);
    h.provider.start().unwrap();

    let frame = h.provider.get_newest_frame().unwrap();
    assert!(!analysis.tick(&frame).unwrap());

    // Adopt the patch color as reference, then move the marker onto the background
    h.params
        .update([("ColorR", 200.0), ("ColorG", 100.0), ("ColorB", 50.0)])
        .unwrap();
    assert!(analysis.tick(&frame).unwrap());

    h.params.update([("CenterX", 4.0), ("CenterY", 4.0)]).unwrap();
    assert!(!analysis.tick(&frame).unwrap());

    h.provider.return_frame(frame);
    h.provider.stop().unwrap();
}

#[test]
fn events_are_debounced_across_ticks() {
    let (h, analysis, _picker) = harness(marker_params(), None);
    let mut events = h.events.subscribe();
    h.provider.start().unwrap();
    let frame = h.provider.get_newest_frame().unwrap();

    let mut tick_with_reference = |color: [f64; 3]| {
        h.params
            .update([("ColorR", color[0]), ("ColorG", color[1]), ("ColorB", color[2])])
            .unwrap();
        analysis.tick(&frame).unwrap()
    };
    let matching = [200.0, 100.0, 50.0];
    let other = [0.0, 0.0, 255.0];
    let states: Vec<bool> = [matching, matching, other, other, matching]
        .into_iter()
        .map(&mut tick_with_reference)
        .collect();
    assert_eq!(states, [true, true, false, false, true]);

    let mut received = Vec::new();
    while let Ok(event) = events.try_recv() {
        received.push(event.active);
    }
    assert_eq!(received, [true, false, true]);

    h.provider.return_frame(frame);
    h.provider.stop().unwrap();
}

#[test]
fn unknown_marker_shape_is_fatal() {
    let params = Params {
        marker_shape: 7,
        ..marker_params()
    };
    let (h, analysis, _picker) = harness(params, None);
    h.provider.start().unwrap();

    let (_analysis, handle) = spawn(analysis);
    let err = handle.join().unwrap().unwrap_err();
    assert!(matches!(err, AnalysisError::MarkerShape(_)));
    assert!(err.is_fatal());
    h.provider.stop().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pick_current_adopts_the_measured_color() {
    let (h, analysis, picker) = harness(marker_params(), None);
    h.provider.start().unwrap();
    let (analysis, handle) = spawn(analysis);
    let derived = analysis.derived_state();

    let derived_probe = Arc::clone(&derived);
    tokio::task::spawn_blocking(move || {
        wait_until("first analysed frame", || derived_probe.get() == Some(false))
    })
    .await
    .unwrap();

    let color = picker.pick().await.unwrap();
    assert_eq!(color, Color::new(200.0, 100.0, 50.0));
    assert_eq!(h.params.snapshot().color(), color);

    let derived_probe = Arc::clone(&derived);
    tokio::task::spawn_blocking(move || {
        wait_until("match after pick", || derived_probe.get() == Some(true))
    })
    .await
    .unwrap();

    h.provider.stop().unwrap();
    handle.join().unwrap().unwrap();

    // With the loop gone a pick fails instead of hanging
    drop(analysis);
    assert_eq!(picker.pick().await, Err(PickError::Unavailable));
    assert!(h.backend.released_count() > 0);
}

#[tokio::test]
async fn pick_times_out_without_frames() {
    let (h, analysis, picker) = harness(marker_params(), Some(0));
    h.provider.start().unwrap();
    // Never run, but alive: requests are accepted and never answered
    let _analysis = analysis;

    let started = Instant::now();
    let timeout = tokio::time::timeout(Duration::from_secs(5), picker.pick()).await;
    assert_eq!(timeout.unwrap(), Err(PickError::Timeout));
    assert!(started.elapsed() >= Duration::from_secs(2));
    h.provider.stop().unwrap();
}
