use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{json, Value};
use tower::ServiceExt;

use colorcheck::analysis::{AnalysisLoop, AnalysisSettings, DerivedState};
use colorcheck::app::App;
use colorcheck::capture::{BackendKind, CaptureBackend, Pattern, PixelFormat, Resolution, StreamInfo, SyntheticCapture};
use colorcheck::http::{router, HttpState};
use colorcheck::params::{ParamStore, Params};
use colorcheck::pipeline::{FrameProvider, ProviderConfig};
use colorcheck::publish::{EventEmitter, PolledVariable, ServerState, StateReporter};
use colorcheck::Config;

fn test_config() -> Config {
    let mut config = Config::default();
    config.capture.backend = BackendKind::Synthetic;
    config.capture.width = 64;
    config.capture.height = 48;
    config.capture.fps = 200;
    config.capture.format = PixelFormat::Rgb24;
    config.capture.resolutions = vec![Resolution::new(32, 24), Resolution::new(80, 60)];
    config.capture.pattern = Pattern::Uniform { color: [40, 80, 120] };
    config.http.bind = "127.0.0.1:0".into();
    config.opcua.host = "127.0.0.1".into();
    config.opcua.pki_dir = std::env::temp_dir().join("colorcheck-http-tests-pki");
    config.params = Params {
        center_x: 40,
        center_y: 30,
        marker_width: 20,
        marker_height: 20,
        port: 0,
        ..Params::default()
    };
    config
}

fn state_of(app: &App) -> HttpState {
    HttpState {
        derived: Arc::clone(app.derived_state()),
        picker: app.picker().clone(),
        params: Arc::clone(app.params()),
    }
}

async fn call(state: HttpState, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut request = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(json) => {
            request = request.header("content-type", "application/json");
            Body::from(json.to_string())
        }
        None => Body::empty(),
    };
    let response = router(state).oneshot(request.body(body).unwrap()).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), 64 * 1024).await.unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

async fn wait_for_status(derived: &DerivedState, expected: bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while derived.get() != Some(expected) {
        assert!(Instant::now() < deadline, "status never became {expected}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn status_and_pick_current_round_trip() {
    let app = App::start(test_config()).await.unwrap();

    // Smallest offered size covering 64x48 was chosen and reported
    let params = app.params().snapshot();
    assert_eq!((params.width, params.height), (80, 60));

    wait_for_status(app.derived_state(), false).await;
    let (code, body) = call(state_of(&app), "GET", "/getstatus.cgi", None).await;
    assert_eq!(code, StatusCode::OK);
    assert_eq!(body, json!({ "status": false }));

    let (code, body) = call(state_of(&app), "POST", "/pickcurrent.cgi", None).await;
    assert_eq!(code, StatusCode::OK);
    assert_eq!(body, json!({ "R": 40.0, "G": 80.0, "B": 120.0 }));

    wait_for_status(app.derived_state(), true).await;
    let (code, body) = call(state_of(&app), "GET", "/status", None).await;
    assert_eq!(code, StatusCode::OK);
    assert_eq!(body, json!({ "status": true }));

    app.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn params_are_validated_before_applying() {
    let app = App::start(test_config()).await.unwrap();

    let (code, body) = call(state_of(&app), "GET", "/params", None).await;
    assert_eq!(code, StatusCode::OK);
    assert_eq!(body["CenterX"], json!(40));
    assert_eq!(body["MarkerShape"], json!(0));

    let (code, _) = call(
        state_of(&app),
        "POST",
        "/params",
        Some(json!({ "CenterX": 10, "Tolerance": 300 })),
    )
    .await;
    assert_eq!(code, StatusCode::BAD_REQUEST);
    assert_eq!(app.params().snapshot().center_x, 40);

    let (code, _) = call(state_of(&app), "POST", "/params", Some(json!({ "Width": 10 }))).await;
    assert_eq!(code, StatusCode::BAD_REQUEST);

    let (code, body) = call(
        state_of(&app),
        "POST",
        "/params",
        Some(json!({ "root.ColorChecker.CenterX": "12", "Tolerance": 5 })),
    )
    .await;
    assert_eq!(code, StatusCode::OK);
    assert_eq!(body["CenterX"], json!(12));
    assert_eq!(body["Tolerance"], json!(5));

    app.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn port_change_relaunches_the_variable_server() {
    let app = App::start(test_config()).await.unwrap();
    let server = Arc::clone(app.variable_server());
    let first = server.local_addr().unwrap();
    assert_eq!(server.state(), ServerState::Running);

    let port = {
        let free = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        free.local_addr().unwrap().port()
    };
    assert_ne!(port, first.port());

    let (code, body) = call(state_of(&app), "POST", "/params", Some(json!({ "Port": port }))).await;
    assert_eq!(code, StatusCode::OK);
    assert_eq!(body["Port"], json!(port));

    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let moved = server.local_addr().map(|addr| addr.port()) == Some(port);
        if moved && server.state() == ServerState::Running {
            break;
        }
        assert!(Instant::now() < deadline, "server never moved to port {port}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(server.published_value().is_some());

    app.shutdown().await.unwrap();
}

#[tokio::test]
async fn unknown_paths_are_rejected() {
    let app = App::start(test_config()).await.unwrap();
    let (code, body) = call(state_of(&app), "GET", "/reboot.cgi", None).await;
    assert_eq!(code, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], json!("Unknown command"));
    app.shutdown().await.unwrap();
}

#[tokio::test]
async fn status_before_first_frame_is_an_error() {
    let backend = Arc::new(
        SyntheticCapture::open(StreamInfo {
            width: 16,
            height: 16,
            format: PixelFormat::Rgb24,
        })
        .unwrap()
        .with_frame_limit(0),
    );
    let dyn_backend: Arc<dyn CaptureBackend> = backend;
    let provider = Arc::new(FrameProvider::new(dyn_backend, ProviderConfig::default()));
    let params = Arc::new(ParamStore::default());
    let (analysis, picker) = AnalysisLoop::new(
        Arc::clone(&provider),
        Arc::clone(&params),
        StateReporter::new(
            Arc::new(PolledVariable::new(false, Duration::from_secs(1))),
            Arc::new(EventEmitter::declare()),
        ),
        AnalysisSettings {
            pick_timeout: Duration::from_millis(50),
            debug_dir: None,
        },
    );
    let state = HttpState {
        derived: analysis.derived_state(),
        picker,
        params,
    };

    let (code, _) = call(state.clone(), "GET", "/getstatus.cgi", None).await;
    assert_eq!(code, StatusCode::INTERNAL_SERVER_ERROR);

    let (code, _) = call(state, "GET", "/pickcurrent", None).await;
    assert_eq!(code, StatusCode::INTERNAL_SERVER_ERROR);
}
