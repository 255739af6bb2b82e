//! Query endpoints: status, pick-current and the parameter surface.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use serde_json::Value;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::analysis::{DerivedState, Picker};
use crate::params::{ParamError, ParamStore, Params};

#[derive(Clone)]
pub struct HttpState {
    pub derived: Arc<DerivedState>,
    pub picker: Picker,
    pub params: Arc<ParamStore>,
}

#[derive(Debug, Serialize)]
struct StatusBody {
    status: bool,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

fn error_response(code: StatusCode, message: impl ToString) -> Response {
    (
        code,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/getstatus.cgi", get(status))
        .route("/status", get(status))
        .route("/pickcurrent.cgi", get(pick_current).post(pick_current))
        .route("/pickcurrent", get(pick_current).post(pick_current))
        .route("/params", get(read_params).post(write_params))
        .fallback(unknown_command)
        .with_state(state)
}

async fn status(State(state): State<HttpState>) -> Response {
    match state.derived.get() {
        Some(status) => Json(StatusBody { status }).into_response(),
        None => error_response(StatusCode::INTERNAL_SERVER_ERROR, "no frame analysed yet"),
    }
}

async fn pick_current(State(state): State<HttpState>) -> Response {
    match state.picker.pick().await {
        Ok(color) => Json(color).into_response(),
        Err(e) => {
            warn!("Pick current color failed: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e)
        }
    }
}

async fn read_params(State(state): State<HttpState>) -> Json<Params> {
    Json(Params::clone(&state.params.snapshot()))
}

fn numeric(name: &str, value: &Value) -> Result<f64, ParamError> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| ParamError::Malformed {
        name: name.to_string(),
        value: value.to_string(),
    })
}

async fn write_params(
    State(state): State<HttpState>,
    Json(body): Json<HashMap<String, Value>>,
) -> Response {
    let updates: Result<Vec<(&str, f64)>, ParamError> = body
        .iter()
        .map(|(name, value)| Ok((name.as_str(), numeric(name, value)?)))
        .collect();

    match updates.and_then(|updates| state.params.update(updates)) {
        Ok(changes) => {
            info!("Applied {} parameter change(s) over HTTP", changes.len());
            Json(Params::clone(&state.params.snapshot())).into_response()
        }
        Err(e) => error_response(StatusCode::BAD_REQUEST, e),
    }
}

async fn unknown_command() -> Response {
    error_response(StatusCode::BAD_REQUEST, "Unknown command")
}

/// Serve until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    state: HttpState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("HTTP endpoints listening on http://{}", addr);
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}
