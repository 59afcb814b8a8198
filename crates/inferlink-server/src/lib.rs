//! HTTP/WebSocket front end of the broker.
//!
//! Clients connect on `/connection/client`, workers on `/connection/worker`
//! with their access key in the `access_key` cookie. Everything past the
//! handshake is handed to [`libinferlink`].

pub mod connection;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::extract::ws::WebSocketUpgrade;
use axum::http::header::COOKIE;
use axum::http::{HeaderMap, HeaderValue, Method};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use inferlink_protocol::{GroupId, MAX_WORKER_FRAME_BYTES, Population, WORKER_ACCESS_COOKIE};
use libinferlink::{Admission, ConnectionManager};
use serde::Serialize;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

pub struct AppState {
    pub manager: Arc<ConnectionManager>,
    pub admission: Arc<dyn Admission>,
}

impl AppState {
    pub fn new(manager: Arc<ConnectionManager>, admission: Arc<dyn Admission>) -> Arc<Self> {
        Arc::new(Self { manager, admission })
    }
}

#[derive(Serialize, Debug)]
pub struct StatusReport {
    #[serde(flatten)]
    pub population: Population,
    /// Group ids waiting for a worker, head first.
    pub queue: Vec<GroupId>,
}

pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/connection/client", get(ws_client))
        .route("/connection/worker", get(ws_worker))
        .route("/api/status", get(api_status))
        .with_state(state)
}

/// CORS for the status endpoint and both upgrade routes. All of them are
/// plain GETs. Blank `--allow-origin` entries are ignored; none left, or a
/// `*` among them, allows any origin.
pub fn build_cors(origins: &[String]) -> Result<CorsLayer> {
    Ok(CorsLayer::new()
        .allow_origin(allowed_origins(origins)?)
        .allow_methods([Method::GET])
        .allow_headers(Any))
}

fn allowed_origins(origins: &[String]) -> Result<AllowOrigin> {
    let origins: Vec<&str> = origins
        .iter()
        .map(|origin| origin.trim())
        .filter(|origin| !origin.is_empty())
        .collect();
    if origins.is_empty() || origins.contains(&"*") {
        return Ok(AllowOrigin::any());
    }
    origins
        .into_iter()
        .map(|origin| {
            HeaderValue::from_str(origin)
                .with_context(|| format!("invalid --allow-origin value: {origin}"))
        })
        .collect::<Result<Vec<_>>>()
        .map(AllowOrigin::list)
}

/// Value of cookie `name` across every `Cookie` header.
pub fn cookie_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.trim_matches('"'))
}

async fn api_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(StatusReport {
        population: state.manager.population().await,
        queue: state.manager.queued_group_ids().await,
    })
}

async fn ws_client(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let admitted = state.admission.admit_client(None);
    ws.on_upgrade(move |socket| async move {
        if admitted {
            connection::serve_client(socket, Arc::clone(&state.manager)).await;
        } else {
            connection::reject_client(socket).await;
        }
    })
}

async fn ws_worker(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let admitted = state
        .admission
        .admit_worker(cookie_value(&headers, WORKER_ACCESS_COOKIE));
    ws.max_message_size(MAX_WORKER_FRAME_BYTES)
        .max_frame_size(MAX_WORKER_FRAME_BYTES)
        .on_upgrade(move |socket| async move {
            if admitted {
                connection::serve_worker(socket, Arc::clone(&state.manager)).await;
            } else {
                connection::reject_worker(socket).await;
            }
        })
}
