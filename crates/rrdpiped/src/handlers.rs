//! HTTP request handlers: query and discovery endpoints, SSE streaming.

use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json, Response};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use rrdpipe_core::ReportingConfig;
use rrdpipe_core::error::ReportingError;
use rrdpipe_core::events::{EventSource, SourceEvent};
use rrdpipe_core::query::{ExportRecord, WindowQuery};
use rrdpipe_core::realtime::{REALTIME_INTERVAL, RealtimeSampler};
use rrdpipe_core::service::{GraphInfo, GraphRequest};

use crate::state::{AppState, SSE_CONNECTIONS};

// ============================================================
// Errors
// ============================================================

/// JSON error body returned by every failing endpoint.
#[derive(Debug, Serialize, utoipa::ToSchema)]
pub(crate) struct ErrorBody {
    /// Stable error discriminant, e.g. `not_found`.
    kind: String,
    message: String,
}

#[derive(Debug)]
pub(crate) struct ApiError {
    status: StatusCode,
    kind: &'static str,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            kind: "validation",
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            kind: "internal",
            message: message.into(),
        }
    }
}

fn status_for(err: &ReportingError) -> StatusCode {
    match err {
        ReportingError::NotFound(_) | ReportingError::NoData { .. } => StatusCode::NOT_FOUND,
        ReportingError::Validation(_) => StatusCode::BAD_REQUEST,
        ReportingError::QueryExecution { .. } => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<ReportingError> for ApiError {
    fn from(err: ReportingError) -> Self {
        let status = status_for(&err);
        if status.is_server_error() {
            warn!(kind = err.kind(), error = %err, "request failed");
        }
        Self {
            status,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            kind: self.kind.to_string(),
            message: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

/// Runs blocking service work off the async workers.
async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, ReportingError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError::internal(format!("worker task failed: {e}")))?
        .map_err(ApiError::from)
}

// ============================================================
// Health
// ============================================================

#[utoipa::path(
    get,
    path = "/api/v1/health",
    responses(
        (status = 200, description = "Service is healthy", body = String)
    )
)]
pub(crate) async fn handle_health() -> &'static str {
    "ok"
}

// ============================================================
// Config
// ============================================================

#[utoipa::path(
    get,
    path = "/api/v1/config",
    responses(
        (status = 200, description = "Active reporting configuration", body = ReportingConfig)
    )
)]
pub(crate) async fn handle_config(State(state): AppState) -> Json<ReportingConfig> {
    Json(state.service.config().clone())
}

// ============================================================
// Discovery
// ============================================================

#[utoipa::path(
    get,
    path = "/api/v1/graphs",
    responses(
        (status = 200, description = "Every registered graph with its current identifiers", body = Vec<GraphInfo>)
    )
)]
pub(crate) async fn handle_graphs(State(state): AppState) -> Result<Json<Vec<GraphInfo>>, ApiError> {
    let service = Arc::clone(&state.service);
    // Discovery walks the archive tree.
    let graphs = blocking(move || Ok(service.graphs())).await?;
    Ok(Json(graphs))
}

// ============================================================
// Query
// ============================================================

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub(crate) struct DataRequest {
    /// Graphs to export; omitted means every graph with data.
    #[serde(default)]
    graphs: Option<Vec<GraphRequest>>,
    #[serde(default)]
    query: WindowQuery,
}

#[utoipa::path(
    post,
    path = "/api/v1/data",
    request_body = DataRequest,
    responses(
        (status = 200, description = "One export per requested graph, in request order", body = Vec<ExportRecord>),
        (status = 400, description = "Invalid window", body = ErrorBody),
        (status = 404, description = "Unknown graph or no archives", body = ErrorBody),
        (status = 500, description = "Invalid aggregation or plugin definition", body = ErrorBody),
        (status = 502, description = "Archive tool failed", body = ErrorBody)
    )
)]
pub(crate) async fn handle_data(
    State(state): AppState,
    Json(request): Json<DataRequest>,
) -> Result<Json<Vec<ExportRecord>>, ApiError> {
    let service = Arc::clone(&state.service);
    let records = blocking(move || match request.graphs {
        Some(graphs) => service.get_data(&graphs, &request.query),
        None => service.get_all(&request.query),
    })
    .await?;
    Ok(Json(records))
}

// ============================================================
// SSE streams
// ============================================================

struct SseGuard;

impl SseGuard {
    fn open(stream: &'static str) -> Self {
        let active = SSE_CONNECTIONS.fetch_add(1, Ordering::Relaxed) + 1;
        info!(stream, active_connections = active, "SSE client connected");
        Self
    }
}

impl Drop for SseGuard {
    fn drop(&mut self) {
        let active = SSE_CONNECTIONS.fetch_sub(1, Ordering::Relaxed) - 1;
        info!(active_connections = active, "SSE client disconnected");
    }
}

#[derive(Debug, Deserialize, utoipa::IntoParams)]
pub(crate) struct StreamQuery {
    /// JSON array of `{name, identifier?}` graphs to follow.
    graphs: String,
}

fn parse_stream_graphs(raw: &str) -> Result<Vec<GraphRequest>, ApiError> {
    let graphs: Vec<GraphRequest> = serde_json::from_str(raw)
        .map_err(|e| ApiError::bad_request(format!("invalid graphs parameter: {e}")))?;
    if graphs.is_empty() {
        return Err(ApiError::bad_request("graphs parameter is empty"));
    }
    Ok(graphs)
}

#[utoipa::path(
    get,
    path = "/api/v1/stream",
    params(StreamQuery),
    responses(
        (status = 200, description = "SSE stream of ADDED events carrying lagged exports"),
        (status = 400, description = "Malformed graphs parameter", body = ErrorBody),
        (status = 404, description = "Unknown graph", body = ErrorBody)
    )
)]
pub(crate) async fn handle_stream(
    State(state): AppState,
    Query(query): Query<StreamQuery>,
) -> Result<Sse<impl futures_core::Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let graphs = parse_stream_graphs(&query.graphs)?;
    let source = EventSource::new(
        Arc::clone(&state.service),
        Arc::clone(&state.router),
        Arc::clone(&state.limiter),
        graphs,
    )?;
    let (handle, mut events) = source.start();
    let mut shutdown = state.shutdown.clone();

    let stream = async_stream::stream! {
        let _guard = SseGuard::open("live");
        // Dropping the handle with the stream cancels the source.
        let _handle = handle;
        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.changed() => None,
                event = events.recv() => event,
            };
            let Some(event) = next else {
                break;
            };
            let json = match &event {
                SourceEvent::Added(record) => serde_json::to_string(record),
            };
            match json {
                Ok(json) => {
                    yield Ok(Event::default().event(event.name()).data(json));
                }
                Err(e) => {
                    error!(error = %e, "failed to serialize export");
                }
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

#[utoipa::path(
    get,
    path = "/api/v1/realtime",
    responses(
        (status = 200, description = "SSE stream of ADDED events carrying CPU usage, core temperatures and memory usage")
    )
)]
pub(crate) async fn handle_realtime(
    State(state): AppState,
) -> Sse<impl futures_core::Stream<Item = Result<Event, Infallible>>> {
    let mut sampler =
        RealtimeSampler::with_proc_root(state.service.filesystem(), state.proc_root.clone())
            .with_sys_root(state.sys_root.clone());
    let mut shutdown = state.shutdown.clone();

    let stream = async_stream::stream! {
        let _guard = SseGuard::open("realtime");
        let mut ticker = tokio::time::interval(REALTIME_INTERVAL);
        loop {
            let stop = tokio::select! {
                biased;
                _ = shutdown.changed() => true,
                _ = ticker.tick() => false,
            };
            if stop {
                break;
            }
            // procfs and sysfs reads block.
            let sampled = tokio::task::spawn_blocking(move || {
                let sample = sampler.sample();
                (sampler, sample)
            })
            .await;
            let sample = match sampled {
                Ok((returned, sample)) => {
                    sampler = returned;
                    sample
                }
                Err(e) => {
                    error!(error = %e, "realtime sampler task failed");
                    break;
                }
            };
            let sample = match sample {
                Ok(sample) => sample,
                Err(e) => {
                    debug!(error = %e, "realtime sample failed");
                    continue;
                }
            };
            match serde_json::to_string(&sample) {
                Ok(json) => {
                    yield Ok(Event::default().event("ADDED").data(json));
                }
                Err(e) => {
                    error!(error = %e, "failed to serialize realtime sample");
                }
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}
