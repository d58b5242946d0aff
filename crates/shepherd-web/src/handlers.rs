//! HTTP request handlers: boundary API endpoints and push channels.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::ws::{Message, Utf8Bytes, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::response::{Json, Response};
use chrono::Utc;
use serde::Deserialize;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, warn};
use utoipa::IntoParams;

use shepherd_core::api::{
    AckRequest, AckResponse, HealthResponse, InfoResponse, IngestRequest, IngestResponse,
    LogsResponse, StatsResponse,
};
use shepherd_core::hub::Payload;
use shepherd_core::model::PushMessage;

use crate::state::{AppState, ChannelGuard};

/// Records returned by `/logs` when no limit is given.
const DEFAULT_LOGS_LIMIT: usize = 100;

// ============================================================
// Info / health
// ============================================================

#[utoipa::path(
    get,
    path = "/",
    responses(
        (status = 200, description = "Service overview", body = InfoResponse)
    )
)]
pub(crate) async fn handle_info(State(state): State<AppState>) -> Json<InfoResponse> {
    let pipeline = &state.pipeline;
    Json(InfoResponse {
        service: "shepherd".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        active_subscribers: pipeline.hub().subscriber_count(),
        buffered_records: pipeline.aggregator().len(),
        capacity: pipeline.capacity(),
    })
}

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

#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse)
    )
)]
pub(crate) async fn handle_health_check() -> Json<HealthResponse> {
    Json(HealthResponse::healthy("shepherd"))
}

// ============================================================
// Statistics and records
// ============================================================

#[utoipa::path(
    get,
    path = "/stats",
    responses(
        (status = 200, description = "All-time counters", body = StatsResponse)
    )
)]
pub(crate) async fn handle_stats(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(state.pipeline.stats().into())
}

#[derive(Debug, Deserialize, IntoParams)]
pub(crate) struct LogsQuery {
    /// Maximum number of records (default 100, capped at the buffer capacity).
    limit: Option<usize>,
}

#[utoipa::path(
    get,
    path = "/logs",
    params(LogsQuery),
    responses(
        (status = 200, description = "Most recent records, oldest first", body = LogsResponse)
    )
)]
pub(crate) async fn handle_logs(
    State(state): State<AppState>,
    Query(query): Query<LogsQuery>,
) -> Json<LogsResponse> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_LOGS_LIMIT)
        .min(state.pipeline.capacity());
    Json(LogsResponse {
        logs: state.pipeline.recent(limit),
    })
}

// ============================================================
// HTTP ingestion
// ============================================================

#[utoipa::path(
    post,
    path = "/api/logs",
    request_body = IngestRequest,
    responses(
        (status = 200, description = "Lines parsed, stored and broadcast", body = IngestResponse)
    )
)]
pub(crate) async fn handle_ingest(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Json(request): Json<IngestRequest>,
) -> Json<IngestResponse> {
    let mut log_ids = Vec::new();
    let mut discarded = 0;
    for line in request.lines() {
        if line.len() + 1 > state.max_line_bytes {
            discarded += 1;
            continue;
        }
        log_ids.push(state.pipeline.ingest(line, Some(peer)).id);
    }
    if discarded > 0 {
        warn!(peer = %peer, discarded, limit = state.max_line_bytes, "discarding over-long lines");
    }
    Json(IngestResponse {
        status: "success".to_string(),
        log_ids,
        discarded,
    })
}

// ============================================================
// Acknowledge
// ============================================================

#[utoipa::path(
    post,
    path = "/acknowledge",
    request_body = AckRequest,
    responses(
        (status = 200, description = "Record acknowledged (or already was)", body = AckResponse),
        (status = 404, description = "No such record in the recent buffer", body = AckResponse)
    )
)]
pub(crate) async fn handle_acknowledge(
    State(state): State<AppState>,
    Json(request): Json<AckRequest>,
) -> (StatusCode, Json<AckResponse>) {
    let at = request.acknowledged_at(Utc::now());
    let outcome = state.pipeline.acknowledge(request.log_id, at);
    let response = AckResponse::new(request.log_id, outcome);
    let status = if response.is_found() {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    };
    (status, Json(response))
}

// ============================================================
// Push channels
// ============================================================

fn ping_interval(period: Duration) -> Interval {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

fn ping_json() -> String {
    serde_json::to_string(&PushMessage::Ping).unwrap_or_else(|e| {
        error!(error = %e, "failed to serialize ping");
        r#"{"type":"ping"}"#.to_string()
    })
}

fn sse_event(payload: &Payload) -> Event {
    Event::default().event(payload.kind()).data(payload.as_str())
}

#[utoipa::path(
    get,
    path = "/api/v1/stream",
    responses(
        (status = 200, description = "Server-Sent Events (text/event-stream) carrying log, ack and ping messages")
    )
)]
pub(crate) async fn handle_stream(
    State(state): State<AppState>,
) -> Sse<impl futures_core::Stream<Item = Result<Event, Infallible>>> {
    let mut subscription = state.pipeline.subscribe();
    let guard = ChannelGuard::new("sse", subscription.id(), &state);
    let period = state.ping_interval;

    let stream = async_stream::stream! {
        let _guard = guard;
        let ping = ping_json();
        let mut ticker = ping_interval(period);
        loop {
            let event = tokio::select! {
                next = subscription.recv() => match next {
                    Some(payload) => sse_event(&payload),
                    None => break,
                },
                _ = ticker.tick() => Event::default().event("ping").data(ping.as_str()),
            };
            yield Ok::<_, Infallible>(event);
        }
    };

    Sse::new(stream)
}

#[utoipa::path(
    get,
    path = "/ws",
    responses(
        (status = 101, description = "WebSocket upgrade; text frames carry log, ack and ping messages")
    )
)]
pub(crate) async fn handle_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| push_ws(socket, state))
}

async fn push_ws(mut socket: WebSocket, state: AppState) {
    let mut subscription = state.pipeline.subscribe();
    let _guard = ChannelGuard::new("websocket", subscription.id(), &state);
    let ping = Utf8Bytes::from(ping_json());
    let mut ticker = ping_interval(state.ping_interval);

    loop {
        tokio::select! {
            next = subscription.recv() => match next {
                Some(payload) => {
                    if let Err(e) = socket.send(Message::Text(payload.as_str().into())).await {
                        debug!(error = %e, "websocket send failed");
                        break;
                    }
                }
                None => {
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                }
            },
            _ = ticker.tick() => {
                if socket.send(Message::Text(ping.clone())).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    debug!(error = %e, "websocket receive failed");
                    break;
                }
                // Client frames carry nothing we act on.
                Some(Ok(_)) => {}
            },
        }
    }
}
