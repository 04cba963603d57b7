//! HTTP surface of the server.
//!
//! Producers publish over `POST /api/events`. Consumers either long-poll
//! `GET /api/updates` or hold a push stream open on `GET /events` (SSE) or
//! `GET /ws` (WebSocket).

use crate::config::Config;
use crate::metrics::{self, StreamMetricsGuard};
use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{HeaderMap, StatusCode},
    response::{sse::Sse, IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use futures_util::{stream::SplitSink, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tandem_core::{
    BusError, ConnectionId, EventBus, EventDraft, EventFilter, RawEventDraft, SubscribeRequest,
    WaitRequest, WaitStatus,
};
use tandem_protocol::{codes, EventId, EventType, Frame, Priority, ProtocolError};
use tandem_transport::{into_event_stream, sse_channel, websocket, WebSocketSink, WireFormat};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type SocketSink = WebSocketSink<SplitSink<WebSocket, Message>, Message>;

/// Shared server state.
pub struct AppState {
    /// The event bus.
    pub bus: EventBus,
    /// Server configuration.
    pub config: Config,
}

/// Build the application router.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/events", post(publish_handler).get(history_handler))
        .route("/api/updates", get(updates_handler))
        .route("/api/changes", get(changes_handler))
        .route("/api/metrics", get(metrics_handler))
        .route("/api/connections", get(connections_handler))
        .route("/api/connections/:id", delete(disconnect_handler))
        .route("/events", get(sse_handler))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

/// Run the HTTP server until `shutdown` is cancelled.
///
/// # Errors
///
/// Returns an error if the listener cannot be bound or the server fails.
pub async fn run_server(bus: EventBus, config: Config, shutdown: CancellationToken) -> Result<()> {
    let addr = config.bind_addr()?;

    if config.metrics.enabled {
        match metrics::start_metrics_server(config.metrics.port) {
            Ok(()) => {
                tokio::spawn(metrics::mirror_bus(
                    bus.clone(),
                    config.metrics.refresh_interval(),
                ));
            }
            Err(e) => warn!("Failed to start metrics server: {:#}", e),
        }
    }

    let state = Arc::new(AppState { bus, config });
    let listener = TcpListener::bind(addr).await?;

    info!("Tandem server listening on {}", addr);
    info!("SSE endpoint: http://{}/events", addr);
    info!("WebSocket endpoint: ws://{}/ws", addr);

    axum::serve(listener, app(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    Ok(())
}

/// A bus error rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(BusError);

impl From<BusError> for ApiError {
    fn from(err: BusError) -> Self {
        Self(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            BusError::Validation(_) | BusError::InvalidPattern { .. } => StatusCode::BAD_REQUEST,
            BusError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            BusError::Capacity(_) | BusError::NotRunning => StatusCode::SERVICE_UNAVAILABLE,
            BusError::UnknownConnection(_) => StatusCode::NOT_FOUND,
            BusError::ModeMismatch(_) => StatusCode::CONFLICT,
            BusError::InvalidConfig(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

fn error_kind(err: &BusError) -> &'static str {
    match err {
        BusError::Validation(_) => "validation",
        BusError::InvalidPattern { .. } => "invalid_pattern",
        BusError::RateLimited(_) => "rate_limited",
        BusError::Capacity(_) => "capacity",
        BusError::UnknownConnection(_) => "unknown_connection",
        BusError::ModeMismatch(_) => "mode_mismatch",
        BusError::InvalidConfig(_) => "invalid_config",
        BusError::NotRunning => "not_running",
    }
}

fn error_code(err: &BusError) -> u16 {
    match err {
        BusError::Validation(_) => codes::INVALID_FRAME,
        BusError::InvalidPattern { .. } => codes::INVALID_PATTERN,
        BusError::Capacity(_) => codes::CAPACITY,
        BusError::RateLimited(_) => codes::RATE_LIMITED,
        _ => codes::INTERNAL,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = error_kind(&self.0);
        metrics::record_error(kind);
        let body = Json(serde_json::json!({
            "error": kind,
            "message": self.0.to_string(),
        }));
        (self.status(), body).into_response()
    }
}

/// Split a comma-separated query value, dropping empty items.
fn split_list(value: Option<&str>) -> Vec<String> {
    value
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let running = state.bus.is_running();
    let status = if running {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(serde_json::json!({
            "status": if running { "ok" } else { "stopped" },
            "version": env!("CARGO_PKG_VERSION"),
            "latest_event_id": state.bus.latest_id(),
        })),
    )
}

async fn publish_handler(
    State(state): State<Arc<AppState>>,
    Json(raw): Json<RawEventDraft>,
) -> Result<impl IntoResponse, ApiError> {
    let draft = EventDraft::try_from(raw)?;
    let event = state.bus.publish(draft)?;
    Ok((StatusCode::CREATED, Json(event)))
}

/// Query of the history and long-poll endpoints.
#[derive(Debug, Default, Deserialize)]
struct EventQuery {
    /// Long-poll only.
    connection_id: Option<String>,
    /// Long-poll only; seconds, clamped by the bus.
    timeout: Option<u64>,
    /// Comma-separated target names.
    targets: Option<String>,
    /// Comma-separated event type names.
    types: Option<String>,
    since: Option<EventId>,
    min_priority: Option<String>,
    correlation_id: Option<String>,
}

impl EventQuery {
    fn to_filter(&self) -> Result<EventFilter, BusError> {
        let mut filter = EventFilter::new();
        let targets = split_list(self.targets.as_deref());
        if !targets.is_empty() {
            filter = filter.with_targets(targets);
        }
        let types = split_list(self.types.as_deref())
            .iter()
            .map(|t| t.parse::<EventType>())
            .collect::<Result<Vec<_>, _>>()?;
        if !types.is_empty() {
            filter = filter.with_types(types);
        }
        if let Some(since) = self.since {
            filter = filter.since(since);
        }
        if let Some(priority) = &self.min_priority {
            filter = filter.with_min_priority(priority.parse::<Priority>()?);
        }
        if let Some(id) = &self.correlation_id {
            filter = filter.with_correlation_id(id.clone());
        }
        Ok(filter)
    }
}

async fn history_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<EventQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let filter = query.to_filter()?;
    Ok(Json(state.bus.history(&filter)))
}

/// Long-poll for events after the connection's cursor.
///
/// A client that disconnects drops this future, which cancels the wait.
async fn updates_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<EventQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let request = WaitRequest {
        filter: query.to_filter()?,
        connection_id: parse_connection_id(query.connection_id.as_deref())?,
        timeout: query.timeout.map(Duration::from_secs),
    };
    let outcome = state
        .bus
        .wait_for_updates(request, &CancellationToken::new())
        .await?;

    let status = match outcome.status {
        WaitStatus::Updates => "updates",
        WaitStatus::Timeout => "timeout",
        WaitStatus::Cancelled => "cancelled",
    };
    metrics::record_wait(outcome.duration_ms, status);
    Ok(Json(outcome))
}

#[derive(Debug, Deserialize)]
struct ChangesQuery {
    since: Option<EventId>,
}

async fn changes_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ChangesQuery>,
) -> impl IntoResponse {
    Json(state.bus.changes_since(query.since))
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.bus.metrics())
}

async fn connections_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.bus.connections())
}

async fn disconnect_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state.bus.connection(&id).is_none() {
        return Err(BusError::UnknownConnection(id).into());
    }
    state.bus.unregister(&id);
    Ok(StatusCode::NO_CONTENT)
}

/// Parameters of a push stream.
#[derive(Debug, Default, Deserialize)]
struct StreamQuery {
    /// Comma-separated channel patterns; empty means `*`.
    channels: Option<String>,
    connection_id: Option<String>,
    since: Option<EventId>,
    /// `json` (default) or `msgpack`; WebSocket only.
    format: Option<String>,
}

impl StreamQuery {
    fn subscribe_request(&self, resume: Option<EventId>) -> Result<SubscribeRequest, BusError> {
        Ok(SubscribeRequest {
            connection_id: parse_connection_id(self.connection_id.as_deref())?,
            channels: split_list(self.channels.as_deref()),
            since: resume.or(self.since),
        })
    }
}

/// Client-supplied ids end up in SSE `id` fields and log lines.
fn parse_connection_id(id: Option<&str>) -> Result<Option<ConnectionId>, BusError> {
    id.map(ConnectionId::parse).transpose()
}

/// `Last-Event-ID` sent by a reconnecting `EventSource`.
fn last_event_id(headers: &HeaderMap) -> Option<EventId> {
    headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

async fn sse_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let (sink, messages) = sse_channel(state.bus.config().outbound_buffer);
    let subscription = state
        .bus
        .subscribe(query.subscribe_request(last_event_id(&headers))?, sink)?;
    debug!(connection = %subscription.connection_id, "SSE stream opened");

    let guard = StreamMetricsGuard::new("sse");
    let stream = into_event_stream(messages).map(move |event| {
        let _open = &guard;
        event
    });
    Ok(Sse::new(stream))
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<StreamQuery>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_websocket(socket, state, query))
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>, query: StreamQuery) {
    let _metrics_guard = StreamMetricsGuard::new("websocket");
    let (sender, mut receiver) = socket.split();
    let sink: SocketSink = WebSocketSink::new(sender, WireFormat::from_query(query.format.as_deref()));

    let subscribed = query
        .subscribe_request(None)
        .and_then(|request| state.bus.subscribe(request, sink.clone()));
    let subscription = match subscribed {
        Ok(subscription) => subscription,
        Err(e) => {
            warn!(error = %e, "WebSocket subscribe failed");
            let _ = sink.send_frame(&Frame::error(0, error_code(&e), e.to_string())).await;
            sink.shutdown().await;
            return;
        }
    };
    let connection_id = subscription.connection_id;
    let mut closed = subscription.closed;
    debug!(connection = %connection_id, "WebSocket connected");

    let mut peer_left = false;
    loop {
        tokio::select! {
            biased;

            // The bus dropped the stream: replaced, evicted, or shut down.
            _ = closed.cancelled() => break,

            msg = receiver.next() => {
                let frame = match msg {
                    Some(Ok(Message::Text(text))) => websocket::decode_text(&text),
                    Some(Ok(Message::Binary(data))) => websocket::decode_binary(&data),
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                        let _ = state.bus.touch(connection_id.as_str());
                        continue;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(connection = %connection_id, "WebSocket closed by peer");
                        peer_left = true;
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %connection_id, error = %e, "WebSocket error");
                        peer_left = true;
                        break;
                    }
                };

                match handle_frame(frame, &connection_id, &state, &sink).await {
                    Ok(FrameResult::Continue) => {}
                    Ok(FrameResult::Resubscribed(token)) => closed = token,
                    Ok(FrameResult::Close) => break,
                    Err(e) => {
                        debug!(connection = %connection_id, error = %e, "Failed to answer client frame");
                        peer_left = true;
                        break;
                    }
                }
            }
        }
    }

    // A stream already cancelled belongs to the bus; only tear down our own.
    if peer_left && !closed.is_cancelled() {
        state.bus.unsubscribe(connection_id.as_str());
    }
    sink.mark_closed();
    debug!(connection = %connection_id, "WebSocket disconnected");
}

enum FrameResult {
    Continue,
    Resubscribed(CancellationToken),
    Close,
}

/// Handle a decoded client frame.
async fn handle_frame(
    frame: Result<Frame, ProtocolError>,
    connection_id: &ConnectionId,
    state: &Arc<AppState>,
    sink: &SocketSink,
) -> Result<FrameResult, tandem_core::DeliveryError> {
    let id = connection_id.as_str();
    let frame = match frame {
        Ok(frame) => frame,
        Err(e) => {
            sink.send_frame(&Frame::error(0, codes::INVALID_FRAME, e.to_string()))
                .await?;
            return Ok(FrameResult::Continue);
        }
    };

    match frame {
        Frame::Ack { cursor, .. } => {
            if let Err(e) = state.bus.acknowledge(id, cursor) {
                debug!(connection = %id, error = %e, "Ack for unknown connection");
            }
            Ok(FrameResult::Continue)
        }

        Frame::Subscribe { id: request_id, channels } => {
            debug!(connection = %id, channels = ?channels, "Resubscribe request");
            // Resume from the acknowledged cursor so the switch neither skips nor repeats.
            let mut request = SubscribeRequest::new(connection_id.clone(), channels);
            if let Some(cursor) = state.bus.cursor(id) {
                request = request.since(cursor);
            }
            match state.bus.subscribe(request, sink.clone()) {
                Ok(subscription) => Ok(FrameResult::Resubscribed(subscription.closed)),
                Err(e) => {
                    warn!(connection = %id, error = %e, "Resubscribe failed");
                    sink.send_frame(&Frame::error(request_id, error_code(&e), e.to_string()))
                        .await?;
                    Ok(FrameResult::Continue)
                }
            }
        }

        Frame::Unsubscribe { .. } => {
            debug!(connection = %id, "Unsubscribe request");
            state.bus.unsubscribe(id);
            sink.shutdown().await;
            Ok(FrameResult::Close)
        }

        other => {
            warn!(connection = %id, frame_type = ?other.frame_type(), "Unexpected frame type");
            sink.send_frame(&Frame::error(
                0,
                codes::INVALID_FRAME,
                format!("unexpected {} frame", other.name()),
            ))
            .await?;
            Ok(FrameResult::Continue)
        }
    }
}
