use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    http::header,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use serde_json::json;
use signal_envelope::{decode, Envelope};
use tokio::{net::TcpListener, signal};
use tracing::{debug, info, warn};

use crate::config::RelayConfig;
use crate::registry::{message_len, BroadcastReport, ConnectionId, ConnectionRegistry};
use crate::telemetry;

pub struct RelayState {
    registry: ConnectionRegistry,
    validate_envelopes: bool,
    metrics: PrometheusHandle,
}

impl RelayState {
    pub fn new(config: &RelayConfig, metrics: PrometheusHandle) -> Self {
        Self {
            registry: ConnectionRegistry::new(config.per_connection_buffer),
            validate_envelopes: config.validate_envelopes,
            metrics,
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    active_connections: usize,
    connections: Vec<ConnectionStatsEntry>,
}

#[derive(Debug, Serialize)]
struct ConnectionStatsEntry {
    connection_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    remote_addr: Option<String>,
}

pub fn router(state: Arc<RelayState>) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/debug/stats", get(stats_handler))
        .route("/metrics", get(metrics_handler))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

/// Serves the relay on an already bound listener until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: Arc<RelayState>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = router(state).into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("relay server shutdown with error")
}

pub async fn run(config: RelayConfig, metrics: PrometheusHandle) -> Result<()> {
    let state = Arc::new(RelayState::new(&config, metrics));
    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;

    info!(
        listen_addr = %config.listen_addr,
        validate_envelopes = config.validate_envelopes,
        "signal relay listening"
    );

    serve(listener, state, shutdown_signal()).await?;

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "shutdown signal received; sleeping for graceful period"
    );
    tokio::time::sleep(config.shutdown_grace).await;
    info!("graceful shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn stats_handler(State(state): State<Arc<RelayState>>) -> impl IntoResponse {
    let connections: Vec<ConnectionStatsEntry> = state
        .registry
        .snapshot()
        .await
        .into_iter()
        .map(|entry| ConnectionStatsEntry {
            connection_id: entry.connection_id.to_string(),
            remote_addr: entry.remote_addr.map(|addr| addr.to_string()),
        })
        .collect();
    Json(StatsResponse {
        active_connections: connections.len(),
        connections,
    })
}

async fn metrics_handler(State(state): State<Arc<RelayState>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

async fn ws_handler(
    State(state): State<Arc<RelayState>>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state, remote_addr))
}

async fn handle_connection(socket: WebSocket, state: Arc<RelayState>, remote_addr: SocketAddr) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let registration = state.registry.register(Some(remote_addr)).await;
    let connection_id = registration.connection_id;
    on_connection_added(registration.active_connections);
    info!(
        connection_id = %connection_id,
        remote_addr = %remote_addr,
        active = registration.active_connections,
        "client connected"
    );

    let mut rx = registration.receiver;
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if ws_tx.send(message).await.is_err() {
                break;
            }
        }
        debug!(connection_id = %connection_id, "writer task finished");
    });

    while let Some(message) = ws_rx.next().await {
        match message {
            Ok(frame @ (Message::Text(_) | Message::Binary(_))) => {
                relay_frame(&state, connection_id, frame).await;
            }
            Ok(Message::Close(frame)) => {
                info!(
                    connection_id = %connection_id,
                    reason = ?frame.map(|f| f.reason.to_string()),
                    "client closed websocket"
                );
                break;
            }
            Ok(_) => continue,
            Err(err) => {
                warn!(
                    connection_id = %connection_id,
                    error = %err,
                    "error receiving message"
                );
                break;
            }
        }
    }

    let remaining = state.registry.unregister(connection_id).await;
    on_connection_removed(remaining);
    writer.abort();

    info!(
        connection_id = %connection_id,
        active = remaining,
        "client disconnected"
    );
}

/// Forwards one inbound frame to every other client.
///
/// With validation on, the frame is decoded only to classify it for the logs;
/// the received bytes are forwarded untouched.
async fn relay_frame(state: &RelayState, source: ConnectionId, frame: Message) {
    if state.validate_envelopes {
        let bytes: &[u8] = match &frame {
            Message::Text(text) => text.as_bytes(),
            Message::Binary(data) => data,
            _ => &[],
        };
        match decode(bytes) {
            Ok(envelope) => log_envelope(source, &envelope),
            Err(err) => {
                warn!(
                    connection_id = %source,
                    error = %err,
                    len = bytes.len(),
                    "dropping malformed frame"
                );
                counter!(telemetry::DECODE_FAILURES_TOTAL, 1);
                return;
            }
        }
    }

    let size = message_len(&frame);
    let report = state.registry.broadcast(source, frame).await;
    record_forwarded(source, size, &report);
}

fn log_envelope(source: ConnectionId, envelope: &Envelope) {
    match envelope {
        Envelope::SessionDescription(description) => debug!(
            connection_id = %source,
            kind = envelope.kind(),
            sdp_type = %description.kind,
            "relaying session description"
        ),
        Envelope::IceCandidate(candidate) => debug!(
            connection_id = %source,
            kind = envelope.kind(),
            mline_index = candidate.sdp_mline_index,
            "relaying ice candidate"
        ),
    }
}

fn on_connection_added(active: usize) {
    counter!(telemetry::CONNECTIONS_TOTAL, 1);
    gauge!(telemetry::CONNECTIONS_ACTIVE, active as f64);
}

fn on_connection_removed(active: usize) {
    counter!(telemetry::CONNECTIONS_CLOSED_TOTAL, 1);
    gauge!(telemetry::CONNECTIONS_ACTIVE, active as f64);
}

fn record_forwarded(source: ConnectionId, size: usize, report: &BroadcastReport) {
    debug!(
        connection_id = %source,
        delivered = report.delivered,
        dropped = report.dropped,
        closed = report.closed,
        "frame forwarded"
    );
    if report.delivered == 0 {
        return;
    }
    counter!(telemetry::MESSAGES_FORWARDED_TOTAL, report.delivered as u64);
    counter!(telemetry::BYTES_FORWARDED_TOTAL, report.bytes as u64);
    histogram!(telemetry::MESSAGE_SIZE_BYTES, size as f64);
}
