//! Agent-facing endpoints: registration and the bidirectional stream.
//!
//! The stream is a WebSocket carrying tagged JSON frames. A fresh
//! connection is unbound until its first frame, which must be `INIT`; after
//! binding, `HEARTBEAT` updates agent liveness and `LOG_MESSAGE` feeds the
//! log sink and the per-job fan-out. Outbound pings and task assignments
//! ride the same socket.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use futures::SinkExt;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::metrics;
use crate::model::JobLogEntry;
use crate::stream::{frames, AgentFrame, StreamSession};

use super::AppState;

/// How long an unbound connection may sit before its `INIT` frame.
const INIT_DEADLINE: Duration = Duration::from_secs(10);

/// Outbound frames buffered per agent before writes start failing.
const OUTBOUND_BUFFER: usize = 64;

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub api_key: String,
    pub hostname: String,
    #[serde(default)]
    pub ip: Option<String>,
    pub port: u16,
}

/// `RegisterAgent`: API-key validation plus the `(org, host)` upsert.
pub async fn register_agent(
    State(state): State<AppState>,
    Json(request): Json<RegisterRequest>,
) -> impl IntoResponse {
    match state
        .registry
        .register(&request.api_key, &request.hostname, request.ip, request.port)
        .await
    {
        Ok(registered) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "agent_id": registered.agent_id,
                "org_id": registered.org_id,
                "success": true,
                "message": if registered.created { "registered" } else { "updated" },
            })),
        ),
        Err(e) => (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({
                "success": false,
                "message": e.to_string(),
            })),
        ),
    }
}

/// `AgentStream`: upgrades to the framed bidirectional stream.
pub async fn agent_stream(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_stream(socket, state))
}

async fn handle_stream(mut socket: WebSocket, state: AppState) {
    // Unbound state: the first frame must be INIT within the deadline.
    let init = tokio::time::timeout(INIT_DEADLINE, socket.recv()).await;
    let agent_id = match init {
        Ok(Some(Ok(Message::Text(text)))) => match frames::decode_agent_frame(&text) {
            Ok(AgentFrame::Init { agent_id }) => agent_id,
            Ok(other) => {
                warn!(frame = ?other, "Stream opened with a non-INIT frame");
                return;
            }
            Err(e) => {
                warn!(error = %e, "Undecodable first frame");
                return;
            }
        },
        _ => {
            debug!("Stream closed before INIT");
            return;
        }
    };

    let agent = match state.store.get_agent(agent_id).await {
        Ok(Some(agent)) => agent,
        Ok(None) => {
            warn!(agent_id = %agent_id, "INIT for unknown agent");
            return;
        }
        Err(e) => {
            warn!(agent_id = %agent_id, error = %e, "Agent lookup failed");
            return;
        }
    };

    // Bind: register the session and bring the agent back to life.
    let (outbound_tx, mut outbound_rx) = tokio::sync::mpsc::channel(OUTBOUND_BUFFER);
    let session = state
        .streams
        .register(agent_id, agent.org_id, outbound_tx)
        .await;

    let mut revived = agent.clone();
    revived.mark_active(Utc::now());
    revived.last_stream_connected_at = Some(Utc::now());
    if let Err(e) = state.store.update_agent(&revived).await {
        warn!(agent_id = %agent_id, error = %e, "Failed to record stream connect");
    }
    metrics::agents_connected(state.streams.connected_count().await);
    info!(agent_id = %agent_id, org_id = %agent.org_id, "Agent stream bound");

    let (mut sink, mut inbound) = socket_split(socket);

    // Writer half: drains the session's outbound channel onto the socket.
    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            let text = match frames::encode_backend_frame(&frame) {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "Outbound frame failed to encode");
                    continue;
                }
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                return;
            }
        }
    });

    // Reader half: inbound frames until the socket closes.
    while let Some(message) = inbound.recv().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };
        let frame = match frames::decode_agent_frame(&text) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(agent_id = %agent_id, error = %e, "Dropping undecodable frame");
                continue;
            }
        };
        handle_frame(&state, &session, frame).await;
    }

    // Teardown: only this connection's session is evicted.
    state.streams.unregister(agent_id, &session).await;
    writer.abort();
    metrics::agents_connected(state.streams.connected_count().await);
    info!(agent_id = %agent_id, "Agent stream closed");
}

async fn handle_frame(state: &AppState, session: &Arc<StreamSession>, frame: AgentFrame) {
    match frame {
        AgentFrame::Init { .. } => {
            // Already bound; re-INIT is a protocol slip, not a reason to
            // drop a healthy stream.
            debug!(agent_id = %session.agent_id, "Duplicate INIT ignored");
        }
        AgentFrame::Heartbeat => {
            session.note_heartbeat();
            if let Err(e) = state
                .store
                .record_agent_heartbeat(session.agent_id, Utc::now())
                .await
            {
                warn!(agent_id = %session.agent_id, error = %e, "Heartbeat not recorded");
            }
        }
        AgentFrame::LogMessage {
            job_id,
            level,
            timestamp,
            message,
            stage,
        } => {
            // Org check: frames for foreign or unknown jobs drop silently.
            let job = match state.store.latest(session.org_id, job_id).await {
                Ok(Some(job)) => job,
                Ok(None) => {
                    debug!(job_id = %job_id, "Log frame for unknown job dropped");
                    return;
                }
                Err(e) => {
                    warn!(job_id = %job_id, error = %e, "Job lookup for log frame failed");
                    return;
                }
            };
            let entry = JobLogEntry {
                job_id,
                job_version: job.version,
                org_id: job.org_id,
                level,
                timestamp,
                message,
                stage,
            };
            metrics::log_frame_ingested();
            if let Err(e) = state.store.append_job_log(&entry).await {
                warn!(job_id = %job_id, error = %e, "Failed to persist streamed log entry");
            }
            state.notifier.broadcast(&entry).await;
        }
    }
}

/// Splits a socket into a sink and a channel-backed receiver so the reader
/// loop stays select-free.
fn socket_split(
    socket: WebSocket,
) -> (
    futures::stream::SplitSink<WebSocket, Message>,
    tokio::sync::mpsc::Receiver<Result<Message, axum::Error>>,
) {
    use futures::StreamExt;

    let (sink, mut stream) = socket.split();
    let (tx, rx) = tokio::sync::mpsc::channel(OUTBOUND_BUFFER);
    tokio::spawn(async move {
        while let Some(message) = stream.next().await {
            if tx.send(message).await.is_err() {
                return;
            }
        }
    });
    (sink, rx)
}
