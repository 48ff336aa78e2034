// WebSocket sessions
//
// One task per connection multiplexes three sources:
// client messages, job resolutions for this session, and broadcast frames.
//
// Decision: Submissions are handled in arrival order; in inline mode the session waits for
// each job before reading the next message
// Decision: Frames are forwarded only to principals holding frames:read
// Decision: A failed send ends the session; its jobs keep running and their outcomes are dropped
// Decision: Pipeline shutdown closes every session with a close frame

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures::StreamExt;
use genrelay_core::{scopes, GatewayError, JobId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::app::AppState;
use crate::auth::Caller;
use crate::broadcast::{BroadcastState, FrameSubscription};
use crate::correlator::Resolution;
use crate::dispatch::{DeliveryMode, DispatchMode, Dispatched};
use crate::gateway::SubmitInput;

/// Messages accepted from the client
#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum ClientEvent {
    Generate {
        #[serde(default)]
        request: Option<Value>,
        #[serde(default)]
        state: Option<Value>,
    },
}

/// Snapshot sent on connect
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionStatus {
    dispatch_mode: DispatchMode,
    pending_jobs: usize,
    broadcast: BroadcastState,
    frames: bool,
}

/// Messages sent to the client (frames are pre-encoded by the broadcaster)
#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case", rename_all_fields = "camelCase")]
enum ServerEvent {
    Status {
        metrics: SessionStatus,
    },
    Job {
        job_id: JobId,
    },
    Result {
        job_id: JobId,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        quality_score: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<&'static str>,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        job_id: Option<JobId>,
        error: &'static str,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        retry_after: Option<u64>,
    },
}

impl ServerEvent {
    fn result(resolution: Resolution) -> Self {
        match resolution.outcome {
            Ok(output) => ServerEvent::Result {
                job_id: resolution.job_id,
                success: true,
                payload: Some(output.payload),
                quality_score: output.quality_score,
                error: None,
                message: None,
            },
            Err(e) => ServerEvent::Result {
                job_id: resolution.job_id,
                success: false,
                payload: None,
                quality_score: None,
                error: Some(e.code()),
                message: Some(e.to_string()),
            },
        }
    }

    fn error(err: &GatewayError) -> Self {
        ServerEvent::Error {
            job_id: err.job_id(),
            error: err.code(),
            message: err.to_string(),
            retry_after: err.retry_after(),
        }
    }
}

/// GET /ws - Upgrade to a generation session
pub async fn ws_handler(
    State(state): State<AppState>,
    caller: Caller,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| session(state, socket, caller))
}

/// Send failed; the session is over
struct Closed;

async fn send_event(socket: &mut WebSocket, event: &ServerEvent) -> Result<(), Closed> {
    let text = match serde_json::to_string(event) {
        Ok(text) => text,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to encode socket event");
            return Ok(());
        }
    };
    socket.send(Message::Text(text)).await.map_err(|_| Closed)
}

async fn next_frame(frames: &mut Option<FrameSubscription>) -> Option<Arc<str>> {
    match frames {
        Some(subscription) => subscription.recv().await,
        None => std::future::pending().await,
    }
}

async fn session(state: AppState, mut socket: WebSocket, caller: Caller) {
    let metrics = Arc::clone(&state.metrics);
    metrics.ws_connected();

    let mut frames = caller
        .principal
        .has_scope(scopes::FRAMES_READ)
        .then(|| state.broadcaster.subscribe(&caller.principal));
    tracing::info!(
        principal = %caller.principal.subject,
        origin = %caller.origin,
        frames = frames.is_some(),
        "Socket session opened"
    );

    match run_session(&state, &mut socket, &caller, &mut frames).await {
        Ok(()) => tracing::info!(principal = %caller.principal.subject, "Socket session closed"),
        Err(Closed) => tracing::debug!(
            principal = %caller.principal.subject,
            "Socket send failed, ending session"
        ),
    }
    metrics.ws_disconnected();
}

async fn run_session(
    state: &AppState,
    socket: &mut WebSocket,
    caller: &Caller,
    frames: &mut Option<FrameSubscription>,
) -> Result<(), Closed> {
    let (resolutions_tx, mut resolutions) = mpsc::unbounded_channel::<Resolution>();

    let status = ServerEvent::Status {
        metrics: SessionStatus {
            dispatch_mode: state.gateway.mode(),
            pending_jobs: state.gateway.pending(),
            broadcast: state.broadcaster.state(),
            frames: frames.is_some(),
        },
    };
    send_event(socket, &status).await?;

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => {
                // Best effort; the peer may already be gone
                let _ = socket.send(Message::Close(None)).await;
                return Ok(());
            }
            incoming = socket.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    handle_text(state, socket, caller, &text, &resolutions_tx).await?;
                }
                Some(Ok(Message::Ping(payload))) => {
                    socket.send(Message::Pong(payload)).await.map_err(|_| Closed)?;
                }
                Some(Ok(Message::Close(_))) | None => return Ok(()),
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(error = %e, "Socket receive failed");
                    return Ok(());
                }
            },
            Some(resolution) = resolutions.recv() => {
                send_event(socket, &ServerEvent::result(resolution)).await?;
            }
            Some(frame) = next_frame(frames) => {
                let len = frame.len();
                let sent = socket.send(Message::Text(frame.to_string())).await;
                if let Some(subscription) = frames.as_ref() {
                    subscription.complete(len);
                }
                sent.map_err(|_| Closed)?;
            }
        }
    }
}

async fn handle_text(
    state: &AppState,
    socket: &mut WebSocket,
    caller: &Caller,
    text: &str,
    resolutions: &mpsc::UnboundedSender<Resolution>,
) -> Result<(), Closed> {
    let (request, job_state) = match serde_json::from_str::<ClientEvent>(text) {
        Ok(ClientEvent::Generate { request, state }) => (request, state),
        Err(e) => {
            let err = GatewayError::invalid_request(format!("unrecognised message: {e}"));
            return send_event(socket, &ServerEvent::error(&err)).await;
        }
    };

    let input = SubmitInput {
        request,
        state: job_state,
    };
    let submitted = state
        .gateway
        .submit(
            &caller.principal,
            &caller.origin,
            input,
            DeliveryMode::Channel(resolutions.clone()),
        )
        .await;

    match submitted {
        Ok(Dispatched::Pending { job_id, .. }) => {
            send_event(socket, &ServerEvent::Job { job_id }).await
        }
        Ok(Dispatched::Completed(resolution)) => {
            send_event(
                socket,
                &ServerEvent::Job {
                    job_id: resolution.job_id,
                },
            )
            .await?;
            send_event(socket, &ServerEvent::result(resolution)).await
        }
        Err(e) => send_event(socket, &ServerEvent::error(&e)).await,
    }
}
