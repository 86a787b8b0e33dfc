//! HTTP/WebSocket transport.
//!
//! One listener serves two surfaces: the device/watcher WebSocket at
//! `/ws` (auth-first message protocol, then the session event loop) and
//! a small operator API under `/api` guarded by a bearer token. The
//! transport layer translates wire frames into [`SessionManager`] calls
//! and owns nothing else.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, Request, State,
    },
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use subtle::ConstantTimeEq;
use tokio::sync::mpsc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use uuid::Uuid;

use crate::auth::{CredentialVerifier, SubjectIdentity};
use crate::manager::{FixOutcome, SessionManager, SessionOverview};
use crate::protocol::{ClientMessage, ServerMessage};
use crate::session::{ConnectionId, Thresholds};

/// Shared state for every handler.
#[derive(Clone)]
pub struct AppState {
    pub manager: SessionManager,
    pub verifier: Arc<dyn CredentialVerifier>,
    /// Per-connection outbound buffer; overflow drops updates.
    pub watcher_buffer: usize,
    /// Bearer token for `/api`. `None` leaves the operator API open.
    pub operator_token: Option<String>,
}

/// Structured error type for the operator API handlers.
///
/// Each variant maps to an HTTP status, a machine-readable code, and a
/// human-readable message, and implements [`IntoResponse`] so handlers
/// return `Result<T, ApiError>` directly.
#[derive(Debug)]
pub enum ApiError {
    /// 401 - No bearer token provided.
    AuthRequired,
    /// 403 - Bearer token provided but wrong.
    AuthInvalid,
    /// 404 - No tracking session for the subject.
    SessionNotFound(String),
    /// 400 - Malformed or invalid request.
    InvalidRequest(String),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::AuthRequired => StatusCode::UNAUTHORIZED,
            ApiError::AuthInvalid => StatusCode::FORBIDDEN,
            ApiError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::AuthRequired => "auth_required",
            ApiError::AuthInvalid => "auth_invalid",
            ApiError::SessionNotFound(_) => "session_not_found",
            ApiError::InvalidRequest(_) => "invalid_request",
        }
    }

    pub fn message(&self) -> String {
        match self {
            ApiError::AuthRequired => {
                "Authentication required. Provide a bearer token via the Authorization header."
                    .to_string()
            }
            ApiError::AuthInvalid => "Invalid authentication token.".to_string(),
            ApiError::SessionNotFound(subject) => {
                format!("No tracking session for subject: {}.", subject)
            }
            ApiError::InvalidRequest(detail) => format!("Invalid request: {}.", detail),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": {
                "code": self.code(),
                "message": self.message(),
            }
        });
        (self.status_code(), Json(body)).into_response()
    }
}

impl From<crate::session::StoreError> for ApiError {
    fn from(err: crate::session::StoreError) -> Self {
        match err {
            crate::session::StoreError::SessionNotFound(subject) => {
                ApiError::SessionNotFound(subject)
            }
        }
    }
}

/// Build the full router: WebSocket endpoint, operator API, health check.
pub fn router(state: AppState) -> Router {
    let operator_token = state.operator_token.clone();
    let api = Router::new()
        .route("/sessions", get(list_sessions))
        .route("/sessions/{subject}/force-stop", post(force_stop_session))
        .route("/sessions/{subject}/thresholds", put(retune_session))
        .route_layer(middleware::from_fn(move |req: Request, next: Next| {
            let token = operator_token.clone();
            async move { require_operator(token, req, next).await }
        }));

    Router::new()
        .route("/healthz", get(healthz))
        .route("/ws", get(ws_upgrade))
        .nest("/api", api)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

fn extract_bearer(req: &Request) -> Option<String> {
    req.headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|v| v.to_string())
}

/// Operator API gate. No configured token means an open API
/// (localhost-only deployments); otherwise the bearer token is compared
/// in constant time.
async fn require_operator(
    expected: Option<String>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(expected) = expected else {
        return Ok(next.run(req).await);
    };
    match extract_bearer(&req) {
        Some(token) if token.as_bytes().ct_eq(expected.as_bytes()).into() => {
            Ok(next.run(req).await)
        }
        Some(_) => Err(ApiError::AuthInvalid),
        None => Err(ApiError::AuthRequired),
    }
}

async fn healthz() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionOverview>> {
    Json(state.manager.list_sessions())
}

#[derive(Debug, Default, Deserialize)]
struct ForceStopRequest {
    reason: Option<String>,
}

async fn force_stop_session(
    Path(subject): Path<String>,
    State(state): State<AppState>,
    body: Option<Json<ForceStopRequest>>,
) -> Result<StatusCode, ApiError> {
    let reason = body
        .and_then(|Json(req)| req.reason)
        .unwrap_or_else(|| "stopped by operator".to_string());
    state.manager.force_stop(&subject, &reason).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn retune_session(
    Path(subject): Path<String>,
    State(state): State<AppState>,
    Json(thresholds): Json<Thresholds>,
) -> Result<StatusCode, ApiError> {
    if !(thresholds.min_distance_meters.is_finite()
        && thresholds.min_distance_meters >= 0.0
        && thresholds.max_accuracy_meters.is_finite()
        && thresholds.max_accuracy_meters > 0.0)
    {
        return Err(ApiError::InvalidRequest(
            "thresholds must be finite and non-negative".to_string(),
        ));
    }
    state.manager.retune(&subject, thresholds)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

/// One connection's lifetime: auth phase, then the session event loop.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let conn: ConnectionId = Uuid::new_v4();
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Auth phase: nothing else is honored until a credential verifies.
    let identity = loop {
        let Some(Ok(frame)) = ws_rx.next().await else {
            return;
        };
        let text = match frame {
            Message::Text(text) => text,
            Message::Close(_) => return,
            _ => continue,
        };
        match ClientMessage::parse(&text) {
            Ok(ClientMessage::Auth { token }) => match state.verifier.verify(&token) {
                Ok(identity) => break identity,
                Err(err) => {
                    tracing::info!(%conn, %err, "credential rejected");
                    let msg = ServerMessage::error("auth_failed", err.to_string());
                    let _ = ws_tx.send(Message::Text(msg.to_json().into())).await;
                    // Clean handshake: close explicitly instead of
                    // dropping the socket mid-stream.
                    let _ = ws_tx
                        .send(Message::Close(Some(CloseFrame {
                            code: close_code::POLICY,
                            reason: "authentication failed".into(),
                        })))
                        .await;
                    return;
                }
            },
            Ok(_) => {
                let msg = ServerMessage::error("auth_required", "authenticate first");
                if ws_tx.send(Message::Text(msg.to_json().into())).await.is_err() {
                    return;
                }
            }
            Err(err) => {
                let msg = ServerMessage::error("bad_message", err.to_string());
                if ws_tx.send(Message::Text(msg.to_json().into())).await.is_err() {
                    return;
                }
            }
        }
    };

    tracing::info!(%conn, subject = %identity.subject_id, "connection authenticated");

    // Outbound channel: watcher fan-out and unicast commands arrive here.
    let (tx, mut rx) = mpsc::channel::<ServerMessage>(state.watcher_buffer);
    state.manager.register_connection(conn, tx);

    let authed = ServerMessage::Authed {
        subject: identity.subject_id.clone(),
    };
    if ws_tx.send(Message::Text(authed.to_json().into())).await.is_err() {
        state.manager.handle_disconnect(conn);
        return;
    }

    loop {
        tokio::select! {
            outbound = rx.recv() => {
                let Some(msg) = outbound else { break };
                if ws_tx.send(Message::Text(msg.to_json().into())).await.is_err() {
                    break;
                }
            }

            inbound = ws_rx.next() => {
                let text = match inbound {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => {
                        tracing::debug!(%conn, %err, "websocket read error");
                        break;
                    }
                };
                let reply = match ClientMessage::parse(&text) {
                    Ok(msg) => dispatch(&state.manager, &identity, conn, msg),
                    Err(err) => Some(ServerMessage::error("bad_message", err.to_string())),
                };
                if let Some(reply) = reply {
                    if ws_tx.send(Message::Text(reply.to_json().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    state.manager.handle_disconnect(conn);
    tracing::info!(%conn, subject = %identity.subject_id, "connection closed");
}

/// Translate one authenticated message into manager calls. Returns the
/// direct reply, if the protocol defines one: accepted fixes are
/// deliberately unacknowledged.
fn dispatch(
    manager: &SessionManager,
    identity: &SubjectIdentity,
    conn: ConnectionId,
    msg: ClientMessage,
) -> Option<ServerMessage> {
    let subject = identity.subject_id.as_str();
    match msg {
        ClientMessage::Auth { .. } => Some(ServerMessage::error(
            "already_authenticated",
            "connection is already authenticated",
        )),
        ClientMessage::Start { thresholds } => {
            let outcome = manager.start(subject, conn, thresholds);
            Some(ServerMessage::Started {
                subject: subject.to_string(),
                resumed: outcome.resumed,
                thresholds: outcome.thresholds,
            })
        }
        ClientMessage::Fix { fix } => {
            let client_timestamp = fix.client_timestamp;
            match manager.fix(subject, fix) {
                FixOutcome::Accepted { .. } => None,
                FixOutcome::Rejected(reason) => Some(ServerMessage::Rejected {
                    reason,
                    client_timestamp,
                }),
                FixOutcome::NoSession => Some(ServerMessage::error(
                    "no_session",
                    "no tracking session; send start first",
                )),
            }
        }
        ClientMessage::Pause => match manager.pause(subject) {
            Ok(()) => Some(ServerMessage::Paused {
                subject: subject.to_string(),
            }),
            Err(err) => Some(ServerMessage::error("session_not_found", err.to_string())),
        },
        ClientMessage::Resume => match manager.resume(subject) {
            Ok(()) => Some(ServerMessage::Resumed {
                subject: subject.to_string(),
            }),
            Err(err) => Some(ServerMessage::error("session_not_found", err.to_string())),
        },
        ClientMessage::Stop => match manager.stop(subject) {
            Ok(()) => Some(ServerMessage::Stopped {
                subject: subject.to_string(),
            }),
            Err(err) => Some(ServerMessage::error("session_not_found", err.to_string())),
        },
        ClientMessage::Watch { subject: watched } => {
            if manager.watch(conn, watched.as_deref()) {
                Some(ServerMessage::Watching { subject: watched })
            } else {
                Some(ServerMessage::error(
                    "not_registered",
                    "connection has no registered outbound channel",
                ))
            }
        }
    }
}
