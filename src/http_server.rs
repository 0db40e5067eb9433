//! HTTP server implementation using Axum.

use crate::format::{self, FormatFailure, FormatRequest, Formatted};
use crate::protocol::{self, Frame};
use crate::proxy::{self, RunRequest, RunResponse};
use crate::relay::ClientEvent;
use crate::session;
use crate::state::{AppState, StopOutcome};
use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{HeaderValue, StatusCode},
    response::Response,
    routing::{delete, get, post},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

const OUTBOUND_FRAMES: usize = 256;
const INBOUND_EVENTS: usize = 64;

#[derive(Debug, Default, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

#[derive(Serialize)]
struct SessionInfo {
    id: String,
    pid: i32,
    language: String,
    age_secs: u64,
}

/// Build the application router.
pub fn router(state: AppState) -> Router {
    let cors = cors_layer(&state.config.allow_origins);

    Router::new()
        // Interactive sessions
        .route("/ws", get(ws_handler))
        // Session administration
        .route("/sessions", get(list_sessions))
        .route("/sessions/:id", delete(stop_session))
        // Pass-throughs
        .route("/run", post(run_remote))
        .route("/format", post(format_code))
        // Health check
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.is_empty() {
        return layer.allow_origin(Any);
    }
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(allowed))
}

/// Serve on an already-bound listener.
pub async fn serve(listener: TcpListener, state: AppState) -> std::io::Result<()> {
    axum::serve(listener, router(state)).await
}

/// Run the HTTP server on the configured port.
pub async fn run_server(state: AppState) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], state.config.port));
    info!("Starting HTTP server on {}", addr);

    let listener = TcpListener::bind(addr).await?;
    serve(listener, state).await
}

async fn health() -> &'static str {
    "OK"
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<TokenQuery>,
    State(state): State<AppState>,
) -> Response {
    let authorized = state.token_ok(query.token.as_deref());
    ws.on_upgrade(move |socket| handle_socket(socket, state, authorized))
}

async fn handle_socket(mut socket: WebSocket, state: AppState, authorized: bool) {
    if !authorized {
        warn!("Rejecting websocket session: invalid token");
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: close_code::POLICY,
                reason: "invalid token".into(),
            })))
            .await;
        return;
    }

    let (mut sink, mut stream) = socket.split();

    let first = loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => break text,
            Some(Ok(Message::Binary(bytes))) => break String::from_utf8_lossy(&bytes).into_owned(),
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
        }
    };

    let (out_tx, mut out_rx) = mpsc::channel::<Frame>(OUTBOUND_FRAMES);
    let (in_tx, in_rx) = mpsc::channel::<ClientEvent>(INBOUND_EVENTS);

    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let last = frame == Frame::Done;
            if sink.send(Message::Text(frame.to_json())).await.is_err() {
                break;
            }
            if last {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let reader = tokio::spawn(async move {
        while let Some(message) = stream.next().await {
            let event = match message {
                Ok(Message::Text(text)) if protocol::is_stop_command(&text) => ClientEvent::Stop,
                Ok(Message::Text(text)) => ClientEvent::Input(text),
                Ok(Message::Binary(bytes)) => {
                    ClientEvent::Input(String::from_utf8_lossy(&bytes).into_owned())
                }
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
                Ok(Message::Close(_)) | Err(_) => break,
            };
            if in_tx.send(event).await.is_err() {
                return;
            }
        }
        let _ = in_tx.send(ClientEvent::Disconnected).await;
    });

    let report = session::serve_connection(
        &state.config.engine,
        &state.registry,
        &first,
        in_rx,
        out_tx,
    )
    .await;
    if let Some(report) = report {
        info!(session = %report.id, state = ?report.state, "Websocket session closed");
    }

    reader.abort();
    let _ = writer.await;
}

async fn list_sessions(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
) -> Result<Json<Vec<SessionInfo>>, StatusCode> {
    if !state.token_ok(query.token.as_deref()) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    let list = state
        .registry
        .snapshot()
        .into_iter()
        .map(|(id, entry)| SessionInfo {
            id,
            pid: entry.pid.as_raw(),
            language: entry.language.to_string(),
            age_secs: entry.started_at.elapsed().as_secs(),
        })
        .collect();
    Ok(Json(list))
}

async fn stop_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<TokenQuery>,
) -> StatusCode {
    if !state.token_ok(query.token.as_deref()) {
        return StatusCode::UNAUTHORIZED;
    }
    match state.registry.stop(&id) {
        StopOutcome::Killed => StatusCode::NO_CONTENT,
        StopOutcome::NotRunning => StatusCode::NOT_FOUND,
    }
}

async fn run_remote(State(state): State<AppState>, Json(req): Json<RunRequest>) -> Json<RunResponse> {
    Json(proxy::execute(&state.http, &state.config.piston_url, &req).await)
}

async fn format_code(
    State(state): State<AppState>,
    Json(req): Json<FormatRequest>,
) -> Result<Json<Formatted>, (StatusCode, Json<FormatFailure>)> {
    let root = state.config.engine.workspace_root();
    match format::format_source(&state.formatters, &root, &req).await {
        Ok(formatted) => Ok(Json(Formatted { formatted })),
        Err(e) => {
            let status = match e {
                format::FormatError::Unsupported(_) => StatusCode::BAD_REQUEST,
                format::FormatError::Unavailable(_) => StatusCode::INTERNAL_SERVER_ERROR,
                format::FormatError::Failed(_) => StatusCode::UNPROCESSABLE_ENTITY,
            };
            Err((status, Json(e.to_failure())))
        }
    }
}
