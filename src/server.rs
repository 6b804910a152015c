use std::future::Future;

use anyhow::Result;
use axum::body::Bytes;
use axum::extract::State;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info, warn};

use crate::INTERNAL_TOKEN_HEADER;
use crate::registry::SUBSCRIBER_BUFFER;
use crate::relay::{RelayError, RelayHandle};
use crate::types::AuthUpdateRequest;

/// Shared state behind every route.
#[derive(Clone)]
pub struct ServerState {
    pub relay: RelayHandle,
    /// Shared secret for internal endpoints; `None` leaves them open.
    pub internal_token: Option<String>,
    pub enable_reset: bool,
}

/// Build the relay's HTTP surface.
pub fn router(state: ServerState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/history", get(history_handler))
        .route("/ws", get(ws_handler))
        .route("/internal/update-auth", post(update_auth_handler))
        .route("/reset", post(reset_handler))
        .route("/health", get(health_handler))
        .fallback(fallback_handler)
        .layer(cors)
        .with_state(state)
}

/// Serve `app` on `listener` until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    app: Router,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    info!("Listening on {}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn history_handler(State(state): State<ServerState>) -> Response {
    match state.relay.history().await {
        Ok(history) => Json(history).into_response(),
        Err(e) => relay_error_response(e),
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<ServerState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state.relay))
}

/// Any other path: upgrade if the client asked for a WebSocket, otherwise 404.
async fn fallback_handler(
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    State(state): State<ServerState>,
) -> Response {
    match ws {
        Ok(ws) => ws.on_upgrade(move |socket| handle_socket(socket, state.relay)),
        Err(_) => (StatusCode::NOT_FOUND, "Not Found").into_response(),
    }
}

async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn update_auth_handler(
    State(state): State<ServerState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !authorized(&state, &headers) {
        warn!("Rejected credential update with missing or wrong internal token");
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    }
    let request: AuthUpdateRequest = match serde_json::from_slice(&body) {
        Ok(req) => req,
        Err(e) => {
            debug!("Bad credential update body: {e}");
            return (StatusCode::BAD_REQUEST, "Invalid cookie").into_response();
        }
    };
    match state.relay.update_credential(request.cookie).await {
        Ok(()) => (StatusCode::OK, "Auth Updated").into_response(),
        Err(e) => relay_error_response(e),
    }
}

async fn reset_handler(State(state): State<ServerState>, headers: HeaderMap) -> Response {
    if !state.enable_reset {
        return (StatusCode::NOT_FOUND, "Not Found").into_response();
    }
    if !authorized(&state, &headers) {
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    }
    match state.relay.reset().await {
        Ok(()) => (StatusCode::OK, "Reset").into_response(),
        Err(e) => relay_error_response(e),
    }
}

fn authorized(state: &ServerState, headers: &HeaderMap) -> bool {
    match &state.internal_token {
        None => true,
        Some(expected) => headers
            .get(INTERNAL_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|given| given == expected),
    }
}

fn relay_error_response(err: RelayError) -> Response {
    let status = match err {
        RelayError::InvalidCredential => StatusCode::BAD_REQUEST,
        RelayError::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        RelayError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, err.to_string()).into_response()
}

/// Pump one subscriber connection until either side goes away.
///
/// Outbound messages come from the actor through a bounded channel; the
/// socket is only ever written from this task. If the peer stalls long
/// enough for that channel to fill, the actor drops it and the loop ends. Disconnects are reported back
/// to the actor rather than touching the registry here.
async fn handle_socket(socket: WebSocket, relay: RelayHandle) {
    let (tx, mut rx) = mpsc::channel(SUBSCRIBER_BUFFER);
    let id = match relay.subscribe(tx).await {
        Ok(id) => id,
        Err(e) => {
            warn!("Could not register subscriber: {e}");
            return;
        }
    };
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            outbound = rx.recv() => {
                let Some(msg) = outbound else { break };
                let text = match serde_json::to_string(&msg) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("Failed to serialize message: {e}");
                        continue;
                    }
                };
                if sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(text))) if text.as_str().trim() == "ping" => {
                    if sink.send(Message::Text("pong".into())).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    relay.unsubscribe(id).await;
}
