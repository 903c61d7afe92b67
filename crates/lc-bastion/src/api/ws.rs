//! WebSocket endpoint of the local control API
//!
//! Each text frame carries one [`LocalRequest`] and is answered with one
//! [`LocalResponse`]. The server pings on an interval; a stream that misses
//! a pong for a whole interval is considered dead and closed.

use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{header, HeaderMap},
    response::{IntoResponse, Response},
};
use tokio::time::MissedTickBehavior;

use lc_protocol::{LocalRequest, LocalResponse};

use super::handlers::{execute, ApiError};
use super::ApiState;

pub async fn upgrade(
    State(state): State<ApiState>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    // The gate has already vetted any Origin that is present
    if !headers.contains_key(header::ORIGIN) {
        return ApiError::Forbidden("WebSocket connections require an Origin header".to_string())
            .into_response();
    }
    match ws {
        Ok(ws) => ws.on_upgrade(move |socket| handle_socket(socket, state)),
        Err(rejection) => rejection.into_response(),
    }
}

async fn handle_socket(mut socket: WebSocket, state: ApiState) {
    let mut ping = tokio::time::interval(state.ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick completes immediately
    ping.tick().await;

    let mut awaiting_pong = false;
    tracing::debug!("Local API WebSocket opened");

    loop {
        tokio::select! {
            msg = socket.recv() => {
                let msg = match msg {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => {
                        tracing::debug!("WebSocket receive error: {}", e);
                        break;
                    }
                    None => break,
                };

                let response = match msg {
                    Message::Text(text) => match serde_json::from_str::<LocalRequest>(&text) {
                        Ok(request) => execute(&state, request)
                            .await
                            .unwrap_or_else(|e| LocalResponse::error(e.to_string())),
                        Err(e) => LocalResponse::error(format!("invalid request: {}", e)),
                    },
                    Message::Binary(_) => LocalResponse::error("binary frames are not supported"),
                    Message::Pong(_) => {
                        awaiting_pong = false;
                        continue;
                    }
                    Message::Ping(_) => continue,
                    Message::Close(_) => break,
                };

                let text = match serde_json::to_string(&response) {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::error!("Failed to encode local response: {}", e);
                        continue;
                    }
                };
                if socket.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            _ = ping.tick() => {
                if awaiting_pong {
                    tracing::info!("Local API WebSocket missed a pong, closing");
                    break;
                }
                if socket.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }
        }
    }

    tracing::debug!("Local API WebSocket closed");
}
