//! Local control API
//!
//! Loopback-only HTTP and WebSocket surface used by browser-hosted tools
//! and local CLIs. Every route sits behind the [`OriginGate`]: a request
//! carrying an `Origin` header that does not belong to a workspace of the
//! configured control plane is rejected with 403. Requests without an
//! `Origin` header (non-browser tools) are let through, except on the
//! WebSocket endpoint.

mod handlers;
mod origin;
mod ws;

pub use handlers::{execute, ApiError};
pub use origin::OriginGate;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    extract::{Request, State},
    http::{header, HeaderValue, Method},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::bastion::Bastion;

/// Shared state of the API handlers
#[derive(Clone)]
pub struct ApiState {
    /// Orchestrator the API drives
    pub bastion: Arc<Bastion>,
    /// Origin gate
    pub gate: Arc<OriginGate>,
    /// SSH config file maintained by the writer, if enabled
    pub ssh_config: Option<PathBuf>,
    /// Keepalive ping interval on WebSocket streams
    pub ping_interval: Duration,
}

/// Build the API router
pub fn build_router(state: ApiState) -> Router {
    let gate = state.gate.clone();
    let cors_gate = state.gate.clone();

    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE])
        .allow_origin(AllowOrigin::predicate(
            move |origin: &HeaderValue, _parts| {
                origin
                    .to_str()
                    .map(|o| cors_gate.allows(o))
                    .unwrap_or(false)
            },
        ));

    Router::new()
        .route("/health", get(handlers::health))
        .route("/api/v1/expose-port", post(handlers::expose_port))
        .route("/api/v1/refresh", post(handlers::refresh))
        .route("/api/v1/tunnels", get(handlers::tunnels))
        .route("/api/v1/auto-tunnel", post(handlers::auto_tunnel))
        .route(
            "/api/v1/ssh-connection/:instance_id",
            get(handlers::ssh_connection),
        )
        .route("/api/v1/ws", get(ws::upgrade))
        .with_state(state)
        .layer(cors)
        .layer(middleware::from_fn_with_state(gate, origin_gate))
        .layer(TraceLayer::new_for_http())
}

/// Reject requests whose `Origin` header is present but not allowed
async fn origin_gate(State(gate): State<Arc<OriginGate>>, req: Request, next: Next) -> Response {
    if let Some(origin) = req.headers().get(header::ORIGIN) {
        let origin = origin.to_str().unwrap_or("<non-ascii>");
        if !gate.allows(origin) {
            tracing::warn!(origin, path = %req.uri().path(), "Rejected request from disallowed origin");
            return ApiError::Forbidden(format!("origin {} is not allowed", origin)).into_response();
        }
    }
    next.run(req).await
}

/// Local API server
///
/// Listens on 127.0.0.1 only.
pub struct ApiServer {
    /// Address to bind (127.0.0.1:port)
    pub address: String,
    state: ApiState,
    shutdown_token: Option<CancellationToken>,
}

impl ApiServer {
    /// Create a new API server
    pub fn new(address: String, state: ApiState) -> Self {
        Self {
            address,
            state,
            shutdown_token: None,
        }
    }

    /// Set the shutdown token (call before run)
    pub fn with_shutdown_token(mut self, token: CancellationToken) -> Self {
        self.shutdown_token = Some(token);
        self
    }

    /// Bind and serve until the shutdown token fires
    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(&self.address)
            .await
            .with_context(|| format!("Failed to bind local API to {}", self.address))?;
        let token = self.shutdown_token.unwrap_or_else(CancellationToken::new);
        serve(listener, self.state, token).await
    }
}

/// Serve the API on an already bound listener
pub async fn serve(listener: TcpListener, state: ApiState, shutdown: CancellationToken) -> Result<()> {
    let local = listener.local_addr()?;
    if !local.ip().is_loopback() {
        anyhow::bail!("Local API must bind to a loopback address, got {}", local);
    }
    tracing::info!("Local API listening on {}", local);

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("Local API server failed")?;

    tracing::info!("Local API stopped");
    Ok(())
}
