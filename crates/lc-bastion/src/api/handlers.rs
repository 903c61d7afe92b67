//! Route handlers of the local control API

use axum::{
    async_trait,
    extract::{rejection::JsonRejection, FromRequest, Path, Query, Request, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;

use lc_core::{ExposeError, InstanceId};
use lc_protocol::{LocalRequest, LocalResponse, SshConnection, TunnelStatus};

use super::ApiState;
use crate::bastion::ExposeOutcome;

/// Errors returned to API callers
#[derive(Error, Debug)]
pub enum ApiError {
    /// Expose, refresh or lookup failed
    #[error(transparent)]
    Expose(#[from] ExposeError),

    /// Caller is not allowed
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// SSH config generation is turned off
    #[error("SSH config generation is disabled")]
    SshConfigDisabled,

    /// The request body is not valid JSON of the expected shape
    #[error("Invalid request body: {}", .0.body_text())]
    Body(#[from] JsonRejection),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Expose(ExposeError::InvalidPort(_))
            | ApiError::Expose(ExposeError::InvalidInstance(_)) => StatusCode::BAD_REQUEST,
            ApiError::Expose(ExposeError::UnknownInstance(_)) => StatusCode::NOT_FOUND,
            ApiError::Expose(ExposeError::NotConnected) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Expose(ExposeError::RefreshFailed(_)) => StatusCode::BAD_GATEWAY,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::SshConfigDisabled => StatusCode::CONFLICT,
            ApiError::Body(rejection) => rejection.status(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "ok": false, "error": self.to_string() }));
        (self.status(), body).into_response()
    }
}

/// JSON body extractor whose rejections use the API error shape
pub struct ApiJson<T>(pub T);

#[async_trait]
impl<T, S> FromRequest<S> for ApiJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state).await?;
        Ok(Self(value))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExposeBody {
    instance_id: String,
    port: u32,
    #[serde(default)]
    target_port: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoTunnelBody {
    instance_id: String,
    enabled: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelQuery {
    #[serde(default)]
    instance_id: Option<String>,
}

pub async fn health() -> &'static str {
    "ok"
}

pub async fn expose_port(
    State(state): State<ApiState>,
    ApiJson(body): ApiJson<ExposeBody>,
) -> Result<Json<Value>, ApiError> {
    let outcome = state
        .bastion
        .expose(&body.instance_id, body.port, body.target_port)
        .await?;
    Ok(Json(json!({
        "ok": true,
        "pending": outcome == ExposeOutcome::Pending,
    })))
}

pub async fn refresh(State(state): State<ApiState>) -> Result<Json<Value>, ApiError> {
    let summary = state.bastion.resync().await?;
    Ok(Json(json!({
        "instances": summary.instances,
        "tunnels": summary.tunnels,
    })))
}

pub async fn tunnels(
    State(state): State<ApiState>,
    Query(query): Query<TunnelQuery>,
) -> Result<Json<Vec<TunnelStatus>>, ApiError> {
    Ok(Json(tunnel_statuses(&state, query.instance_id.as_deref())?))
}

pub async fn auto_tunnel(
    State(state): State<ApiState>,
    ApiJson(body): ApiJson<AutoTunnelBody>,
) -> Result<Json<Value>, ApiError> {
    state.bastion.set_auto_tunnel(&body.instance_id, body.enabled)?;
    Ok(Json(json!({ "ok": true })))
}

pub async fn ssh_connection(
    State(state): State<ApiState>,
    Path(instance_id): Path<String>,
) -> Result<Json<SshConnection>, ApiError> {
    Ok(Json(resolve_ssh(&state, &instance_id)?))
}

/// Run one request received over the WebSocket endpoint
pub async fn execute(state: &ApiState, request: LocalRequest) -> Result<LocalResponse, ApiError> {
    let response = match request {
        LocalRequest::ExposePort {
            instance_id,
            port,
            target_port,
        } => {
            let outcome = state.bastion.expose(&instance_id, port, target_port).await?;
            LocalResponse::Exposed {
                pending: outcome == ExposeOutcome::Pending,
            }
        }
        LocalRequest::Refresh => {
            let summary = state.bastion.resync().await?;
            LocalResponse::Refreshed {
                instances: summary.instances,
                tunnels: summary.tunnels,
            }
        }
        LocalRequest::TunnelStatus { instance_id } => LocalResponse::Tunnels {
            tunnels: tunnel_statuses(state, instance_id.as_deref())?,
        },
        LocalRequest::AutoTunnel {
            instance_id,
            enabled,
        } => {
            state.bastion.set_auto_tunnel(&instance_id, enabled)?;
            LocalResponse::Ok
        }
        LocalRequest::ResolveSshConnection { instance_id } => {
            LocalResponse::SshConnection(resolve_ssh(state, &instance_id)?)
        }
        LocalRequest::Ping => LocalResponse::Pong,
    };
    Ok(response)
}

fn tunnel_statuses(state: &ApiState, filter: Option<&str>) -> Result<Vec<TunnelStatus>, ApiError> {
    let snapshot = state.bastion.snapshot();
    let statuses = match filter {
        Some(raw) => {
            let id = InstanceId::parse(raw)?;
            snapshot.get(&id).map(|t| t.status()).into_iter().collect()
        }
        None => snapshot.tunnels().iter().map(|t| t.status()).collect(),
    };
    Ok(statuses)
}

fn resolve_ssh(state: &ApiState, instance_id: &str) -> Result<SshConnection, ApiError> {
    let path = state.ssh_config.as_ref().ok_or(ApiError::SshConfigDisabled)?;
    let id = InstanceId::parse(instance_id)?;
    let tunnel = state
        .bastion
        .tunnel(&id)
        .ok_or_else(|| ExposeError::UnknownInstance(id.to_string()))?;
    Ok(SshConnection {
        host: tunnel.host_alias().to_string(),
        config_file: path.display().to_string(),
    })
}
