//! Integration tests for the local control API

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use lc_bastion::api::build_router;
use lc_bastion::{ApiState, Bastion, BastionConfig, ObserverSet, OriginGate, SshConfigWriter};
use lc_core::{CloseReason, ControlPlane, InstanceUpdates, SessionError};
use lc_protocol::WorkspaceInstance;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tower::ServiceExt; // For `oneshot` method

const ALLOWED_ORIGIN: &str = "https://amber-dog-1a2b3c4d.ws-eu01.gitpod.io";

struct StaticSource {
    instances: Mutex<Vec<WorkspaceInstance>>,
}

#[async_trait]
impl ControlPlane for StaticSource {
    async fn token_scopes(&self) -> Result<Vec<String>, SessionError> {
        Ok(Vec::new())
    }
    async fn list_instances(&self) -> Result<Vec<WorkspaceInstance>, SessionError> {
        Ok(self.instances.lock().clone())
    }
    async fn owner_token(&self, workspace_id: &str) -> Result<String, SessionError> {
        Ok(format!("owner-{}", workspace_id))
    }
    fn subscribe(&self) -> Result<InstanceUpdates, SessionError> {
        Err(SessionError::AlreadySubscribed)
    }
    async fn closed(&self) -> CloseReason {
        CloseReason::Shutdown
    }
    async fn close(&self) {}
}

fn instance(id: &str, ws: &str) -> WorkspaceInstance {
    serde_json::from_value(json!({
        "id": id,
        "workspaceId": ws,
        "ideUrl": format!("https://{}.ws-eu01.gitpod.io", ws),
        "status": {"phase": "running", "exposedPorts": [{"port": 3000}]}
    }))
    .unwrap()
}

fn bastion_config() -> BastionConfig {
    BastionConfig {
        origin_host: "gitpod.io".to_string(),
        auto_tunnel: true,
        pending_expose_ttl: Duration::from_secs(300),
        liveness_timeout: Duration::from_millis(100),
        liveness_attempts: 1,
    }
}

/// Helper to create an API router with a static control-plane source
fn create_test_app(
    instances: Vec<WorkspaceInstance>,
    ssh_config: Option<std::path::PathBuf>,
) -> (Router, Arc<Bastion>) {
    let mut observers = ObserverSet::new();
    if let Some(path) = &ssh_config {
        observers
            .register(Arc::new(SshConfigWriter::new(path.clone())))
            .unwrap();
    }
    let bastion = Bastion::new(bastion_config(), observers);
    bastion.attach(Arc::new(StaticSource {
        instances: Mutex::new(instances),
    }));

    let state = ApiState {
        bastion: bastion.clone(),
        gate: Arc::new(OriginGate::new("gitpod.io", false).unwrap()),
        ssh_config,
        ping_interval: Duration::from_secs(15),
    };
    (build_router(state), bastion)
}

fn post_json(uri: &str, origin: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .uri(uri)
        .method("POST")
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(origin) = origin {
        builder = builder.header(header::ORIGIN, origin);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn test_health_without_origin() {
    let (app, _) = create_test_app(Vec::new(), None);
    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_disallowed_origin_is_forbidden() {
    let (app, bastion) = create_test_app(vec![instance("i1", "amber-dog-1a2b3c4d")], None);
    bastion.resync().await.unwrap();

    let response = app
        .oneshot(post_json(
            "/api/v1/expose-port",
            Some("https://evil.com"),
            json!({"instanceId": "i1", "port": 8080}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body = body_json(response).await;
    assert_eq!(body["ok"], false);

    // Nothing changed
    let tunnel = bastion.snapshot();
    assert_eq!(tunnel.tunnels()[0].forwards.len(), 1);
}

#[tokio::test]
async fn test_expose_from_workspace_origin() {
    let (app, bastion) = create_test_app(vec![instance("i1", "amber-dog-1a2b3c4d")], None);
    bastion.resync().await.unwrap();

    let response = app
        .oneshot(post_json(
            "/api/v1/expose-port",
            Some(ALLOWED_ORIGIN),
            json!({"instanceId": "i1", "port": 8080, "targetPort": 80}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
            .unwrap(),
        ALLOWED_ORIGIN
    );
    let body = body_json(response).await;
    assert_eq!(body, json!({"ok": true, "pending": false}));

    let forwards: Vec<(u16, u16)> = bastion.snapshot().tunnels()[0]
        .forwards
        .iter()
        .map(|p| (p.local_port, p.target_port))
        .collect();
    assert_eq!(forwards, vec![(3000, 3000), (8080, 80)]);
}

#[tokio::test]
async fn test_expose_invalid_port() {
    let (app, _) = create_test_app(Vec::new(), None);
    let response = app
        .oneshot(post_json(
            "/api/v1/expose-port",
            None,
            json!({"instanceId": "i1", "port": 70000}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["ok"], false);
    assert_eq!(body["error"], "Invalid port: 70000");
}

#[tokio::test]
async fn test_malformed_bodies_get_error_json() {
    let (app, bastion) = create_test_app(Vec::new(), None);

    let not_json = Request::builder()
        .uri("/api/v1/expose-port")
        .method("POST")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let response = app.clone().oneshot(not_json).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["ok"], false);
    assert!(body["error"].as_str().unwrap().starts_with("Invalid request body"));

    let wrong_shape = post_json("/api/v1/expose-port", None, json!({"port": "eighty"}));
    let response = app.clone().oneshot(wrong_shape).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body = body_json(response).await;
    assert_eq!(body["ok"], false);
    assert!(body["error"].is_string());

    let no_content_type = Request::builder()
        .uri("/api/v1/auto-tunnel")
        .method("POST")
        .body(Body::from(r#"{"instanceId":"i1","enabled":true}"#))
        .unwrap();
    let response = app.oneshot(no_content_type).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    assert_eq!(body_json(response).await["ok"], false);

    assert_eq!(bastion.pending_count(), 0);
}

#[tokio::test]
async fn test_expose_for_unknown_instance_is_buffered() {
    let (app, bastion) = create_test_app(Vec::new(), None);
    let response = app
        .oneshot(post_json(
            "/api/v1/expose-port",
            None,
            json!({"instanceId": "later", "port": 5000}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["pending"], true);
    assert_eq!(bastion.pending_count(), 1);
}

#[tokio::test]
async fn test_refresh_reports_counts() {
    let (app, _) = create_test_app(
        vec![instance("i1", "amber-dog-1a2b3c4d"), instance("i2", "blue-cat-9z8y7x6w")],
        None,
    );
    let response = app
        .oneshot(post_json("/api/v1/refresh", Some(ALLOWED_ORIGIN), json!({})))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, json!({"instances": 2, "tunnels": 2}));
}

#[tokio::test]
async fn test_tunnels_listing_and_filter() {
    let (app, bastion) = create_test_app(
        vec![instance("i1", "amber-dog-1a2b3c4d"), instance("i2", "blue-cat-9z8y7x6w")],
        None,
    );
    bastion.resync().await.unwrap();

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/api/v1/tunnels").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body.as_array().unwrap().len(), 2);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/v1/tunnels?instanceId=i2")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body[0]["workspaceId"], "blue-cat-9z8y7x6w");
    assert_eq!(body[0]["forwards"][0]["localPort"], 3000);
}

#[tokio::test]
async fn test_auto_tunnel_toggle() {
    let (app, bastion) = create_test_app(vec![instance("i1", "amber-dog-1a2b3c4d")], None);
    bastion.resync().await.unwrap();

    let response = app
        .clone()
        .oneshot(post_json(
            "/api/v1/auto-tunnel",
            None,
            json!({"instanceId": "i1", "enabled": false}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(bastion.snapshot().tunnels()[0].forwards.is_empty());

    let response = app
        .oneshot(post_json(
            "/api/v1/auto-tunnel",
            None,
            json!({"instanceId": "nope", "enabled": true}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_ssh_connection_resolution() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ssh_config");
    let (app, bastion) = create_test_app(
        vec![instance("i1", "amber-dog-1a2b3c4d")],
        Some(path.clone()),
    );
    bastion.resync().await.unwrap();
    bastion.settled().await;

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/v1/ssh-connection/i1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["host"], "amber-dog-1a2b3c4d");
    assert_eq!(body["configFile"], path.display().to_string());

    let config = std::fs::read_to_string(&path).unwrap();
    assert!(config.contains("Host amber-dog-1a2b3c4d"));
    assert!(config.contains("HostName amber-dog-1a2b3c4d.ssh.ws-eu01.gitpod.io"));
}

#[tokio::test]
async fn test_ssh_connection_when_disabled() {
    let (app, _) = create_test_app(Vec::new(), None);
    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/v1/ssh-connection/i1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_websocket_requires_origin() {
    let (app, _) = create_test_app(Vec::new(), None);
    let request = Request::builder()
        .uri("/api/v1/ws")
        .header(header::CONNECTION, "upgrade")
        .header(header::UPGRADE, "websocket")
        .header(header::SEC_WEBSOCKET_VERSION, "13")
        .header(header::SEC_WEBSOCKET_KEY, "dGhlIHNhbXBsZSBub25jZQ==")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_reconnect_resync_to_zero_empties_config() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ssh_config");
    let (_, bastion) = create_test_app(
        vec![instance("i1", "amber-dog-1a2b3c4d")],
        Some(path.clone()),
    );
    bastion.resync().await.unwrap();
    bastion.settled().await;
    assert!(std::fs::read_to_string(&path).unwrap().contains("Host "));

    bastion.attach(Arc::new(StaticSource {
        instances: Mutex::new(Vec::new()),
    }));
    bastion.resync().await.unwrap();
    bastion.settled().await;

    assert!(bastion.snapshot().is_empty());
    assert!(!std::fs::read_to_string(&path).unwrap().contains("Host "));
}
