//! Interactive browser login
//!
//! OAuth2 authorization code flow with PKCE against the control plane. A
//! one-shot callback listener on 127.0.0.1 receives the code, which is then
//! exchanged for an access token.

use std::time::Duration;

use async_trait::async_trait;
use axum::{
    extract::{Query, State},
    response::{IntoResponse, Redirect, Response},
    routing::get,
    Router,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::RngCore;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use lc_core::{LoginError, LoginFlow, Origin, REQUIRED_SCOPES};

/// OAuth client identifier registered with the control plane
pub const CLIENT_ID: &str = "gplctl-1.0";

/// How long the user has to finish the flow in the browser
pub const LOGIN_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// PKCE verifier and its S256 challenge
#[derive(Debug, Clone)]
pub struct Pkce {
    pub verifier: String,
    pub challenge: String,
}

impl Pkce {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self::from_verifier(URL_SAFE_NO_PAD.encode(bytes))
    }

    pub fn from_verifier(verifier: String) -> Self {
        let challenge = URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()));
        Self {
            verifier,
            challenge,
        }
    }
}

fn random_state() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Build the URL the user opens to authorize the companion
pub fn authorize_url(
    origin: &Origin,
    redirect_uri: &str,
    challenge: &str,
    state: &str,
) -> Result<url::Url, LoginError> {
    let mut url = url::Url::parse(&format!("{}/api/oauth/authorize", origin))
        .map_err(|e| LoginError::Exchange(e.to_string()))?;
    url.query_pairs_mut()
        .append_pair("response_type", "code")
        .append_pair("client_id", CLIENT_ID)
        .append_pair("redirect_uri", redirect_uri)
        .append_pair("scope", &REQUIRED_SCOPES.join(" "))
        .append_pair("code_challenge", challenge)
        .append_pair("code_challenge_method", "S256")
        .append_pair("state", state);
    Ok(url)
}

#[derive(Debug, Deserialize)]
struct CallbackParams {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Clone)]
struct CallbackState {
    expected_state: String,
    redirect: Option<String>,
    result: mpsc::Sender<Result<String, LoginError>>,
}

async fn callback(
    State(state): State<CallbackState>,
    Query(params): Query<CallbackParams>,
) -> Response {
    let outcome = if let Some(error) = params.error {
        Err(LoginError::Denied(
            params.error_description.unwrap_or(error),
        ))
    } else if params.state.as_deref() != Some(state.expected_state.as_str()) {
        Err(LoginError::Denied("state mismatch".to_string()))
    } else {
        params
            .code
            .ok_or_else(|| LoginError::Denied("callback carried no code".to_string()))
    };

    let succeeded = outcome.is_ok();
    let _ = state.result.try_send(outcome);

    match (&state.redirect, succeeded) {
        (Some(redirect), true) => Redirect::to(redirect).into_response(),
        (_, true) => "Login complete. You can close this window.".into_response(),
        (_, false) => "Login failed. Check the companion logs.".into_response(),
    }
}

/// Browser-based login flow
#[derive(Debug, Clone)]
pub struct BrowserLogin {
    http: reqwest::Client,
    redirect: Option<String>,
    timeout: Duration,
}

impl BrowserLogin {
    /// `redirect` is where the browser lands after a successful callback
    pub fn new(redirect: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            redirect,
            timeout: LOGIN_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn receive_code(
        &self,
        origin: &Origin,
        pkce: &Pkce,
    ) -> Result<(String, String), LoginError> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let redirect_uri = format!("http://{}/callback", listener.local_addr()?);
        let expected_state = random_state();

        let (tx, mut rx) = mpsc::channel(1);
        let app = Router::new()
            .route("/callback", get(callback))
            .with_state(CallbackState {
                expected_state: expected_state.clone(),
                redirect: self.redirect.clone(),
                result: tx,
            });

        let shutdown = CancellationToken::new();
        let server_shutdown = shutdown.clone();
        let server = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
                .await
        });

        let url = authorize_url(origin, &redirect_uri, &pkce.challenge, &expected_state)?;
        tracing::info!("Open this URL in your browser to log in: {}", url);

        let outcome = tokio::time::timeout(self.timeout, rx.recv()).await;
        shutdown.cancel();
        let _ = server.await;

        match outcome {
            Ok(Some(code)) => Ok((code?, redirect_uri)),
            Ok(None) => Err(LoginError::Denied("callback listener stopped".to_string())),
            Err(_) => Err(LoginError::Timeout(self.timeout)),
        }
    }

    async fn exchange(
        &self,
        origin: &Origin,
        code: &str,
        redirect_uri: &str,
        pkce: &Pkce,
    ) -> Result<String, LoginError> {
        let response = self
            .http
            .post(format!("{}/api/oauth/token", origin))
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", redirect_uri),
                ("client_id", CLIENT_ID),
                ("code_verifier", pkce.verifier.as_str()),
            ])
            .send()
            .await
            .map_err(|e| LoginError::Exchange(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LoginError::Exchange(format!("{}: {}", status, body)));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| LoginError::Exchange(e.to_string()))?;
        Ok(token.access_token)
    }
}

#[async_trait]
impl LoginFlow for BrowserLogin {
    async fn login(&self, origin: &Origin) -> Result<String, LoginError> {
        let pkce = Pkce::generate();
        let (code, redirect_uri) = self.receive_code(origin, &pkce).await?;
        let token = self.exchange(origin, &code, &redirect_uri, &pkce).await?;
        tracing::info!(%origin, "Login succeeded");
        Ok(token)
    }
}
