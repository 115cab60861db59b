use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::to_bytes;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use relay_config::Config;
use relay_contracts::{CallbackRequest, ErrorResponse, SIGNATURE_HEADER};
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod gateway;
pub mod provider;
pub mod relay;
pub mod store;

pub use gateway::{GatewayError, LineGateway, MessagingGateway};
pub use provider::{CompletionProvider, GeminiProvider, ProviderError};
pub use relay::{Deadline, DispatchOutcome, Relay, RelaySettings};
pub use store::{MemoryStore, SettingsStore, SqliteStore, StoreError};

/// Same ceiling axum's `Bytes` extractor applies by default.
const MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

pub async fn serve(cfg: Config) -> Result<(), String> {
    let addr: SocketAddr = cfg
        .server
        .listen_addr
        .parse()
        .map_err(|e| format!("invalid listen_addr: {e}"))?;

    let app = build_app(cfg)?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| format!("bind failed: {e}"))?;
    info!(%addr, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| format!("serve failed: {e}"))
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

/// Handles to the three outside systems the relay talks to. Built once at
/// startup and shared by every request.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn SettingsStore>,
    pub provider: Arc<dyn CompletionProvider>,
    pub gateway: Arc<dyn MessagingGateway>,
}

impl Collaborators {
    pub fn from_config(cfg: &Config) -> Result<Self, String> {
        Ok(Self {
            store: store::open_store(&cfg.store)?,
            provider: Arc::new(GeminiProvider::new(&cfg.gemini).map_err(|e| e.to_string())?),
            gateway: Arc::new(LineGateway::new(&cfg.line).map_err(|e| e.to_string())?),
        })
    }
}

pub fn build_app(cfg: Config) -> Result<Router, String> {
    let collaborators = Collaborators::from_config(&cfg)?;
    Ok(build_app_with(cfg, collaborators))
}

pub fn build_app_with(cfg: Config, collaborators: Collaborators) -> Router {
    let relay = Relay::new(
        collaborators.store,
        collaborators.provider,
        collaborators.gateway,
        RelaySettings::from_config(&cfg),
    );
    let state = AppState {
        relay: Arc::new(relay),
        channel_secret: Arc::from(cfg.line.channel_secret.as_str()),
    };
    Router::new()
        .route("/healthz", get(healthz))
        .route(&cfg.server.webhook_path, post(callback))
        .with_state(state)
}

#[derive(Clone)]
struct AppState {
    relay: Arc<Relay>,
    channel_secret: Arc<str>,
}

#[derive(Debug, Error)]
pub enum CallbackError {
    #[error("missing x-line-signature header")]
    MissingSignature,
    #[error("signature mismatch")]
    InvalidSignature,
    #[error("malformed callback body: {0}")]
    Malformed(String),
    #[error("failed to read callback body: {0}")]
    Body(String),
}

impl IntoResponse for CallbackError {
    fn into_response(self) -> Response {
        let (status, code) = match self {
            CallbackError::MissingSignature | CallbackError::InvalidSignature => {
                (StatusCode::UNAUTHORIZED, "invalid_signature")
            }
            CallbackError::Malformed(_) | CallbackError::Body(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "malformed_request")
            }
        };
        (status, Json(ErrorResponse::new(code, self.to_string()))).into_response()
    }
}

/// Checks the signature over the raw body before looking at its contents.
pub fn parse_callback(
    channel_secret: &str,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<CallbackRequest, CallbackError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(CallbackError::MissingSignature)?;
    if !relay_kernel::signature::verify(channel_secret, body, signature) {
        return Err(CallbackError::InvalidSignature);
    }
    serde_json::from_slice(body).map_err(|e| CallbackError::Malformed(e.to_string()))
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

/// The deadline starts when the request head arrives, before the body is read.
async fn callback(State(state): State<AppState>, request: Request) -> Response {
    let deadline = Deadline::after(state.relay.settings().request_timeout);
    let span = info_span!("callback", request_id = %Uuid::new_v4());

    async move {
        let (parts, body) = request.into_parts();
        let body = match to_bytes(body, MAX_BODY_BYTES).await {
            Ok(body) => body,
            Err(err) => {
                let err = CallbackError::Body(err.to_string());
                warn!(error = %err, "rejecting webhook request");
                return err.into_response();
            }
        };
        let callback = match parse_callback(&state.channel_secret, &parts.headers, &body) {
            Ok(callback) => callback,
            Err(err) => {
                warn!(error = %err, "rejecting webhook request");
                return err.into_response();
            }
        };

        info!(
            destination = %callback.destination,
            events = callback.events.len(),
            "webhook received"
        );
        let outcome = state.relay.dispatch(callback.events, deadline).await;
        info!(
            total = outcome.total,
            abandoned = outcome.abandoned,
            "webhook handled"
        );
        StatusCode::OK.into_response()
    }
    .instrument(span)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn parse_callback_checks_signature_before_body() {
        let body = b"not json";
        let mut headers = HeaderMap::new();
        assert!(matches!(
            parse_callback("s", &headers, body),
            Err(CallbackError::MissingSignature)
        ));

        headers.insert(SIGNATURE_HEADER, HeaderValue::from_static("bogus"));
        assert!(matches!(
            parse_callback("s", &headers, body),
            Err(CallbackError::InvalidSignature)
        ));

        let sig = relay_kernel::signature::sign("s", body);
        headers.insert(SIGNATURE_HEADER, HeaderValue::from_str(&sig).unwrap());
        assert!(matches!(
            parse_callback("s", &headers, body),
            Err(CallbackError::Malformed(_))
        ));
    }

    #[test]
    fn rejection_statuses() {
        assert_eq!(
            CallbackError::InvalidSignature.into_response().status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            CallbackError::Malformed("x".to_string())
                .into_response()
                .status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            CallbackError::Body("length limit exceeded".to_string())
                .into_response()
                .status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
