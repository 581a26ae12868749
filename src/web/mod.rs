use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{self, HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

use crate::config::{ListenAddr, Settings};
use crate::runner::{Runner, RunnerError};

/// Shared, read-only state handed to every request handler.
#[derive(Clone)]
pub struct AppState {
    pub runner: Arc<dyn Runner + Send + Sync>,
    pub read_timeout: Duration,
    pub max_body_bytes: u64,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("command", &self.runner.command_line())
            .field("read_timeout", &self.read_timeout)
            .field("max_body_bytes", &self.max_body_bytes)
            .finish()
    }
}

impl AppState {
    pub fn new(runner: impl Runner + Send + Sync + 'static, settings: &Settings) -> Self {
        AppState {
            runner: Arc::new(runner),
            read_timeout: settings.read_timeout,
            max_body_bytes: settings.max_body_bytes,
        }
    }
}

pub fn create_app(state: AppState) -> Router {
    Router::new()
        // The webhook is accepted on every path.
        .route("/", post(receive_webhook))
        .route("/{*path}", post(receive_webhook))
        .with_state(state)
        .layer(
            ServiceBuilder::new().layer(
                TraceLayer::new_for_http()
                    .make_span_with(|request: &http::Request<_>| {
                        tracing::info_span!(
                            "http_request",
                            method = %request.method(),
                            uri = %request.uri(),
                            version = ?request.version(),
                        )
                    })
                    .on_request(|request: &http::Request<_>, _span: &tracing::Span| {
                        info!("Received {} request", request.method());
                    })
                    .on_response(
                        |response: &http::Response<_>, latency: Duration, _span: &tracing::Span| {
                            info!(
                                status = %response.status(),
                                latency = ?latency,
                                "Finished processing request"
                            );
                        },
                    ),
            ),
        )
}

pub async fn receive_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, WebhookError> {
    let declared = declared_length(&headers)?;
    debug!("Declared body length: {}", declared);

    if declared > state.max_body_bytes {
        return Err(WebhookError::PayloadTooLarge {
            declared,
            limit: state.max_body_bytes,
        });
    }

    let bytes = read_body(body, declared, state.read_timeout).await?;
    parse_payload(&bytes)?;

    info!("Running command: {}", state.runner.command_line());
    let launched = state.runner.launch()?;
    debug!(pid = ?launched.pid, "Deploy command launched");

    info!("Finished processing POST request");
    Ok(plain_response(StatusCode::OK))
}

fn declared_length(headers: &HeaderMap) -> Result<u64, WebhookError> {
    let value = headers
        .get(header::CONTENT_LENGTH)
        .ok_or(WebhookError::MissingContentLength)?;

    value
        .to_str()
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .ok_or_else(|| {
            WebhookError::InvalidContentLength(String::from_utf8_lossy(value.as_bytes()).into_owned())
        })
}

async fn read_body(body: Body, declared: u64, timeout: Duration) -> Result<Bytes, WebhookError> {
    let limit = usize::try_from(declared).unwrap_or(usize::MAX);

    match tokio::time::timeout(timeout, axum::body::to_bytes(body, limit)).await {
        Ok(result) => result.map_err(WebhookError::BodyRead),
        Err(_) => Err(WebhookError::SlowClient(timeout)),
    }
}

/// Gates on well-formed JSON. The decoded value is never inspected.
pub fn parse_payload(bytes: &[u8]) -> Result<serde_json::Value, WebhookError> {
    let text = std::str::from_utf8(bytes).map_err(|e| WebhookError::MalformedPayload {
        raw: String::from_utf8_lossy(bytes).into_owned(),
        reason: e.to_string(),
    })?;

    serde_json::from_str(text).map_err(|e| WebhookError::MalformedPayload {
        raw: text.to_string(),
        reason: e.to_string(),
    })
}

fn plain_response(status: StatusCode) -> Response {
    (status, [(header::CONTENT_TYPE, "text/plain")]).into_response()
}

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("missing Content-Length header")]
    MissingContentLength,
    #[error("invalid Content-Length header: {0}")]
    InvalidContentLength(String),
    #[error("declared body of {declared} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge { declared: u64, limit: u64 },
    #[error("invalid JSON: {reason}")]
    MalformedPayload { raw: String, reason: String },
    #[error("request body not received within {0:?}")]
    SlowClient(Duration),
    #[error("failed to read request body: {0}")]
    BodyRead(axum::Error),
    #[error(transparent)]
    Launch(#[from] RunnerError),
}

impl WebhookError {
    pub fn status(&self) -> StatusCode {
        match self {
            WebhookError::MissingContentLength
            | WebhookError::InvalidContentLength(_)
            | WebhookError::MalformedPayload { .. }
            | WebhookError::BodyRead(_) => StatusCode::BAD_REQUEST,
            WebhookError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            WebhookError::SlowClient(_) => StatusCode::REQUEST_TIMEOUT,
            WebhookError::Launch(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        match &self {
            WebhookError::MalformedPayload { raw, reason } => {
                error!("Unable to load JSON data '{}': {}", raw, reason);
            }
            WebhookError::SlowClient(_) => {
                error!("Aborting request: {}", self);
            }
            WebhookError::Launch(e) => {
                error!("Failed to launch deploy command: {}", e);
            }
            WebhookError::PayloadTooLarge { .. } => {
                error!("Payload too large: {}", self);
            }
            other => {
                error!("Bad request: {}", other);
            }
        }

        let mut response = plain_response(self.status());
        if matches!(self, WebhookError::SlowClient(_)) {
            // The rest of the body may still be in flight; drop the connection.
            response
                .headers_mut()
                .insert(header::CONNECTION, HeaderValue::from_static("close"));
        }
        response
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to bind to address {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Server error: {0}")]
    Serve(#[from] std::io::Error),
}

pub async fn start_server(addr: &ListenAddr, state: AppState) -> Result<(), ServerError> {
    let listener = tokio::net::TcpListener::bind((addr.host.as_str(), addr.port))
        .await
        .map_err(|source| {
            error!("Failed to bind to address {}: {}", addr, source);
            ServerError::Bind {
                addr: addr.to_string(),
                source,
            }
        })?;

    info!("Press Ctrl+C to stop the server");
    serve(listener, state, shutdown_signal()).await
}

/// Serves webhooks on an already bound listener until `shutdown` resolves,
/// then lets in-flight requests finish and closes the listener.
pub async fn serve<F>(
    listener: tokio::net::TcpListener,
    state: AppState,
    shutdown: F,
) -> Result<(), ServerError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = create_app(state);

    match listener.local_addr() {
        Ok(local) => info!("Starting deploy-hook at {}", local),
        Err(_) => info!("Starting deploy-hook"),
    }

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| {
            error!("Server error: {}", e);
            ServerError::Serve(e)
        })?;

    info!("Stopping deploy-hook server");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down gracefully");
        },
        _ = terminate => {
            info!("Received termination signal, shutting down gracefully");
        },
    }
}
