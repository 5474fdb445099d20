// crates/o11y-harness-core/src/responder.rs
// ============================================================================
// Module: Request-Capturing HTTP Responder
// Description: Loopback HTTP listener that buffers whole requests for handlers.
// Purpose: Shared transport for the telemetry collector and platform doubles.
// Dependencies: axum, bytes, thiserror, tokio, tracing
// ============================================================================

//! ## Overview
//! [`RequestResponder`] binds a TCP listener (an OS-assigned loopback port by
//! default), buffers each request body completely, and hands the resulting
//! [`CapturedRequest`] to a synchronous [`RequestHandler`]. Handlers never see
//! partial bodies and never share buffers across connections.
//! Invariants:
//! - Bodies above [`ResponderSettings::max_body_bytes`] are rejected with `413`
//!   before the handler runs.
//! - Shutdown stops accepting connections, waits up to the grace period for
//!   the server task, then aborts it; the port is released either way.
//! - Dropping a responder without shutting it down still stops the server.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::net::Ipv4Addr;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::http::Method;
use axum::http::StatusCode;
use axum::http::Uri;
use axum::http::header::CONTENT_TYPE;
use axum::response::IntoResponse;
use axum::response::Response;
use bytes::Bytes;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Default request body cap (16 MiB).
pub const DEFAULT_MAX_BODY_BYTES: usize = 16 * 1024 * 1024;
/// Default wait for in-flight connections during shutdown.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);
/// Content type for plain-text replies.
pub const TEXT_PLAIN: &str = "text/plain";
/// Content type for JSON replies.
pub const APPLICATION_JSON: &str = "application/json";

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Errors raised while starting a responder.
///
/// # Invariants
/// - Variants are stable for programmatic handling.
#[derive(Debug, Error)]
pub enum ResponderError {
    /// The listener could not be bound.
    #[error("{name} bind failed: {reason}")]
    Bind {
        /// Responder name used in diagnostics.
        name: &'static str,
        /// Underlying I/O error text.
        reason: String,
    },
    /// The bound address could not be read back.
    #[error("{name} local address unavailable: {reason}")]
    LocalAddr {
        /// Responder name used in diagnostics.
        name: &'static str,
        /// Underlying I/O error text.
        reason: String,
    },
    /// The settings cannot produce a working listener.
    #[error("invalid responder settings: {0}")]
    InvalidSettings(String),
}

// ============================================================================
// SECTION: Request and Response Types
// ============================================================================

/// A fully buffered inbound request.
#[derive(Debug, Clone)]
pub struct CapturedRequest {
    /// Request method.
    pub method: Method,
    /// Request path without the query string.
    pub path: String,
    /// Request headers.
    pub headers: HeaderMap,
    /// Complete request body.
    pub body: Bytes,
}

impl CapturedRequest {
    /// Returns a header value when present and valid UTF-8.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }
}

/// A canned reply produced by a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CannedResponse {
    /// Response status.
    pub status: StatusCode,
    /// Response content type.
    pub content_type: &'static str,
    /// Response body.
    pub body: Bytes,
}

impl CannedResponse {
    /// Builds a plain-text response.
    #[must_use]
    pub fn text(status: StatusCode, body: impl Into<String>) -> Self {
        Self {
            status,
            content_type: TEXT_PLAIN,
            body: Bytes::from(body.into()),
        }
    }

    /// Builds a `200 OK` JSON response with a verbatim body.
    #[must_use]
    pub const fn json(body: Bytes) -> Self {
        Self {
            status: StatusCode::OK,
            content_type: APPLICATION_JSON,
            body,
        }
    }

    /// Builds a `405 Method Not Allowed` response.
    #[must_use]
    pub fn method_not_allowed(method: &Method) -> Self {
        Self::text(StatusCode::METHOD_NOT_ALLOWED, format!("method {method} not allowed"))
    }

    /// Builds a `404 Not Found` response.
    #[must_use]
    pub fn not_found(path: &str) -> Self {
        Self::text(StatusCode::NOT_FOUND, format!("no route for {path}"))
    }
}

impl IntoResponse for CannedResponse {
    fn into_response(self) -> Response {
        (self.status, [(CONTENT_TYPE, self.content_type)], self.body).into_response()
    }
}

/// Synchronous handler invoked once per fully buffered request.
pub trait RequestHandler: Send + Sync + 'static {
    /// Produces the reply for a captured request.
    fn handle(&self, request: CapturedRequest) -> CannedResponse;
}

// ============================================================================
// SECTION: Settings
// ============================================================================

/// Listener settings for a responder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponderSettings {
    /// Name used in logs and errors.
    pub name: &'static str,
    /// Address to bind; port `0` lets the OS choose.
    pub bind_addr: SocketAddr,
    /// Maximum accepted request body size.
    pub max_body_bytes: usize,
    /// Wait for the server task during shutdown before aborting it.
    pub shutdown_grace: Duration,
}

impl Default for ResponderSettings {
    fn default() -> Self {
        Self::named("responder")
    }
}

impl ResponderSettings {
    /// Default loopback settings with a diagnostic name.
    #[must_use]
    pub const fn named(name: &'static str) -> Self {
        Self {
            name,
            bind_addr: SocketAddr::new(std::net::IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }

    /// Validates the settings.
    fn validate(&self) -> Result<(), ResponderError> {
        if self.max_body_bytes == 0 {
            return Err(ResponderError::InvalidSettings(
                "max_body_bytes must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// SECTION: Responder
// ============================================================================

/// Shared state for the capture route.
#[derive(Clone)]
struct ResponderState {
    /// Responder name used in logs.
    name: &'static str,
    /// Handler receiving captured requests.
    handler: Arc<dyn RequestHandler>,
}

/// Handle for a running request-capturing listener.
pub struct RequestResponder {
    /// Responder name used in logs.
    name: &'static str,
    /// Bound listener address.
    local_addr: SocketAddr,
    /// Shutdown trigger for the server task.
    shutdown: Option<oneshot::Sender<()>>,
    /// Server task handle.
    join: Option<JoinHandle<()>>,
    /// Wait for the server task during shutdown.
    shutdown_grace: Duration,
}

impl std::fmt::Debug for RequestResponder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestResponder")
            .field("name", &self.name)
            .field("local_addr", &self.local_addr)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl RequestResponder {
    /// Binds a listener and starts serving requests with `handler`.
    ///
    /// # Errors
    ///
    /// Returns [`ResponderError`] when the settings are invalid or the
    /// listener cannot be bound.
    pub async fn bind(
        settings: ResponderSettings,
        handler: Arc<dyn RequestHandler>,
    ) -> Result<Self, ResponderError> {
        settings.validate()?;
        let name = settings.name;
        let listener =
            TcpListener::bind(settings.bind_addr).await.map_err(|err| ResponderError::Bind {
                name,
                reason: err.to_string(),
            })?;
        let local_addr = listener.local_addr().map_err(|err| ResponderError::LocalAddr {
            name,
            reason: err.to_string(),
        })?;
        let state = ResponderState {
            name,
            handler,
        };
        let app = Router::new()
            .fallback(capture)
            .layer(DefaultBodyLimit::max(settings.max_body_bytes))
            .with_state(state);
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let join = tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            });
            if let Err(err) = server.await {
                tracing::warn!(responder = name, error = %err, "responder server failed");
            }
        });
        tracing::info!(responder = name, addr = %local_addr, "responder listening");
        Ok(Self {
            name,
            local_addr,
            shutdown: Some(shutdown_tx),
            join: Some(join),
            shutdown_grace: settings.shutdown_grace,
        })
    }

    /// Returns the bound address.
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Builds an `http://` URL for `path` on the bound address.
    #[must_use]
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.local_addr)
    }

    /// Returns true while the server task is alive.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.join.as_ref().is_some_and(|join| !join.is_finished())
    }

    /// Stops the listener and waits for the server task to finish.
    pub async fn shutdown(mut self) {
        self.stop().await;
    }

    /// Signals shutdown, waits out the grace period, then aborts.
    async fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(mut join) = self.join.take() {
            if tokio::time::timeout(self.shutdown_grace, &mut join).await.is_err() {
                tracing::warn!(responder = self.name, "graceful shutdown timed out; aborting");
                join.abort();
                let _ = join.await;
            }
            tracing::info!(responder = self.name, addr = %self.local_addr, "responder stopped");
        }
    }
}

impl Drop for RequestResponder {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(join) = self.join.take() {
            join.abort();
        }
    }
}

/// Capture route: every method and path lands here with a buffered body.
async fn capture(
    State(state): State<ResponderState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> CannedResponse {
    let request = CapturedRequest {
        method,
        path: uri.path().to_string(),
        headers,
        body,
    };
    tracing::debug!(
        responder = state.name,
        method = %request.method,
        path = %request.path,
        bytes = request.body.len(),
        "request buffered"
    );
    state.handler.handle(request)
}
