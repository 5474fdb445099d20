// crates/o11y-harness-core/src/collector.rs
// ============================================================================
// Module: Telemetry Collector Double
// Description: Mock OTLP/HTTP metrics endpoint with a derived name index.
// Purpose: Record every export a worker pushes and make its names queryable.
// Dependencies: axum, serde_json, tokio, tracing
// ============================================================================

//! ## Overview
//! [`TelemetryCollector`] serves `POST /v1/metrics`. Each fully buffered body
//! is decoded as an OTLP JSON export, appended to an insertion-ordered history
//! and followed by a rebuild of the [`MetricNameIndex`] over the whole history.
//! Malformed bodies are answered with `400` and counted; the collector keeps
//! serving.
//! Invariants:
//! - After every append the metric index equals the union of metric names over
//!   all payloads received since the last start.
//! - Append and reindex happen under one lock acquisition, so readers never
//!   observe a payload without its names (or the reverse).
//! - `start` and `dispose` clear the history and both indexes.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use axum::http::Method;
use axum::http::StatusCode;
use serde_json::Value;

use crate::otlp::DecodeError;
use crate::otlp::DecodedExport;
use crate::otlp::decode_export;
use crate::responder::CannedResponse;
use crate::responder::CapturedRequest;
use crate::responder::RequestHandler;
use crate::responder::RequestResponder;
use crate::responder::ResponderError;
use crate::responder::ResponderSettings;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Ingestion path for OTLP/HTTP metric exports.
pub const METRICS_PATH: &str = "/v1/metrics";

// ============================================================================
// SECTION: Captured Payloads
// ============================================================================

/// One accepted export, immutable once stored.
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedPayload {
    /// 1-based position in the collector history.
    sequence: u64,
    /// Size of the request body in bytes.
    byte_len: usize,
    /// Decoded document, verbatim.
    document: Value,
    /// Metric names in document order.
    metric_names: Vec<String>,
    /// Scope names in document order.
    scope_names: Vec<String>,
}

impl CapturedPayload {
    /// Returns the 1-based position in the history.
    #[must_use]
    pub const fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Returns the body size in bytes.
    #[must_use]
    pub const fn byte_len(&self) -> usize {
        self.byte_len
    }

    /// Returns the decoded document.
    #[must_use]
    pub const fn document(&self) -> &Value {
        &self.document
    }

    /// Returns the metric names carried by this payload, in document order.
    #[must_use]
    pub fn metric_names(&self) -> &[String] {
        &self.metric_names
    }

    /// Returns the scope names carried by this payload, in document order.
    #[must_use]
    pub fn scope_names(&self) -> &[String] {
        &self.scope_names
    }
}

// ============================================================================
// SECTION: Name Index
// ============================================================================

/// Set of distinct names derived from a payload history.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricNameIndex {
    /// Distinct names.
    names: BTreeSet<String>,
}

impl MetricNameIndex {
    /// Builds an index from any sequence of names.
    pub fn from_names<'a, I>(names: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        Self {
            names: names.into_iter().map(ToString::to_string).collect(),
        }
    }

    /// Rebuilds the metric-name index over a full payload history.
    #[must_use]
    pub fn from_history(history: &[Arc<CapturedPayload>]) -> Self {
        Self::from_names(
            history.iter().flat_map(|payload| payload.metric_names.iter().map(String::as_str)),
        )
    }

    /// Rebuilds the scope-name index over a full payload history.
    #[must_use]
    pub fn scopes_from_history(history: &[Arc<CapturedPayload>]) -> Self {
        Self::from_names(
            history.iter().flat_map(|payload| payload.scope_names.iter().map(String::as_str)),
        )
    }

    /// Returns true when `name` is indexed.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    /// Returns the number of distinct names.
    #[must_use]
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Returns true when no names are indexed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Returns the indexed names.
    #[must_use]
    pub const fn names(&self) -> &BTreeSet<String> {
        &self.names
    }

    /// Consumes the index and returns its names.
    #[must_use]
    pub fn into_names(self) -> BTreeSet<String> {
        self.names
    }
}

// ============================================================================
// SECTION: Ledger
// ============================================================================

/// Mutable collector state guarded by one mutex.
#[derive(Debug, Default)]
struct CollectorLedger {
    /// Accepted payloads in append order.
    payloads: Vec<Arc<CapturedPayload>>,
    /// Metric names across `payloads`.
    metric_names: MetricNameIndex,
    /// Scope names across `payloads`.
    scope_names: MetricNameIndex,
    /// Bodies that failed to decode.
    rejected: u64,
}

impl CollectorLedger {
    /// Appends a decoded export and rebuilds both indexes.
    fn append(&mut self, decoded: DecodedExport, byte_len: usize) -> Arc<CapturedPayload> {
        let sequence = u64::try_from(self.payloads.len()).unwrap_or(u64::MAX).saturating_add(1);
        let payload = Arc::new(CapturedPayload {
            sequence,
            byte_len,
            document: decoded.document,
            metric_names: decoded.metric_names,
            scope_names: decoded.scope_names,
        });
        self.payloads.push(Arc::clone(&payload));
        self.reindex();
        payload
    }

    /// Recomputes both indexes from the full history.
    fn reindex(&mut self) {
        self.metric_names = MetricNameIndex::from_history(&self.payloads);
        self.scope_names = MetricNameIndex::scopes_from_history(&self.payloads);
    }

    /// Drops all history, indexes and counters.
    fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Shared ledger handle used by the collector and its request handler.
#[derive(Debug, Clone, Default)]
struct SharedLedger(Arc<Mutex<CollectorLedger>>);

impl SharedLedger {
    /// Locks the ledger, recovering from a poisoned lock.
    fn lock(&self) -> MutexGuard<'_, CollectorLedger> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Decodes and records one export body.
    fn ingest(&self, body: &[u8]) -> Result<Arc<CapturedPayload>, DecodeError> {
        match decode_export(body) {
            Ok(decoded) => {
                let payload = self.lock().append(decoded, body.len());
                tracing::debug!(
                    sequence = payload.sequence,
                    bytes = payload.byte_len,
                    metric_count = payload.metric_names.len(),
                    "telemetry payload indexed"
                );
                Ok(payload)
            }
            Err(err) => {
                let mut ledger = self.lock();
                ledger.rejected = ledger.rejected.saturating_add(1);
                drop(ledger);
                tracing::warn!(bytes = body.len(), error = %err, "telemetry payload rejected");
                Err(err)
            }
        }
    }
}

/// Request handler for the ingestion endpoint.
struct CollectorHandler {
    /// Ledger receiving accepted payloads.
    ledger: SharedLedger,
}

impl RequestHandler for CollectorHandler {
    fn handle(&self, request: CapturedRequest) -> CannedResponse {
        if request.path != METRICS_PATH {
            return CannedResponse::not_found(&request.path);
        }
        if request.method != Method::POST {
            return CannedResponse::method_not_allowed(&request.method);
        }
        match self.ledger.ingest(&request.body) {
            Ok(_) => CannedResponse::text(StatusCode::OK, "OK"),
            Err(err) => CannedResponse::text(StatusCode::BAD_REQUEST, err.to_string()),
        }
    }
}

// ============================================================================
// SECTION: Collector
// ============================================================================

/// Mock telemetry collector with an ordered history and name indexes.
#[derive(Debug)]
pub struct TelemetryCollector {
    /// Shared state.
    ledger: SharedLedger,
    /// Listener settings used on start.
    settings: ResponderSettings,
    /// Running listener, when started.
    responder: Option<RequestResponder>,
}

impl Default for TelemetryCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetryCollector {
    /// Creates a stopped collector with default loopback settings.
    #[must_use]
    pub fn new() -> Self {
        Self::with_settings(ResponderSettings::named("telemetry-collector"))
    }

    /// Creates a stopped collector with explicit listener settings.
    #[must_use]
    pub fn with_settings(settings: ResponderSettings) -> Self {
        Self {
            ledger: SharedLedger::default(),
            settings,
            responder: None,
        }
    }

    /// Clears all state and starts listening. A running collector is stopped
    /// first.
    ///
    /// # Errors
    ///
    /// Returns [`ResponderError`] when the listener cannot be bound.
    pub async fn start(&mut self) -> Result<(), ResponderError> {
        self.dispose().await;
        let handler = Arc::new(CollectorHandler {
            ledger: self.ledger.clone(),
        });
        self.responder = Some(RequestResponder::bind(self.settings.clone(), handler).await?);
        Ok(())
    }

    /// Stops the listener and discards all recorded state. No-op when stopped.
    pub async fn dispose(&mut self) {
        if let Some(responder) = self.responder.take() {
            responder.shutdown().await;
        }
        self.ledger.lock().reset();
    }

    /// Returns true while the listener is serving.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.responder.as_ref().is_some_and(RequestResponder::is_running)
    }

    /// Returns the bound address when started.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.responder.as_ref().map(RequestResponder::local_addr)
    }

    /// Returns the ingestion URL when started.
    #[must_use]
    pub fn metrics_url(&self) -> Option<String> {
        self.responder.as_ref().map(|responder| responder.url(METRICS_PATH))
    }

    /// Decodes and records an export body without going through HTTP.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError`] when the body is malformed; the rejection is
    /// counted and the history is left untouched.
    pub fn ingest(&self, body: &[u8]) -> Result<Arc<CapturedPayload>, DecodeError> {
        self.ledger.ingest(body)
    }

    /// Returns a snapshot of the payload history in insertion order.
    #[must_use]
    pub fn payloads(&self) -> Vec<Arc<CapturedPayload>> {
        self.ledger.lock().payloads.clone()
    }

    /// Returns the number of accepted payloads.
    #[must_use]
    pub fn payload_count(&self) -> usize {
        self.ledger.lock().payloads.len()
    }

    /// Returns the distinct metric names seen so far.
    #[must_use]
    pub fn metric_names(&self) -> BTreeSet<String> {
        self.ledger.lock().metric_names.names().clone()
    }

    /// Returns a copy of the current metric-name index.
    #[must_use]
    pub fn metric_index(&self) -> MetricNameIndex {
        self.ledger.lock().metric_names.clone()
    }

    /// Returns true when `name` has been seen in any payload.
    #[must_use]
    pub fn contains_metric(&self, name: &str) -> bool {
        self.ledger.lock().metric_names.contains(name)
    }

    /// Returns the distinct instrumentation scope names seen so far.
    #[must_use]
    pub fn scope_names(&self) -> BTreeSet<String> {
        self.ledger.lock().scope_names.names().clone()
    }

    /// Returns the number of bodies rejected as malformed.
    #[must_use]
    pub fn rejected_count(&self) -> u64 {
        self.ledger.lock().rejected
    }

    /// Recomputes the indexes from the current history and returns the
    /// metric-name index. The result never differs from [`Self::metric_index`].
    #[must_use]
    pub fn reindex(&self) -> MetricNameIndex {
        let mut ledger = self.ledger.lock();
        ledger.reindex();
        ledger.metric_names.clone()
    }
}
