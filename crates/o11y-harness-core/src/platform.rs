// crates/o11y-harness-core/src/platform.rs
// ============================================================================
// Module: Platform API Double
// Description: Content-routed mock of the platform analytics API.
// Purpose: Answer worker queries with canned fixture documents.
// Dependencies: axum, bytes, memchr, serde_json, thiserror, tracing
// ============================================================================

//! ## Overview
//! [`PlatformApiDouble`] answers every `POST` with a fixture chosen by a
//! [`RoutingTable`]: an ordered list of `(marker, fixture)` routes checked
//! against the raw request body. The first route whose marker occurs in the
//! body wins; when none match, the default fixture is returned.
//!
//! Default priority order (see [`QueryKind::PRIORITY`]):
//! 1. `d1AnalyticsAdaptiveGroups`
//! 2. `durableObjectsInvocationsAdaptiveGroups`
//! 3. `queueBacklogAdaptiveGroups`
//! 4. `workersInvocationsAdaptive`
//!
//! The default fixture is the worker analytics document.
//! Invariants:
//! - Fixtures are loaded and validated before the listener binds; a missing,
//!   empty or non-JSON fixture prevents startup.
//! - Responses are fixture bytes verbatim; no state survives a request.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use axum::http::Method;
use bytes::Bytes;
use memchr::memmem;
use serde::de::IgnoredAny;
use thiserror::Error;

use crate::responder::CannedResponse;
use crate::responder::CapturedRequest;
use crate::responder::RequestHandler;
use crate::responder::RequestResponder;
use crate::responder::ResponderError;
use crate::responder::ResponderSettings;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Path the harness hands to workers as the platform API base.
pub const PLATFORM_PATH: &str = "/";
/// Maximum fixture size accepted at startup.
pub const MAX_FIXTURE_BYTES: u64 = 8 * 1024 * 1024;

/// Returns the fixture directory shipped with this crate.
#[must_use]
pub fn default_fixture_dir() -> PathBuf {
    PathBuf::from(concat!(env!("CARGO_MANIFEST_DIR"), "/fixtures/platform"))
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Errors raised while loading fixture documents.
///
/// # Invariants
/// - Variants are stable for programmatic handling.
#[derive(Debug, Error)]
pub enum FixtureError {
    /// The fixture file could not be read.
    #[error("fixture {path} unreadable: {reason}")]
    Unreadable {
        /// Fixture path.
        path: String,
        /// Underlying I/O error text.
        reason: String,
    },
    /// The fixture file has no content.
    #[error("fixture {path} is empty")]
    Empty {
        /// Fixture path.
        path: String,
    },
    /// The fixture file exceeds [`MAX_FIXTURE_BYTES`].
    #[error("fixture {path} exceeds size limit")]
    TooLarge {
        /// Fixture path.
        path: String,
    },
    /// The fixture file is not a JSON document.
    #[error("fixture {path} is not valid json: {reason}")]
    Malformed {
        /// Fixture path.
        path: String,
        /// Parser error text.
        reason: String,
    },
}

/// Errors raised while starting the platform double.
#[derive(Debug, Error)]
pub enum PlatformError {
    /// Fixture loading failed; nothing was bound.
    #[error(transparent)]
    Fixture(#[from] FixtureError),
    /// The listener could not be started.
    #[error(transparent)]
    Listener(#[from] ResponderError),
}

// ============================================================================
// SECTION: Query Kinds
// ============================================================================

/// Upstream query shapes the double knows how to answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryKind {
    /// Worker invocation analytics.
    WorkerAnalytics,
    /// D1 database analytics.
    D1Analytics,
    /// Durable Objects invocation analytics.
    DurableObjectsAnalytics,
    /// Queue backlog analytics.
    QueueBacklogAnalytics,
}

impl QueryKind {
    /// Route evaluation order for the default table.
    pub const PRIORITY: [Self; 4] = [
        Self::D1Analytics,
        Self::DurableObjectsAnalytics,
        Self::QueueBacklogAnalytics,
        Self::WorkerAnalytics,
    ];

    /// Body substring identifying this query kind.
    #[must_use]
    pub const fn marker(self) -> &'static str {
        match self {
            Self::WorkerAnalytics => "workersInvocationsAdaptive",
            Self::D1Analytics => "d1AnalyticsAdaptiveGroups",
            Self::DurableObjectsAnalytics => "durableObjectsInvocationsAdaptiveGroups",
            Self::QueueBacklogAnalytics => "queueBacklogAdaptiveGroups",
        }
    }

    /// Fixture file name for this query kind.
    #[must_use]
    pub const fn fixture_file(self) -> &'static str {
        match self {
            Self::WorkerAnalytics => "worker-query-response.json",
            Self::D1Analytics => "d1-query-response.json",
            Self::DurableObjectsAnalytics => "durable-objects-query-response.json",
            Self::QueueBacklogAnalytics => "queue-backlog-query-response.json",
        }
    }

    /// Stable label for logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::WorkerAnalytics => "worker_analytics",
            Self::D1Analytics => "d1_analytics",
            Self::DurableObjectsAnalytics => "durable_objects_analytics",
            Self::QueueBacklogAnalytics => "queue_backlog_analytics",
        }
    }
}

// ============================================================================
// SECTION: Routing Table
// ============================================================================

/// One `(marker, fixture)` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixtureRoute {
    /// Query kind answered by this route.
    kind: QueryKind,
    /// Substring searched for in request bodies.
    marker: String,
    /// Fixture document served verbatim.
    document: Bytes,
}

impl FixtureRoute {
    /// Creates a route.
    #[must_use]
    pub fn new(kind: QueryKind, marker: impl Into<String>, document: Bytes) -> Self {
        Self {
            kind,
            marker: marker.into(),
            document,
        }
    }

    /// Returns the query kind.
    #[must_use]
    pub const fn kind(&self) -> QueryKind {
        self.kind
    }

    /// Returns the marker substring.
    #[must_use]
    pub fn marker(&self) -> &str {
        &self.marker
    }

    /// Returns the fixture document.
    #[must_use]
    pub const fn document(&self) -> &Bytes {
        &self.document
    }

    /// Returns true when the marker occurs in `body`.
    #[must_use]
    pub fn matches(&self, body: &[u8]) -> bool {
        !self.marker.is_empty() && memmem::find(body, self.marker.as_bytes()).is_some()
    }
}

/// Ordered routes plus a default fixture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingTable {
    /// Routes in evaluation order.
    routes: Vec<FixtureRoute>,
    /// Kind reported for unmatched bodies.
    default_kind: QueryKind,
    /// Document served for unmatched bodies.
    default_document: Bytes,
}

impl RoutingTable {
    /// Creates a table from explicit routes and a default.
    #[must_use]
    pub const fn new(
        routes: Vec<FixtureRoute>,
        default_kind: QueryKind,
        default_document: Bytes,
    ) -> Self {
        Self {
            routes,
            default_kind,
            default_document,
        }
    }

    /// Loads the default table from `dir`, one file per [`QueryKind`].
    ///
    /// # Errors
    ///
    /// Returns [`FixtureError`] when any fixture is missing or invalid.
    pub fn load(dir: &Path) -> Result<Self, FixtureError> {
        let mut routes = Vec::with_capacity(QueryKind::PRIORITY.len());
        for kind in QueryKind::PRIORITY {
            let document = load_fixture(&dir.join(kind.fixture_file()))?;
            routes.push(FixtureRoute::new(kind, kind.marker(), document));
        }
        let default_document = routes
            .iter()
            .find(|route| route.kind == QueryKind::WorkerAnalytics)
            .map(|route| route.document.clone())
            .unwrap_or_default();
        Ok(Self::new(routes, QueryKind::WorkerAnalytics, default_document))
    }

    /// Returns the routes in evaluation order.
    #[must_use]
    pub fn routes(&self) -> &[FixtureRoute] {
        &self.routes
    }

    /// Returns the fixture for `kind`, if the table has one.
    #[must_use]
    pub fn fixture(&self, kind: QueryKind) -> Option<&Bytes> {
        self.routes.iter().find(|route| route.kind == kind).map(FixtureRoute::document)
    }

    /// Picks the fixture for a request body: first matching route, else the
    /// default.
    #[must_use]
    pub fn resolve(&self, body: &[u8]) -> (QueryKind, Bytes) {
        self.routes.iter().find(|route| route.matches(body)).map_or_else(
            || (self.default_kind, self.default_document.clone()),
            |route| (route.kind, route.document.clone()),
        )
    }
}

/// Reads and validates one fixture file.
fn load_fixture(path: &Path) -> Result<Bytes, FixtureError> {
    let display = path.display().to_string();
    let metadata = fs::metadata(path).map_err(|err| FixtureError::Unreadable {
        path: display.clone(),
        reason: err.to_string(),
    })?;
    if metadata.len() > MAX_FIXTURE_BYTES {
        return Err(FixtureError::TooLarge {
            path: display,
        });
    }
    let bytes = fs::read(path).map_err(|err| FixtureError::Unreadable {
        path: display.clone(),
        reason: err.to_string(),
    })?;
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Err(FixtureError::Empty {
            path: display,
        });
    }
    serde_json::from_slice::<IgnoredAny>(&bytes).map_err(|err| FixtureError::Malformed {
        path: display,
        reason: err.to_string(),
    })?;
    Ok(Bytes::from(bytes))
}

// ============================================================================
// SECTION: Double
// ============================================================================

/// Request handler answering from a routing table.
struct PlatformHandler {
    /// Table consulted for every request.
    table: Arc<RoutingTable>,
}

impl RequestHandler for PlatformHandler {
    fn handle(&self, request: CapturedRequest) -> CannedResponse {
        if request.method != Method::POST {
            return CannedResponse::method_not_allowed(&request.method);
        }
        let (kind, document) = self.table.resolve(&request.body);
        tracing::debug!(kind = kind.as_str(), path = %request.path, "platform query routed");
        CannedResponse::json(document)
    }
}

/// Mock platform API serving fixture documents by body content.
#[derive(Debug)]
pub struct PlatformApiDouble {
    /// Directory holding one fixture per [`QueryKind`].
    fixture_dir: PathBuf,
    /// Listener settings used on start.
    settings: ResponderSettings,
    /// Table in use while running.
    table: Option<Arc<RoutingTable>>,
    /// Running listener, when started.
    responder: Option<RequestResponder>,
}

impl PlatformApiDouble {
    /// Creates a stopped double that loads fixtures from `fixture_dir`.
    #[must_use]
    pub fn new(fixture_dir: impl Into<PathBuf>) -> Self {
        Self::with_settings(fixture_dir, ResponderSettings::named("platform-api"))
    }

    /// Creates a stopped double with explicit listener settings.
    #[must_use]
    pub fn with_settings(fixture_dir: impl Into<PathBuf>, settings: ResponderSettings) -> Self {
        Self {
            fixture_dir: fixture_dir.into(),
            settings,
            table: None,
            responder: None,
        }
    }

    /// Loads fixtures and starts listening. A running double is stopped
    /// before the fixtures are read, so a failed restart leaves it stopped.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::Fixture`] when a fixture cannot be loaded
    /// (nothing is bound) and [`PlatformError::Listener`] when binding fails.
    pub async fn start(&mut self) -> Result<(), PlatformError> {
        self.dispose().await;
        let table = RoutingTable::load(&self.fixture_dir)?;
        self.start_with_table(table).await
    }

    /// Starts listening with an explicit routing table.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::Listener`] when binding fails.
    pub async fn start_with_table(&mut self, table: RoutingTable) -> Result<(), PlatformError> {
        self.dispose().await;
        let table = Arc::new(table);
        let handler = Arc::new(PlatformHandler {
            table: Arc::clone(&table),
        });
        let responder = RequestResponder::bind(self.settings.clone(), handler).await?;
        tracing::info!(
            addr = %responder.local_addr(),
            routes = table.routes().len(),
            "platform api double ready"
        );
        self.table = Some(table);
        self.responder = Some(responder);
        Ok(())
    }

    /// Stops the listener. No-op when stopped.
    pub async fn dispose(&mut self) {
        if let Some(responder) = self.responder.take() {
            responder.shutdown().await;
        }
        self.table = None;
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

    /// Returns the base URL handed to workers when started.
    #[must_use]
    pub fn url(&self) -> Option<String> {
        self.responder.as_ref().map(|responder| responder.url(PLATFORM_PATH))
    }

    /// Returns the routing table in use when started.
    #[must_use]
    pub fn routing_table(&self) -> Option<Arc<RoutingTable>> {
        self.table.clone()
    }
}
