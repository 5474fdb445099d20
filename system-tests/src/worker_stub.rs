// system-tests/src/worker_stub.rs
// ============================================================================
// Module: Worker Stand-In
// Description: A minimal scheduled worker that turns platform analytics into
//              an OTLP JSON metrics export.
// Purpose: Give the harness a real HTTP worker to drive without a worker
//          runtime installed.
// Dependencies: axum, reqwest, serde_json, thiserror, tokio, tracing, url
// ============================================================================

//! ## Overview
//! [`WorkerStub`] behaves like the exporter worker the harness is built for:
//! on `GET /cdn-cgi/mf/scheduled` it queries the platform API for worker and
//! D1 analytics with bearer auth, converts each row into gauge data points and
//! posts one export document to the metrics URL. It reads its endpoints from
//! the same bindings the sandbox injects, so it runs unchanged in-process or
//! as the `stub_worker` binary.
//! Invariants:
//! - One scheduled request performs at most one metrics export.
//! - A platform error or malformed analytics response aborts the run before
//!   anything is exported.
//! - The credential never appears in logs or `Debug` output.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use o11y_sandbox::API_KEY_BINDING;
use o11y_sandbox::DEFAULT_SCHEDULED_PATH;
use o11y_sandbox::METRICS_URL_BINDING;
use o11y_sandbox::PLATFORM_API_URL_BINDING;
use o11y_sandbox::SandboxBindings;
use reqwest::Client;
use serde_json::Value;
use serde_json::json;
use thiserror::Error;
use tokio::net::TcpListener;
use url::Url;

use crate::config::read_env_nonempty;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Instrumentation scope name on every exported metric.
pub const EXPORT_SCOPE_NAME: &str = "o11y-worker-exporter";
/// `service.name` resource attribute on every export.
pub const SERVICE_NAME: &str = "o11y-worker";
/// Worker invocation analytics query.
pub const WORKER_ANALYTICS_QUERY: &str = "query GetWorkersAnalytics($accountTag: string!, \
     $datetimeStart: Time!, $datetimeEnd: Time!) { viewer { accounts(filter: {accountTag: \
     $accountTag}) { workersInvocationsAdaptive(limit: 10000, filter: {datetime_geq: \
     $datetimeStart, datetime_lt: $datetimeEnd}) { dimensions { scriptName status datetime } \
     sum { requests errors subrequests duration } quantiles { cpuTimeP50 cpuTimeP75 cpuTimeP99 \
     cpuTimeP999 durationP50 durationP99 } } } } }";
/// D1 database analytics query.
pub const D1_ANALYTICS_QUERY: &str = "query GetD1Analytics($accountTag: string!, \
     $datetimeStart: Time!, $datetimeEnd: Time!) { viewer { accounts(filter: {accountTag: \
     $accountTag}) { d1AnalyticsAdaptiveGroups(limit: 10000, filter: {datetimeMinute_geq: \
     $datetimeStart, datetimeMinute_lt: $datetimeEnd}) { dimensions { databaseId \
     datetimeMinute } sum { readQueries writeQueries rowsRead rowsWritten } } } } }";
/// Bound on each outbound request.
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(5);
/// Analytics window requested from the platform API.
const QUERY_WINDOW: Duration = Duration::from_secs(60);

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Errors raised by the worker stand-in.
#[derive(Debug, Error)]
pub enum WorkerStubError {
    /// A required binding is absent.
    #[error("worker binding {0} is missing")]
    MissingBinding(&'static str),
    /// A binding is present but unusable.
    #[error("worker binding {name} is invalid: {reason}")]
    InvalidBinding {
        /// Binding name.
        name: &'static str,
        /// Validation failure.
        reason: String,
    },
    /// The HTTP client could not be built.
    #[error("worker http client unavailable: {0}")]
    Client(String),
    /// The platform API request failed.
    #[error("platform api request failed: {0}")]
    Upstream(String),
    /// The platform API response is not analytics data.
    #[error("platform api response malformed: {0}")]
    Decode(String),
    /// The metrics export could not be delivered.
    #[error("metrics export failed: {0}")]
    Export(String),
}

// ============================================================================
// SECTION: Bindings
// ============================================================================

/// Endpoints and credential the worker runs against.
#[derive(Clone)]
pub struct WorkerStubBindings {
    /// Platform API base URL.
    platform_api_url: Url,
    /// Telemetry ingestion URL.
    metrics_url: Url,
    /// Platform API credential.
    api_key: String,
}

impl fmt::Debug for WorkerStubBindings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerStubBindings")
            .field("platform_api_url", &self.platform_api_url.as_str())
            .field("metrics_url", &self.metrics_url.as_str())
            .field("api_key", &"<redacted>")
            .finish()
    }
}

impl WorkerStubBindings {
    /// Builds bindings from explicit values.
    #[must_use]
    pub fn new(platform_api_url: Url, metrics_url: Url, api_key: impl Into<String>) -> Self {
        Self {
            platform_api_url,
            metrics_url,
            api_key: api_key.into(),
        }
    }

    /// Reads the bindings from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerStubError`] when a binding is missing, empty or not a URL.
    pub fn from_env() -> Result<Self, WorkerStubError> {
        Ok(Self {
            platform_api_url: env_url(PLATFORM_API_URL_BINDING)?,
            metrics_url: env_url(METRICS_URL_BINDING)?,
            api_key: env_text(API_KEY_BINDING)?,
        })
    }

    /// Returns the platform API base URL.
    #[must_use]
    pub const fn platform_api_url(&self) -> &Url {
        &self.platform_api_url
    }

    /// Returns the telemetry ingestion URL.
    #[must_use]
    pub const fn metrics_url(&self) -> &Url {
        &self.metrics_url
    }
}

impl From<&SandboxBindings> for WorkerStubBindings {
    fn from(bindings: &SandboxBindings) -> Self {
        Self::new(
            bindings.platform_api_url().clone(),
            bindings.metrics_url().clone(),
            bindings.api_key(),
        )
    }
}

/// Reads a required, non-empty binding.
fn env_text(name: &'static str) -> Result<String, WorkerStubError> {
    read_env_nonempty(name)
        .map_err(|reason| WorkerStubError::InvalidBinding {
            name,
            reason,
        })?
        .map(|value| value.trim().to_string())
        .ok_or(WorkerStubError::MissingBinding(name))
}

/// Reads a required URL binding.
fn env_url(name: &'static str) -> Result<Url, WorkerStubError> {
    let text = env_text(name)?;
    Url::parse(&text).map_err(|err| WorkerStubError::InvalidBinding {
        name,
        reason: err.to_string(),
    })
}

// ============================================================================
// SECTION: Metrics
// ============================================================================

/// One gauge sample derived from an analytics row.
#[derive(Debug, Clone, PartialEq)]
pub struct GaugeSample {
    /// Metric name.
    pub name: &'static str,
    /// Human-readable description.
    pub description: &'static str,
    /// Unit string.
    pub unit: &'static str,
    /// Sample value.
    pub value: f64,
    /// Data point attributes.
    pub attributes: BTreeMap<&'static str, String>,
}

/// Gauge definitions read from each worker invocation row: metric name,
/// description, unit and JSON pointer into the row.
const WORKER_GAUGES: [(&str, &str, &str, &str); 5] = [
    ("cloudflare_worker_requests", "A gauge of the number of requests to a worker.", "1", "/sum/requests"),
    ("cloudflare_worker_errors", "A gauge of the number of failed worker requests.", "1", "/sum/errors"),
    ("cloudflare_worker_subrequests", "A gauge of the number of worker subrequests.", "1", "/sum/subrequests"),
    ("cpu_time", "Median worker CPU time.", "ms", "/quantiles/cpuTimeP50"),
    ("cloudflare_worker_duration_p99", "99th percentile worker wall time.", "s", "/quantiles/durationP99"),
];

/// Gauge definitions read from each D1 analytics row.
const D1_GAUGES: [(&str, &str, &str, &str); 4] = [
    ("cloudflare_d1_read_queries", "A gauge of the number of D1 read queries.", "1", "/sum/readQueries"),
    ("cloudflare_d1_write_queries", "A gauge of the number of D1 write queries.", "1", "/sum/writeQueries"),
    ("cloudflare_d1_rows_read", "A gauge of the number of D1 rows read.", "1", "/sum/rowsRead"),
    ("cloudflare_d1_rows_written", "A gauge of the number of D1 rows written.", "1", "/sum/rowsWritten"),
];

/// Returns the row arrays under `data.viewer.accounts[*].<field>`.
fn analytics_rows<'a>(response: &'a Value, field: &str) -> Result<Vec<&'a Value>, WorkerStubError> {
    if let Some(errors) = response.get("errors").filter(|errors| !errors.is_null()) {
        return Err(WorkerStubError::Decode(format!("graphql errors: {errors}")));
    }
    let accounts = response
        .pointer("/data/viewer/accounts")
        .and_then(Value::as_array)
        .ok_or_else(|| WorkerStubError::Decode("missing data.viewer.accounts".to_string()))?;
    let mut rows = Vec::new();
    for account in accounts {
        let entries = account
            .get(field)
            .and_then(Value::as_array)
            .ok_or_else(|| WorkerStubError::Decode(format!("missing {field} in account")))?;
        rows.extend(entries.iter());
    }
    Ok(rows)
}

/// Converts analytics rows into gauge samples.
fn rows_to_samples(
    rows: &[&Value],
    gauges: &[(&'static str, &'static str, &'static str, &'static str)],
    dimensions: &[(&'static str, &'static str)],
) -> Result<Vec<GaugeSample>, WorkerStubError> {
    let mut samples = Vec::with_capacity(rows.len() * gauges.len());
    for row in rows {
        let attributes: BTreeMap<&'static str, String> = dimensions
            .iter()
            .filter_map(|(attribute, pointer)| {
                row.pointer(pointer).and_then(Value::as_str).map(|text| (*attribute, text.to_string()))
            })
            .collect();
        for &(name, description, unit, pointer) in gauges {
            let value = row
                .pointer(pointer)
                .and_then(Value::as_f64)
                .ok_or_else(|| WorkerStubError::Decode(format!("{name}: {pointer} is not a number")))?;
            samples.push(GaugeSample {
                name,
                description,
                unit,
                value,
                attributes: attributes.clone(),
            });
        }
    }
    Ok(samples)
}

/// Converts a worker analytics response into gauge samples.
///
/// # Errors
///
/// Returns [`WorkerStubError::Decode`] when the response is not worker analytics.
pub fn worker_samples(response: &Value) -> Result<Vec<GaugeSample>, WorkerStubError> {
    let rows = analytics_rows(response, "workersInvocationsAdaptive")?;
    rows_to_samples(
        &rows,
        &WORKER_GAUGES,
        &[("script_name", "/dimensions/scriptName"), ("status", "/dimensions/status")],
    )
}

/// Converts a D1 analytics response into gauge samples.
///
/// # Errors
///
/// Returns [`WorkerStubError::Decode`] when the response is not D1 analytics.
pub fn d1_samples(response: &Value) -> Result<Vec<GaugeSample>, WorkerStubError> {
    let rows = analytics_rows(response, "d1AnalyticsAdaptiveGroups")?;
    rows_to_samples(&rows, &D1_GAUGES, &[("database_id", "/dimensions/databaseId")])
}

/// Builds one OTLP JSON export with a metric per distinct sample name.
#[must_use]
pub fn export_document(samples: &[GaugeSample], time_unix_nano: u128) -> Value {
    let mut grouped: BTreeMap<&'static str, Vec<&GaugeSample>> = BTreeMap::new();
    for sample in samples {
        grouped.entry(sample.name).or_default().push(sample);
    }
    let time = time_unix_nano.to_string();
    let metrics: Vec<Value> = grouped
        .values()
        .filter_map(|group| {
            let first = group.first()?;
            let data_points: Vec<Value> = group
                .iter()
                .map(|sample| {
                    let attributes: Vec<Value> = sample
                        .attributes
                        .iter()
                        .map(|(key, value)| json!({"key": key, "value": {"stringValue": value}}))
                        .collect();
                    json!({"attributes": attributes, "timeUnixNano": time, "asDouble": sample.value})
                })
                .collect();
            Some(json!({
                "name": first.name,
                "description": first.description,
                "unit": first.unit,
                "gauge": {"dataPoints": data_points}
            }))
        })
        .collect();
    json!({
        "resourceMetrics": [{
            "resource": {
                "attributes": [{"key": "service.name", "value": {"stringValue": SERVICE_NAME}}]
            },
            "scopeMetrics": [{
                "scope": {"name": EXPORT_SCOPE_NAME, "version": env!("CARGO_PKG_VERSION")},
                "metrics": metrics
            }]
        }]
    })
}

// ============================================================================
// SECTION: Worker
// ============================================================================

/// Outcome of one scheduled run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledRun {
    /// Gauge samples derived from the analytics responses.
    pub samples: usize,
    /// Whether an export was posted.
    pub exported: bool,
}

/// The scheduled worker stand-in.
#[derive(Debug, Clone)]
pub struct WorkerStub {
    /// Upstream endpoints.
    bindings: WorkerStubBindings,
    /// Outbound HTTP client.
    client: Client,
    /// Post the export after querying.
    export_enabled: bool,
}

impl WorkerStub {
    /// Builds a worker that exports after every scheduled run.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerStubError::Client`] when the HTTP client cannot be built.
    pub fn new(bindings: WorkerStubBindings) -> Result<Self, WorkerStubError> {
        let client = Client::builder()
            .timeout(UPSTREAM_TIMEOUT)
            .build()
            .map_err(|err| WorkerStubError::Client(err.to_string()))?;
        Ok(Self {
            bindings,
            client,
            export_enabled: true,
        })
    }

    /// Queries the platform but never posts to the metrics URL.
    #[must_use]
    pub const fn without_export(mut self) -> Self {
        self.export_enabled = false;
        self
    }

    /// Returns the bindings the worker runs against.
    #[must_use]
    pub const fn bindings(&self) -> &WorkerStubBindings {
        &self.bindings
    }

    /// Runs one scheduled execution.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerStubError`] when a platform query or the export fails.
    pub async fn run_scheduled(&self) -> Result<ScheduledRun, WorkerStubError> {
        let workers = self.query(WORKER_ANALYTICS_QUERY).await?;
        let d1 = self.query(D1_ANALYTICS_QUERY).await?;
        let mut samples = worker_samples(&workers)?;
        samples.extend(d1_samples(&d1)?);
        if !self.export_enabled {
            tracing::debug!(samples = samples.len(), "scheduled run finished without export");
            return Ok(ScheduledRun {
                samples: samples.len(),
                exported: false,
            });
        }
        let document = export_document(&samples, unix_nanos(SystemTime::now()));
        let body =
            serde_json::to_vec(&document).map_err(|err| WorkerStubError::Export(err.to_string()))?;
        let bytes = body.len();
        self.client
            .post(self.bindings.metrics_url.clone())
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|err| WorkerStubError::Export(err.to_string()))?;
        tracing::info!(samples = samples.len(), bytes, "metrics exported");
        Ok(ScheduledRun {
            samples: samples.len(),
            exported: true,
        })
    }

    /// Posts one GraphQL query to the platform API.
    async fn query(&self, query: &str) -> Result<Value, WorkerStubError> {
        let end = SystemTime::now();
        let start = end.checked_sub(QUERY_WINDOW).unwrap_or(UNIX_EPOCH);
        let request = json!({
            "query": query,
            "variables": {
                "accountTag": "",
                "datetimeStart": unix_seconds(start).to_string(),
                "datetimeEnd": unix_seconds(end).to_string()
            }
        });
        let response = self
            .client
            .post(self.bindings.platform_api_url.clone())
            .bearer_auth(&self.bindings.api_key)
            .json(&request)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|err| WorkerStubError::Upstream(err.to_string()))?;
        response.json::<Value>().await.map_err(|err| WorkerStubError::Decode(err.to_string()))
    }

    /// Builds the worker's HTTP routes.
    pub fn router(self: Arc<Self>) -> Router {
        Router::new().route(DEFAULT_SCHEDULED_PATH, get(scheduled)).with_state(self)
    }
}

/// Handles `GET /cdn-cgi/mf/scheduled`.
async fn scheduled(State(worker): State<Arc<WorkerStub>>) -> (StatusCode, String) {
    match worker.run_scheduled().await {
        Ok(run) => (StatusCode::OK, format!("ran scheduled handler ({} samples)", run.samples)),
        Err(err) => {
            tracing::warn!(error = %err, "scheduled run failed");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}

/// Serves `worker` on `listener` until `shutdown` resolves.
///
/// # Errors
///
/// Returns the underlying I/O error when serving fails.
pub async fn serve<F>(
    listener: TcpListener,
    worker: Arc<WorkerStub>,
    shutdown: F,
) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, worker.router()).with_graceful_shutdown(shutdown).await
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Nanoseconds since the Unix epoch.
fn unix_nanos(time: SystemTime) -> u128 {
    time.duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos()
}

/// Whole seconds since the Unix epoch.
fn unix_seconds(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}
