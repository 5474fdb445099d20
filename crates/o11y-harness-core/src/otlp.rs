// crates/o11y-harness-core/src/otlp.rs
// ============================================================================
// Module: OTLP Export View
// Description: Minimal typed view over OTLP JSON metric export documents.
// Purpose: Extract scope and metric names without interpreting data points.
// Dependencies: serde, serde_json, thiserror
// ============================================================================

//! ## Overview
//! The collector only enforces one field contract on incoming exports:
//! `resourceMetrics[].scopeMetrics[].metrics[].name`. Everything else in the
//! document (resources, attributes, data points) is kept verbatim but never
//! interpreted.
//! Invariants:
//! - Absent group arrays are treated as empty.
//! - Every metric entry must carry a string `name`.

// ============================================================================
// SECTION: Imports
// ============================================================================

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Errors raised while decoding a telemetry export body.
///
/// # Invariants
/// - Variants are stable for programmatic handling.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The body is not well-formed JSON.
    #[error("export body is not valid json: {0}")]
    Json(String),
    /// The JSON does not follow the resource/scope/metric nesting.
    #[error("export body has unexpected shape: {0}")]
    Shape(String),
}

// ============================================================================
// SECTION: Document Types
// ============================================================================

/// Top-level OTLP metrics export request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportMetricsDocument {
    /// Resource-level metric groups.
    #[serde(default)]
    pub resource_metrics: Vec<ResourceMetrics>,
}

/// Metrics emitted by a single resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceMetrics {
    /// Instrumentation-scope groups for the resource.
    #[serde(default)]
    pub scope_metrics: Vec<ScopeMetrics>,
}

/// Metrics emitted by one instrumentation scope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ScopeMetrics {
    /// Instrumentation scope descriptor, when present.
    #[serde(default)]
    pub scope: Option<InstrumentationScope>,
    /// Metrics reported under the scope.
    #[serde(default)]
    pub metrics: Vec<MetricDescriptor>,
}

/// Instrumentation scope descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct InstrumentationScope {
    /// Scope name; empty when the exporter omitted it.
    #[serde(default)]
    pub name: String,
}

/// The part of a metric the harness cares about.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MetricDescriptor {
    /// Metric name.
    pub name: String,
}

impl ExportMetricsDocument {
    /// Iterates metric names in document order, duplicates included.
    pub fn metric_names(&self) -> impl Iterator<Item = &str> {
        self.resource_metrics
            .iter()
            .flat_map(|resource| resource.scope_metrics.iter())
            .flat_map(|scope| scope.metrics.iter())
            .map(|metric| metric.name.as_str())
    }

    /// Iterates non-empty scope names in document order.
    pub fn scope_names(&self) -> impl Iterator<Item = &str> {
        self.resource_metrics
            .iter()
            .flat_map(|resource| resource.scope_metrics.iter())
            .filter_map(|scope| scope.scope.as_ref())
            .map(|scope| scope.name.as_str())
            .filter(|name| !name.is_empty())
    }
}

// ============================================================================
// SECTION: Decoding
// ============================================================================

/// A decoded export body plus the names extracted from it.
#[derive(Debug, Clone)]
pub(crate) struct DecodedExport {
    /// The document exactly as received.
    pub(crate) document: Value,
    /// Metric names in document order.
    pub(crate) metric_names: Vec<String>,
    /// Scope names in document order.
    pub(crate) scope_names: Vec<String>,
}

/// Decodes a fully buffered export body.
///
/// # Errors
///
/// Returns [`DecodeError`] when the body is not JSON or a metric lacks a name.
pub(crate) fn decode_export(body: &[u8]) -> Result<DecodedExport, DecodeError> {
    let document: Value =
        serde_json::from_slice(body).map_err(|err| DecodeError::Json(err.to_string()))?;
    let typed = ExportMetricsDocument::deserialize(&document)
        .map_err(|err| DecodeError::Shape(err.to_string()))?;
    let metric_names = typed.metric_names().map(ToString::to_string).collect();
    let scope_names = typed.scope_names().map(ToString::to_string).collect();
    Ok(DecodedExport {
        document,
        metric_names,
        scope_names,
    })
}
