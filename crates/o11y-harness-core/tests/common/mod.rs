// crates/o11y-harness-core/tests/common/mod.rs
// ============================================================================
// Module: Common Test Utilities
// Description: Shared helpers for o11y-harness-core integration tests.
// Purpose: Provide log capture and OTLP export builders.
// Dependencies: serde_json, tracing-subscriber
// ============================================================================

//! ## Overview
//! Provides test logging setup and builders for OTLP JSON export bodies.

#![allow(
    clippy::panic,
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::use_debug,
    clippy::dbg_macro,
    clippy::panic_in_result_fn,
    clippy::unwrap_in_result,
    reason = "Test-only output and panic-based assertions are permitted."
)]

use std::sync::Once;

use serde_json::Value;
use serde_json::json;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

static INIT: Once = Once::new();

// ============================================================================
// SECTION: Logging
// ============================================================================

/// Routes harness logs to the libtest writer once per test binary.
pub fn init_test_logging() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));
        let _ = tracing_subscriber::registry()
            .with(fmt::layer().with_test_writer().with_target(true))
            .with(filter)
            .try_init();
    });
}

// ============================================================================
// SECTION: Export Builders
// ============================================================================

/// Builds an OTLP JSON export with one resource and the given scopes.
pub fn export_document(scopes: &[(&str, &[&str])]) -> Value {
    let scope_metrics: Vec<Value> = scopes
        .iter()
        .map(|(scope, metrics)| {
            let metrics: Vec<Value> = metrics
                .iter()
                .map(|name| {
                    json!({
                        "name": name,
                        "unit": "1",
                        "gauge": {"dataPoints": [{"asInt": "1", "timeUnixNano": "1768471200000000000"}]}
                    })
                })
                .collect();
            json!({"scope": {"name": scope, "version": "0.1.0"}, "metrics": metrics})
        })
        .collect();
    json!({
        "resourceMetrics": [{
            "resource": {"attributes": [{"key": "service.name", "value": {"stringValue": "worker"}}]},
            "scopeMetrics": scope_metrics
        }]
    })
}

/// Serializes [`export_document`] for a single `worker` scope.
pub fn export_body(metrics: &[&str]) -> Vec<u8> {
    serde_json::to_vec(&export_document(&[("worker", metrics)])).unwrap()
}
