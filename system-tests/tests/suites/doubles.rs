// system-tests/tests/suites/doubles.rs
// ============================================================================
// Module: Double Interplay Tests
// Description: The worker stand-in against both doubles, without a sandbox.
// Purpose: Validate platform routing over HTTP and the export document the
//          stand-in produces from fixture data.
// Dependencies: system-tests helpers, o11y-harness-core, reqwest
// ============================================================================

//! ## Overview
//! Exercises the doubles the way a worker sees them: raw GraphQL bodies to
//! the platform API double and export documents to the collector.
//! Invariants:
//! - Query bodies route to fixtures by marker; fixtures are served verbatim.
//! - A failed platform query never produces an export.

use std::fs;

use bytes::Bytes;
use helpers::artifacts::TestReporter;
use helpers::context::SCENARIO_API_KEY;
use helpers::context::StepResult;
use helpers::context::require;
use helpers::context::require_eq;
use helpers::logging::init_test_logging;
use o11y_harness_core::PlatformApiDouble;
use o11y_harness_core::QueryKind;
use o11y_harness_core::RoutingTable;
use o11y_harness_core::TelemetryCollector;
use o11y_harness_core::default_fixture_dir;
use serde_json::Value;
use system_tests::worker_stub::WorkerStub;
use system_tests::worker_stub::WorkerStubBindings;
use system_tests::worker_stub::WorkerStubError;
use system_tests::worker_stub::export_document;
use system_tests::worker_stub::worker_samples;
use url::Url;

use crate::helpers;

async fn post_query(url: &str, body: &'static str) -> StepResult<Bytes> {
    let response = reqwest::Client::new()
        .post(url)
        .header("content-type", "application/json")
        .body(body)
        .send()
        .await?
        .error_for_status()?;
    Ok(response.bytes().await?)
}

async fn running_doubles() -> StepResult<(TelemetryCollector, PlatformApiDouble)> {
    init_test_logging();
    let mut collector = TelemetryCollector::new();
    collector.start().await?;
    let mut platform = PlatformApiDouble::new(default_fixture_dir());
    platform.start().await?;
    Ok((collector, platform))
}

fn stub_bindings(
    collector: &TelemetryCollector,
    platform: &PlatformApiDouble,
) -> StepResult<WorkerStubBindings> {
    let platform_url = Url::parse(&platform.url().ok_or("platform stopped")?)?;
    let metrics_url = Url::parse(&collector.metrics_url().ok_or("collector stopped")?)?;
    Ok(WorkerStubBindings::new(platform_url, metrics_url, SCENARIO_API_KEY))
}

#[tokio::test(flavor = "multi_thread")]
async fn d1_query_is_answered_with_d1_fixture_verbatim() -> StepResult {
    let mut reporter = TestReporter::new("d1_query_is_answered_with_d1_fixture_verbatim")?;
    let (mut collector, mut platform) = running_doubles().await?;
    let url = platform.url().ok_or("platform stopped")?;

    let body = post_query(&url, "{\"query\":\"d1AnalyticsAdaptiveGroups(...)\"}\n").await?;
    let expected = fs::read(default_fixture_dir().join(QueryKind::D1Analytics.fixture_file()))?;
    require(body.as_ref() == expected.as_slice(), "d1 response differs from fixture file")?;

    let unmarked = post_query(&url, "{\"query\":\"viewer { accounts { id } }\"}").await?;
    let worker =
        fs::read(default_fixture_dir().join(QueryKind::WorkerAnalytics.fixture_file()))?;
    require(unmarked.as_ref() == worker.as_slice(), "unmarked query not given worker fixture")?;

    platform.dispose().await;
    collector.dispose().await;
    reporter.finish(
        "pass",
        vec!["marker routing served fixture bytes verbatim".to_string()],
        vec!["summary.json".to_string(), "summary.md".to_string()],
    )?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn stand_in_run_exports_one_document() -> StepResult {
    let mut reporter = TestReporter::new("stand_in_run_exports_one_document")?;
    let (mut collector, mut platform) = running_doubles().await?;
    let worker = WorkerStub::new(stub_bindings(&collector, &platform)?)?;
    let metrics_url = collector.metrics_url().ok_or("collector stopped")?;
    require_eq(&worker.bindings().metrics_url().as_str(), &metrics_url.as_str(), "metrics url")?;

    let run = worker.run_scheduled().await?;
    require(run.exported, "run did not export")?;
    require_eq(&run.samples, &14, "samples from two worker rows and one d1 row")?;
    require_eq(&collector.payload_count(), &1, "collector payloads")?;
    for name in ["cpu_time", "cloudflare_worker_requests", "cloudflare_d1_rows_read"] {
        require(collector.contains_metric(name), format!("{name} not indexed"))?;
    }
    let payloads = collector.payloads();
    let payload = payloads.first().ok_or("no payload captured")?;
    reporter.artifacts().write_json("export.json", payload.document())?;

    platform.dispose().await;
    collector.dispose().await;
    reporter.finish(
        "pass",
        vec![format!("{} metric names indexed", payload.metric_names().len())],
        vec!["summary.json".to_string(), "summary.md".to_string(), "export.json".to_string()],
    )?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn platform_error_aborts_export() -> StepResult {
    let mut reporter = TestReporter::new("platform_error_aborts_export")?;
    init_test_logging();
    let mut collector = TelemetryCollector::new();
    collector.start().await?;
    let mut platform = PlatformApiDouble::new(default_fixture_dir());
    platform
        .start_with_table(RoutingTable::new(
            Vec::new(),
            QueryKind::WorkerAnalytics,
            Bytes::from_static(b"{\"data\":null,\"errors\":[{\"message\":\"authentication error\"}]}"),
        ))
        .await?;
    let worker = WorkerStub::new(stub_bindings(&collector, &platform)?)?;

    let outcome = worker.run_scheduled().await;
    require(
        matches!(outcome, Err(WorkerStubError::Decode(_))),
        "graphql errors should fail the run",
    )?;
    require_eq(&collector.payload_count(), &0, "collector payloads")?;

    platform.dispose().await;
    collector.dispose().await;
    reporter.finish(
        "pass",
        vec!["graphql error response produced no export".to_string()],
        vec!["summary.json".to_string(), "summary.md".to_string()],
    )?;
    Ok(())
}

#[test]
fn cpu_time_follows_worker_fixture() -> StepResult {
    let raw = fs::read(default_fixture_dir().join(QueryKind::WorkerAnalytics.fixture_file()))?;
    let response: Value = serde_json::from_slice(&raw)?;
    let samples = worker_samples(&response)?;
    let cpu: Vec<(String, f64)> = samples
        .iter()
        .filter(|sample| sample.name == "cpu_time")
        .map(|sample| (sample.attributes.get("script_name").cloned().unwrap_or_default(), sample.value))
        .collect();
    require_eq(
        &cpu,
        &vec![("edge-router".to_string(), 1.8), ("image-resizer".to_string(), 6.1)],
        "cpu_time samples",
    )?;

    let document = export_document(&samples, 1_768_471_200_000_000_000);
    let metrics = document
        .pointer("/resourceMetrics/0/scopeMetrics/0/metrics")
        .and_then(Value::as_array)
        .ok_or("export has no metrics")?;
    require_eq(&metrics.len(), &5, "one metric per gauge name")?;
    let cpu_points = metrics
        .iter()
        .find(|metric| metric.get("name").and_then(Value::as_str) == Some("cpu_time"))
        .and_then(|metric| metric.pointer("/gauge/dataPoints"))
        .and_then(Value::as_array)
        .ok_or("cpu_time has no data points")?;
    require_eq(&cpu_points.len(), &2, "cpu_time data points")
}
