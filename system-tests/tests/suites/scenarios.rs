// system-tests/tests/suites/scenarios.rs
// ============================================================================
// Module: End-to-End Scenarios
// Description: Worker trigger to telemetry index scenarios.
// Purpose: Validate that a triggered worker's export reaches the collector
//          index and that silence and teardown behave.
// Dependencies: system-tests helpers
// ============================================================================

//! ## Overview
//! End-to-end scenarios: start both doubles, start the worker with their
//! URLs, trigger once, poll the collector.
//! Invariants:
//! - A silent worker produces a poll timeout, never a hang.
//! - Teardown releases every listener the scenario opened.

use std::net::SocketAddr;
use std::time::Duration;

use helpers::context::StepResult;
use helpers::context::require;
use helpers::context::require_eq;
use helpers::context::run_scenario;
use helpers::in_process_worker::InProcessLauncher;
use helpers::in_process_worker::WorkerMode;
use helpers::timeouts::TELEMETRY_TIMEOUT;
use helpers::timeouts::resolve_timeout;
use o11y_harness_core::PollError;
use o11y_sandbox::ConfigurationError;
use o11y_sandbox::SandboxConfig;
use o11y_sandbox::SandboxError;
use serde_json::Value;
use system_tests::config::SystemTestConfig;
use system_tests::worker_stub::EXPORT_SCOPE_NAME;
use tokio::net::TcpStream;

use crate::helpers;

#[tokio::test(flavor = "multi_thread")]
async fn triggered_worker_reports_cpu_time() -> StepResult {
    run_scenario("triggered_worker_reports_cpu_time", async |ctx| {
        ctx.given_doubles_running().await?;
        ctx.given_worker().await?;
        let report = ctx.when_worker_triggered().await?;
        require(report.status == 200, format!("trigger status {}", report.status))?;
        let outcome = ctx.then_payloads_received(1).await?;
        ctx.note(format!("first payload after {} attempts", outcome.attempts));
        ctx.then_metric_indexed("cpu_time")?;
        Ok(())
    })
    .await
}

#[tokio::test(flavor = "multi_thread")]
async fn stand_in_exports_worker_and_d1_metrics() -> StepResult {
    let launcher = InProcessLauncher::new(WorkerMode::Exporting);
    let launches = launcher.launch_log();
    run_scenario("stand_in_exports_worker_and_d1_metrics", async move |ctx| {
        ctx.given_doubles_running().await?;
        ctx.given_worker_with(launcher).await?;
        ctx.when_worker_triggered().await?;
        ctx.then_payloads_received(1).await?;

        for name in [
            "cpu_time",
            "cloudflare_worker_requests",
            "cloudflare_worker_errors",
            "cloudflare_d1_read_queries",
            "cloudflare_d1_write_queries",
        ] {
            ctx.then_metric_indexed(name)?;
        }
        require_eq(&ctx.collector().payload_count(), &1, "one trigger, one export")?;
        require(
            ctx.collector().scope_names().contains(EXPORT_SCOPE_NAME),
            "export scope not indexed",
        )?;
        require_eq(&ctx.collector().rejected_count(), &0, "collector rejected a payload")?;

        let injected = launches.lock().map_err(|_| "launch log poisoned")?.clone();
        let bindings = injected.first().ok_or("worker was never launched")?;
        let platform_url = ctx.platform().url().ok_or("platform stopped")?;
        let metrics_url = ctx.collector().metrics_url().ok_or("collector stopped")?;
        require_eq(&bindings.platform_api_url().as_str(), &platform_url.as_str(), "platform url")?;
        require_eq(&bindings.metrics_url().as_str(), &metrics_url.as_str(), "metrics url")?;
        Ok(())
    })
    .await
}

#[tokio::test(flavor = "multi_thread")]
async fn silent_worker_times_out() -> StepResult {
    run_scenario("silent_worker_times_out", async |ctx| {
        ctx.given_doubles_running().await?;
        ctx.given_worker_with(InProcessLauncher::new(WorkerMode::Silent)).await?;
        let shortened = ctx.poller().with_timeout(Duration::from_millis(800));
        ctx.set_poller(shortened);
        ctx.when_worker_triggered().await?;
        let Err(err) = ctx.then_payloads_received(1).await else {
            return Err("silent worker produced telemetry".into());
        };
        require(err.is_timeout(), format!("expected a timeout, got: {err}"))?;
        if let PollError::Timeout { waited_ms, .. } = &err {
            require((800..4_500).contains(waited_ms), format!("shortened poller not used: {err}"))?;
        }
        require_eq(&ctx.collector().payload_count(), &0, "collector payloads")?;
        require(ctx.collector().metric_names().is_empty(), "index should be empty")?;
        ctx.note(err.to_string());
        Ok(())
    })
    .await
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_credential_never_launches() -> StepResult {
    let launcher = InProcessLauncher::new(WorkerMode::Exporting);
    let launches = launcher.launch_log();
    run_scenario("missing_credential_never_launches", async move |ctx| {
        ctx.given_doubles_running().await?;
        let config = SandboxConfig {
            api_key: None,
            ..ctx.sandbox_config()?
        };
        let Err(err) = ctx.given_worker_config(launcher, &config).await else {
            return Err("worker started without a credential".into());
        };
        let rejected = matches!(
            err.downcast_ref::<SandboxError>(),
            Some(SandboxError::Configuration(ConfigurationError::Missing(_)))
        );
        require(rejected, format!("expected a missing-setting error, got: {err}"))?;
        require(ctx.sandbox().is_none(), "driver kept after failed start")?;
        let launched = launches.lock().map_err(|_| "launch log poisoned")?.len();
        require_eq(&launched, &0, "launcher calls")?;
        Ok(())
    })
    .await
}

#[tokio::test(flavor = "multi_thread")]
async fn teardown_releases_every_listener() -> StepResult {
    let mut addrs: Vec<SocketAddr> = Vec::new();
    run_scenario("teardown_releases_every_listener", async |ctx| {
        ctx.given_doubles_running().await?;
        ctx.given_worker_with(InProcessLauncher::new(WorkerMode::Exporting)).await?;
        ctx.when_worker_triggered().await?;
        ctx.then_payloads_received(1).await?;
        addrs.extend(ctx.collector().local_addr());
        addrs.extend(ctx.platform().local_addr());
        let worker = ctx.sandbox().and_then(|driver| driver.base_url()).ok_or("no worker")?;
        let host = worker.host_str().ok_or("worker url has no host")?;
        let port = worker.port().ok_or("worker url has no port")?;
        addrs.push(format!("{host}:{port}").parse()?);
        Ok(())
    })
    .await?;

    require_eq(&addrs.len(), &3, "captured listener count")?;
    for addr in addrs {
        require(TcpStream::connect(addr).await.is_err(), format!("{addr} still accepts connections"))?;
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn fresh_scenario_starts_with_empty_index() -> StepResult {
    run_scenario("fresh_scenario_first_run", async |ctx| {
        ctx.given_doubles_running().await?;
        ctx.given_worker_with(InProcessLauncher::new(WorkerMode::Exporting)).await?;
        ctx.when_worker_triggered().await?;
        ctx.then_payloads_received(1).await?;
        Ok(())
    })
    .await?;

    run_scenario("fresh_scenario_second_run", async |ctx| {
        ctx.given_doubles_running().await?;
        require(ctx.collector().metric_names().is_empty(), "new collector inherited names")?;
        require_eq(&ctx.collector().payload_count(), &0, "new collector payloads")?;
        Ok(())
    })
    .await
}

#[tokio::test(flavor = "multi_thread")]
async fn summary_lists_written_payloads() -> StepResult {
    let mut root = None;
    run_scenario("summary_lists_written_payloads", async |ctx| {
        ctx.given_doubles_running().await?;
        ctx.given_worker_with(InProcessLauncher::new(WorkerMode::Exporting)).await?;
        ctx.when_worker_triggered().await?;
        ctx.then_payloads_received(1).await?;
        root = Some(ctx.reporter().artifacts().root().to_path_buf());
        Ok(())
    })
    .await?;

    let root = root.ok_or("artifact root not captured")?;
    let summary: Value = serde_json::from_slice(&std::fs::read(root.join("summary.json"))?)?;
    let listed: Vec<&str> = summary
        .get("artifacts")
        .and_then(Value::as_array)
        .ok_or("summary has no artifact list")?
        .iter()
        .filter_map(Value::as_str)
        .collect();
    require(listed.contains(&"payloads.json"), format!("payloads.json not listed: {}", listed.join(", ")))?;
    require(root.join("payloads.json").is_file(), "payloads.json not written")
}

#[tokio::test(flavor = "multi_thread")]
async fn summary_omits_payloads_when_none_arrived() -> StepResult {
    let mut root = None;
    run_scenario("summary_omits_payloads_when_none_arrived", async |ctx| {
        ctx.given_doubles_running().await?;
        root = Some(ctx.reporter().artifacts().root().to_path_buf());
        Ok(())
    })
    .await?;

    let root = root.ok_or("artifact root not captured")?;
    let summary: Value = serde_json::from_slice(&std::fs::read(root.join("summary.json"))?)?;
    let listed = summary.get("artifacts").and_then(Value::as_array).ok_or("summary has no artifact list")?;
    require_eq(&listed.len(), &2, "summary artifacts")?;
    require(!root.join("payloads.json").exists(), "payloads.json written without payloads")
}

#[test]
fn timeout_override_only_lengthens() -> StepResult {
    let unset = SystemTestConfig::default();
    require_eq(&resolve_timeout(&unset, TELEMETRY_TIMEOUT), &TELEMETRY_TIMEOUT, "no override")?;

    let shorter = SystemTestConfig {
        timeout: Some(Duration::from_secs(1)),
        ..SystemTestConfig::default()
    };
    require_eq(&resolve_timeout(&shorter, TELEMETRY_TIMEOUT), &TELEMETRY_TIMEOUT, "shorter override")?;

    let longer = SystemTestConfig {
        timeout: Some(Duration::from_secs(30)),
        ..SystemTestConfig::default()
    };
    require_eq(&resolve_timeout(&longer, TELEMETRY_TIMEOUT), &Duration::from_secs(30), "longer override")
}
