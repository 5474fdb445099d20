// system-tests/tests/suites/process_sandbox.rs
// ============================================================================
// Module: Process Sandbox Scenarios
// Description: End-to-end scenarios with the worker as a child process.
// Purpose: Validate the process launcher against the stub_worker binary.
// Dependencies: system-tests helpers, o11y-sandbox, tempfile
// ============================================================================

//! ## Overview
//! Runs the `stub_worker` binary through [`ProcessLauncher`], the same path a
//! real worker runtime takes when `O11Y_SYSTEM_TEST_WORKER_CONFIG` is set.
//! Invariants:
//! - Bindings reach the child through its environment.
//! - Dispose kills the child and frees its port.

use std::net::SocketAddr;
use std::time::Duration;

use helpers::context::StepResult;
use helpers::context::require;
use helpers::context::run_scenario;
use o11y_sandbox::ProcessLauncher;
use o11y_sandbox::ProcessLauncherConfig;
use system_tests::config::SystemTestConfig;
use tokio::net::TcpStream;

use crate::helpers;

/// Path of the worker stand-in binary built alongside these tests.
const STUB_WORKER: &str = env!("CARGO_BIN_EXE_stub_worker");

fn stub_worker_config() -> Result<ProcessLauncherConfig, String> {
    let env_config = SystemTestConfig::load()?;
    let mut config = ProcessLauncherConfig::new(STUB_WORKER);
    config.inherit_output = env_config.inherit_worker_output;
    Ok(config)
}

#[tokio::test(flavor = "multi_thread")]
async fn stub_worker_process_reports_cpu_time() -> StepResult {
    let launcher = ProcessLauncher::new(stub_worker_config()?)?;
    run_scenario("stub_worker_process_reports_cpu_time", async move |ctx| {
        ctx.given_doubles_running().await?;
        ctx.given_worker_with(launcher).await?;
        let report = ctx.when_worker_triggered().await?;
        require(report.status == 200, format!("trigger status {}", report.status))?;
        ctx.then_payloads_received(1).await?;
        ctx.then_metric_indexed("cpu_time")?;
        ctx.then_metric_indexed("cloudflare_d1_read_queries")?;
        Ok(())
    })
    .await
}

#[tokio::test(flavor = "multi_thread")]
async fn launcher_config_file_drives_stub_worker() -> StepResult {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("worker.toml");
    std::fs::write(
        &path,
        format!("command = '{STUB_WORKER}'\nstartup_timeout_ms = 20000\n\n[env]\nRUST_LOG = \"warn\"\n"),
    )?;
    let launcher = ProcessLauncher::new(ProcessLauncherConfig::load(&path)?)?;
    require(launcher.config().env.contains_key("RUST_LOG"), "env table not loaded")?;
    require(
        launcher.config().startup_timeout() == Duration::from_secs(20),
        "startup timeout not loaded",
    )?;

    run_scenario("launcher_config_file_drives_stub_worker", async move |ctx| {
        ctx.given_doubles_running().await?;
        ctx.given_worker_with(launcher).await?;
        ctx.when_worker_triggered().await?;
        ctx.then_payloads_received(1).await?;
        ctx.then_metric_indexed("cpu_time")?;
        Ok(())
    })
    .await
}

#[tokio::test(flavor = "multi_thread")]
async fn dispose_kills_worker_process() -> StepResult {
    let launcher = ProcessLauncher::new(stub_worker_config()?)?;
    let mut worker_addr: Option<SocketAddr> = None;
    run_scenario("dispose_kills_worker_process", async |ctx| {
        ctx.given_doubles_running().await?;
        ctx.given_worker_with(launcher).await?;
        let base_url = ctx.sandbox().and_then(|driver| driver.base_url()).ok_or("no worker")?;
        let addr: SocketAddr = format!(
            "{}:{}",
            base_url.host_str().ok_or("worker url has no host")?,
            base_url.port().ok_or("worker url has no port")?
        )
        .parse()?;
        require(TcpStream::connect(addr).await.is_ok(), "worker not accepting connections")?;
        worker_addr = Some(addr);
        Ok(())
    })
    .await?;

    let addr = worker_addr.ok_or("worker address not captured")?;
    require(TcpStream::connect(addr).await.is_err(), format!("{addr} still accepts connections"))
}
