// system-tests/src/bin/stub_worker.rs
// ============================================================================
// Module: Stub Worker Binary
// Description: Runs the worker stand-in as a standalone process.
// Purpose: Exercise the process launcher end to end.
// Dependencies: system-tests, tokio, tracing-subscriber
// ============================================================================

//! ## Overview
//! Reads the worker bindings and `PORT` from the environment, serves the
//! scheduled trigger route on `127.0.0.1:$PORT` and exits on Ctrl-C.

use std::io::Write;
use std::net::Ipv4Addr;
use std::process::ExitCode;
use std::sync::Arc;

use o11y_sandbox::PORT_ENV_VAR;
use system_tests::config::read_env_nonempty;
use system_tests::worker_stub::WorkerStub;
use system_tests::worker_stub::WorkerStubBindings;
use system_tests::worker_stub::serve;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> ExitCode {
    init_logging();
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            let _ = writeln!(std::io::stderr(), "stub_worker: {message}");
            ExitCode::FAILURE
        }
    }
}

/// Binds the port and serves until Ctrl-C.
async fn run() -> Result<(), String> {
    let port = read_env_nonempty(PORT_ENV_VAR)?
        .ok_or_else(|| format!("{PORT_ENV_VAR} is not set"))?
        .trim()
        .parse::<u16>()
        .map_err(|err| format!("{PORT_ENV_VAR} is not a port: {err}"))?;
    let bindings = WorkerStubBindings::from_env().map_err(|err| err.to_string())?;
    let worker = WorkerStub::new(bindings).map_err(|err| err.to_string())?;
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port))
        .await
        .map_err(|err| format!("failed to bind port {port}: {err}"))?;
    tracing::info!(port, "stub worker listening");
    serve(listener, Arc::new(worker), async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
    .map_err(|err| format!("server failed: {err}"))
}

/// Installs the stderr log subscriber.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
