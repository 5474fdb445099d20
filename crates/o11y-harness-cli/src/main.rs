// crates/o11y-harness-cli/src/main.rs
// ============================================================================
// Module: Observability Doubles CLI Entry Point
// Description: Command dispatcher for running the test doubles standalone.
// Purpose: Let worker developers point a local worker at the doubles by hand.
// Dependencies: clap, o11y-harness-core, tokio, tracing-subscriber
// ============================================================================

//! ## Overview
//! `o11y-doubles serve` starts the telemetry collector and the platform API
//! double, prints their URLs, and on Ctrl-C prints what the collector indexed.
//! `o11y-doubles route` answers, offline, which fixture a query body would
//! receive.
//! Binds are loopback-only unless `--allow-non-loopback` is given.

// ============================================================================
// SECTION: Modules
// ============================================================================


// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fs::File;
use std::io::Read;
use std::io::Write;
use std::net::SocketAddr;
use std::path::Path;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::ArgAction;
use clap::Args;
use clap::Parser;
use clap::Subcommand;
use o11y_harness_core::PlatformApiDouble;
use o11y_harness_core::QueryKind;
use o11y_harness_core::ResponderSettings;
use o11y_harness_core::RoutingTable;
use o11y_harness_core::TelemetryCollector;
use o11y_harness_core::default_fixture_dir;
use o11y_harness_core::responder::DEFAULT_MAX_BODY_BYTES;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

// ============================================================================
// SECTION: Limits
// ============================================================================

/// Maximum size of a query body read by `route`.
const MAX_ROUTE_BODY_BYTES: u64 = 1024 * 1024;
/// Default collector bind address.
const DEFAULT_COLLECTOR_ADDR: &str = "127.0.0.1:0";
/// Default platform API bind address.
const DEFAULT_PLATFORM_ADDR: &str = "127.0.0.1:0";

// ============================================================================
// SECTION: CLI Types
// ============================================================================

/// Top-level CLI definition.
#[derive(Parser, Debug)]
#[command(name = "o11y-doubles", version, disable_help_subcommand = true)]
struct Cli {
    /// Log per-request activity.
    #[arg(long, short, action = ArgAction::SetTrue, global = true)]
    verbose: bool,
    /// Selected subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

/// Supported CLI subcommands.
#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve the telemetry collector and platform API doubles until Ctrl-C.
    Serve(ServeCommand),
    /// Print which fixture a platform query body is answered with.
    Route(RouteCommand),
}

/// Arguments for `serve`.
#[derive(Args, Debug)]
struct ServeCommand {
    /// Telemetry collector bind address.
    #[arg(long, value_name = "ADDR", default_value = DEFAULT_COLLECTOR_ADDR)]
    collector_addr: SocketAddr,
    /// Platform API double bind address.
    #[arg(long, value_name = "ADDR", default_value = DEFAULT_PLATFORM_ADDR)]
    platform_addr: SocketAddr,
    /// Fixture directory (defaults to the bundled fixtures).
    #[arg(long, value_name = "DIR")]
    fixtures: Option<PathBuf>,
    /// Maximum accepted request body size in bytes.
    #[arg(long, value_name = "BYTES", default_value_t = DEFAULT_MAX_BODY_BYTES)]
    max_body_bytes: usize,
    /// Permit binding to non-loopback addresses.
    #[arg(long, action = ArgAction::SetTrue)]
    allow_non_loopback: bool,
}

/// Arguments for `route`.
#[derive(Args, Debug)]
struct RouteCommand {
    /// Query body given inline.
    #[arg(long, value_name = "TEXT", conflicts_with = "file", required_unless_present = "file")]
    body: Option<String>,
    /// Query body read from a file.
    #[arg(long, value_name = "PATH")]
    file: Option<PathBuf>,
    /// Fixture directory (defaults to the bundled fixtures).
    #[arg(long, value_name = "DIR")]
    fixtures: Option<PathBuf>,
    /// Also print the fixture document.
    #[arg(long, action = ArgAction::SetTrue)]
    print_document: bool,
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// CLI error wrapper for user-facing messages.
#[derive(Debug, Error)]
#[error("{message}")]
struct CliError {
    /// Human-readable error message.
    message: String,
}

impl CliError {
    /// Constructs a new [`CliError`].
    const fn new(message: String) -> Self {
        Self {
            message,
        }
    }
}

/// CLI result alias for fallible operations.
type CliResult<T> = Result<T, CliError>;

/// Errors raised by bounded file reads.
#[derive(Debug, Error)]
enum ReadLimitError {
    /// The file could not be opened or read.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// The file exceeds the allowed size.
    #[error("file exceeds {limit} bytes")]
    TooLarge {
        /// Maximum allowed size.
        limit: u64,
    },
}

// ============================================================================
// SECTION: Entry Point
// ============================================================================

/// CLI entry point returning an exit code.
#[tokio::main(flavor = "multi_thread")]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(err) => emit_error(&err.to_string()),
    }
}

/// Executes the CLI command dispatcher.
async fn run() -> CliResult<ExitCode> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    match cli.command {
        Commands::Serve(command) => command_serve(command).await,
        Commands::Route(command) => command_route(&command),
    }
}

/// Installs the stderr log subscriber; `RUST_LOG` overrides the default level.
fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

// ============================================================================
// SECTION: Serve Command
// ============================================================================

/// Runs both doubles until Ctrl-C, then prints the collected metric names.
async fn command_serve(command: ServeCommand) -> CliResult<ExitCode> {
    enforce_loopback("collector", command.collector_addr, command.allow_non_loopback)?;
    enforce_loopback("platform", command.platform_addr, command.allow_non_loopback)?;
    let fixture_dir = command.fixtures.unwrap_or_else(default_fixture_dir);

    let mut collector = TelemetryCollector::with_settings(ResponderSettings {
        bind_addr: command.collector_addr,
        max_body_bytes: command.max_body_bytes,
        ..ResponderSettings::named("telemetry-collector")
    });
    let mut platform = PlatformApiDouble::with_settings(
        fixture_dir,
        ResponderSettings {
            bind_addr: command.platform_addr,
            max_body_bytes: command.max_body_bytes,
            ..ResponderSettings::named("platform-api")
        },
    );

    collector
        .start()
        .await
        .map_err(|err| CliError::new(format!("collector failed to start: {err}")))?;
    if let Err(err) = platform.start().await {
        collector.dispose().await;
        return Err(CliError::new(format!("platform api double failed to start: {err}")));
    }

    let metrics_url = collector.metrics_url().unwrap_or_default();
    let platform_url = platform.url().unwrap_or_default();
    write_stdout_line(&format!("METRICS_URL={metrics_url}"))
        .map_err(|err| CliError::new(output_error("stdout", &err)))?;
    write_stdout_line(&format!("CLOUDFLARE_API_URL={platform_url}"))
        .map_err(|err| CliError::new(output_error("stdout", &err)))?;

    let waited = tokio::signal::ctrl_c().await;
    let summary = serve_summary(
        collector.payload_count(),
        collector.rejected_count(),
        &collector.metric_names().into_iter().collect::<Vec<_>>(),
    );
    platform.dispose().await;
    collector.dispose().await;
    waited.map_err(|err| CliError::new(format!("failed to wait for ctrl-c: {err}")))?;
    for line in summary {
        write_stdout_line(&line).map_err(|err| CliError::new(output_error("stdout", &err)))?;
    }
    Ok(ExitCode::SUCCESS)
}

/// Refuses non-loopback binds unless explicitly allowed.
fn enforce_loopback(label: &str, addr: SocketAddr, allow_non_loopback: bool) -> CliResult<()> {
    if addr.ip().is_loopback() {
        return Ok(());
    }
    if allow_non_loopback {
        tracing::warn!(double = label, addr = %addr, "binding to a non-loopback address");
        return Ok(());
    }
    Err(CliError::new(format!(
        "refusing to bind {label} to non-loopback address {addr}; pass --allow-non-loopback to \
         override"
    )))
}

/// Formats the end-of-run summary.
fn serve_summary(payloads: usize, rejected: u64, metric_names: &[String]) -> Vec<String> {
    let mut lines = Vec::with_capacity(metric_names.len() + 3);
    lines.push(format!("payloads: {payloads}"));
    lines.push(format!("rejected: {rejected}"));
    lines.push(format!("metric names ({}):", metric_names.len()));
    lines.extend(metric_names.iter().map(|name| format!("  {name}")));
    lines
}

// ============================================================================
// SECTION: Route Command
// ============================================================================

/// Resolves a query body against the routing table and prints the result.
fn command_route(command: &RouteCommand) -> CliResult<ExitCode> {
    let body = match (&command.body, &command.file) {
        (Some(body), _) => body.as_bytes().to_vec(),
        (None, Some(path)) => read_bytes_with_limit(path, MAX_ROUTE_BODY_BYTES).map_err(|err| {
            CliError::new(format!("failed to read {}: {err}", path.display()))
        })?,
        (None, None) => return Err(CliError::new("either --body or --file is required".to_string())),
    };
    let fixture_dir = command.fixtures.clone().unwrap_or_else(default_fixture_dir);
    let table = RoutingTable::load(&fixture_dir).map_err(|err| CliError::new(err.to_string()))?;
    let (kind, document) = table.resolve(&body);
    write_stdout_line(&describe_route(kind))
        .map_err(|err| CliError::new(output_error("stdout", &err)))?;
    if command.print_document {
        let text = String::from_utf8_lossy(&document);
        write_stdout_line(text.trim_end())
            .map_err(|err| CliError::new(output_error("stdout", &err)))?;
    }
    Ok(ExitCode::SUCCESS)
}

/// Formats a resolved route as `kind fixture-file`.
fn describe_route(kind: QueryKind) -> String {
    format!("{} {}", kind.as_str(), kind.fixture_file())
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Reads a file, refusing anything larger than `limit` bytes.
fn read_bytes_with_limit(path: &Path, limit: u64) -> Result<Vec<u8>, ReadLimitError> {
    let file = File::open(path)?;
    let mut bytes = Vec::new();
    file.take(limit.saturating_add(1)).read_to_end(&mut bytes)?;
    if u64::try_from(bytes.len()).unwrap_or(u64::MAX) > limit {
        return Err(ReadLimitError::TooLarge {
            limit,
        });
    }
    Ok(bytes)
}

/// Writes a single line to stdout.
fn write_stdout_line(message: &str) -> std::io::Result<()> {
    let mut stdout = std::io::stdout();
    writeln!(&mut stdout, "{message}")
}

/// Writes a single line to stderr.
fn write_stderr_line(message: &str) -> std::io::Result<()> {
    let mut stderr = std::io::stderr();
    writeln!(&mut stderr, "{message}")
}

/// Formats an output error message.
fn output_error(stream: &str, error: &std::io::Error) -> String {
    format!("failed to write to {stream}: {error}")
}

/// Emits an error message to stderr and returns a failure exit code.
fn emit_error(message: &str) -> ExitCode {
    let _ = write_stderr_line(message);
    ExitCode::FAILURE
}
