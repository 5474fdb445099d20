// crates/o11y-sandbox/src/process.rs
// ============================================================================
// Module: Process Launcher
// Description: Sandbox launcher that runs the worker as a child process.
// Purpose: Host a real worker runtime behind the sandbox driver.
// Dependencies: async-trait, serde, thiserror, tokio, toml, url
// ============================================================================

//! ## Overview
//! [`ProcessLauncher`] starts the command described by a
//! [`ProcessLauncherConfig`] on a fresh loopback port. `{port}` placeholders in
//! the arguments are replaced with that port, and the worker bindings plus
//! `PORT` are added to the child environment. The launch completes once the
//! port accepts TCP connections.
//! Invariants:
//! - A child that exits before becoming ready fails the launch.
//! - A child that is not ready within `startup_timeout_ms` is killed and fails
//!   the launch.
//! - Children are killed on shutdown and when their instance is dropped.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::fs;
use std::net::Ipv4Addr;
use std::net::SocketAddr;
use std::net::TcpListener as StdTcpListener;
use std::path::Path;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::process::Child;
use tokio::process::Command;
use tokio::time::Instant;
use tokio::time::sleep;
use url::Url;

use crate::config::SandboxBindings;
use crate::driver::SandboxError;
use crate::driver::SandboxInstance;
use crate::driver::SandboxLauncher;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Placeholder replaced with the allocated port in arguments.
pub const PORT_PLACEHOLDER: &str = "{port}";
/// Environment variable carrying the allocated port.
pub const PORT_ENV_VAR: &str = "PORT";
/// Maximum launcher config file size in bytes.
const MAX_CONFIG_FILE_SIZE: usize = 64 * 1024;
/// Maximum total path length.
const MAX_TOTAL_PATH_LENGTH: usize = 4096;
/// Maximum length of a single path component.
const MAX_PATH_COMPONENT_LENGTH: usize = 255;
/// Maximum number of command arguments.
const MAX_ARGS: usize = 64;
/// Default readiness deadline in milliseconds.
const DEFAULT_STARTUP_TIMEOUT_MS: u64 = 15_000;
/// Minimum readiness deadline in milliseconds.
const MIN_STARTUP_TIMEOUT_MS: u64 = 100;
/// Maximum readiness deadline in milliseconds.
const MAX_STARTUP_TIMEOUT_MS: u64 = 120_000;
/// Delay between readiness probes.
const READINESS_PROBE_INTERVAL: Duration = Duration::from_millis(50);

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Errors raised while loading launcher configuration.
///
/// # Invariants
/// - Variants are stable for programmatic handling.
#[derive(Debug, Error)]
pub enum LauncherConfigError {
    /// I/O failure while reading configuration.
    #[error("launcher config io error: {0}")]
    Io(String),
    /// TOML parsing error.
    #[error("launcher config parse error: {0}")]
    Parse(String),
    /// Invalid configuration data.
    #[error("invalid launcher config: {0}")]
    Invalid(String),
}

// ============================================================================
// SECTION: Configuration
// ============================================================================

/// How to run the worker runtime.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProcessLauncherConfig {
    /// Program to execute.
    pub command: String,
    /// Program arguments; `{port}` is substituted.
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory for the child.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Extra environment for the child, applied before the worker bindings.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Readiness deadline in milliseconds.
    #[serde(default = "default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,
    /// Forward child stdout/stderr to this process instead of discarding it.
    #[serde(default)]
    pub inherit_output: bool,
}

/// Serde default for `startup_timeout_ms`.
const fn default_startup_timeout_ms() -> u64 {
    DEFAULT_STARTUP_TIMEOUT_MS
}

impl ProcessLauncherConfig {
    /// Creates a config for `command` with defaults.
    #[must_use]
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            working_dir: None,
            env: BTreeMap::new(),
            startup_timeout_ms: DEFAULT_STARTUP_TIMEOUT_MS,
            inherit_output: false,
        }
    }

    /// Loads and validates a config file.
    ///
    /// # Errors
    ///
    /// Returns [`LauncherConfigError`] when loading or validation fails.
    pub fn load(path: &Path) -> Result<Self, LauncherConfigError> {
        validate_path(path)?;
        let bytes = fs::read(path).map_err(|err| LauncherConfigError::Io(err.to_string()))?;
        if bytes.len() > MAX_CONFIG_FILE_SIZE {
            return Err(LauncherConfigError::Invalid("config file exceeds size limit".to_string()));
        }
        let content = std::str::from_utf8(&bytes)
            .map_err(|_| LauncherConfigError::Invalid("config file must be utf-8".to_string()))?;
        let config: Self =
            toml::from_str(content).map_err(|err| LauncherConfigError::Parse(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the config.
    ///
    /// # Errors
    ///
    /// Returns [`LauncherConfigError::Invalid`] when a field is out of range.
    pub fn validate(&self) -> Result<(), LauncherConfigError> {
        if self.command.trim().is_empty() {
            return Err(LauncherConfigError::Invalid("command must be non-empty".to_string()));
        }
        validate_path(Path::new(&self.command))?;
        if self.args.len() > MAX_ARGS {
            return Err(LauncherConfigError::Invalid(format!("args exceeds {MAX_ARGS} entries")));
        }
        if let Some(dir) = &self.working_dir {
            validate_path(dir)?;
        }
        if !(MIN_STARTUP_TIMEOUT_MS ..= MAX_STARTUP_TIMEOUT_MS).contains(&self.startup_timeout_ms)
        {
            return Err(LauncherConfigError::Invalid(format!(
                "startup_timeout_ms must be between {MIN_STARTUP_TIMEOUT_MS} and \
                 {MAX_STARTUP_TIMEOUT_MS}"
            )));
        }
        if self.env.keys().any(|key| key.is_empty() || key.contains('=')) {
            return Err(LauncherConfigError::Invalid("env keys must be non-empty names".to_string()));
        }
        Ok(())
    }

    /// Returns the arguments with `{port}` replaced.
    #[must_use]
    pub fn resolved_args(&self, port: u16) -> Vec<String> {
        let port = port.to_string();
        self.args.iter().map(|arg| arg.replace(PORT_PLACEHOLDER, &port)).collect()
    }

    /// Returns the readiness deadline.
    #[must_use]
    pub const fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }
}

/// Validates a path against length limits.
fn validate_path(path: &Path) -> Result<(), LauncherConfigError> {
    let text = path.to_string_lossy();
    if text.len() > MAX_TOTAL_PATH_LENGTH {
        return Err(LauncherConfigError::Invalid("path exceeds max length".to_string()));
    }
    for component in path.components() {
        let value = component.as_os_str().to_string_lossy();
        if value.len() > MAX_PATH_COMPONENT_LENGTH {
            return Err(LauncherConfigError::Invalid("path component too long".to_string()));
        }
    }
    Ok(())
}

// ============================================================================
// SECTION: Launcher
// ============================================================================

/// Launches the worker as a child process.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    /// Command description.
    config: ProcessLauncherConfig,
}

impl ProcessLauncher {
    /// Creates a launcher from a validated config.
    ///
    /// # Errors
    ///
    /// Returns [`LauncherConfigError::Invalid`] when the config is invalid.
    pub fn new(config: ProcessLauncherConfig) -> Result<Self, LauncherConfigError> {
        config.validate()?;
        Ok(Self {
            config,
        })
    }

    /// Returns the launcher config.
    #[must_use]
    pub const fn config(&self) -> &ProcessLauncherConfig {
        &self.config
    }
}

#[async_trait]
impl SandboxLauncher for ProcessLauncher {
    async fn launch(
        &self,
        bindings: &SandboxBindings,
    ) -> Result<Box<dyn SandboxInstance>, SandboxError> {
        let addr = allocate_loopback_addr()?;
        let mut command = Command::new(&self.config.command);
        command
            .args(self.config.resolved_args(addr.port()))
            .envs(&self.config.env)
            .envs(bindings.env())
            .env(PORT_ENV_VAR, addr.port().to_string())
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if self.config.inherit_output {
            command.stdout(Stdio::inherit()).stderr(Stdio::inherit());
        } else {
            command.stdout(Stdio::null()).stderr(Stdio::null());
        }
        if let Some(dir) = &self.config.working_dir {
            command.current_dir(dir);
        }
        let mut child = command.spawn().map_err(|err| {
            SandboxError::Launch(format!("failed to spawn {}: {err}", self.config.command))
        })?;
        tracing::debug!(
            command = %self.config.command,
            pid = child.id().unwrap_or_default(),
            addr = %addr,
            "worker process spawned"
        );
        if let Err(err) = wait_for_port(&mut child, addr, self.config.startup_timeout()).await {
            let _ = child.kill().await;
            return Err(err);
        }
        let base_url = Url::parse(&format!("http://{addr}/"))
            .map_err(|err| SandboxError::Launch(err.to_string()))?;
        Ok(Box::new(ProcessInstance {
            child,
            base_url,
        }))
    }
}

/// Picks a free loopback port by binding and releasing it.
fn allocate_loopback_addr() -> Result<SocketAddr, SandboxError> {
    let listener = StdTcpListener::bind((Ipv4Addr::LOCALHOST, 0))
        .map_err(|err| SandboxError::Launch(format!("failed to bind loopback: {err}")))?;
    let addr = listener
        .local_addr()
        .map_err(|err| SandboxError::Launch(format!("failed to read listener address: {err}")))?;
    drop(listener);
    Ok(addr)
}

/// Waits until `addr` accepts connections, the child exits, or time runs out.
async fn wait_for_port(
    child: &mut Child,
    addr: SocketAddr,
    timeout: Duration,
) -> Result<(), SandboxError> {
    let started = Instant::now();
    let mut attempts = 0u32;
    loop {
        attempts = attempts.saturating_add(1);
        if let Some(status) =
            child.try_wait().map_err(|err| SandboxError::Launch(err.to_string()))?
        {
            return Err(SandboxError::Launch(format!(
                "worker process exited before becoming ready: {status}"
            )));
        }
        if TcpStream::connect(addr).await.is_ok() {
            tracing::debug!(addr = %addr, attempts, "worker process ready");
            return Ok(());
        }
        if started.elapsed() > timeout {
            return Err(SandboxError::Launch(format!(
                "worker readiness timeout after {attempts} attempts on {addr}"
            )));
        }
        sleep(READINESS_PROBE_INTERVAL).await;
    }
}

// ============================================================================
// SECTION: Instance
// ============================================================================

/// A running worker child process.
struct ProcessInstance {
    /// Child handle; killed on drop.
    child: Child,
    /// Loopback base URL.
    base_url: Url,
}

#[async_trait]
impl SandboxInstance for ProcessInstance {
    fn base_url(&self) -> &Url {
        &self.base_url
    }

    async fn shutdown(mut self: Box<Self>) -> Result<(), SandboxError> {
        if self.child.try_wait().map_err(|err| SandboxError::Shutdown(err.to_string()))?.is_some() {
            return Ok(());
        }
        self.child.kill().await.map_err(|err| SandboxError::Shutdown(err.to_string()))
    }
}
