// crates/o11y-sandbox/src/driver.rs
// ============================================================================
// Module: Sandbox Driver
// Description: Lifecycle control for one externally-built worker instance.
// Purpose: Start a worker with injected bindings, trigger it, tear it down.
// Dependencies: async-trait, reqwest, thiserror, tracing, url
// ============================================================================

//! ## Overview
//! [`SandboxDriver`] owns at most one running worker. How the worker is hosted
//! is behind [`SandboxLauncher`]; the driver only validates configuration,
//! asks the launcher for an instance, and issues the scheduled trigger request.
//! Invariants:
//! - Configuration is validated before the launcher is called.
//! - One trigger call issues exactly one HTTP request; there are no retries.
//! - `dispose` is safe to call repeatedly and with nothing running.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::time::Duration;
use std::time::Instant;

use async_trait::async_trait;
use reqwest::Client;
use thiserror::Error;
use url::Url;

use crate::config::ConfigurationError;
use crate::config::SandboxBindings;
use crate::config::SandboxConfig;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Default bound on one trigger round trip.
pub const DEFAULT_TRIGGER_TIMEOUT: Duration = Duration::from_secs(10);
/// Maximum response body length kept in trigger errors.
const MAX_ERROR_BODY_CHARS: usize = 512;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Errors raised by the sandbox driver and its launchers.
///
/// # Invariants
/// - Variants are stable for programmatic handling.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// The configuration failed validation; nothing was launched.
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    /// An instance is already running.
    #[error("sandbox is already running")]
    AlreadyRunning,
    /// No instance is running.
    #[error("sandbox is not running")]
    NotRunning,
    /// The launcher could not produce a ready instance.
    #[error("sandbox launch failed: {0}")]
    Launch(String),
    /// The trigger request could not be completed.
    #[error("sandbox trigger failed: {0}")]
    Trigger(String),
    /// The trigger request was answered with a non-success status.
    #[error("sandbox trigger returned status {status}: {body}")]
    TriggerStatus {
        /// HTTP status code.
        status: u16,
        /// Response body, truncated.
        body: String,
    },
    /// The instance could not be shut down cleanly.
    #[error("sandbox shutdown failed: {0}")]
    Shutdown(String),
    /// The HTTP client could not be built.
    #[error("sandbox http client unavailable: {0}")]
    Client(String),
}

// ============================================================================
// SECTION: Launcher Seam
// ============================================================================

/// Hosts worker instances.
#[async_trait]
pub trait SandboxLauncher: Send + Sync {
    /// Starts one worker with `bindings` and returns once it accepts requests.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::Launch`] when the worker cannot be started.
    async fn launch(
        &self,
        bindings: &SandboxBindings,
    ) -> Result<Box<dyn SandboxInstance>, SandboxError>;
}

/// One running worker.
#[async_trait]
pub trait SandboxInstance: Send {
    /// Base URL requests are sent to.
    fn base_url(&self) -> &Url;

    /// Stops the worker and releases its resources.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::Shutdown`] when the worker cannot be stopped.
    async fn shutdown(self: Box<Self>) -> Result<(), SandboxError>;
}

// ============================================================================
// SECTION: Driver
// ============================================================================

/// Result of one trigger call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerReport {
    /// HTTP status returned by the worker.
    pub status: u16,
    /// Round-trip time.
    pub elapsed: Duration,
}

/// Drives one worker instance through start, trigger and dispose.
pub struct SandboxDriver {
    /// Launcher used by `start`.
    launcher: Box<dyn SandboxLauncher>,
    /// HTTP client for trigger requests.
    client: Client,
    /// Running instance and its trigger path.
    running: Option<(Box<dyn SandboxInstance>, String)>,
}

impl std::fmt::Debug for SandboxDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxDriver")
            .field("base_url", &self.base_url().map(Url::as_str))
            .finish_non_exhaustive()
    }
}

impl SandboxDriver {
    /// Builds a driver with the default trigger timeout.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::Client`] when the HTTP client cannot be built.
    pub fn new(launcher: impl SandboxLauncher + 'static) -> Result<Self, SandboxError> {
        Self::with_trigger_timeout(launcher, DEFAULT_TRIGGER_TIMEOUT)
    }

    /// Builds a driver with an explicit trigger timeout.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::Client`] when the HTTP client cannot be built.
    pub fn with_trigger_timeout(
        launcher: impl SandboxLauncher + 'static,
        trigger_timeout: Duration,
    ) -> Result<Self, SandboxError> {
        let client = Client::builder()
            .timeout(trigger_timeout)
            .build()
            .map_err(|err| SandboxError::Client(err.to_string()))?;
        Ok(Self {
            launcher: Box::new(launcher),
            client,
            running: None,
        })
    }

    /// Validates `config` and launches one worker with its bindings.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::AlreadyRunning`] when an instance is running,
    /// [`SandboxError::Configuration`] when validation fails (the launcher is
    /// never called), and launcher errors otherwise.
    pub async fn start(&mut self, config: &SandboxConfig) -> Result<(), SandboxError> {
        if self.running.is_some() {
            return Err(SandboxError::AlreadyRunning);
        }
        let bindings = config.validate()?;
        let instance = self.launcher.launch(&bindings).await?;
        tracing::info!(
            base_url = %instance.base_url(),
            platform_api_url = %bindings.platform_api_url(),
            metrics_url = %bindings.metrics_url(),
            "sandbox started"
        );
        self.running = Some((instance, bindings.scheduled_path().to_string()));
        Ok(())
    }

    /// Requests one scheduled execution and waits for the worker's response.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::NotRunning`] with no instance,
    /// [`SandboxError::Trigger`] on transport failure and
    /// [`SandboxError::TriggerStatus`] on a non-success status.
    pub async fn trigger(&self) -> Result<TriggerReport, SandboxError> {
        let (instance, scheduled_path) =
            self.running.as_ref().ok_or(SandboxError::NotRunning)?;
        let url = instance
            .base_url()
            .join(scheduled_path)
            .map_err(|err| SandboxError::Trigger(err.to_string()))?;
        let started = Instant::now();
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|err| SandboxError::Trigger(err.to_string()))?;
        let status = response.status();
        let elapsed = started.elapsed();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(url = %url, status = status.as_u16(), "sandbox trigger rejected");
            return Err(SandboxError::TriggerStatus {
                status: status.as_u16(),
                body: body.chars().take(MAX_ERROR_BODY_CHARS).collect(),
            });
        }
        tracing::debug!(
            url = %url,
            status = status.as_u16(),
            elapsed_ms = elapsed.as_millis(),
            "sandbox triggered"
        );
        Ok(TriggerReport {
            status: status.as_u16(),
            elapsed,
        })
    }

    /// Shuts down the running instance. No-op with nothing running.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::Shutdown`] when the instance cannot be stopped;
    /// the driver no longer tracks it either way.
    pub async fn dispose(&mut self) -> Result<(), SandboxError> {
        let Some((instance, _)) = self.running.take() else {
            return Ok(());
        };
        let base_url = instance.base_url().to_string();
        instance.shutdown().await?;
        tracing::info!(base_url = %base_url, "sandbox disposed");
        Ok(())
    }

    /// Returns true while an instance is running.
    #[must_use]
    pub const fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Returns the running instance's base URL.
    #[must_use]
    pub fn base_url(&self) -> Option<&Url> {
        self.running.as_ref().map(|(instance, _)| instance.base_url())
    }
}
