// crates/o11y-sandbox/src/lib.rs
// ============================================================================
// Module: Worker Sandbox
// Description: Configuration, lifecycle driver and launchers for worker sandboxes.
// Purpose: Run an externally-built worker against simulated dependencies.
// Dependencies: async-trait, reqwest, serde, thiserror, tokio, toml, url
// ============================================================================

//! ## Overview
//! The sandbox crate treats the worker as an opaque collaborator reachable over
//! HTTP. A scenario describes the worker's upstream endpoints in a
//! [`SandboxConfig`], the [`SandboxDriver`] validates it and asks a
//! [`SandboxLauncher`] for an instance, and [`SandboxDriver::trigger`] runs one
//! scheduled execution.
//!
//! Invariants:
//! - Invalid configuration never reaches a launcher.
//! - At most one instance per driver is running at a time.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod config;
pub mod driver;
pub mod process;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use config::API_KEY_BINDING;
pub use config::ConfigurationError;
pub use config::DEFAULT_SCHEDULED_PATH;
pub use config::METRICS_URL_BINDING;
pub use config::PLATFORM_API_URL_BINDING;
pub use config::SandboxBindings;
pub use config::SandboxConfig;
pub use driver::DEFAULT_TRIGGER_TIMEOUT;
pub use driver::SandboxDriver;
pub use driver::SandboxError;
pub use driver::SandboxInstance;
pub use driver::SandboxLauncher;
pub use driver::TriggerReport;
pub use process::LauncherConfigError;
pub use process::PORT_ENV_VAR;
pub use process::ProcessLauncher;
pub use process::ProcessLauncherConfig;
