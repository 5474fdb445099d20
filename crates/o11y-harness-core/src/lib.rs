// crates/o11y-harness-core/src/lib.rs
// ============================================================================
// Module: Worker Observability Harness Core
// Description: Test doubles and synchronization primitives for worker scenarios.
// Purpose: Capture worker telemetry and simulate upstream platform APIs.
// Dependencies: axum, memchr, serde_json, thiserror, tokio, tracing
// ============================================================================

//! ## Overview
//! The harness core provides the pieces a scenario needs to observe an
//! externally-built worker without talking to real infrastructure:
//! - [`TelemetryCollector`] accepts OTLP JSON exports and indexes metric names.
//! - [`PlatformApiDouble`] answers platform API queries with canned fixtures.
//! - [`RequestResponder`] is the shared HTTP listener underneath both doubles.
//! - [`Poller`] bridges the gap between "worker triggered" and "telemetry
//!   observable" with a bounded, interval-based wait.
//!
//! Invariants:
//! - Request bodies are buffered completely before any handler runs.
//! - The collector's metric-name index always equals the union of names over
//!   the full payload history since the last start.
//! - Every listener binds an OS-assigned loopback port and is released on
//!   dispose or drop.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod collector;
pub mod otlp;
pub mod platform;
pub mod poll;
pub mod responder;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use collector::CapturedPayload;
pub use collector::METRICS_PATH;
pub use collector::MetricNameIndex;
pub use collector::TelemetryCollector;
pub use otlp::DecodeError;
pub use otlp::ExportMetricsDocument;
pub use platform::FixtureError;
pub use platform::FixtureRoute;
pub use platform::PLATFORM_PATH;
pub use platform::PlatformApiDouble;
pub use platform::PlatformError;
pub use platform::QueryKind;
pub use platform::RoutingTable;
pub use platform::default_fixture_dir;
pub use poll::PollError;
pub use poll::PollOutcome;
pub use poll::Poller;
pub use poll::wait_until;
pub use responder::CannedResponse;
pub use responder::CapturedRequest;
pub use responder::RequestHandler;
pub use responder::RequestResponder;
pub use responder::ResponderError;
pub use responder::ResponderSettings;
