// system-tests/tests/helpers/mod.rs
// ============================================================================
// Module: System Test Helpers
// Description: Shared helpers for harness system-tests.
// Purpose: Provide the scenario context, worker launchers and artifacts.
// Dependencies: system-tests, o11y-harness-core, o11y-sandbox
// ============================================================================

//! ## Overview
//! Shared helpers for harness system-tests.
//! Purpose: Provide the scenario context, worker launchers and artifacts.
//! Invariants:
//! - Every double and worker a scenario starts is torn down by the scenario.
//! - Timeouts come from one place and can only be lengthened by env override.

#![allow(dead_code, reason = "Shared helpers are reused across multiple test suites.")]

pub mod in_process_worker;
pub mod logging;
