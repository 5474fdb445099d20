// system-tests/src/lib.rs
// ============================================================================
// Module: Observability Harness System Tests Library
// Description: Shared configuration and the worker stand-in for scenarios.
// Purpose: Provide common utilities for the system-test binaries.
// Dependencies: o11y-sandbox, axum, reqwest
// ============================================================================

//! ## Overview
//! This crate hosts the env-backed test configuration and the worker
//! stand-in used by the system-test binaries in `system-tests/tests`. The
//! `stub_worker` binary runs the same stand-in as a child process.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod config;
pub mod worker_stub;
