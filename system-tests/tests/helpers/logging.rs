// system-tests/tests/helpers/logging.rs
// ============================================================================
// Module: System Test Logging
// Description: Routes harness tracing output to the libtest writer.
// Purpose: Make double and driver events visible in failing test output.
// Dependencies: tracing-subscriber
// ============================================================================

use std::sync::Once;

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

static INIT: Once = Once::new();

/// Installs the test subscriber once per binary; `RUST_LOG` overrides the
/// default `debug` filter.
pub fn init_test_logging() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));
        let _ = tracing_subscriber::registry()
            .with(fmt::layer().with_test_writer().with_target(true))
            .with(filter)
            .try_init();
    });
}
