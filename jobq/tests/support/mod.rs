//! Shared integration-test helpers.

use std::sync::Once;

static INIT: Once = Once::new();

/// Initializes a `tracing_subscriber` writer for the current test binary, once.
///
/// Safe to call from every test function; only the first call installs the subscriber.
pub fn init_logging() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}
