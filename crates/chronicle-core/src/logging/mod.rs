//! Structured logging with `tracing`.
//!
//! Library code logs through the `tracing` macros with structured fields
//! (`audit_id`, `entity`, `table`, `plugin`). Binaries call
//! [`init_subscriber`] once at startup; tests use [`capture_logs`] to assert
//! on emitted events without touching the global subscriber.

pub mod capture;

pub use capture::{CapturedEvent, CapturedLogs, capture_logs};

/// Install the global subscriber, writing to stderr.
///
/// `RUST_LOG` overrides `level` when set. With `json` each event is one JSON
/// object per line. Only the first call in a process has any effect.
pub fn init_subscriber(level: &str, json: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr);

    // a subscriber is already installed
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.compact().try_init()
    };
}
