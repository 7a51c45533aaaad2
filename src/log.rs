//! Structured logging for keel.
//!
//! Log levels:
//! - ERROR: the session could not continue
//! - WARN: executor errors, retries, failed tasks
//! - INFO: session and task lifecycle, spirals, commitment changes
//! - DEBUG: panel votes, gate decisions, checkpoint writes
//!
//! Debug mode can be enabled with the `--debug` flag or `KEEL_DEBUG=1`.
//! `RUST_LOG` overrides both. Output goes to stderr so stdout stays free for
//! the session report.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Whether `KEEL_DEBUG` asks for debug output.
pub fn debug_from_env() -> bool {
    std::env::var("KEEL_DEBUG")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Filter directive used when `RUST_LOG` is unset.
pub fn default_directive(debug: bool) -> &'static str {
    if debug {
        "keel=debug"
    } else {
        "keel=info"
    }
}

/// Install the global subscriber. Safe to call more than once.
pub fn init(debug: bool) {
    let debug = debug || debug_from_env();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(debug)));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}
