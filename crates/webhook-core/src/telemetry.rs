//! Structured logging init, shared by the consumer binary and the demo
//! receiver. Generalizes every teacher service's
//! `tracing_subscriber::fmt::init()` into one configurable entry point.

use tracing_subscriber::{fmt, EnvFilter};

/// Initialize `tracing` with an `EnvFilter` (default `info`, overridable
/// via `RUST_LOG`) and, when `WEBHOOK_LOG_JSON=1`, structured JSON output
/// suitable for log aggregation.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("WEBHOOK_LOG_JSON").map(|v| v == "1").unwrap_or(false);

    if json {
        fmt().with_env_filter(filter).json().init();
    } else {
        fmt().with_env_filter(filter).init();
    }
}
