//! Tracing setup helpers for binaries embedding the runtime.
//!
//! The library itself only emits `tracing` events; installing a subscriber
//! is the embedding application's choice. These helpers cover the common
//! cases so worker binaries do not each reinvent the boilerplate.

use tracing_subscriber::{fmt, EnvFilter};

/// Default filter applied when `RUST_LOG` is unset.
const DEFAULT_FILTER: &str = "info";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Installs a human-readable subscriber honoring `RUST_LOG`.
///
/// Safe to call more than once; subsequent calls are no-ops.
pub fn init_tracing() {
    let _ = fmt()
        .with_env_filter(env_filter())
        .with_target(false)
        .try_init();
}

/// Installs a JSON-lines subscriber honoring `RUST_LOG`, for deployments
/// that ship worker logs to a collector.
pub fn init_tracing_json() {
    let _ = fmt()
        .json()
        .with_env_filter(env_filter())
        .with_current_span(false)
        .try_init();
}
