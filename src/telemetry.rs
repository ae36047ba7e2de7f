//! Tracing subscriber setup.
//!
//! The library itself only emits `tracing` events; installing a subscriber is
//! the application's call. This helper wires the common case: fmt output to
//! stderr with an env-driven filter.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install a fmt subscriber filtered by `RUST_LOG`, defaulting to
/// `warn,opweave=info`.
///
/// Safe to call more than once; later calls are no-ops. Returns whether this
/// call installed the subscriber.
pub fn init() -> bool {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("warn,opweave=info"))
        .unwrap_or_default();
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .is_ok()
}
