//! Tracing initialisation helpers.
//!
//! The engine itself only emits `tracing` events and spans; wiring a
//! subscriber is the embedding application's job. Workers that do not have
//! their own subscriber can call [`init`] once at startup.

use tracing_subscriber::EnvFilter;

/// Install a formatted stderr subscriber honouring `RUST_LOG`.
///
/// Falls back to `info` when `RUST_LOG` is unset. Calling this twice is
/// harmless: the second call is a no-op.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
