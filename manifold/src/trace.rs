//! Tracing bootstrap for tests and demos.
//!
//! Selector threads are named `{pool}-{index}`, and most of what goes
//! wrong in a channel shows up as an interleaving across them, so the
//! subscriber installed here renders thread names on every line.

use tracing_subscriber::EnvFilter;

/// Install a fmt subscriber suited to poking at a selector pool.
///
/// Filtering follows `RUST_LOG` when set; otherwise only errors from
/// the manifold crates are shown so test output stays quiet.
/// Best-effort: a globally installed subscriber wins.
pub fn init() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("manifold=error,manifold_core=error"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .try_init();
}
