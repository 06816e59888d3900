//! Global `tracing` subscriber installation.
//!
//! Matches the teacher daemon's `main.rs` registry setup: a fmt layer with
//! thread ids/names on, filtered by `RUST_LOG` with a crate-scoped default
//! so `fabric_sim=debug` shows up even when the caller never sets the
//! environment variable at all.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Installs the global subscriber. Safe to call more than once per process
/// (subsequent calls are no-ops) so scenario tests can call it
/// unconditionally without tripping over each other.
pub fn init() {
    let _ = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_thread_names(true),
        )
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,fabric_sim=debug")),
        )
        .try_init();
}
