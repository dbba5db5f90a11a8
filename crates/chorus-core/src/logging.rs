//! Tracing setup for binaries and tests.
//!
//! The core itself only emits `tracing` events; installing a subscriber is
//! the embedder's job. This helper wires the usual stack: env-filtered
//! console output, `CHORUS_LOG` overriding the default level.

use tracing_subscriber::{fmt, EnvFilter};

/// Install the default console subscriber.
///
/// Respects `CHORUS_LOG` (e.g. `CHORUS_LOG=chorus_core=debug`). Calling it
/// twice is harmless; the second call is a no-op.
pub fn init() {
    let filter = EnvFilter::try_from_env("CHORUS_LOG")
        .unwrap_or_else(|_| EnvFilter::new("chorus_core=info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
