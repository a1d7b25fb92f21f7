//! Tracing initialization for the eddy daemon.
//!
//! Human-readable logs go to stdout, filtered by `RUST_LOG` when set and by
//! the configured level otherwise.

use tracing_subscriber::EnvFilter;

/// Initialize the tracing subscriber.
///
/// Call this once at startup, before any `tracing` events are emitted.
/// With `verbose_routing` the routing target is raised to `info` so per-key
/// routing decisions show up under the default level.
pub fn init(level: &str, verbose_routing: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let directives = if verbose_routing {
            format!("{level},eddy_cluster=info")
        } else {
            level.to_string()
        };
        EnvFilter::new(directives)
    });

    tracing_subscriber::fmt().with_env_filter(filter).init();
}
