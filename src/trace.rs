//! Opt-in diagnostics: route `tracing` events to stderr.
//!
//! The engine emits `debug!`/`info!` events throughout (merge trees, import
//! commits, degraded fallbacks). Embedders usually install their own
//! subscriber; binaries and tests can call [`init`] to get a plain stderr
//! one.

/// Install a stderr subscriber for `tracing` events. Safe to call more than
/// once; later calls are no-ops.
pub fn init() {
    let _ = tracing_subscriber::fmt()
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
