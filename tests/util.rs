#![cfg(not(loom))]

/// Installs a `fmt` subscriber filtered by `RUST_LOG`.
///
/// The contended paths log every wait and wake at `TRACE`, which is far too
/// much output for the stress tests unless it is asked for.
pub fn trace_init() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
