//! Logging initialization.
//!
//! All output goes through `tracing` with the standardized
//! `YYYY-MM-DD HH:MM:SS` timestamp format.

/// Initialize the global tracing subscriber.
///
/// Honors `RUST_LOG`; defaults to `info` for everything and `debug` for
/// this crate when unset.
pub fn init() {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info,lockgate=debug");
    }

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::new(
            "%Y-%m-%d %H:%M:%S".to_string(),
        ))
        .with_ansi(false)
        .init();
}
