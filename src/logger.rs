//! Centralized logging configuration for sba-linear binaries and tests
//!
//! Provides a consistent tracing setup with a default INFO level. Cheirality
//! soft-drops and assembly statistics are reported through this subscriber.

use tracing::Level;

/// Initialize the tracing subscriber with the library's standard
/// configuration.
///
/// Default log level: INFO (overrideable via the `RUST_LOG` environment
/// variable, e.g. `RUST_LOG=sba_linear=debug`).
pub fn init_logger() {
    init_logger_with_level(Level::INFO)
}

/// Initialize the tracing subscriber with a custom default level.
pub fn init_logger_with_level(default_level: Level) {
    use tracing_subscriber::fmt::time::SystemTime;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(default_level.into())
                .from_env_lossy(),
        )
        .with_timer(SystemTime)
        .with_target(true)
        .with_level(true)
        .with_file(false)
        .with_line_number(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .init();
}
