use tracing_subscriber::EnvFilter;

/// Initializes the global tracing subscriber from an env-filter directive
/// string such as `"info,keeper=debug"`.
///
/// Must be called exactly once, before any other thread can emit events.
pub fn initialize(filter: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_ansi(false)
        .init();
}
