//! Tracing subscriber setup shared by binaries and integration harnesses.

/// Initialise the global tracing subscriber with env-filter support.
///
/// Safe to call more than once — subsequent calls are no-ops.
pub fn init_tracing(default_filter: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .try_init();
}
