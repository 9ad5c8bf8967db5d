use tracing_subscriber::EnvFilter;

/// Send structured logs to stderr so stdout carries only the run summary.
///
/// `RUST_LOG` takes precedence over `--log-level`.
pub fn init(log_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}
