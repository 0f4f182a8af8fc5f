use tracing_subscriber::EnvFilter;

/// Install the global fmt subscriber on stderr.
///
/// `RUST_LOG` wins over `default_level`; an unparsable level falls back to
/// `info`.
pub fn init(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
