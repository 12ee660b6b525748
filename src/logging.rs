use tracing_subscriber::EnvFilter;

/// Stderr logging, filterable with `RUST_LOG`; info by default so the
/// engine's structural traces are visible without drowning the console.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
