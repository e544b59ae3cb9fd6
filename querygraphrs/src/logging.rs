use tracing_subscriber::EnvFilter;

/// Install a fmt subscriber filtered by `QUERYGRAPH_LOG`, then `RUST_LOG`,
/// defaulting to `info`. Returns `false` if a global subscriber was already set.
pub fn init_tracing() -> bool {
    let filter = std::env::var("QUERYGRAPH_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .map(EnvFilter::new)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok()
}
