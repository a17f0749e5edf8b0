use tracing_subscriber::EnvFilter;

/// Installs the process-wide `tracing` subscriber. Called once, at the top of
/// `main`, before anything else logs. Verbosity defaults to `info` and is
/// overridable with `RUST_LOG`.
pub fn init() {
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

	tracing_subscriber::fmt()
		.with_env_filter(filter)
		.with_target(true)
		.init();
}
