use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber shared by every pipeline binary.
///
/// `default_filter` applies when `RUST_LOG` is unset; stages run unattended
/// under a scheduler, so output stays on stderr in plain fmt form for the
/// platform's log capture.
pub fn init_tracing(default_filter: &str) -> Result<(), anyhow::Error> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))
}
