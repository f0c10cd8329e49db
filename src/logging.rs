use color_eyre::Result;
use eyre::Context as _;
use flood_config::Config;
use std::sync::Arc;
use tracing_subscriber::{
    fmt,
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
    Layer,
};

const LOG_FILE: &str = concat!(env!("CARGO_PKG_NAME"), ".log");
const FILE_FILTER: &str = "info,flood=debug,flood_bandwidth=debug,flood_server=debug";

/// Logs to stderr, filtered by `RUST_LOG` (default `info`), and to a fresh
/// `flood.log` in the data directory at debug level for the flood crates.
pub fn init_logging(config: &Config) -> Result<()> {
    let directory = config.data_dir();
    std::fs::create_dir_all(&directory).context("Failed to create data directory")?;
    let log_path = directory.join(LOG_FILE);
    if log_path.exists() {
        std::fs::remove_file(&log_path).context("Failed to remove existing log file")?;
    }
    let log_file = std::fs::File::create(&log_path)
        .wrap_err_with(|| format!("Failed to create log file {}", log_path.display()))?;

    let stderr_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(stderr_filter),
        )
        .with(
            fmt::layer()
                .with_ansi(false)
                .with_writer(Arc::new(log_file))
                .with_filter(EnvFilter::new(FILE_FILTER)),
        )
        .with(tracing_error::ErrorLayer::default())
        .try_init()
        .context("Failed to initialize tracing subscriber")
}
