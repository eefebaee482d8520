use eyre::{
    Context as _,
    Result,
};
use std::{
    path::{
        Path,
        PathBuf,
    },
    sync::Arc,
};
use tracing_subscriber::{
    fmt,
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
    Layer,
};

/// The tool's own log, part of the bundle it produces.
pub const LOG_FILE: &str = "diagnostic.log";

lazy_static::lazy_static! {
    static ref LOG_ENV: String = format!("{}_LOG", env!("CARGO_PKG_NAME").to_uppercase().replace('-', "_"));
}

fn env_filter(verbose: bool) -> EnvFilter {
    let default_level = if verbose { "debug" } else { "info" };
    EnvFilter::try_from_env(LOG_ENV.as_str())
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(format!("{default_level},hyper=warn,hyper_util=warn,reqwest=warn")))
}

/// Logs to stderr and to `diagnostic.log` inside `run_dir`. `CLUSTER_DIAG_LOG` or `RUST_LOG`
/// override the level, `verbose` raises the default to debug.
pub fn init_logging(verbose: bool, run_dir: &Path) -> Result<PathBuf> {
    let log_path = run_dir.join(LOG_FILE);
    let log_file = std::fs::File::create(&log_path)
        .wrap_err_with(|| format!("Failed to create log file {}", log_path.display()))?;

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_filter(env_filter(verbose)),
        )
        .with(
            fmt::layer()
                .with_writer(Arc::new(log_file))
                .with_ansi(false)
                .with_filter(env_filter(verbose)),
        )
        .with(tracing_error::ErrorLayer::default())
        .try_init()
        .wrap_err("Failed to initialize tracing subscriber")?;

    Ok(log_path)
}
