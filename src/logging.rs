//! Logging setup of the command line tool.
//!
//! Log lines go to stderr, next to the progress bars. The level is read from `RUST_LOG`,
//! defaulting to `info` (`debug` with `--verbose`).

use tracing::subscriber::SetGlobalDefaultError;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Registry};

fn build_env_filter(verbose: bool) -> EnvFilter {
    let default_level = if verbose { "debug" } else { "info" };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

pub fn init(verbose: bool) -> Result<(), SetGlobalDefaultError> {
    let stderr_layer = fmt::layer().with_target(false).with_writer(std::io::stderr);
    let subscriber = Registry::default()
        .with(build_env_filter(verbose))
        .with(stderr_layer);
    tracing::subscriber::set_global_default(subscriber)
}
