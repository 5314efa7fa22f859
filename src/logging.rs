use std::fs::OpenOptions;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use tracing_subscriber::{EnvFilter, fmt};

use crate::settings::Settings;

/// Initializes the global subscriber. `log_level` provides the baseline
/// filter, overridable through `RUST_LOG`. When a log file is configured but
/// cannot be opened, logging falls back to stderr rather than failing
/// startup.
pub fn init(settings: &Settings) -> Result<()> {
    let filter = || {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(settings.log_level.as_filter()))
    };

    if !settings.log_file.is_empty() {
        match OpenOptions::new()
            .create(true)
            .append(true)
            .open(&settings.log_file)
        {
            Ok(file) => {
                fmt::fmt()
                    .with_env_filter(filter())
                    .with_target(false)
                    .with_ansi(false)
                    .compact()
                    .with_writer(Arc::new(file))
                    .try_init()
                    .map_err(|err| anyhow!(err))?;
                return Ok(());
            }
            Err(err) => {
                eprintln!(
                    "can't open log file {}, falling back to stderr: {err}",
                    settings.log_file
                );
            }
        }
    }

    fmt::fmt()
        .with_env_filter(filter())
        .with_target(false)
        .compact()
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err| anyhow!(err))?;
    Ok(())
}
