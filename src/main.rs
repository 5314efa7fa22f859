use anyhow::Result;
use clap::Parser;

use memgate::{cli::Cli, logging, run, settings::Settings};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let (settings, load_error) = Settings::load(&cli);
    logging::init(&settings)?;
    if let Some(err) = load_error {
        tracing::warn!(error = %err, "failed to load configuration, continuing with defaults");
    }
    run(settings).await
}
