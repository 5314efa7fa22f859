use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Clone, Parser)]
#[command(name = "memgate", about = "In-memory caching reverse proxy")]
pub struct Cli {
    /// Path to the JSON configuration file (defaults to ./memgate.json if present).
    #[arg(short = 'f', long)]
    pub config: Option<PathBuf>,
}
