//! blockvault - deduplicating, encrypting backup tool
//!
//! Main binary entry point for the command-line interface.

use anyhow::Result;
use blockvault::cli::{Cli, Commands};
use blockvault::config::Settings;
use blockvault::logging;
use clap::Parser;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = Settings::load(cli.config.as_deref())?;
    let format = cli.log_format.unwrap_or(settings.logging.format);
    logging::init_logging(&settings.logging.level, cli.verbose, format);

    match cli.command {
        Commands::Backup(args) => blockvault::cli::backup::run(args, &settings).await,
        Commands::Restore(args) => blockvault::cli::restore::run(args, &settings).await,
        Commands::List(args) => blockvault::cli::list::run(args, &settings).await,
    }
}
