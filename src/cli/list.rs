//! List command implementation.

use crate::config::Settings;
use anyhow::Result;
use clap::{Args, ValueEnum};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ListFormat {
    Summary,
    Json,
}

/// Arguments for the list command
#[derive(Args, Debug)]
pub struct ListArgs {
    /// Metadata index database
    #[arg(short = 'd', long)]
    pub db: Option<PathBuf>,

    /// Output format
    #[arg(long, value_enum, default_value_t = ListFormat::Summary)]
    pub format: ListFormat,
}

/// Run the list command
pub async fn run(args: ListArgs, settings: &Settings) -> Result<()> {
    let db = args.db.unwrap_or_else(|| settings.database.clone());
    let index = super::open_index(&db).await?;
    let backups = index.list_backups().await?;

    match args.format {
        ListFormat::Json => println!("{}", serde_json::to_string_pretty(&backups)?),
        ListFormat::Summary => {
            if backups.is_empty() {
                println!("No backups found in {}", db.display());
                return Ok(());
            }
            let stats = index.stats().await?;
            println!(
                "{} backups, {} unique blocks, {} file objects",
                stats.backups, stats.blocks, stats.fsobjects
            );
            println!();
            for backup in &backups {
                println!(
                    "  {:>4}  {}  {}",
                    backup.id,
                    backup.created.format("%Y-%m-%d %H:%M:%S"),
                    backup.name
                );
                if !backup.description.is_empty() {
                    println!("        {}", backup.description);
                }
                if let Some(expires) = backup.expires {
                    println!("        expires {}", expires.format("%Y-%m-%d"));
                }
            }
        }
    }

    Ok(())
}
