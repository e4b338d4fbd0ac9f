//! Restore command implementation.

use crate::config::Settings;
use crate::restore::{ConflictPolicy, RestoreConfig, RestoreEngine};
use crate::select::{FixedSelection, TerminalSelector};
use anyhow::{bail, Result};
use clap::Args;
use std::path::PathBuf;

/// Arguments for the restore command
#[derive(Args, Debug)]
pub struct RestoreArgs {
    /// Directory to restore into
    pub destination: PathBuf,

    /// Backup id; prompts for a choice when omitted
    #[arg(short = 'i', long)]
    pub id: Option<i64>,

    /// Directory holding encrypted blocks
    #[arg(short = 'p', long)]
    pub block_path: Option<PathBuf>,

    /// Metadata index database
    #[arg(short = 'd', long)]
    pub db: Option<PathBuf>,

    /// What to do when a target file already exists
    #[arg(long, value_enum, default_value_t = ConflictPolicy::Overwrite)]
    pub conflict: ConflictPolicy,

    /// Skip re-hashing restored files
    #[arg(long)]
    pub no_verify: bool,

    /// Restore recorded owner and group (usually needs root)
    #[arg(long)]
    pub restore_ownership: bool,

    /// Files restored concurrently
    #[arg(long)]
    pub workers: Option<usize>,
}

/// Run the restore command
pub async fn run(args: RestoreArgs, settings: &Settings) -> Result<()> {
    let block_path = args.block_path.unwrap_or_else(|| settings.block_path.clone());
    let mut config = RestoreConfig::new(block_path);
    config.conflict_policy = args.conflict;
    config.verify_integrity = !args.no_verify;
    config.restore_ownership = args.restore_ownership;
    config.workers = args.workers.unwrap_or(settings.workers);

    let db = args.db.unwrap_or_else(|| settings.database.clone());
    let index = super::open_index(&db).await?;
    let engine = RestoreEngine::new(index, config).await?;

    let backup = match args.id {
        Some(id) => engine.resolve_backup(&mut FixedSelection(id)).await?,
        None => engine.resolve_backup(&mut TerminalSelector::stdio()).await?,
    };

    println!(
        "Restoring backup '{}' to {}",
        backup.name,
        args.destination.display()
    );
    let report = engine.restore_backup(backup.id, &args.destination).await?;

    println!("Restore finished in {:.1?}", report.duration);
    println!("  Files restored: {}", report.files_restored);
    println!("  Directories: {}", report.directories_created);
    println!("  Symlinks: {}", report.symlinks_restored);
    println!("  Skipped: {}", report.files_skipped);
    println!("  Bytes written: {}", report.bytes_written);

    if !report.is_success() {
        eprintln!("Failed entries:");
        for (path, error) in &report.failures {
            eprintln!("  {}: {}", path.display(), error);
        }
        bail!("{} entries failed to restore", report.failures.len());
    }

    Ok(())
}
