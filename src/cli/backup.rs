//! Backup command implementation.

use crate::backup::{BackupConfig, BackupEngine};
use crate::config::Settings;
use crate::crypto::RunKeys;
use anyhow::{Context, Result};
use clap::Args;
use std::path::PathBuf;
use tracing::info;

/// Arguments for the backup command
#[derive(Args, Debug)]
pub struct BackupArgs {
    /// File or directory to back up
    pub source: PathBuf,

    /// Block size in bytes
    #[arg(short = 'b', long)]
    pub block_size: Option<usize>,

    /// Directory holding encrypted blocks
    #[arg(short = 'p', long)]
    pub block_path: Option<PathBuf>,

    /// Unique name for this backup
    #[arg(long)]
    pub name: String,

    /// Free-form description
    #[arg(long, default_value = "")]
    pub description: String,

    /// Run secret (base64, 32 bytes); generated when omitted
    #[arg(short = 's', long)]
    pub secret: Option<String>,

    /// Run nonce (base64, 12 bytes); generated when omitted
    #[arg(short = 'n', long)]
    pub nonce: Option<String>,

    /// Metadata index database
    #[arg(short = 'd', long)]
    pub db: Option<PathBuf>,

    /// Files processed concurrently
    #[arg(long)]
    pub workers: Option<usize>,

    /// Mark the backup as expiring after this many days
    #[arg(long)]
    pub expires_in_days: Option<u32>,

    /// Follow symbolic links instead of recording them
    #[arg(long)]
    pub follow_symlinks: bool,

    /// Additional exclude pattern (repeatable)
    #[arg(long)]
    pub exclude: Vec<String>,
}

/// Run the backup command
pub async fn run(args: BackupArgs, settings: &Settings) -> Result<()> {
    let (run_keys, secret_generated, nonce_generated) =
        RunKeys::resolve(args.secret.as_deref(), args.nonce.as_deref())
            .context("Invalid --secret/--nonce")?;
    if secret_generated {
        info!(secret = %run_keys.secret.to_base64(), "Generated run secret; record it with this backup");
    }
    if nonce_generated {
        info!(nonce = %run_keys.nonce.to_base64(), "Generated run nonce; record it with this backup");
    }

    let generated = (secret_generated || nonce_generated).then(|| {
        (
            run_keys.secret.to_base64(),
            run_keys.nonce.to_base64(),
        )
    });

    let block_path = args.block_path.unwrap_or_else(|| settings.block_path.clone());
    let mut config = BackupConfig::new(block_path, run_keys);
    config.block_size = args.block_size.unwrap_or(settings.block_size);
    config.workers = args.workers.unwrap_or(settings.workers);
    config.follow_symlinks = args.follow_symlinks;
    config.exclude_patterns = settings.exclude_patterns.clone();
    config.exclude_patterns.extend(args.exclude);
    config.retention_days = args.expires_in_days.or(settings.retention_days);

    let db = args.db.unwrap_or_else(|| settings.database.clone());
    let index = super::open_index(&db).await?;
    let engine = BackupEngine::new(index, config).await?;

    info!("Starting backup: {} -> {}", args.source.display(), db.display());
    let summary = engine
        .create_backup(&args.source, &args.name, &args.description)
        .await?;

    println!("Backup completed successfully!");
    println!("  Backup ID: {}", summary.backup.id);
    println!("  Name: {}", summary.backup.name);
    println!(
        "  Entries: {} files, {} directories, {} symlinks",
        summary.files, summary.directories, summary.symlinks
    );
    println!(
        "  Blocks: {} written, {} reused",
        summary.blocks_written, summary.blocks_reused
    );
    println!(
        "  Objects: {} new, {} unchanged",
        summary.objects_created, summary.objects_reused
    );
    println!("  Read: {} bytes", summary.bytes_read);
    println!("  Stored: {} bytes", summary.bytes_written);
    if let Some(expires) = summary.backup.expires {
        println!("  Expires: {}", expires.format("%Y-%m-%d %H:%M:%S UTC"));
    }

    if let Some((secret, nonce)) = generated {
        println!("  Run secret: {}", secret);
        println!("  Run nonce: {}", nonce);
    }

    Ok(())
}
