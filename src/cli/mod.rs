//! Command-line interface for blockvault.
//!
//! Flags override values from the settings file; the settings file overrides
//! built-in defaults.

use crate::config::LogFormat;
use crate::index::{MetadataIndex, SqliteIndex};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub mod backup;
pub mod list;
pub mod restore;

/// blockvault - deduplicating, encrypting backups
#[derive(Parser)]
#[command(name = "blockvault")]
#[command(about = "Deduplicating, encrypting block-level backups")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Settings file (default: ./blockvault.toml, then ~/.blockvault/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Log output format
    #[arg(long, global = true, value_enum)]
    pub log_format: Option<LogFormat>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Back up a file or directory tree
    Backup(backup::BackupArgs),
    /// Restore a backup into a destination directory
    Restore(restore::RestoreArgs),
    /// List known backups, newest first
    List(list::ListArgs),
}

async fn open_index(path: &Path) -> crate::Result<Arc<dyn MetadataIndex>> {
    Ok(Arc::new(SqliteIndex::open(path).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::restore::ConflictPolicy;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_backup_flags() {
        let cli = Cli::parse_from([
            "blockvault",
            "backup",
            "-b",
            "1024",
            "-p",
            "/srv/blocks",
            "--name",
            "nightly",
            "-d",
            "/srv/index.db",
            "/home",
        ]);
        let Commands::Backup(args) = cli.command else {
            panic!("expected backup command");
        };
        assert_eq!(args.block_size, Some(1024));
        assert_eq!(args.block_path, Some(PathBuf::from("/srv/blocks")));
        assert_eq!(args.name, "nightly");
        assert_eq!(args.source, PathBuf::from("/home"));
        assert!(args.secret.is_none());
    }

    #[test]
    fn test_restore_flags() {
        let cli = Cli::parse_from([
            "blockvault",
            "-v",
            "restore",
            "-i",
            "7",
            "--conflict",
            "rename",
            "--no-verify",
            "/tmp/out",
        ]);
        assert!(cli.verbose);
        let Commands::Restore(args) = cli.command else {
            panic!("expected restore command");
        };
        assert_eq!(args.id, Some(7));
        assert_eq!(args.conflict, ConflictPolicy::Rename);
        assert!(args.no_verify);
        assert_eq!(args.destination, PathBuf::from("/tmp/out"));
    }
}
