//! # blockvault
//!
//! Deduplicating, encrypting block-level backups with a relational metadata index.
//!
//! ## Features
//!
//! - **Backup Engine**: Fixed-size chunking with SHA-256 content addressing
//! - **Deduplication**: Each distinct block is encrypted and stored exactly once
//! - **Encryption**: ChaCha20-Poly1305 with a fresh key for every block
//! - **Metadata Index**: SQLite (or in-memory) record of blocks, files and backups
//! - **Restore System**: Per-file recovery with integrity verification
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use blockvault::backup::{BackupConfig, BackupEngine};
//! use blockvault::crypto::RunKeys;
//! use blockvault::index::SqliteIndex;
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> anyhow::Result<()> {
//! let index = Arc::new(SqliteIndex::open("backup.db").await?);
//! let config = BackupConfig::new("./blocks", RunKeys::generate()?);
//! let engine = BackupEngine::new(index, config).await?;
//!
//! let summary = engine.create_backup("./my-data", "initial", "first run").await?;
//! println!("Backup {} stored {} new blocks", summary.backup.id, summary.blocks_written);
//! # Ok(())
//! # }
//! ```

pub mod backup;
pub mod chunk;
pub mod cli;
pub mod config;
pub mod crypto;
pub mod error;
pub mod hash;
pub mod index;
pub mod logging;
pub mod model;
pub mod restore;
pub mod select;
pub mod store;

// Re-export commonly used types
pub use backup::{BackupConfig, BackupEngine, BackupSummary};
pub use error::{Error, Result};
pub use index::{MemoryIndex, MetadataIndex, SqliteIndex};
pub use restore::{ConflictPolicy, RestoreConfig, RestoreEngine, RestoreReport};
pub use select::{BackupSelector, FixedSelection, TerminalSelector};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
