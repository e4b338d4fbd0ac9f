//! Backup orchestration: walk, chunk, deduplicate, encrypt, store, commit

use crate::chunk::{block_count, BlockReader, DEFAULT_BLOCK_SIZE};
use crate::crypto::{self, RunKeys, SecretKey};
use crate::hash::{ContentHash, FileHasher};
use crate::index::MetadataIndex;
use crate::model::{Backup, Block, FsEntry, NewBackup, NewBlock};
use crate::store::BlockStore;
use crate::{Error, Result};
use chrono::{DateTime, Duration, SubsecRound, Utc};
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::Serialize;
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard};
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

/// Configuration for backup operations
#[derive(Debug, Clone)]
pub struct BackupConfig {
    /// Plaintext bytes per block; the final block of a file may be shorter
    pub block_size: usize,
    /// Directory holding encrypted block files
    pub block_path: PathBuf,
    /// Nonce (and logged secret) for this run
    pub run_keys: RunKeys,
    /// Files processed concurrently
    pub workers: usize,
    /// Whether to follow symbolic links
    pub follow_symlinks: bool,
    /// Patterns to exclude from backup
    pub exclude_patterns: Vec<String>,
    /// Days until the backup expires; `None` keeps it forever
    pub retention_days: Option<u32>,
}

impl BackupConfig {
    pub fn new<P: Into<PathBuf>>(block_path: P, run_keys: RunKeys) -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            block_path: block_path.into(),
            run_keys,
            workers: 4,
            follow_symlinks: false,
            exclude_patterns: Vec::new(),
            retention_days: None,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            return Err(Error::config("block size must be greater than zero"));
        }
        if self.workers == 0 {
            return Err(Error::config("worker count must be greater than zero"));
        }
        if let Some(days) = self.retention_days {
            expiry_after(Utc::now(), days)?;
        }
        Ok(())
    }
}

/// When a backup created at `created` and kept for `days` expires
pub fn expiry_after(created: DateTime<Utc>, days: u32) -> Result<DateTime<Utc>> {
    Duration::try_days(i64::from(days))
        .and_then(|retention| created.checked_add_signed(retention))
        .ok_or_else(|| Error::config(format!("retention of {days} days is out of range")))
}

/// Outcome of a committed backup run
#[derive(Debug, Clone, Serialize)]
pub struct BackupSummary {
    pub backup: Backup,
    pub files: u64,
    pub directories: u64,
    pub symlinks: u64,
    pub blocks_written: u64,
    pub blocks_reused: u64,
    pub objects_created: u64,
    pub objects_reused: u64,
    /// Plaintext bytes read from the source
    pub bytes_read: u64,
    /// Ciphertext bytes written to the block store
    pub bytes_written: u64,
}

#[derive(Debug, Default)]
struct RunCounters {
    files: AtomicU64,
    directories: AtomicU64,
    symlinks: AtomicU64,
    blocks_written: AtomicU64,
    blocks_reused: AtomicU64,
    objects_created: AtomicU64,
    objects_reused: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
}

impl RunCounters {
    fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    fn into_summary(self, backup: Backup) -> BackupSummary {
        BackupSummary {
            backup,
            files: self.files.into_inner(),
            directories: self.directories.into_inner(),
            symlinks: self.symlinks.into_inner(),
            blocks_written: self.blocks_written.into_inner(),
            blocks_reused: self.blocks_reused.into_inner(),
            objects_created: self.objects_created.into_inner(),
            objects_reused: self.objects_reused.into_inner(),
            bytes_read: self.bytes_read.into_inner(),
            bytes_written: self.bytes_written.into_inner(),
        }
    }
}

const LOCK_STRIPES: usize = 256;

/// Serialises the find/encrypt/store/claim sequence for equal plaintext
/// hashes. Hashes are striped on their first byte, so the lock set stays the
/// same size however many blocks a run sees.
#[derive(Debug)]
struct HashLocks {
    stripes: Vec<AsyncMutex<()>>,
}

impl Default for HashLocks {
    fn default() -> Self {
        Self {
            stripes: (0..LOCK_STRIPES).map(|_| AsyncMutex::new(())).collect(),
        }
    }
}

impl HashLocks {
    async fn acquire(&self, hash: &ContentHash) -> MutexGuard<'_, ()> {
        self.stripes[usize::from(hash.as_bytes()[0])].lock().await
    }
}

#[derive(Debug, Default)]
struct RunState {
    locks: HashLocks,
    counters: RunCounters,
}

/// A filesystem entry discovered during the walk
#[derive(Debug)]
struct SourceEntry {
    path: PathBuf,
    entry: FsEntry,
}

/// Backup engine for creating deduplicated, encrypted backups
pub struct BackupEngine {
    index: Arc<dyn MetadataIndex>,
    store: BlockStore,
    config: BackupConfig,
}

impl BackupEngine {
    /// Create a new backup engine, opening the block store at
    /// `config.block_path`
    pub async fn new(index: Arc<dyn MetadataIndex>, config: BackupConfig) -> Result<Self> {
        config.validate()?;
        let store = BlockStore::open(&config.block_path).await?;
        Ok(Self {
            index,
            store,
            config,
        })
    }

    pub fn config(&self) -> &BackupConfig {
        &self.config
    }

    /// Back up `source` (a file or a directory tree) as a new named backup.
    ///
    /// Any read, crypto or index failure aborts the run before the backup row
    /// is written, so an interrupted run never leaves a partial backup behind.
    #[instrument(skip_all, fields(name = %name))]
    pub async fn create_backup<P: AsRef<Path>>(
        &self,
        source: P,
        name: &str,
        description: &str,
    ) -> Result<BackupSummary> {
        let source = source.as_ref();
        let source = tokio::fs::canonicalize(source)
            .await
            .map_err(|e| Error::io(source, e))?;

        if self.index.find_backup_by_name(name).await?.is_some() {
            return Err(Error::BackupNameExists {
                name: name.to_string(),
            });
        }

        info!("Starting backup of {} as '{}'", source.display(), name);

        let entries = self.enumerate(&source)?;
        debug!("Enumerated {} entries", entries.len());

        let state = RunState::default();
        let object_ids: Vec<i64> = stream::iter(entries)
            .map(|source_entry| self.capture(source_entry, &state))
            .buffer_unordered(self.config.workers)
            .try_collect()
            .await?;

        // The index keeps whole seconds
        let created = Utc::now().trunc_subsecs(0);
        let backup = NewBackup {
            name: name.to_string(),
            description: description.to_string(),
            block_size: self.config.block_size as u64,
            created,
            expires: self
                .config
                .retention_days
                .map(|days| expiry_after(created, days))
                .transpose()?,
        };
        let backup = self.index.commit_backup(backup, &object_ids).await?;

        let summary = state.counters.into_summary(backup);
        info!(
            "Backup completed: {} files, {} directories, {} blocks written, {} blocks reused, {} bytes stored",
            summary.files,
            summary.directories,
            summary.blocks_written,
            summary.blocks_reused,
            summary.bytes_written
        );

        Ok(summary)
    }

    /// Walk the source and describe every entry that should be recorded
    fn enumerate(&self, source: &Path) -> Result<Vec<SourceEntry>> {
        let walker = WalkDir::new(source)
            .follow_links(self.config.follow_symlinks)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| {
                let relative = entry.path().strip_prefix(source).unwrap_or(entry.path());
                let excluded = entry.depth() > 0 && self.should_exclude(relative);
                if excluded {
                    debug!("Excluding: {}", entry.path().display());
                }
                !excluded
            });

        let mut entries = Vec::new();
        for entry in walker {
            let entry = entry.map_err(|e| Error::Walk {
                path: e.path().unwrap_or(source).to_path_buf(),
                source: e,
            })?;
            let path = entry.path();
            let metadata = entry.metadata().map_err(|e| Error::Walk {
                path: path.to_path_buf(),
                source: e,
            })?;

            let file_type = entry.file_type();
            let symlink_target = if file_type.is_symlink() {
                Some(std::fs::read_link(path).map_err(|e| Error::io(path, e))?)
            } else if file_type.is_dir() || file_type.is_file() {
                None
            } else {
                warn!("Skipping special file: {}", path.display());
                continue;
            };

            entries.push(SourceEntry {
                path: path.to_path_buf(),
                entry: describe(path, &metadata, file_type.is_dir(), symlink_target),
            });
        }

        Ok(entries)
    }

    /// Record one entry, storing its blocks first when it is a regular file
    async fn capture(&self, source_entry: SourceEntry, state: &RunState) -> Result<i64> {
        let SourceEntry { path, mut entry } = source_entry;
        let counters = &state.counters;

        let blocks = if entry.is_directory {
            RunCounters::bump(&counters.directories, 1);
            Vec::new()
        } else if entry.is_symlink() {
            RunCounters::bump(&counters.symlinks, 1);
            Vec::new()
        } else {
            RunCounters::bump(&counters.files, 1);
            let (content_hash, blocks) = self.store_file(&path, state).await?;
            entry.content_hash = Some(content_hash);
            blocks
        };

        let existing = self
            .index
            .find_filesystem_objects(&entry.name, &entry.parent_path)
            .await?;
        if let Some(object) = existing.iter().find(|o| entry.matches_indexed(&o.entry)) {
            debug!("Reusing object {} for {}", object.id, path.display());
            RunCounters::bump(&counters.objects_reused, 1);
            return Ok(object.id);
        }

        let id = self.index.insert_filesystem_object(&entry, &blocks).await?;
        debug!("Indexed {} as object {}", path.display(), id);
        RunCounters::bump(&counters.objects_created, 1);
        Ok(id)
    }

    /// Read a file block by block, returning its whole-file hash and the
    /// ordered blocks that make it up
    async fn store_file(&self, path: &Path, state: &RunState) -> Result<(ContentHash, Vec<Block>)> {
        let file = tokio::fs::File::open(path)
            .await
            .map_err(|e| Error::io(path, e))?;
        let len = file
            .metadata()
            .await
            .map_err(|e| Error::io(path, e))?
            .len();
        let mut reader = BlockReader::new(file, self.config.block_size);
        let mut hasher = FileHasher::new();
        let mut blocks = Vec::with_capacity(block_count(len, self.config.block_size) as usize);

        while let Some(data) = reader.next_block().await.map_err(|e| Error::io(path, e))? {
            hasher.update(&data);
            RunCounters::bump(&state.counters.bytes_read, data.len() as u64);
            blocks.push(self.store_block(data, state).await?);
        }

        let bytes = hasher.len();
        let content_hash = hasher.finalize();
        debug!(
            "Hashed {} ({} bytes, {} blocks): {}",
            path.display(),
            bytes,
            blocks.len(),
            content_hash
        );
        Ok((content_hash, blocks))
    }

    /// Return the indexed block for this plaintext, encrypting and storing it
    /// first if no block with the same hash exists yet
    async fn store_block(&self, data: Vec<u8>, state: &RunState) -> Result<Block> {
        let hash = ContentHash::of(&data);
        let _guard = state.locks.acquire(&hash).await;

        if let Some(block) = self.index.find_block_by_hash(&hash).await? {
            RunCounters::bump(&state.counters.blocks_reused, 1);
            return Ok(block);
        }

        let secret = SecretKey::generate()
            .map_err(|e| Error::crypto(format!("generate secret for block {hash}"), e))?;
        let nonce = self.config.run_keys.nonce;
        let encrypted_name = crypto::encrypt(hash.as_bytes(), &secret, &nonce)
            .map_err(|e| Error::crypto(format!("encrypt name of block {hash}"), e))?;
        let ciphertext = crypto::encrypt(&data, &secret, &nonce)
            .map_err(|e| Error::crypto(format!("encrypt block {hash}"), e))?;

        let written = self.store.store(&encrypted_name, &ciphertext).await?;

        let new_block = NewBlock {
            hash,
            encrypted_name: encrypted_name.clone(),
            secret,
            nonce,
            size: data.len() as u64,
        };
        let claim = match self.index.get_or_create_block(new_block).await {
            Ok(claim) => claim,
            Err(e) => {
                if let Err(cleanup) = self.store.remove(&encrypted_name).await {
                    warn!("Failed to remove unindexed block {}: {}", hash, cleanup);
                }
                return Err(e);
            }
        };

        if claim.created {
            RunCounters::bump(&state.counters.blocks_written, 1);
            RunCounters::bump(&state.counters.bytes_written, written);
        } else {
            // Another process indexed this hash first; its file is the one
            // the index points at.
            debug!("Lost index race for block {}, discarding local copy", hash);
            self.store.remove(&encrypted_name).await?;
            RunCounters::bump(&state.counters.blocks_reused, 1);
        }

        Ok(claim.block)
    }

    /// Check if a path should be excluded based on patterns
    fn should_exclude<P: AsRef<Path>>(&self, path: P) -> bool {
        let path = path.as_ref();
        let path_str = path.to_string_lossy();
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy())
            .unwrap_or_default();

        self.config
            .exclude_patterns
            .iter()
            .any(|pattern| matches_pattern(&path_str, pattern) || matches_pattern(&file_name, pattern))
    }
}

/// Simple pattern matching (supports a single * wildcard)
fn matches_pattern(text: &str, pattern: &str) -> bool {
    if pattern == "*" {
        return true;
    }

    if let Some((prefix, suffix)) = pattern.split_once('*') {
        if !suffix.contains('*') {
            return text.len() >= prefix.len() + suffix.len()
                && text.starts_with(prefix)
                && text.ends_with(suffix);
        }
    }

    text == pattern || path_contains_segment(text, pattern)
}

/// Check if a path contains a specific segment
fn path_contains_segment(path: &str, segment: &str) -> bool {
    path.split(['/', '\\']).any(|part| part == segment)
}

/// Build the index record for a walked entry
fn describe(
    path: &Path,
    metadata: &Metadata,
    is_directory: bool,
    symlink_target: Option<PathBuf>,
) -> FsEntry {
    let name = match path.file_name() {
        Some(name) => match name.to_str() {
            Some(name) => name.to_string(),
            None => {
                warn!("Non UTF-8 name stored lossily: {}", path.display());
                name.to_string_lossy().into_owned()
            }
        },
        None => String::new(),
    };
    let parent_path = path.parent().unwrap_or(path).to_path_buf();
    let (mode, uid, gid) = ownership(metadata, is_directory);

    FsEntry {
        name,
        parent_path,
        is_directory,
        mode,
        uid,
        gid,
        symlink_target,
        content_hash: None,
    }
}

#[cfg(unix)]
fn ownership(metadata: &Metadata, _is_directory: bool) -> (u32, u32, u32) {
    use std::os::unix::fs::MetadataExt;
    (metadata.mode() & 0o7777, metadata.uid(), metadata.gid())
}

#[cfg(not(unix))]
fn ownership(metadata: &Metadata, is_directory: bool) -> (u32, u32, u32) {
    let mode = match (is_directory, metadata.permissions().readonly()) {
        (true, false) => 0o755,
        (true, true) => 0o555,
        (false, false) => 0o644,
        (false, true) => 0o444,
    };
    (mode, 0, 0)
}
