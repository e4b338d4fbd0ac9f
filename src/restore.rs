//! Restore functionality for reconstructing files from backups

use crate::crypto;
use crate::hash::{hash_file, ContentHash};
use crate::index::MetadataIndex;
use crate::model::{path_under, Backup, Block, FsObject};
use crate::select::BackupSelector;
use crate::store::BlockStore;
use crate::{Error, Result};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument, warn};

/// Configuration for restore operations
#[derive(Debug, Clone)]
pub struct RestoreConfig {
    /// Directory holding encrypted block files
    pub block_path: PathBuf,
    /// How to handle conflicts when target files already exist
    pub conflict_policy: ConflictPolicy,
    /// Whether to verify file integrity after restore
    pub verify_integrity: bool,
    /// Whether to preserve file permissions
    pub preserve_permissions: bool,
    /// Whether to chown restored entries to their recorded owner
    pub restore_ownership: bool,
    /// Files restored concurrently
    pub workers: usize,
}

impl RestoreConfig {
    pub fn new<P: Into<PathBuf>>(block_path: P) -> Self {
        Self {
            block_path: block_path.into(),
            conflict_policy: ConflictPolicy::default(),
            verify_integrity: true,
            preserve_permissions: true,
            restore_ownership: false,
            workers: 4,
        }
    }
}

/// Policy for handling file conflicts during restore
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum ConflictPolicy {
    /// Overwrite existing files
    #[default]
    Overwrite,
    /// Skip files that already exist
    Skip,
    /// Rename the restored file with a numeric suffix
    Rename,
}

/// Result of a restore operation
#[derive(Debug)]
pub struct RestoreReport {
    /// Backup that was restored
    pub backup: Backup,
    /// Number of files successfully restored
    pub files_restored: usize,
    pub directories_created: usize,
    pub symlinks_restored: usize,
    /// Number of files skipped because the target existed
    pub files_skipped: usize,
    /// Total plaintext bytes written
    pub bytes_written: u64,
    /// Duration of the operation
    pub duration: Duration,
    /// Original path and error of every entry that could not be restored
    pub failures: Vec<(PathBuf, Error)>,
}

impl RestoreReport {
    fn new(backup: Backup) -> Self {
        Self {
            backup,
            files_restored: 0,
            directories_created: 0,
            symlinks_restored: 0,
            files_skipped: 0,
            bytes_written: 0,
            duration: Duration::default(),
            failures: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    fn fail(&mut self, object: &FsObject, error: Error) {
        warn!("Failed to restore {}: {}", object.path().display(), error);
        self.failures.push((object.path(), error));
    }
}

enum FileOutcome {
    Restored { bytes: u64 },
    Skipped,
}

/// Restore engine for reconstructing files from indexed blocks
pub struct RestoreEngine {
    index: Arc<dyn MetadataIndex>,
    store: BlockStore,
    config: RestoreConfig,
}

impl RestoreEngine {
    /// Create a new restore engine reading blocks from `config.block_path`
    pub async fn new(index: Arc<dyn MetadataIndex>, config: RestoreConfig) -> Result<Self> {
        if config.workers == 0 {
            return Err(Error::config("worker count must be greater than zero"));
        }
        let store = BlockStore::open(&config.block_path).await?;
        Ok(Self {
            index,
            store,
            config,
        })
    }

    /// Let `selector` choose among all indexed backups
    pub async fn resolve_backup(&self, selector: &mut dyn BackupSelector) -> Result<Backup> {
        let backups = self.index.list_backups().await?;
        if backups.is_empty() {
            return Err(Error::NoBackups);
        }
        selector.select_one(&backups)
    }

    /// Restore whichever backup `selector` picks
    pub async fn restore_with<P: AsRef<Path>>(
        &self,
        selector: &mut dyn BackupSelector,
        destination: P,
    ) -> Result<RestoreReport> {
        let backup = self.resolve_backup(selector).await?;
        self.restore_backup(backup.id, destination).await
    }

    /// Restore a backup beneath `destination`.
    ///
    /// Per-entry failures are collected in the report and do not stop the
    /// remaining entries. Only failures to read the index or to create the
    /// destination itself are returned as errors.
    #[instrument(skip_all, fields(backup_id = backup_id))]
    pub async fn restore_backup<P: AsRef<Path>>(
        &self,
        backup_id: i64,
        destination: P,
    ) -> Result<RestoreReport> {
        let start_time = Instant::now();
        let destination = destination.as_ref();

        let backup = self.index.get_backup_by_id(backup_id).await?;
        let objects = self.index.get_objects_for_backup(backup_id).await?;
        info!(
            "Restoring backup '{}' ({} objects) to {}",
            backup.name,
            objects.len(),
            destination.display()
        );

        tokio::fs::create_dir_all(destination)
            .await
            .map_err(|e| Error::io(destination, e))?;

        let mut report = RestoreReport::new(backup);
        let (directories, others): (Vec<FsObject>, Vec<FsObject>) =
            objects.into_iter().partition(|o| o.entry.is_directory);
        let (symlinks, files): (Vec<FsObject>, Vec<FsObject>) =
            others.into_iter().partition(|o| o.entry.is_symlink());

        let mut created_directories = Vec::new();
        for directory in &directories {
            match self.create_directory(directory, destination).await {
                Ok(target) => {
                    report.directories_created += 1;
                    created_directories.push((target, directory));
                }
                Err(e) => report.fail(directory, e),
            }
        }

        let outcomes: Vec<(&FsObject, Result<FileOutcome>)> = stream::iter(&files)
            .map(|file| async move { (file, self.restore_file(file, destination).await) })
            .buffer_unordered(self.config.workers)
            .collect()
            .await;
        for (file, outcome) in outcomes {
            match outcome {
                Ok(FileOutcome::Restored { bytes }) => {
                    report.files_restored += 1;
                    report.bytes_written += bytes;
                }
                Ok(FileOutcome::Skipped) => report.files_skipped += 1,
                Err(e) => report.fail(file, e),
            }
        }

        for link in &symlinks {
            match self.restore_symlink(link, destination).await {
                Ok(true) => report.symlinks_restored += 1,
                Ok(false) => report.files_skipped += 1,
                Err(e) => report.fail(link, e),
            }
        }

        // Deepest first, so a read-only parent never blocks its children.
        created_directories.sort_by_key(|(target, _)| std::cmp::Reverse(target.components().count()));
        for (target, directory) in created_directories {
            if let Err(e) = self.apply_metadata(directory, &target).await {
                report.fail(directory, e);
            }
        }

        report.duration = start_time.elapsed();
        info!(
            "Restore completed: {} files restored, {} skipped, {} failed in {:?}",
            report.files_restored,
            report.files_skipped,
            report.failures.len(),
            report.duration
        );

        Ok(report)
    }

    async fn create_directory(&self, directory: &FsObject, destination: &Path) -> Result<PathBuf> {
        let target = target_path(directory, destination)?;
        tokio::fs::create_dir_all(&target)
            .await
            .map_err(|e| Error::io(&target, e))?;
        debug!("Created directory {}", target.display());
        Ok(target)
    }

    /// Restore one regular file block by block
    async fn restore_file(&self, file: &FsObject, destination: &Path) -> Result<FileOutcome> {
        debug!("Restoring {}", file);
        let mut target = target_path(file, destination)?;

        if exists(&target).await? {
            match self.config.conflict_policy {
                ConflictPolicy::Skip => {
                    debug!("Skipping existing file {}", target.display());
                    return Ok(FileOutcome::Skipped);
                }
                // Replace the entry itself; a symlink here must not be
                // written through
                ConflictPolicy::Overwrite => tokio::fs::remove_file(&target)
                    .await
                    .map_err(|e| Error::io(&target, e))?,
                ConflictPolicy::Rename => target = generate_unique_path(&target).await?,
            }
        }

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::io(parent, e))?;
        }

        let output = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&target)
            .await
            .map_err(|e| Error::io(&target, e))?;

        let bytes = match self.write_blocks(file, output, &target).await {
            Ok(bytes) => bytes,
            Err(e) => {
                if let Err(cleanup) = tokio::fs::remove_file(&target).await {
                    if cleanup.kind() != io::ErrorKind::NotFound {
                        warn!("Failed to remove partial file {}: {}", target.display(), cleanup);
                    }
                }
                return Err(e);
            }
        };

        if self.config.verify_integrity {
            if let Some(expected) = &file.entry.content_hash {
                self.verify_file_integrity(&target, expected).await?;
            }
        }

        self.apply_metadata(file, &target).await?;
        debug!("Restored file: {} ({} bytes)", target.display(), bytes);
        Ok(FileOutcome::Restored { bytes })
    }

    async fn write_blocks(
        &self,
        file: &FsObject,
        mut output: tokio::fs::File,
        target: &Path,
    ) -> Result<u64> {
        let mut bytes = 0;
        for block in &file.blocks {
            let plaintext = self.load_block(block).await?;
            output
                .write_all(&plaintext)
                .await
                .map_err(|e| Error::io(target, e))?;
            bytes += plaintext.len() as u64;
        }

        output.flush().await.map_err(|e| Error::io(target, e))?;
        output.sync_all().await.map_err(|e| Error::io(target, e))?;
        Ok(bytes)
    }

    /// Fetch, decrypt and check one block
    async fn load_block(&self, block: &Block) -> Result<Vec<u8>> {
        let ciphertext = match self.store.load(&block.encrypted_name).await {
            Err(Error::BlockNotFound { name, .. }) => {
                return Err(Error::BlockNotFound {
                    name,
                    hash: block.hash.to_hex(),
                })
            }
            other => other?,
        };

        let plaintext = crypto::decrypt(&ciphertext, &block.secret, &block.nonce)
            .map_err(|e| Error::crypto(format!("decrypt block {}", block.hash), e))?;

        let actual = ContentHash::of(&plaintext);
        if actual != block.hash {
            return Err(Error::Integrity {
                entity: format!("block {}", block.id),
                expected: block.hash.to_hex(),
                actual: actual.to_hex(),
            });
        }
        Ok(plaintext)
    }

    async fn restore_symlink(&self, link: &FsObject, destination: &Path) -> Result<bool> {
        let mut target = target_path(link, destination)?;
        let Some(points_to) = &link.entry.symlink_target else {
            return Ok(false);
        };

        if exists(&target).await? {
            match self.config.conflict_policy {
                ConflictPolicy::Skip => return Ok(false),
                ConflictPolicy::Overwrite => tokio::fs::remove_file(&target)
                    .await
                    .map_err(|e| Error::io(&target, e))?,
                ConflictPolicy::Rename => target = generate_unique_path(&target).await?,
            }
        }

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::io(parent, e))?;
        }

        create_symlink(points_to, &target).await?;
        debug!("Restored symlink {} -> {}", target.display(), points_to.display());
        Ok(true)
    }

    /// Apply recorded permissions and, if configured, ownership
    async fn apply_metadata(&self, object: &FsObject, target: &Path) -> Result<()> {
        if self.config.preserve_permissions {
            set_mode(target, object.entry.mode).await?;
        }
        if self.config.restore_ownership {
            if let Err(e) = set_owner(target, object.entry.uid, object.entry.gid) {
                warn!("Failed to set owner of {}: {}", target.display(), e);
            }
        }
        Ok(())
    }

    /// Verify the integrity of a restored file
    pub async fn verify_file_integrity(&self, file_path: &Path, expected: &ContentHash) -> Result<()> {
        let actual = hash_file(file_path).await?;
        if actual != *expected {
            return Err(Error::Integrity {
                entity: file_path.display().to_string(),
                expected: expected.to_hex(),
                actual: actual.to_hex(),
            });
        }
        Ok(())
    }
}

fn target_path(object: &FsObject, destination: &Path) -> Result<PathBuf> {
    let recorded = object.path();
    path_under(destination, &recorded).ok_or(Error::UnsafePath { path: recorded })
}

async fn exists(path: &Path) -> Result<bool> {
    match tokio::fs::symlink_metadata(path).await {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(Error::io(path, e)),
    }
}

/// Generate a unique path by adding a numeric suffix
async fn generate_unique_path(original_path: &Path) -> Result<PathBuf> {
    let parent = original_path.parent().unwrap_or(Path::new("."));
    let stem = original_path
        .file_stem()
        .map(|s| s.to_string_lossy())
        .unwrap_or_default();
    let extension = original_path
        .extension()
        .map(|s| s.to_string_lossy())
        .unwrap_or_default();

    for i in 1..1000 {
        let new_name = if extension.is_empty() {
            format!("{}.{}", stem, i)
        } else {
            format!("{}.{}.{}", stem, i, extension)
        };

        let new_path = parent.join(new_name);
        if !exists(&new_path).await? {
            return Ok(new_path);
        }
    }

    Err(Error::io(
        original_path,
        io::Error::new(io::ErrorKind::AlreadyExists, "no free name for renamed copy"),
    ))
}

#[cfg(unix)]
async fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .await
        .map_err(|e| Error::io(path, e))
}

#[cfg(not(unix))]
async fn set_mode(path: &Path, mode: u32) -> Result<()> {
    let mut permissions = tokio::fs::metadata(path)
        .await
        .map_err(|e| Error::io(path, e))?
        .permissions();
    permissions.set_readonly(mode & 0o222 == 0);
    tokio::fs::set_permissions(path, permissions)
        .await
        .map_err(|e| Error::io(path, e))
}

#[cfg(unix)]
fn set_owner(path: &Path, uid: u32, gid: u32) -> io::Result<()> {
    std::os::unix::fs::lchown(path, Some(uid), Some(gid))
}

#[cfg(not(unix))]
fn set_owner(_path: &Path, _uid: u32, _gid: u32) -> io::Result<()> {
    Ok(())
}

#[cfg(unix)]
async fn create_symlink(points_to: &Path, link: &Path) -> Result<()> {
    tokio::fs::symlink(points_to, link)
        .await
        .map_err(|e| Error::io(link, e))
}

#[cfg(not(unix))]
async fn create_symlink(points_to: &Path, link: &Path) -> Result<()> {
    warn!(
        "Symbolic links are not restored on this platform: {} -> {}",
        link.display(),
        points_to.display()
    );
    Ok(())
}
