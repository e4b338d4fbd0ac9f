//! Records kept in the metadata index

use crate::crypto::{BlockNonce, SecretKey};
use crate::hash::ContentHash;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};

/// A unique plaintext block, stored encrypted exactly once
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub id: i64,
    /// SHA-256 of the plaintext
    pub hash: ContentHash,
    /// Encryption of `hash`; names the block file on disk
    pub encrypted_name: Vec<u8>,
    pub secret: SecretKey,
    pub nonce: BlockNonce,
    /// Plaintext length in bytes
    pub size: u64,
}

/// A block about to be inserted into the index
#[derive(Debug, Clone)]
pub struct NewBlock {
    pub hash: ContentHash,
    pub encrypted_name: Vec<u8>,
    pub secret: SecretKey,
    pub nonce: BlockNonce,
    pub size: u64,
}

impl NewBlock {
    pub(crate) fn into_block(self, id: i64) -> Block {
        Block {
            id,
            hash: self.hash,
            encrypted_name: self.encrypted_name,
            secret: self.secret,
            nonce: self.nonce,
            size: self.size,
        }
    }
}

/// Outcome of an atomic insert-if-absent on the blocks table
#[derive(Debug, Clone)]
pub struct BlockClaim {
    pub block: Block,
    /// False when a row for the hash already existed
    pub created: bool,
}

/// A file, directory or symlink as captured from disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsEntry {
    pub name: String,
    /// Absolute path of the containing directory
    pub parent_path: PathBuf,
    pub is_directory: bool,
    /// Permission bits (Unix-style)
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub symlink_target: Option<PathBuf>,
    /// SHA-256 of the whole file; `None` for directories and symlinks
    pub content_hash: Option<ContentHash>,
}

impl FsEntry {
    /// Full original path of the entry
    pub fn path(&self) -> PathBuf {
        self.parent_path.join(&self.name)
    }

    pub fn is_symlink(&self) -> bool {
        self.symlink_target.is_some()
    }

    pub fn is_regular_file(&self) -> bool {
        !self.is_directory && !self.is_symlink()
    }

    /// Whether an indexed record can stand in for this freshly captured entry.
    ///
    /// Files match on content hash alone, directories on ownership and
    /// permissions, symlinks on their target.
    pub fn matches_indexed(&self, indexed: &FsEntry) -> bool {
        if self.is_directory != indexed.is_directory {
            return false;
        }
        if self.is_directory {
            return self.mode == indexed.mode && self.uid == indexed.uid && self.gid == indexed.gid;
        }
        if self.is_symlink() || indexed.is_symlink() {
            return self.symlink_target == indexed.symlink_target;
        }
        self.content_hash.is_some() && self.content_hash == indexed.content_hash
    }
}

/// An indexed filesystem object with its blocks resolved in file order
#[derive(Debug, Clone)]
pub struct FsObject {
    pub id: i64,
    pub entry: FsEntry,
    pub blocks: Vec<Block>,
}

impl FsObject {
    /// Plaintext size reconstructed from the block list
    pub fn size(&self) -> u64 {
        self.blocks.iter().map(|b| b.size).sum()
    }

    pub fn path(&self) -> PathBuf {
        self.entry.path()
    }
}

impl std::fmt::Display for FsObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {:o} {}:{}",
            self.path().display(),
            self.entry.mode,
            self.entry.uid,
            self.entry.gid
        )
    }
}

/// A named snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Backup {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub block_size: u64,
    pub created: DateTime<Utc>,
    /// `None` means the backup never expires
    pub expires: Option<DateTime<Utc>>,
}

/// A backup row about to be committed
#[derive(Debug, Clone)]
pub struct NewBackup {
    pub name: String,
    pub description: String,
    pub block_size: u64,
    pub created: DateTime<Utc>,
    pub expires: Option<DateTime<Utc>>,
}

impl NewBackup {
    pub(crate) fn into_backup(self, id: i64) -> Backup {
        Backup {
            id,
            name: self.name,
            description: self.description,
            block_size: self.block_size,
            created: self.created,
            expires: self.expires,
        }
    }
}

/// Join a recorded absolute path under a restore destination.
///
/// Root and prefix components are dropped; `..` is refused so index contents
/// can never point a restore outside `destination`.
pub fn path_under(destination: &Path, recorded: &Path) -> Option<PathBuf> {
    use std::path::Component;

    let mut target = destination.to_path_buf();
    for component in recorded.components() {
        match component {
            Component::Normal(part) => target.push(part),
            Component::RootDir | Component::Prefix(_) | Component::CurDir => {}
            Component::ParentDir => return None,
        }
    }
    Some(target)
}
