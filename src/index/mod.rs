//! Metadata index: the relational record of blocks, filesystem objects,
//! backups and their memberships.
//!
//! The index is the only authority on whether a block has been stored. The
//! orchestrators talk to it exclusively through [`MetadataIndex`], so backends
//! can be swapped without touching backup or restore logic.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryIndex;
pub use sqlite::SqliteIndex;

use crate::hash::ContentHash;
use crate::model::{Backup, Block, BlockClaim, FsEntry, FsObject, NewBackup, NewBlock};
use crate::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::path::Path;

/// Row counts per table
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IndexStats {
    pub blocks: u64,
    pub fsobjects: u64,
    pub backups: u64,
    pub memberships: u64,
}

/// Capability set every index backend provides.
#[async_trait]
pub trait MetadataIndex: Send + Sync {
    /// Look up a block by its plaintext hash.
    async fn find_block_by_hash(&self, hash: &ContentHash) -> Result<Option<Block>>;

    /// Insert a block row. Fails with `Error::DuplicateBlock` if the hash is
    /// already indexed.
    async fn insert_block(&self, block: NewBlock) -> Result<i64>;

    /// Atomically insert the block if its hash is absent, otherwise return the
    /// existing row untouched.
    async fn get_or_create_block(&self, block: NewBlock) -> Result<BlockClaim>;

    /// Insert a filesystem object together with its ordered block list.
    async fn insert_filesystem_object(&self, entry: &FsEntry, blocks: &[Block]) -> Result<i64>;

    /// All recorded objects with this name in this parent directory.
    async fn find_filesystem_objects(&self, name: &str, parent_path: &Path)
        -> Result<Vec<FsObject>>;

    /// Insert a backup row. Fails with `Error::BackupNameExists` on a name clash.
    async fn insert_backup(&self, backup: NewBackup) -> Result<i64>;

    /// Add a filesystem object to a backup. Linking twice is a no-op.
    async fn link_backup_object(&self, backup_id: i64, object_id: i64) -> Result<()>;

    /// Insert a backup and all of its membership links as one unit.
    async fn commit_backup(&self, backup: NewBackup, object_ids: &[i64]) -> Result<Backup>;

    async fn find_backup_by_name(&self, name: &str) -> Result<Option<Backup>>;

    /// Fails with `Error::BackupNotFound` if no such backup exists.
    async fn get_backup_by_id(&self, id: i64) -> Result<Backup>;

    /// All backups, newest first.
    async fn list_backups(&self) -> Result<Vec<Backup>>;

    /// Objects belonging to a backup, each with its blocks in file order.
    async fn get_objects_for_backup(&self, backup_id: i64) -> Result<Vec<FsObject>>;

    async fn stats(&self) -> Result<IndexStats>;
}

#[cfg(test)]
pub(crate) mod testing {
    //! Shared conformance checks run against every backend.

    use super::*;
    use crate::crypto::{BlockNonce, SecretKey};
    use crate::Error;
    use chrono::{TimeZone, Utc};
    use std::path::PathBuf;

    pub fn new_block(content: &[u8]) -> NewBlock {
        NewBlock {
            hash: ContentHash::of(content),
            encrypted_name: ContentHash::of(&[content, b"name"].concat()).as_bytes().to_vec(),
            secret: SecretKey::generate().unwrap(),
            nonce: BlockNonce::from_bytes([4; 12]),
            size: content.len() as u64,
        }
    }

    pub fn file_entry(name: &str, content: &[u8]) -> FsEntry {
        FsEntry {
            name: name.to_string(),
            parent_path: PathBuf::from("/srv/data"),
            is_directory: false,
            mode: 0o644,
            uid: 1000,
            gid: 100,
            symlink_target: None,
            content_hash: Some(ContentHash::of(content)),
        }
    }

    pub fn new_backup(name: &str, created_secs: i64) -> NewBackup {
        NewBackup {
            name: name.to_string(),
            description: format!("{name} description"),
            block_size: 4096,
            created: Utc.timestamp_opt(created_secs, 0).unwrap(),
            expires: None,
        }
    }

    pub async fn get_or_create_is_idempotent(index: &dyn MetadataIndex) {
        let first = index.get_or_create_block(new_block(b"alpha")).await.unwrap();
        assert!(first.created);

        let second = index.get_or_create_block(new_block(b"alpha")).await.unwrap();
        assert!(!second.created);
        assert_eq!(second.block, first.block);

        let found = index
            .find_block_by_hash(&ContentHash::of(b"alpha"))
            .await
            .unwrap();
        assert_eq!(found, Some(first.block));
        assert_eq!(index.stats().await.unwrap().blocks, 1);
    }

    pub async fn insert_block_rejects_duplicates(index: &dyn MetadataIndex) {
        index.insert_block(new_block(b"beta")).await.unwrap();
        let err = index.insert_block(new_block(b"beta")).await.unwrap_err();
        assert!(matches!(err, Error::DuplicateBlock { .. }));
    }

    pub async fn objects_keep_block_order(index: &dyn MetadataIndex) {
        let a = index.get_or_create_block(new_block(b"a")).await.unwrap().block;
        let b = index.get_or_create_block(new_block(b"b")).await.unwrap().block;
        let blocks = vec![b.clone(), a.clone(), b.clone()];

        let entry = file_entry("report.txt", b"bab");
        let id = index.insert_filesystem_object(&entry, &blocks).await.unwrap();

        let found = index
            .find_filesystem_objects("report.txt", Path::new("/srv/data"))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, id);
        assert_eq!(found[0].entry, entry);
        assert_eq!(found[0].blocks, blocks);

        let none = index
            .find_filesystem_objects("report.txt", Path::new("/elsewhere"))
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    pub async fn backups_roundtrip(index: &dyn MetadataIndex) {
        let block = index.get_or_create_block(new_block(b"x")).await.unwrap().block;
        let file = index
            .insert_filesystem_object(&file_entry("x.bin", b"x"), &[block])
            .await
            .unwrap();
        let dir = FsEntry {
            name: "data".to_string(),
            parent_path: PathBuf::from("/srv"),
            is_directory: true,
            mode: 0o755,
            symlink_target: None,
            content_hash: None,
            ..file_entry("data", b"")
        };
        let dir = index.insert_filesystem_object(&dir, &[]).await.unwrap();

        let older = index.commit_backup(new_backup("older", 100), &[file]).await.unwrap();
        let newer = index
            .commit_backup(new_backup("newer", 200), &[file, dir])
            .await
            .unwrap();

        let listed = index.list_backups().await.unwrap();
        assert_eq!(listed, vec![newer.clone(), older.clone()]);
        assert_eq!(index.get_backup_by_id(older.id).await.unwrap(), older);
        assert_eq!(
            index.find_backup_by_name("newer").await.unwrap(),
            Some(newer.clone())
        );
        assert_eq!(index.find_backup_by_name("missing").await.unwrap(), None);

        let objects = index.get_objects_for_backup(newer.id).await.unwrap();
        assert_eq!(objects.len(), 2);
        let file_object = objects.iter().find(|o| o.id == file).unwrap();
        assert_eq!(file_object.blocks.len(), 1);
        assert_eq!(file_object.size(), 1);

        let stats = index.stats().await.unwrap();
        assert_eq!(stats.backups, 2);
        assert_eq!(stats.memberships, 3);
    }

    pub async fn backup_names_are_unique(index: &dyn MetadataIndex) {
        index.insert_backup(new_backup("nightly", 1)).await.unwrap();
        let err = index.insert_backup(new_backup("nightly", 2)).await.unwrap_err();
        assert!(matches!(err, Error::BackupNameExists { ref name } if name == "nightly"));

        let err = index.commit_backup(new_backup("nightly", 3), &[]).await.unwrap_err();
        assert!(matches!(err, Error::BackupNameExists { .. }));
        assert_eq!(index.list_backups().await.unwrap().len(), 1);
    }

    pub async fn link_is_idempotent(index: &dyn MetadataIndex) {
        let backup = index.insert_backup(new_backup("links", 1)).await.unwrap();
        let object = index
            .insert_filesystem_object(&file_entry("empty", b""), &[])
            .await
            .unwrap();

        index.link_backup_object(backup, object).await.unwrap();
        index.link_backup_object(backup, object).await.unwrap();
        assert_eq!(index.get_objects_for_backup(backup).await.unwrap().len(), 1);
    }

    pub async fn missing_backup_is_not_found(index: &dyn MetadataIndex) {
        assert!(matches!(
            index.get_backup_by_id(42).await,
            Err(Error::BackupNotFound { id: 42 })
        ));
        assert!(matches!(
            index.get_objects_for_backup(42).await,
            Err(Error::BackupNotFound { id: 42 })
        ));
    }
}
