//! In-process metadata index
//!
//! Holds every table in memory behind a single mutex. Semantics match
//! [`SqliteIndex`](super::SqliteIndex), including uniqueness and foreign-key
//! checks, which makes it suitable for tests and dry runs.

use super::{IndexStats, MetadataIndex};
use crate::hash::ContentHash;
use crate::model::{Backup, Block, BlockClaim, FsEntry, FsObject, NewBackup, NewBlock};
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct Tables {
    blocks: Vec<Block>,
    blocks_by_hash: HashMap<ContentHash, usize>,
    objects: Vec<(FsEntry, Vec<i64>)>,
    backups: Vec<Backup>,
    memberships: BTreeSet<(i64, i64)>,
}

impl Tables {
    fn block(&self, id: i64) -> Option<&Block> {
        usize::try_from(id - 1).ok().and_then(|i| self.blocks.get(i))
    }

    fn object(&self, id: i64) -> Option<&(FsEntry, Vec<i64>)> {
        usize::try_from(id - 1).ok().and_then(|i| self.objects.get(i))
    }

    fn backup(&self, id: i64) -> Option<&Backup> {
        self.backups.iter().find(|b| b.id == id)
    }

    fn push_block(&mut self, block: NewBlock) -> Block {
        let id = self.blocks.len() as i64 + 1;
        let block = block.into_block(id);
        self.blocks_by_hash.insert(block.hash, self.blocks.len());
        self.blocks.push(block.clone());
        block
    }

    fn push_backup(&mut self, backup: NewBackup) -> Result<Backup> {
        if self.backups.iter().any(|b| b.name == backup.name) {
            return Err(Error::BackupNameExists { name: backup.name });
        }
        let id = self.backups.last().map_or(1, |b| b.id + 1);
        let backup = backup.into_backup(id);
        self.backups.push(backup.clone());
        Ok(backup)
    }

    fn check_object(&self, object_id: i64) -> Result<()> {
        match self.object(object_id) {
            Some(_) => Ok(()),
            None => Err(Error::MissingReference {
                table: "fsobjects",
                id: object_id,
            }),
        }
    }

    fn resolve(&self, id: i64) -> Result<FsObject> {
        let (entry, block_ids) = self.object(id).ok_or(Error::MissingReference {
            table: "fsobjects",
            id,
        })?;
        let blocks = block_ids
            .iter()
            .map(|block_id| {
                self.block(*block_id).cloned().ok_or(Error::MissingReference {
                    table: "blocks",
                    id: *block_id,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(FsObject {
            id,
            entry: entry.clone(),
            blocks,
        })
    }
}

/// Metadata index kept entirely in memory
#[derive(Debug, Default)]
pub struct MemoryIndex {
    tables: Mutex<Tables>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl MetadataIndex for MemoryIndex {
    async fn find_block_by_hash(&self, hash: &ContentHash) -> Result<Option<Block>> {
        let tables = self.tables();
        Ok(tables
            .blocks_by_hash
            .get(hash)
            .map(|i| tables.blocks[*i].clone()))
    }

    async fn insert_block(&self, block: NewBlock) -> Result<i64> {
        let mut tables = self.tables();
        if tables.blocks_by_hash.contains_key(&block.hash) {
            return Err(Error::DuplicateBlock {
                hash: block.hash.to_hex(),
            });
        }
        Ok(tables.push_block(block).id)
    }

    async fn get_or_create_block(&self, block: NewBlock) -> Result<BlockClaim> {
        let mut tables = self.tables();
        if let Some(i) = tables.blocks_by_hash.get(&block.hash) {
            return Ok(BlockClaim {
                block: tables.blocks[*i].clone(),
                created: false,
            });
        }
        Ok(BlockClaim {
            block: tables.push_block(block),
            created: true,
        })
    }

    async fn insert_filesystem_object(&self, entry: &FsEntry, blocks: &[Block]) -> Result<i64> {
        let mut tables = self.tables();
        for block in blocks {
            if tables.block(block.id).is_none() {
                return Err(Error::MissingReference {
                    table: "blocks",
                    id: block.id,
                });
            }
        }
        tables
            .objects
            .push((entry.clone(), blocks.iter().map(|b| b.id).collect()));
        Ok(tables.objects.len() as i64)
    }

    async fn find_filesystem_objects(
        &self,
        name: &str,
        parent_path: &Path,
    ) -> Result<Vec<FsObject>> {
        let tables = self.tables();
        let ids: Vec<i64> = tables
            .objects
            .iter()
            .enumerate()
            .filter(|(_, (entry, _))| entry.name == name && entry.parent_path == parent_path)
            .map(|(i, _)| i as i64 + 1)
            .collect();
        ids.into_iter().map(|id| tables.resolve(id)).collect()
    }

    async fn insert_backup(&self, backup: NewBackup) -> Result<i64> {
        Ok(self.tables().push_backup(backup)?.id)
    }

    async fn link_backup_object(&self, backup_id: i64, object_id: i64) -> Result<()> {
        let mut tables = self.tables();
        if tables.backup(backup_id).is_none() {
            return Err(Error::MissingReference {
                table: "backups",
                id: backup_id,
            });
        }
        tables.check_object(object_id)?;
        tables.memberships.insert((backup_id, object_id));
        Ok(())
    }

    async fn commit_backup(&self, backup: NewBackup, object_ids: &[i64]) -> Result<Backup> {
        let mut tables = self.tables();
        for object_id in object_ids {
            tables.check_object(*object_id)?;
        }
        let backup = tables.push_backup(backup)?;
        for object_id in object_ids {
            tables.memberships.insert((backup.id, *object_id));
        }
        Ok(backup)
    }

    async fn find_backup_by_name(&self, name: &str) -> Result<Option<Backup>> {
        Ok(self
            .tables()
            .backups
            .iter()
            .find(|b| b.name == name)
            .cloned())
    }

    async fn get_backup_by_id(&self, id: i64) -> Result<Backup> {
        self.tables()
            .backup(id)
            .cloned()
            .ok_or(Error::BackupNotFound { id })
    }

    async fn list_backups(&self) -> Result<Vec<Backup>> {
        let mut backups = self.tables().backups.clone();
        backups.sort_by(|a, b| b.created.cmp(&a.created).then(b.id.cmp(&a.id)));
        Ok(backups)
    }

    async fn get_objects_for_backup(&self, backup_id: i64) -> Result<Vec<FsObject>> {
        let tables = self.tables();
        if tables.backup(backup_id).is_none() {
            return Err(Error::BackupNotFound { id: backup_id });
        }

        let mut objects = tables
            .memberships
            .range((backup_id, i64::MIN)..=(backup_id, i64::MAX))
            .map(|(_, object_id)| tables.resolve(*object_id))
            .collect::<Result<Vec<_>>>()?;
        objects.sort_by(|a, b| {
            sort_key(&a.entry.parent_path, &a.entry.name)
                .cmp(&sort_key(&b.entry.parent_path, &b.entry.name))
        });
        Ok(objects)
    }

    async fn stats(&self) -> Result<IndexStats> {
        let tables = self.tables();
        Ok(IndexStats {
            blocks: tables.blocks.len() as u64,
            fsobjects: tables.objects.len() as u64,
            backups: tables.backups.len() as u64,
            memberships: tables.memberships.len() as u64,
        })
    }
}

fn sort_key<'a>(parent: &'a Path, name: &'a str) -> (std::borrow::Cow<'a, str>, &'a str) {
    (parent.to_string_lossy(), name)
}
