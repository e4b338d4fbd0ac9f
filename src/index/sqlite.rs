//! SQLite metadata index
//!
//! ## Database Schema
//!
//! - `blocks`: one row per distinct plaintext hash, with its key material
//! - `fsobjects`: files, directories and symlinks as captured by a backup
//! - `fileblocks`: ordered join encoding each file's block sequence
//! - `backups`: named snapshots, unique on `name`
//! - `backupobjects`: many-to-many join between backups and objects

use super::{IndexStats, MetadataIndex};
use crate::crypto::{BlockNonce, SecretKey};
use crate::hash::ContentHash;
use crate::model::{Backup, Block, BlockClaim, FsEntry, FsObject, NewBackup, NewBlock};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

const SCHEMA: &[(&str, &str)] = &[
    (
        "blocks",
        r#"
        CREATE TABLE IF NOT EXISTS blocks (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            hash BLOB NOT NULL UNIQUE,
            encrypted_name BLOB NOT NULL,
            size INTEGER NOT NULL,
            secret BLOB NOT NULL,
            nonce BLOB NOT NULL
        )
        "#,
    ),
    (
        "fsobjects",
        r#"
        CREATE TABLE IF NOT EXISTS fsobjects (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            path TEXT NOT NULL,
            is_directory INTEGER NOT NULL,
            mode INTEGER NOT NULL,
            uid INTEGER NOT NULL,
            gid INTEGER NOT NULL,
            target TEXT,
            content_hash BLOB
        )
        "#,
    ),
    (
        "fileblocks",
        r#"
        CREATE TABLE IF NOT EXISTS fileblocks (
            order_number INTEGER NOT NULL,
            fsobject_id INTEGER NOT NULL,
            block_id INTEGER NOT NULL,
            PRIMARY KEY (fsobject_id, order_number),
            FOREIGN KEY (fsobject_id) REFERENCES fsobjects(id),
            FOREIGN KEY (block_id) REFERENCES blocks(id)
        )
        "#,
    ),
    (
        "backups",
        r#"
        CREATE TABLE IF NOT EXISTS backups (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            description TEXT NOT NULL,
            block_size INTEGER NOT NULL,
            created INTEGER NOT NULL,
            expires INTEGER
        )
        "#,
    ),
    (
        "backupobjects",
        r#"
        CREATE TABLE IF NOT EXISTS backupobjects (
            backup_id INTEGER NOT NULL,
            fsobject_id INTEGER NOT NULL,
            PRIMARY KEY (backup_id, fsobject_id),
            FOREIGN KEY (backup_id) REFERENCES backups(id),
            FOREIGN KEY (fsobject_id) REFERENCES fsobjects(id)
        )
        "#,
    ),
    (
        "idx_fsobjects_name_path",
        "CREATE INDEX IF NOT EXISTS idx_fsobjects_name_path ON fsobjects(name, path)",
    ),
    (
        "idx_backups_created",
        "CREATE INDEX IF NOT EXISTS idx_backups_created ON backups(created)",
    ),
];

const BLOCK_COLUMNS: &str = "b.id, b.hash, b.encrypted_name, b.size, b.secret, b.nonce";
const OBJECT_COLUMNS: &str =
    "f.id, f.name, f.path, f.is_directory, f.mode, f.uid, f.gid, f.target, f.content_hash";
const BACKUP_COLUMNS: &str = "id, name, description, block_size, created, expires";

/// Metadata index backed by a SQLite database file
#[derive(Debug, Clone)]
pub struct SqliteIndex {
    pool: SqlitePool,
}

impl SqliteIndex {
    /// Open (creating if needed) the index database at `path`
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::io(parent, e))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        // A single connection serialises writers within this process; other
        // processes are arbitrated by SQLite's own locking.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| Error::index(format!("open {}", path.display()), e))?;

        let index = Self { pool };
        index.init_schema().await?;
        info!(path = %path.display(), "Metadata index ready");
        Ok(index)
    }

    /// Close the underlying connection pool
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn init_schema(&self) -> Result<()> {
        for (name, statement) in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| Error::index(format!("create {name}"), e))?;
        }
        Ok(())
    }

    async fn load_blocks<'e, E>(executor: E, object_id: i64) -> Result<Vec<Block>>
    where
        E: sqlx::Executor<'e, Database = Sqlite>,
    {
        let rows = sqlx::query(&format!(
            "SELECT {BLOCK_COLUMNS} FROM fileblocks fb \
             JOIN blocks b ON b.id = fb.block_id \
             WHERE fb.fsobject_id = ? ORDER BY fb.order_number"
        ))
        .bind(object_id)
        .fetch_all(executor)
        .await
        .map_err(|e| Error::index(format!("load blocks of object {object_id}"), e))?;

        rows.iter().map(block_from_row).collect()
    }

    async fn resolve_objects(&self, rows: Vec<SqliteRow>) -> Result<Vec<FsObject>> {
        let mut objects = Vec::with_capacity(rows.len());
        for row in &rows {
            let (id, entry) = entry_from_row(row)?;
            let blocks = Self::load_blocks(&self.pool, id).await?;
            objects.push(FsObject { id, entry, blocks });
        }
        Ok(objects)
    }

    async fn insert_backup_in(tx: &mut Transaction<'_, Sqlite>, backup: &NewBackup) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO backups (name, description, block_size, created, expires) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&backup.name)
        .bind(&backup.description)
        .bind(backup.block_size as i64)
        .bind(backup.created.timestamp())
        .bind(backup.expires.map(|e| e.timestamp()))
        .execute(&mut **tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                Error::BackupNameExists {
                    name: backup.name.clone(),
                }
            } else {
                Error::index(format!("insert backup {}", backup.name), e)
            }
        })?;
        Ok(result.last_insert_rowid())
    }

    async fn link_in(
        tx: &mut Transaction<'_, Sqlite>,
        backup_id: i64,
        object_id: i64,
    ) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO backupobjects (backup_id, fsobject_id) VALUES (?, ?)")
            .bind(backup_id)
            .bind(object_id)
            .execute(&mut **tx)
            .await
            .map_err(|e| {
                Error::index(format!("link object {object_id} to backup {backup_id}"), e)
            })?;
        Ok(())
    }

    async fn begin(&self, context: &str) -> Result<Transaction<'static, Sqlite>> {
        self.pool
            .begin()
            .await
            .map_err(|e| Error::index(format!("begin {context}"), e))
    }
}

#[async_trait]
impl MetadataIndex for SqliteIndex {
    async fn find_block_by_hash(&self, hash: &ContentHash) -> Result<Option<Block>> {
        let row = sqlx::query(&format!("SELECT {BLOCK_COLUMNS} FROM blocks b WHERE b.hash = ?"))
            .bind(hash.as_bytes().as_slice())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Error::index(format!("find block {hash}"), e))?;

        row.as_ref().map(block_from_row).transpose()
    }

    async fn insert_block(&self, block: NewBlock) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO blocks (hash, encrypted_name, size, secret, nonce) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(block.hash.as_bytes().as_slice())
        .bind(block.encrypted_name.as_slice())
        .bind(block.size as i64)
        .bind(block.secret.as_bytes().as_slice())
        .bind(block.nonce.as_bytes().as_slice())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                Error::DuplicateBlock {
                    hash: block.hash.to_hex(),
                }
            } else {
                Error::index(format!("insert block {}", block.hash), e)
            }
        })?;
        Ok(result.last_insert_rowid())
    }

    async fn get_or_create_block(&self, block: NewBlock) -> Result<BlockClaim> {
        let context = format!("claim block {}", block.hash);
        let mut tx = self.begin(&context).await?;

        let inserted = sqlx::query(
            "INSERT INTO blocks (hash, encrypted_name, size, secret, nonce) VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(hash) DO NOTHING",
        )
        .bind(block.hash.as_bytes().as_slice())
        .bind(block.encrypted_name.as_slice())
        .bind(block.size as i64)
        .bind(block.secret.as_bytes().as_slice())
        .bind(block.nonce.as_bytes().as_slice())
        .execute(&mut *tx)
        .await
        .map_err(|e| Error::index(&context, e))?;

        let row = sqlx::query(&format!("SELECT {BLOCK_COLUMNS} FROM blocks b WHERE b.hash = ?"))
            .bind(block.hash.as_bytes().as_slice())
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| Error::index(&context, e))?;

        tx.commit().await.map_err(|e| Error::index(&context, e))?;

        let created = inserted.rows_affected() == 1;
        debug!(hash = %block.hash, created, "Block claimed");
        Ok(BlockClaim {
            block: block_from_row(&row)?,
            created,
        })
    }

    async fn insert_filesystem_object(&self, entry: &FsEntry, blocks: &[Block]) -> Result<i64> {
        let context = format!("insert object {}", entry.path().display());
        let mut tx = self.begin(&context).await?;

        let result = sqlx::query(
            "INSERT INTO fsobjects (name, path, is_directory, mode, uid, gid, target, content_hash) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&entry.name)
        .bind(entry.parent_path.to_string_lossy().into_owned())
        .bind(entry.is_directory)
        .bind(i64::from(entry.mode))
        .bind(i64::from(entry.uid))
        .bind(i64::from(entry.gid))
        .bind(
            entry
                .symlink_target
                .as_ref()
                .map(|t| t.to_string_lossy().into_owned()),
        )
        .bind(entry.content_hash.map(|h| h.as_bytes().to_vec()))
        .execute(&mut *tx)
        .await
        .map_err(|e| Error::index(&context, e))?;
        let object_id = result.last_insert_rowid();

        for (order_number, block) in blocks.iter().enumerate() {
            sqlx::query(
                "INSERT INTO fileblocks (order_number, fsobject_id, block_id) VALUES (?, ?, ?)",
            )
            .bind(order_number as i64)
            .bind(object_id)
            .bind(block.id)
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::index(format!("{context}: block #{order_number}"), e))?;
        }

        tx.commit().await.map_err(|e| Error::index(&context, e))?;
        Ok(object_id)
    }

    async fn find_filesystem_objects(
        &self,
        name: &str,
        parent_path: &Path,
    ) -> Result<Vec<FsObject>> {
        let rows = sqlx::query(&format!(
            "SELECT {OBJECT_COLUMNS} FROM fsobjects f WHERE f.name = ? AND f.path = ? ORDER BY f.id"
        ))
        .bind(name)
        .bind(parent_path.to_string_lossy().into_owned())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            Error::index(
                format!("find objects {}", parent_path.join(name).display()),
                e,
            )
        })?;

        self.resolve_objects(rows).await
    }

    async fn insert_backup(&self, backup: NewBackup) -> Result<i64> {
        let context = format!("insert backup {}", backup.name);
        let mut tx = self.begin(&context).await?;
        let id = Self::insert_backup_in(&mut tx, &backup).await?;
        tx.commit().await.map_err(|e| Error::index(&context, e))?;
        Ok(id)
    }

    async fn link_backup_object(&self, backup_id: i64, object_id: i64) -> Result<()> {
        let context = format!("link object {object_id} to backup {backup_id}");
        let mut tx = self.begin(&context).await?;
        Self::link_in(&mut tx, backup_id, object_id).await?;
        tx.commit().await.map_err(|e| Error::index(&context, e))?;
        Ok(())
    }

    async fn commit_backup(&self, backup: NewBackup, object_ids: &[i64]) -> Result<Backup> {
        let context = format!("commit backup {}", backup.name);
        let mut tx = self.begin(&context).await?;

        let backup_id = Self::insert_backup_in(&mut tx, &backup).await?;
        for object_id in object_ids {
            Self::link_in(&mut tx, backup_id, *object_id).await?;
        }

        tx.commit().await.map_err(|e| Error::index(&context, e))?;
        debug!(
            backup = %backup.name,
            objects = object_ids.len(),
            "Backup committed"
        );
        Ok(backup.into_backup(backup_id))
    }

    async fn find_backup_by_name(&self, name: &str) -> Result<Option<Backup>> {
        let row = sqlx::query(&format!("SELECT {BACKUP_COLUMNS} FROM backups WHERE name = ?"))
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Error::index(format!("find backup {name}"), e))?;

        row.as_ref().map(backup_from_row).transpose()
    }

    async fn get_backup_by_id(&self, id: i64) -> Result<Backup> {
        let row = sqlx::query(&format!("SELECT {BACKUP_COLUMNS} FROM backups WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Error::index(format!("get backup {id}"), e))?;

        match row {
            Some(row) => backup_from_row(&row),
            None => Err(Error::BackupNotFound { id }),
        }
    }

    async fn list_backups(&self) -> Result<Vec<Backup>> {
        let rows = sqlx::query(&format!(
            "SELECT {BACKUP_COLUMNS} FROM backups ORDER BY created DESC, id DESC"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::index("list backups", e))?;

        rows.iter().map(backup_from_row).collect()
    }

    async fn get_objects_for_backup(&self, backup_id: i64) -> Result<Vec<FsObject>> {
        self.get_backup_by_id(backup_id).await?;

        let rows = sqlx::query(&format!(
            "SELECT {OBJECT_COLUMNS} FROM backupobjects bo \
             JOIN fsobjects f ON f.id = bo.fsobject_id \
             WHERE bo.backup_id = ? ORDER BY f.path, f.name"
        ))
        .bind(backup_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::index(format!("objects of backup {backup_id}"), e))?;

        self.resolve_objects(rows).await
    }

    async fn stats(&self) -> Result<IndexStats> {
        let mut counts = [0u64; 4];
        for (slot, table) in ["blocks", "fsobjects", "backups", "backupobjects"]
            .iter()
            .enumerate()
        {
            let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
                .fetch_one(&self.pool)
                .await
                .map_err(|e| Error::index(format!("count {table}"), e))?;
            counts[slot] = count as u64;
        }

        Ok(IndexStats {
            blocks: counts[0],
            fsobjects: counts[1],
            backups: counts[2],
            memberships: counts[3],
        })
    }
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(error, sqlx::Error::Database(db) if db.is_unique_violation())
}

fn column<'r, T>(row: &'r SqliteRow, table: &'static str, name: &str) -> Result<T>
where
    T: sqlx::Decode<'r, Sqlite> + sqlx::Type<Sqlite>,
{
    row.try_get(name)
        .map_err(|e| Error::index(format!("decode {table}.{name}"), e))
}

fn block_from_row(row: &SqliteRow) -> Result<Block> {
    let id: i64 = column(row, "blocks", "id")?;
    let corrupt = |reason: String| Error::CorruptRecord {
        table: "blocks",
        id,
        reason,
    };

    let hash: Vec<u8> = column(row, "blocks", "hash")?;
    let secret: Vec<u8> = column(row, "blocks", "secret")?;
    let nonce: Vec<u8> = column(row, "blocks", "nonce")?;
    let size: i64 = column(row, "blocks", "size")?;

    Ok(Block {
        id,
        hash: ContentHash::from_slice(&hash)
            .ok_or_else(|| corrupt(format!("hash has {} bytes", hash.len())))?,
        encrypted_name: column(row, "blocks", "encrypted_name")?,
        secret: SecretKey::from_slice(&secret).map_err(|e| corrupt(e.to_string()))?,
        nonce: BlockNonce::from_slice(&nonce).map_err(|e| corrupt(e.to_string()))?,
        size: u64::try_from(size).map_err(|_| corrupt(format!("negative size {size}")))?,
    })
}

fn entry_from_row(row: &SqliteRow) -> Result<(i64, FsEntry)> {
    let id: i64 = column(row, "fsobjects", "id")?;
    let corrupt = |reason: String| Error::CorruptRecord {
        table: "fsobjects",
        id,
        reason,
    };
    let small = |name: &str, value: i64| {
        u32::try_from(value).map_err(|_| corrupt(format!("{name} {value} out of range")))
    };

    let path: String = column(row, "fsobjects", "path")?;
    let target: Option<String> = column(row, "fsobjects", "target")?;
    let content_hash: Option<Vec<u8>> = column(row, "fsobjects", "content_hash")?;
    let content_hash = match content_hash {
        Some(bytes) => Some(
            ContentHash::from_slice(&bytes)
                .ok_or_else(|| corrupt(format!("content hash has {} bytes", bytes.len())))?,
        ),
        None => None,
    };

    let entry = FsEntry {
        name: column(row, "fsobjects", "name")?,
        parent_path: PathBuf::from(path),
        is_directory: column(row, "fsobjects", "is_directory")?,
        mode: small("mode", column(row, "fsobjects", "mode")?)?,
        uid: small("uid", column(row, "fsobjects", "uid")?)?,
        gid: small("gid", column(row, "fsobjects", "gid")?)?,
        symlink_target: target.map(PathBuf::from),
        content_hash,
    };
    Ok((id, entry))
}

fn backup_from_row(row: &SqliteRow) -> Result<Backup> {
    let id: i64 = column(row, "backups", "id")?;
    let timestamp = |secs: i64| {
        DateTime::<Utc>::from_timestamp(secs, 0).ok_or_else(|| Error::CorruptRecord {
            table: "backups",
            id,
            reason: format!("timestamp {secs} out of range"),
        })
    };

    let block_size: i64 = column(row, "backups", "block_size")?;
    let expires: Option<i64> = column(row, "backups", "expires")?;

    Ok(Backup {
        id,
        name: column(row, "backups", "name")?,
        description: column(row, "backups", "description")?,
        block_size: block_size.max(0) as u64,
        created: timestamp(column(row, "backups", "created")?)?,
        expires: expires.map(timestamp).transpose()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::testing;
    use tempfile::TempDir;

    async fn open_index() -> (TempDir, SqliteIndex) {
        let temp_dir = TempDir::new().unwrap();
        let index = SqliteIndex::open(temp_dir.path().join("index.db"))
            .await
            .unwrap();
        (temp_dir, index)
    }

    #[tokio::test]
    async fn test_get_or_create_is_idempotent() {
        let (_dir, index) = open_index().await;
        testing::get_or_create_is_idempotent(&index).await;
    }

    #[tokio::test]
    async fn test_insert_block_rejects_duplicates() {
        let (_dir, index) = open_index().await;
        testing::insert_block_rejects_duplicates(&index).await;
    }

    #[tokio::test]
    async fn test_objects_keep_block_order() {
        let (_dir, index) = open_index().await;
        testing::objects_keep_block_order(&index).await;
    }

    #[tokio::test]
    async fn test_backups_roundtrip() {
        let (_dir, index) = open_index().await;
        testing::backups_roundtrip(&index).await;
    }

    #[tokio::test]
    async fn test_backup_names_are_unique() {
        let (_dir, index) = open_index().await;
        testing::backup_names_are_unique(&index).await;
    }

    #[tokio::test]
    async fn test_link_is_idempotent() {
        let (_dir, index) = open_index().await;
        testing::link_is_idempotent(&index).await;
    }

    #[tokio::test]
    async fn test_missing_backup_is_not_found() {
        let (_dir, index) = open_index().await;
        testing::missing_backup_is_not_found(&index).await;
    }

    #[tokio::test]
    async fn test_reopen_preserves_rows() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("index.db");

        let index = SqliteIndex::open(&path).await.unwrap();
        index
            .get_or_create_block(testing::new_block(b"persisted"))
            .await
            .unwrap();
        index.close().await;

        let reopened = SqliteIndex::open(&path).await.unwrap();
        assert!(reopened
            .find_block_by_hash(&ContentHash::of(b"persisted"))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_foreign_keys_are_enforced() {
        let (_dir, index) = open_index().await;
        let backup = index.insert_backup(testing::new_backup("fk", 1)).await.unwrap();

        let result = index.link_backup_object(backup, 999).await;
        assert!(matches!(result, Err(Error::Index { .. })));
    }
}
