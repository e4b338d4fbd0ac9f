//! Content-addressed storage of encrypted blocks
//!
//! Blocks live at `<base>/<hex(name[0])>/<hex(name[1])>/<hex(name)>`, one file
//! per block, raw ciphertext with no header.

use crate::{Error, Result};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Durable block storage on a byte-sharded directory tree
#[derive(Debug, Clone)]
pub struct BlockStore {
    base_path: PathBuf,
}

impl BlockStore {
    /// Open a block store rooted at `base_path`, creating the root if needed
    pub async fn open<P: AsRef<Path>>(base_path: P) -> Result<Self> {
        let base_path = base_path.as_ref().to_path_buf();
        fs::create_dir_all(&base_path)
            .await
            .map_err(|e| Error::io(&base_path, e))?;
        Ok(Self { base_path })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Store a block's ciphertext under its encrypted name.
    ///
    /// Returns the number of bytes written; 0 when a file with that name
    /// already exists and the write was skipped.
    pub async fn store(&self, encrypted_name: &[u8], ciphertext: &[u8]) -> Result<u64> {
        let block_path = self.block_path(encrypted_name)?;

        if fs::try_exists(&block_path)
            .await
            .map_err(|e| Error::io(&block_path, e))?
        {
            debug!(block = %block_path.display(), "Block already stored, skipping write");
            return Ok(0);
        }

        let shard = block_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.base_path.clone());
        fs::create_dir_all(&shard)
            .await
            .map_err(|e| Error::io(&shard, e))?;

        // Write to a temporary sibling first so a torn write never occupies the final name
        let temp_path = shard.join(format!(
            ".{}.tmp-{:016x}",
            hex::encode(encrypted_name),
            rand::random::<u64>()
        ));
        if let Err(e) = write_synced(&temp_path, ciphertext).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e);
        }
        fs::rename(&temp_path, &block_path)
            .await
            .map_err(|e| Error::io(&block_path, e))?;

        debug!(
            block = %block_path.display(),
            bytes = ciphertext.len(),
            "Stored block"
        );
        Ok(ciphertext.len() as u64)
    }

    /// Load a block's ciphertext
    pub async fn load(&self, encrypted_name: &[u8]) -> Result<Vec<u8>> {
        let block_path = self.block_path(encrypted_name)?;
        match fs::read(&block_path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(Error::BlockNotFound {
                name: hex::encode(encrypted_name),
                hash: String::from("unknown"),
            }),
            Err(e) => Err(Error::io(&block_path, e)),
        }
    }

    /// Check if a block exists in the store
    pub async fn contains(&self, encrypted_name: &[u8]) -> Result<bool> {
        let block_path = self.block_path(encrypted_name)?;
        fs::try_exists(&block_path)
            .await
            .map_err(|e| Error::io(&block_path, e))
    }

    /// Remove a block from the store; absent blocks are not an error
    pub async fn remove(&self, encrypted_name: &[u8]) -> Result<()> {
        let block_path = self.block_path(encrypted_name)?;
        match fs::remove_file(&block_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::io(&block_path, e)),
        }
    }

    /// Get the file path for an encrypted block name
    pub fn block_path(&self, encrypted_name: &[u8]) -> Result<PathBuf> {
        if encrypted_name.len() < 2 {
            return Err(Error::InvalidBlockName {
                name: hex::encode(encrypted_name),
            });
        }
        Ok(self
            .base_path
            .join(hex::encode(&encrypted_name[0..1]))
            .join(hex::encode(&encrypted_name[1..2]))
            .join(hex::encode(encrypted_name)))
    }
}

async fn write_synced(path: &Path, data: &[u8]) -> Result<()> {
    let mut file = fs::File::create(path)
        .await
        .map_err(|e| Error::io(path, e))?;
    file.write_all(data).await.map_err(|e| Error::io(path, e))?;
    file.sync_all().await.map_err(|e| Error::io(path, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_store_and_load() -> Result<()> {
        let temp_dir = TempDir::new().unwrap();
        let store = BlockStore::open(temp_dir.path()).await?;

        let name = [0xab, 0xcd, 0x01, 0x02];
        let written = store.store(&name, b"ciphertext bytes").await?;

        assert_eq!(written, 16);
        assert!(store.contains(&name).await?);
        assert_eq!(store.load(&name).await?, b"ciphertext bytes");
        Ok(())
    }

    #[tokio::test]
    async fn test_sharded_layout() -> Result<()> {
        let temp_dir = TempDir::new().unwrap();
        let store = BlockStore::open(temp_dir.path()).await?;

        let name = [0x0f, 0xa0, 0x33];
        store.store(&name, b"x").await?;

        let expected = temp_dir.path().join("0f").join("a0").join("0fa033");
        assert!(expected.is_file());
        assert_eq!(store.block_path(&name)?, expected);
        Ok(())
    }

    #[tokio::test]
    async fn test_second_store_is_skipped() -> Result<()> {
        let temp_dir = TempDir::new().unwrap();
        let store = BlockStore::open(temp_dir.path()).await?;

        let name = [1, 2, 3, 4];
        store.store(&name, b"original").await?;
        let path = store.block_path(&name)?;
        let modified = std::fs::metadata(&path).unwrap().modified().unwrap();

        assert_eq!(store.store(&name, b"original").await?, 0);
        assert_eq!(std::fs::read(&path).unwrap(), b"original");
        assert_eq!(std::fs::metadata(&path).unwrap().modified().unwrap(), modified);
        Ok(())
    }

    #[tokio::test]
    async fn test_no_temp_files_left_behind() -> Result<()> {
        let temp_dir = TempDir::new().unwrap();
        let store = BlockStore::open(temp_dir.path()).await?;

        let name = [9, 8, 7];
        store.store(&name, b"data").await?;

        let shard = store.block_path(&name)?.parent().unwrap().to_path_buf();
        let entries: Vec<_> = std::fs::read_dir(shard).unwrap().collect();
        assert_eq!(entries.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_load_missing_block() -> Result<()> {
        let temp_dir = TempDir::new().unwrap();
        let store = BlockStore::open(temp_dir.path()).await?;

        let result = store.load(&[0xde, 0xad, 0xbe, 0xef]).await;
        assert!(matches!(result, Err(Error::BlockNotFound { ref name, .. }) if name == "deadbeef"));
        Ok(())
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() -> Result<()> {
        let temp_dir = TempDir::new().unwrap();
        let store = BlockStore::open(temp_dir.path()).await?;

        let name = [5, 6, 7];
        store.store(&name, b"data").await?;
        store.remove(&name).await?;
        store.remove(&name).await?;
        assert!(!store.contains(&name).await?);
        Ok(())
    }

    #[test]
    fn test_short_names_are_rejected() {
        let store = BlockStore {
            base_path: PathBuf::from("/blocks"),
        };
        assert!(matches!(
            store.block_path(&[1]),
            Err(Error::InvalidBlockName { ref name }) if name == "01"
        ));
    }
}
