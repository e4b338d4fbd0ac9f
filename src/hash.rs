//! Content addressing with SHA-256

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

/// Digest length in bytes
pub const HASH_LEN: usize = 32;

/// A SHA-256 digest identifying a block or a whole file by its plaintext
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContentHash([u8; HASH_LEN]);

impl ContentHash {
    pub fn from_bytes(bytes: [u8; HASH_LEN]) -> Self {
        Self(bytes)
    }

    /// Rebuild a digest read back from storage
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        bytes.try_into().ok().map(Self)
    }

    /// Hash a byte slice
    pub fn of(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }

    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl std::fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ContentHash({})", self.to_hex())
    }
}

/// Running hash over a file's blocks, fed in read order
#[derive(Clone, Default)]
pub struct FileHasher {
    inner: Sha256,
    bytes: u64,
}

impl FileHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
        self.bytes += data.len() as u64;
    }

    /// Number of bytes hashed so far
    pub fn len(&self) -> u64 {
        self.bytes
    }

    pub fn is_empty(&self) -> bool {
        self.bytes == 0
    }

    pub fn finalize(self) -> ContentHash {
        ContentHash(self.inner.finalize().into())
    }
}

/// Compute the SHA-256 hash of a file in streaming fashion
pub async fn hash_file<P: AsRef<Path>>(file_path: P) -> Result<ContentHash> {
    let file_path = file_path.as_ref();
    let mut file = File::open(file_path)
        .await
        .map_err(|e| Error::io(file_path, e))?;

    let mut hasher = FileHasher::new();
    let mut buffer = vec![0u8; 64 * 1024];
    loop {
        let bytes_read = file
            .read(&mut buffer)
            .await
            .map_err(|e| Error::io(file_path, e))?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_content_hash_of_known_input() {
        let hash = ContentHash::of(b"hello world");

        // SHA-256 of "hello world"
        assert_eq!(
            hash.to_hex(),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_equal_content_equal_hash() {
        assert_eq!(ContentHash::of(b"block"), ContentHash::of(b"block"));
        assert_ne!(ContentHash::of(b"block"), ContentHash::of(b"block "));
    }

    #[test]
    fn test_running_hash_matches_whole_hash() {
        let data = b"the quick brown fox jumps over the lazy dog";
        let mut hasher = FileHasher::new();
        for chunk in data.chunks(7) {
            hasher.update(chunk);
        }
        assert_eq!(hasher.len(), data.len() as u64);
        assert_eq!(hasher.finalize(), ContentHash::of(data));
    }

    #[test]
    fn test_from_slice_rejects_wrong_length() {
        assert!(ContentHash::from_slice(&[0u8; 31]).is_none());
        let hash = ContentHash::of(b"x");
        assert_eq!(ContentHash::from_slice(hash.as_bytes()), Some(hash));
    }

    #[tokio::test]
    async fn test_hash_file_streams_contents() -> Result<()> {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("data.bin");
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &data).unwrap();

        assert_eq!(hash_file(&path).await?, ContentHash::of(&data));
        Ok(())
    }

    #[tokio::test]
    async fn test_hash_file_missing_reports_path() {
        let err = hash_file("/nonexistent/blockvault/file").await.unwrap_err();
        assert!(err.to_string().contains("/nonexistent/blockvault/file"));
    }
}
