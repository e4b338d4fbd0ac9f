//! # Block Encryption
//!
//! ChaCha20-Poly1305 (IETF variant: 256-bit key, 96-bit nonce) over whole
//! blocks, with no associated data.
//!
//! Every block gets its own random [`SecretKey`]. The [`BlockNonce`] is shared
//! by all blocks written during one backup run, so no two blocks ever share a
//! (key, nonce) pair. Within a block the pair encrypts both the block's hash
//! (its stored name) and its data. Anything that starts deriving or reusing
//! keys across blocks must also stop sharing the nonce.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use rand::{rngs::OsRng, RngCore};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Key length in bytes.
pub const KEY_LEN: usize = 32;

/// Nonce length in bytes.
pub const NONCE_LEN: usize = 12;

/// Poly1305 tag appended to every ciphertext.
pub const TAG_LEN: usize = 16;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid key length: expected {KEY_LEN} bytes, got {0}")]
    InvalidKeyLength(usize),

    #[error("invalid nonce length: expected {NONCE_LEN} bytes, got {0}")]
    InvalidNonceLength(usize),

    #[error("invalid base64 encoding: {0}")]
    Encoding(String),

    #[error("encryption failed")]
    Encryption,

    #[error("authentication failed: ciphertext was modified or the key/nonce is wrong")]
    Authentication,

    #[error("entropy source failure: {0}")]
    Entropy(String),
}

/// Per-block symmetric key (256-bit).
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SecretKey([u8; KEY_LEN]);

impl SecretKey {
    /// Create from bytes.
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Create from a slice, checking the length.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let array: [u8; KEY_LEN] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyLength(bytes.len()))?;
        Ok(Self(array))
    }

    /// Generate a random key from the OS entropy source.
    pub fn generate() -> Result<Self, CryptoError> {
        let mut bytes = [0u8; KEY_LEN];
        fill_random(&mut bytes)?;
        Ok(Self(bytes))
    }

    /// Decode from standard base64.
    pub fn from_base64(encoded: &str) -> Result<Self, CryptoError> {
        let mut decoded = STANDARD
            .decode(encoded.trim())
            .map_err(|e| CryptoError::Encoding(e.to_string()))?;
        let key = Self::from_slice(&decoded);
        decoded.zeroize();
        key
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }

    /// Get inner bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretKey(<redacted>)")
    }
}

/// 96-bit nonce.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BlockNonce([u8; NONCE_LEN]);

impl BlockNonce {
    /// Create from bytes.
    pub fn from_bytes(bytes: [u8; NONCE_LEN]) -> Self {
        Self(bytes)
    }

    /// Create from a slice, checking the length.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let array: [u8; NONCE_LEN] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidNonceLength(bytes.len()))?;
        Ok(Self(array))
    }

    /// Generate a random nonce from the OS entropy source.
    pub fn generate() -> Result<Self, CryptoError> {
        let mut bytes = [0u8; NONCE_LEN];
        fill_random(&mut bytes)?;
        Ok(Self(bytes))
    }

    /// Decode from standard base64.
    pub fn from_base64(encoded: &str) -> Result<Self, CryptoError> {
        let decoded = STANDARD
            .decode(encoded.trim())
            .map_err(|e| CryptoError::Encoding(e.to_string()))?;
        Self::from_slice(&decoded)
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }

    /// Get inner bytes.
    pub fn as_bytes(&self) -> &[u8; NONCE_LEN] {
        &self.0
    }
}

/// Run-level key material for one backup invocation.
///
/// The nonce is applied to every block of the run. The secret is never used to
/// encrypt anything: each block carries its own key in the index. It is kept so
/// operators can record the pair that was logged for the run.
#[derive(Clone, Debug)]
pub struct RunKeys {
    pub secret: SecretKey,
    pub nonce: BlockNonce,
}

impl RunKeys {
    /// Generate fresh run keys.
    pub fn generate() -> Result<Self, CryptoError> {
        Ok(Self {
            secret: SecretKey::generate()?,
            nonce: BlockNonce::generate()?,
        })
    }

    /// Build run keys from optional base64 values, generating whatever is
    /// missing. The returned flags report which values were generated.
    pub fn resolve(
        secret: Option<&str>,
        nonce: Option<&str>,
    ) -> Result<(Self, bool, bool), CryptoError> {
        let (secret, secret_generated) = match secret {
            Some(encoded) => (SecretKey::from_base64(encoded)?, false),
            None => (SecretKey::generate()?, true),
        };
        let (nonce, nonce_generated) = match nonce {
            Some(encoded) => (BlockNonce::from_base64(encoded)?, false),
            None => (BlockNonce::generate()?, true),
        };
        Ok((Self { secret, nonce }, secret_generated, nonce_generated))
    }
}

fn fill_random(bytes: &mut [u8]) -> Result<(), CryptoError> {
    OsRng
        .try_fill_bytes(bytes)
        .map_err(|e| CryptoError::Entropy(e.to_string()))
}

/// Encrypt plaintext. The ciphertext is `plaintext.len() + TAG_LEN` bytes.
///
/// # Errors
///
/// Returns `CryptoError::Encryption` if the cipher rejects the input.
pub fn encrypt(
    plaintext: &[u8],
    key: &SecretKey,
    nonce: &BlockNonce,
) -> Result<Vec<u8>, CryptoError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    cipher
        .encrypt(Nonce::from_slice(nonce.as_bytes()), plaintext)
        .map_err(|_| CryptoError::Encryption)
}

/// Decrypt and authenticate ciphertext.
///
/// # Errors
///
/// Returns `CryptoError::Authentication` if the tag does not verify.
pub fn decrypt(
    ciphertext: &[u8],
    key: &SecretKey,
    nonce: &BlockNonce,
) -> Result<Vec<u8>, CryptoError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    cipher
        .decrypt(Nonce::from_slice(nonce.as_bytes()), ciphertext)
        .map_err(|_| CryptoError::Authentication)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let key = SecretKey::generate().unwrap();
        let nonce = BlockNonce::generate().unwrap();
        let plaintexts: [&[u8]; 3] = [b"", b"a", &[0x5a; 4096]];

        for plaintext in plaintexts {
            let ciphertext = encrypt(plaintext, &key, &nonce).unwrap();
            assert_eq!(ciphertext.len(), plaintext.len() + TAG_LEN);
            assert_eq!(decrypt(&ciphertext, &key, &nonce).unwrap(), plaintext);
        }
    }

    #[test]
    fn test_wrong_key_fails() {
        let key1 = SecretKey::generate().unwrap();
        let key2 = SecretKey::generate().unwrap();
        let nonce = BlockNonce::generate().unwrap();

        let ciphertext = encrypt(b"Secret message", &key1, &nonce).unwrap();
        assert_eq!(
            decrypt(&ciphertext, &key2, &nonce),
            Err(CryptoError::Authentication)
        );
    }

    #[test]
    fn test_wrong_nonce_fails() {
        let key = SecretKey::generate().unwrap();
        let nonce = BlockNonce::from_bytes([1; NONCE_LEN]);
        let other = BlockNonce::from_bytes([2; NONCE_LEN]);

        let ciphertext = encrypt(b"Secret message", &key, &nonce).unwrap();
        assert!(decrypt(&ciphertext, &key, &other).is_err());
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let key = SecretKey::generate().unwrap();
        let nonce = BlockNonce::generate().unwrap();

        let mut ciphertext = encrypt(b"Secret message", &key, &nonce).unwrap();
        ciphertext[0] ^= 0xFF;

        assert_eq!(
            decrypt(&ciphertext, &key, &nonce),
            Err(CryptoError::Authentication)
        );
    }

    #[test]
    fn test_encryption_is_deterministic_for_key_and_nonce() {
        let key = SecretKey::from_bytes([7; KEY_LEN]);
        let nonce = BlockNonce::from_bytes([9; NONCE_LEN]);

        let a = encrypt(b"same hash bytes", &key, &nonce).unwrap();
        let b = encrypt(b"same hash bytes", &key, &nonce).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_slice_length_checks() {
        assert_eq!(
            SecretKey::from_slice(&[0; 16]),
            Err(CryptoError::InvalidKeyLength(16))
        );
        assert_eq!(
            BlockNonce::from_slice(&[0; 24]),
            Err(CryptoError::InvalidNonceLength(24))
        );
    }

    #[test]
    fn test_base64_roundtrip_and_validation() {
        let key = SecretKey::generate().unwrap();
        assert_eq!(SecretKey::from_base64(&key.to_base64()).unwrap(), key);

        let nonce = BlockNonce::generate().unwrap();
        assert_eq!(BlockNonce::from_base64(&nonce.to_base64()).unwrap(), nonce);

        assert!(matches!(
            SecretKey::from_base64("not base64!"),
            Err(CryptoError::Encoding(_))
        ));
        assert_eq!(
            BlockNonce::from_base64("AAAA"),
            Err(CryptoError::InvalidNonceLength(3))
        );
    }

    #[test]
    fn test_run_keys_resolve() {
        let nonce = BlockNonce::from_bytes([3; NONCE_LEN]);
        let (keys, secret_generated, nonce_generated) =
            RunKeys::resolve(None, Some(&nonce.to_base64())).unwrap();

        assert!(secret_generated);
        assert!(!nonce_generated);
        assert_eq!(keys.nonce, nonce);
    }

    #[test]
    fn test_secret_debug_is_redacted() {
        let key = SecretKey::from_bytes([0xAB; KEY_LEN]);
        assert_eq!(format!("{:?}", key), "SecretKey(<redacted>)");
    }
}
