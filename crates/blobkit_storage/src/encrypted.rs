//! Transparent per-value encryption wrapper.
//!
//! [`EncryptedStore`] decorates any [`Store`] with AES-256-GCM encryption at
//! rest.
//!
//! ## Value format
//!
//! ```text
//! | magic (7) | algorithm (1) | boundary (8) | nonce (12) | ciphertext || tag (16) |
//! ```
//!
//! - The 16-byte header identifies encrypted values. A value whose first 16
//!   bytes don't carry the magic and boundary is returned unmodified, so
//!   legacy plaintext values stay readable after encryption is turned on.
//! - Every value gets a fresh random nonce.
//! - Keys are never encrypted. Don't put confidential data in keys.
//! - Whole values are buffered in memory in both directions; this wrapper
//!   is not meant for very large single blobs.

use crate::context::Context;
use crate::error::{StorageError, StorageResult};
use crate::store::{BlobReader, BlobWriter, KeyIter, ListOptions, Store};
use aes_gcm::{
    aead::{generic_array::GenericArray, Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use std::io::{self, Cursor, Read, Write};
use std::sync::Arc;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size of AES-256 key in bytes.
pub const KEY_SIZE: usize = 32;
/// Size of GCM nonce in bytes.
pub const NONCE_SIZE: usize = 12;
/// Size of GCM authentication tag in bytes.
pub const TAG_SIZE: usize = 16;
/// Size of the header prepended to every encrypted value.
pub const HEADER_SIZE: usize = 16;

/// Magic constant opening every encrypted value.
pub const MAGIC: [u8; 7] = *b"BLOBKIT";
/// Boundary marker closing the header.
pub const BOUNDARY: [u8; 8] = [0x00, 0xE7, 0x1F, 0xC5, 0x9A, 0x00, 0x3D, 0xB2];

/// Algorithms an encrypted value can name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Algorithm {
    /// AES-256-GCM with a random 96-bit nonce stored before the ciphertext.
    Aes256GcmRandomNonce = 0x01,
}

impl Algorithm {
    /// Parses the header's algorithm byte.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::UnknownAlgorithm`] for any other byte.
    pub fn from_byte(byte: u8) -> StorageResult<Self> {
        match byte {
            0x01 => Ok(Self::Aes256GcmRandomNonce),
            other => Err(StorageError::UnknownAlgorithm(other)),
        }
    }
}

/// Encryption key for [`EncryptedStore`].
///
/// The key is zeroized when dropped. Share one key between stores through
/// an [`Arc`] rather than cloning it.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey {
    bytes: [u8; KEY_SIZE],
}

impl EncryptionKey {
    /// Generates a new random key.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Creates a key from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes slice is not exactly 32 bytes.
    pub fn from_bytes(bytes: &[u8]) -> StorageResult<Self> {
        if bytes.len() != KEY_SIZE {
            return Err(StorageError::encryption(format!(
                "invalid key size: expected {KEY_SIZE}, got {}",
                bytes.len()
            )));
        }
        let mut key_bytes = [0u8; KEY_SIZE];
        key_bytes.copy_from_slice(bytes);
        Ok(Self { bytes: key_bytes })
    }

    /// Derives a key from a passphrase using HKDF-SHA256.
    ///
    /// HKDF is appropriate when the passphrase already has high entropy.
    ///
    /// # Errors
    ///
    /// Returns an error if key expansion fails.
    pub fn derive_from_password(password: &[u8], salt: &[u8]) -> StorageResult<Self> {
        use hkdf::Hkdf;
        use sha2::Sha256;

        let hk = Hkdf::<Sha256>::new(Some(salt), password);
        let mut bytes = [0u8; KEY_SIZE];
        hk.expand(b"blobkit-value-key-v1", &mut bytes)
            .map_err(|_| StorageError::encryption("HKDF expand failed"))?;
        Ok(Self { bytes })
    }

    /// Returns the key as a byte slice.
    ///
    /// Don't log or serialize the result.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Returns the header for values encrypted with `algorithm`.
#[must_use]
pub fn header(algorithm: Algorithm) -> [u8; HEADER_SIZE] {
    let mut header = [0u8; HEADER_SIZE];
    header[..7].copy_from_slice(&MAGIC);
    header[7] = algorithm as u8;
    header[8..].copy_from_slice(&BOUNDARY);
    header
}

/// Returns the algorithm byte if `data` opens with an encryption header.
#[must_use]
pub fn detect_header(data: &[u8]) -> Option<u8> {
    if data.len() < HEADER_SIZE {
        return None;
    }
    if data[..7] == MAGIC && data[8..HEADER_SIZE] == BOUNDARY {
        Some(data[7])
    } else {
        None
    }
}

/// A store wrapper encrypting every value written through it.
///
/// # Example
///
/// ```rust
/// use blobkit_storage::{Context, EncryptedStore, EncryptionKey, MemoryStore, Store};
/// use std::sync::Arc;
///
/// let inner = Arc::new(MemoryStore::new("secrets"));
/// let key = Arc::new(EncryptionKey::generate());
/// let store = EncryptedStore::new(inner.clone(), key);
///
/// let ctx = Context::background();
/// store.put(&ctx, "token", b"hunter2").unwrap();
/// assert_eq!(store.get(&ctx, "token").unwrap().unwrap(), b"hunter2");
/// assert_ne!(inner.get(&ctx, "token").unwrap().unwrap(), b"hunter2");
/// ```
pub struct EncryptedStore {
    inner: Arc<dyn Store>,
    key: Arc<EncryptionKey>,
}

impl std::fmt::Debug for EncryptedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedStore")
            .field("inner", &self.inner.name())
            .field("key", &self.key)
            .finish()
    }
}

impl EncryptedStore {
    /// Wraps `inner`, encrypting with `key`.
    #[must_use]
    pub fn new(inner: Arc<dyn Store>, key: Arc<EncryptionKey>) -> Self {
        Self { inner, key }
    }

    /// Returns the wrapped store.
    #[must_use]
    pub fn inner(&self) -> &Arc<dyn Store> {
        &self.inner
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(GenericArray::from_slice(self.key.as_bytes()))
    }

    /// Encrypts a whole value, header included.
    fn seal(&self, plaintext: &[u8]) -> StorageResult<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher()
            .encrypt(nonce, plaintext)
            .map_err(|_| StorageError::encryption("encryption failed"))?;

        let mut sealed = Vec::with_capacity(HEADER_SIZE + NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&header(Algorithm::Aes256GcmRandomNonce));
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend(ciphertext);
        Ok(sealed)
    }

    /// Decrypts a stored value, passing unencrypted values through.
    fn open(&self, stored: Vec<u8>) -> StorageResult<Vec<u8>> {
        let Some(algorithm) = detect_header(&stored) else {
            return Ok(stored);
        };
        match Algorithm::from_byte(algorithm)? {
            Algorithm::Aes256GcmRandomNonce => {
                let body = &stored[HEADER_SIZE..];
                if body.len() < NONCE_SIZE + TAG_SIZE {
                    return Err(StorageError::encryption("ciphertext too short"));
                }
                let nonce = Nonce::from_slice(&body[..NONCE_SIZE]);
                self.cipher()
                    .decrypt(nonce, &body[NONCE_SIZE..])
                    .map_err(|_| StorageError::encryption("authentication failed"))
            }
        }
    }
}

impl Store for EncryptedStore {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn list<'a>(&'a self, ctx: &Context, opts: &ListOptions) -> StorageResult<KeyIter<'a>> {
        self.inner.list(ctx, opts)
    }

    fn exists(&self, ctx: &Context, key: &str) -> StorageResult<bool> {
        self.inner.exists(ctx, key)
    }

    fn delete(&self, ctx: &Context, key: &str) -> StorageResult<()> {
        self.inner.delete(ctx, key)
    }

    fn reader(&self, ctx: &Context, key: &str) -> StorageResult<Option<BlobReader>> {
        let Some(mut reader) = self.inner.reader(ctx, key)? else {
            return Ok(None);
        };
        let mut stored = Vec::new();
        reader.read_to_end(&mut stored)?;
        let plaintext = self.open(stored)?;
        Ok(Some(Box::new(Cursor::new(plaintext))))
    }

    fn check_key(&self, key: &str) -> StorageResult<()> {
        self.inner.check_key(key)
    }

    fn writer<'a>(&'a self, ctx: &Context, key: &str) -> StorageResult<Box<dyn BlobWriter + 'a>> {
        self.inner.check_key(key)?;
        ctx.check()?;
        Ok(Box::new(EncryptedWriter {
            store: self,
            ctx: ctx.clone(),
            key: key.to_string(),
            buffer: Vec::new(),
        }))
    }

    fn sync(&self) -> StorageResult<()> {
        self.inner.sync()
    }
}

struct EncryptedWriter<'a> {
    store: &'a EncryptedStore,
    ctx: Context,
    key: String,
    buffer: Vec<u8>,
}

impl Write for EncryptedWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl BlobWriter for EncryptedWriter<'_> {
    fn commit(self: Box<Self>) -> StorageResult<()> {
        self.ctx.check()?;
        let sealed = self.store.seal(&self.buffer)?;
        let mut inner = self.store.inner.writer(&self.ctx, &self.key)?;
        inner.write_all(&sealed)?;
        inner.commit()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStore;
    use proptest::prelude::*;

    fn wrap(inner: &Arc<MemoryStore>, key: u8) -> EncryptedStore {
        let key = EncryptionKey::from_bytes(&[key; KEY_SIZE]).unwrap();
        EncryptedStore::new(inner.clone(), Arc::new(key))
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let inner = Arc::new(MemoryStore::new("s"));
        let store = wrap(&inner, 0x42);
        let ctx = Context::background();

        store.put(&ctx, "k", b"Hello, encrypted world!").unwrap();
        assert_eq!(store.get(&ctx, "k").unwrap().unwrap(), b"Hello, encrypted world!");
    }

    #[test]
    fn stored_bytes_are_not_plaintext() {
        let inner = Arc::new(MemoryStore::new("s"));
        let store = wrap(&inner, 0x42);
        let ctx = Context::background();

        store.put(&ctx, "k", b"Secret data").unwrap();
        let raw = inner.get(&ctx, "k").unwrap().unwrap();
        assert_eq!(detect_header(&raw), Some(Algorithm::Aes256GcmRandomNonce as u8));
        assert!(!raw.windows(11).any(|w| w == b"Secret data"));
        assert_eq!(raw.len(), HEADER_SIZE + NONCE_SIZE + 11 + TAG_SIZE);
    }

    #[test]
    fn legacy_plaintext_passes_through() {
        let inner = Arc::new(MemoryStore::new("s"));
        let ctx = Context::background();
        inner.put(&ctx, "old", b"{\"legacy\":true}").unwrap();

        let store = wrap(&inner, 0x42);
        assert_eq!(store.get(&ctx, "old").unwrap().unwrap(), b"{\"legacy\":true}");
    }

    #[test]
    fn tampered_data_fails() {
        let inner = Arc::new(MemoryStore::new("s"));
        let store = wrap(&inner, 0x42);
        let ctx = Context::background();
        store.put(&ctx, "k", b"Secret data").unwrap();

        let mut raw = inner.get(&ctx, "k").unwrap().unwrap();
        raw[HEADER_SIZE + NONCE_SIZE + 1] ^= 0xFF;
        inner.put(&ctx, "k", &raw).unwrap();

        assert!(matches!(store.get(&ctx, "k"), Err(StorageError::Encryption(_))));
    }

    #[test]
    fn different_keys_fail() {
        let inner = Arc::new(MemoryStore::new("s"));
        let ctx = Context::background();
        wrap(&inner, 0x42).put(&ctx, "k", b"Secret data").unwrap();
        assert!(wrap(&inner, 0x43).get(&ctx, "k").is_err());
    }

    #[test]
    fn unknown_algorithm_is_rejected() {
        let inner = Arc::new(MemoryStore::new("s"));
        let ctx = Context::background();
        let mut raw = header(Algorithm::Aes256GcmRandomNonce).to_vec();
        raw[7] = 0x09;
        raw.extend_from_slice(&[0u8; 40]);
        inner.put(&ctx, "k", &raw).unwrap();

        assert!(matches!(
            wrap(&inner, 0x42).get(&ctx, "k"),
            Err(StorageError::UnknownAlgorithm(0x09))
        ));
    }

    #[test]
    fn short_values_are_not_headers() {
        assert_eq!(detect_header(&MAGIC), None);
        assert_eq!(detect_header(b""), None);
        let mut almost = header(Algorithm::Aes256GcmRandomNonce);
        almost[15] ^= 1;
        assert_eq!(detect_header(&almost), None);
    }

    #[test]
    fn nonces_are_fresh_per_write() {
        let inner = Arc::new(MemoryStore::new("s"));
        let store = wrap(&inner, 0x42);
        let ctx = Context::background();
        store.put(&ctx, "a", b"same").unwrap();
        store.put(&ctx, "b", b"same").unwrap();
        assert_ne!(inner.get(&ctx, "a").unwrap(), inner.get(&ctx, "b").unwrap());
    }

    #[test]
    fn derived_keys_are_deterministic() {
        let a = EncryptionKey::derive_from_password(b"correct horse", b"salt").unwrap();
        let b = EncryptionKey::derive_from_password(b"correct horse", b"salt").unwrap();
        let c = EncryptionKey::derive_from_password(b"correct horse", b"pepper").unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());
        assert_ne!(a.as_bytes(), c.as_bytes());
        assert!(EncryptionKey::from_bytes(&[0u8; 31]).is_err());
        assert_eq!(format!("{a:?}"), "EncryptionKey { bytes: \"[REDACTED]\" }");
    }

    proptest! {
        #[test]
        fn any_value_roundtrips(value in prop::collection::vec(any::<u8>(), 0..2048)) {
            let inner = Arc::new(MemoryStore::new("s"));
            let store = wrap(&inner, 0x11);
            let ctx = Context::background();
            store.put(&ctx, "k", &value).unwrap();
            prop_assert_eq!(store.get(&ctx, "k").unwrap().unwrap(), value);
        }
    }
}
