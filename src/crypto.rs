//! Hashing and leaf encryption.
//!
//! Every parent-to-child link stores the SHA-256 digest of the child
//! block as it lies on disk. Leaves are encrypted with AES-128-CTR under
//! a key selected by `KeyId`, so their digests cover the ciphertext.

use alloc::collections::BTreeMap;

use openssl::rand::rand_bytes;
use openssl::symm::{decrypt, encrypt, Cipher as SslCipher};
use serde::{Deserialize, Serialize};
use spin::Mutex;

use crate::node::Block;
use crate::prelude::*;

pub const HASH_SIZE: usize = 32;
pub const KEY_SIZE: usize = 16;
const IV_SIZE: usize = 16;

/// SHA-256 digest of one block.
#[derive(Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hash(pub [u8; HASH_SIZE]);

impl Hash {
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

impl Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Hash({:02x}{:02x}{:02x}{:02x}..)",
            self.0[0], self.0[1], self.0[2], self.0[3]
        )
    }
}

/// Digest of a block's on-disk content.
pub fn digest(block: &Block) -> Hash {
    Hash(openssl::sha::sha256(block.as_slice()))
}

/// A symmetric cipher keyed by `KeyId`, tweaked by the physical address.
pub trait Cipher: Send + Sync {
    fn encrypt(&self, key_id: KeyId, pba: Pba, block: &mut Block) -> Result<()>;
    fn decrypt(&self, key_id: KeyId, pba: Pba, block: &mut Block) -> Result<()>;
}

impl<T: Cipher> Cipher for Arc<T> {
    fn encrypt(&self, key_id: KeyId, pba: Pba, block: &mut Block) -> Result<()> {
        (**self).encrypt(key_id, pba, block)
    }

    fn decrypt(&self, key_id: KeyId, pba: Pba, block: &mut Block) -> Result<()> {
        (**self).decrypt(key_id, pba, block)
    }
}

/// AES-128-CTR with one key per key epoch and a PBA-derived IV.
pub struct AesCtrCipher {
    keys: Mutex<BTreeMap<KeyId, [u8; KEY_SIZE]>>,
}

impl AesCtrCipher {
    pub fn new() -> Self {
        Self {
            keys: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn insert_key(&self, key_id: KeyId, key: [u8; KEY_SIZE]) {
        self.keys.lock().insert(key_id, key);
    }

    /// Install a freshly generated random key for `key_id`.
    pub fn generate_key(&self, key_id: KeyId) -> Result<()> {
        let mut key = [0u8; KEY_SIZE];
        rand_bytes(&mut key).map_err(|_| Error::new(EncryptFailed))?;
        self.insert_key(key_id, key);
        Ok(())
    }

    fn key_of(&self, key_id: KeyId) -> Result<[u8; KEY_SIZE]> {
        self.keys
            .lock()
            .get(&key_id)
            .copied()
            .ok_or(Error::with_msg(NotFound, "unknown key id"))
    }

    fn iv_of(pba: Pba) -> [u8; IV_SIZE] {
        let mut iv = [0u8; IV_SIZE];
        iv[..8].copy_from_slice(&pba.to_le_bytes());
        iv
    }
}

impl Default for AesCtrCipher {
    fn default() -> Self {
        Self::new()
    }
}

impl Cipher for AesCtrCipher {
    fn encrypt(&self, key_id: KeyId, pba: Pba, block: &mut Block) -> Result<()> {
        let key = self.key_of(key_id)?;
        let iv = Self::iv_of(pba);
        let result = encrypt(SslCipher::aes_128_ctr(), &key, Some(&iv), block.as_slice())
            .map_err(|_| Error::new(EncryptFailed))?;
        block.as_mut_slice().copy_from_slice(result.as_slice());
        Ok(())
    }

    fn decrypt(&self, key_id: KeyId, pba: Pba, block: &mut Block) -> Result<()> {
        let key = self.key_of(key_id)?;
        let iv = Self::iv_of(pba);
        let result = decrypt(SslCipher::aes_128_ctr(), &key, Some(&iv), block.as_slice())
            .map_err(|_| Error::new(DecryptFailed))?;
        block.as_mut_slice().copy_from_slice(result.as_slice());
        Ok(())
    }
}
