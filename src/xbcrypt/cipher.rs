//! AES-CTR cipher handles.

use std::{fs, path::Path, sync::Arc};

use aes::{Aes128, Aes192, Aes256};
use ctr::cipher::{KeyIvInit, StreamCipher};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use super::IV_LEN;
use crate::{Error, Result};

type Aes128Ctr = ctr::Ctr128BE<Aes128>;
type Aes192Ctr = ctr::Ctr128BE<Aes192>;
type Aes256Ctr = ctr::Ctr128BE<Aes256>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
pub enum CryptAlgo {
    #[value(name = "AES128")]
    #[serde(rename = "AES128")]
    Aes128,
    #[value(name = "AES192")]
    #[serde(rename = "AES192")]
    Aes192,
    #[value(name = "AES256")]
    #[serde(rename = "AES256")]
    Aes256,
}

impl CryptAlgo {
    pub fn key_len(self) -> usize {
        match self {
            CryptAlgo::Aes128 => 16,
            CryptAlgo::Aes192 => 24,
            CryptAlgo::Aes256 => 32,
        }
    }
}

/// Raw key material for one algorithm. Wiped from memory on drop.
pub struct CryptKey {
    algo: CryptAlgo,
    bytes: Zeroizing<Vec<u8>>,
}

impl std::fmt::Debug for CryptKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptKey")
            .field("algo", &self.algo)
            .finish_non_exhaustive()
    }
}

impl CryptKey {
    pub fn new(algo: CryptAlgo, bytes: &[u8]) -> Result<Self> {
        if bytes.len() != algo.key_len() {
            return Err(Error::InvalidKey(format!(
                "{:?} needs a {}-byte key, got {} bytes",
                algo,
                algo.key_len(),
                bytes.len()
            ))
            .into());
        }
        Ok(Self {
            algo,
            bytes: Zeroizing::new(bytes.to_vec()),
        })
    }

    /// Read a key from a file; one trailing newline is ignored.
    pub fn from_file(algo: CryptAlgo, path: &Path) -> Result<Self> {
        let raw = Zeroizing::new(fs::read(path).map_err(|source| Error::FileIo {
            path: path.display().to_string(),
            source,
        })?);
        let mut key: &[u8] = &raw;
        if let Some(stripped) = key.strip_suffix(b"\n") {
            key = stripped.strip_suffix(b"\r").unwrap_or(stripped);
        }
        Self::new(algo, key)
    }

    pub fn algo(&self) -> CryptAlgo {
        self.algo
    }
}

/// Per-worker cipher state. The keystream is restarted for every chunk.
pub struct CipherHandle {
    key: Arc<CryptKey>,
}

impl CipherHandle {
    pub fn new(key: Arc<CryptKey>) -> Self {
        Self { key }
    }

    /// XOR `data` with the keystream starting at counter block `iv`.
    pub fn apply(&mut self, iv: &[u8; IV_LEN], data: &mut [u8]) -> Result<()> {
        let key = self.key.bytes.as_slice();
        let invalid = |_| Error::InvalidKey("key length does not match cipher".into());
        match self.key.algo {
            CryptAlgo::Aes128 => Aes128Ctr::new_from_slices(key, iv)
                .map_err(invalid)?
                .apply_keystream(data),
            CryptAlgo::Aes192 => Aes192Ctr::new_from_slices(key, iv)
                .map_err(invalid)?
                .apply_keystream(data),
            CryptAlgo::Aes256 => Aes256Ctr::new_from_slices(key, iv)
                .map_err(invalid)?
                .apply_keystream(data),
        }
        Ok(())
    }
}
