//! xbcrypt chunked encryption format.
//!
//! ```text
//! magic (8) | reserved (8, LE) | original_len (8, LE) | encrypted_len (8, LE)
//!   | crc32 of plaintext (4, LE) | [iv_len (8, LE) | iv] | ciphertext
//! ```
//!
//! Version 1 (`XBCRYP01`) has no IV field and runs CTR from a zero counter.
//! Version 2 (`XBCRYP02`) stores an IV that readers ignore. Version 3
//! (`XBCRYP03`) starts CTR at the stored IV and encrypts a SHA-256 of the
//! plaintext after the data, so `encrypted_len = original_len + 32`.

pub mod chunk;
pub mod cipher;
pub mod decrypt;
pub mod encrypt;
pub mod reader;

pub use chunk::{decrypt_chunk, encrypt_chunk, parse_chunk, CryptChunk, Parsed};
pub use cipher::{CipherHandle, CryptAlgo, CryptKey};
pub use decrypt::DecryptDatasink;
pub use encrypt::EncryptDatasink;
pub use reader::CryptReader;

pub const MAGIC_V1: &[u8; 8] = b"XBCRYP01";
pub const MAGIC_V2: &[u8; 8] = b"XBCRYP02";
pub const MAGIC_V3: &[u8; 8] = b"XBCRYP03";
pub const MAGIC_LEN: usize = 8;
/// magic + reserved + original_len + encrypted_len + checksum.
pub const FIXED_HEADER_LEN: usize = MAGIC_LEN + 8 + 8 + 8 + 4;
pub const IV_LEN: usize = 16;
pub const HASH_LEN: usize = 32;
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;
/// Suffix appended to encrypted file names.
pub const SUFFIX: &str = ".xbcrypt";
/// Upper bound accepted for any length field.
pub const MAX_FIELD_LEN: u64 = i32::MAX as u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, clap::ValueEnum)]
pub enum Version {
    #[value(name = "1")]
    V1,
    #[value(name = "2")]
    V2,
    #[default]
    #[value(name = "3")]
    V3,
}

impl Version {
    pub fn magic(self) -> &'static [u8; 8] {
        match self {
            Version::V1 => MAGIC_V1,
            Version::V2 => MAGIC_V2,
            Version::V3 => MAGIC_V3,
        }
    }

    pub fn from_magic(magic: &[u8]) -> Option<Self> {
        if magic == MAGIC_V3 {
            Some(Version::V3)
        } else if magic == MAGIC_V2 {
            Some(Version::V2)
        } else if magic == MAGIC_V1 {
            Some(Version::V1)
        } else {
            None
        }
    }

    pub fn has_iv(self) -> bool {
        self != Version::V1
    }

    pub fn has_hash(self) -> bool {
        self == Version::V3
    }
}

/// Settings shared by the encrypting and decrypting datasinks.
#[derive(Debug, Clone)]
pub struct CryptOptions {
    pub threads: usize,
    pub chunk_size: usize,
    /// Format written by the encrypting sink; readers accept every version.
    pub version: Version,
}

impl Default for CryptOptions {
    fn default() -> Self {
        Self {
            threads: 1,
            chunk_size: DEFAULT_CHUNK_SIZE,
            version: Version::V3,
        }
    }
}
