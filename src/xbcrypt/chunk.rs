//! Encoding and decoding of single xbcrypt chunks.

use rand::RngCore;
use sha2::{Digest, Sha256};

use super::{CipherHandle, Version, FIXED_HEADER_LEN, HASH_LEN, IV_LEN, MAGIC_LEN, MAX_FIELD_LEN};
use crate::{Error, Result};

/// A chunk as read from the stream, still encrypted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CryptChunk {
    pub version: Version,
    pub original_len: u64,
    pub checksum: u32,
    pub iv: Vec<u8>,
    pub ciphertext: Vec<u8>,
}

/// Result of parsing the front of a buffer.
#[derive(Debug)]
pub enum Parsed {
    /// More input is needed before a whole chunk is available.
    Incomplete,
    /// One whole chunk and the number of bytes it occupied.
    Chunk(CryptChunk, usize),
}

fn le_u64(buf: &[u8], at: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(b)
}

fn check_len(value: u64, field: &str, offset: u64) -> Result<usize> {
    if value > MAX_FIELD_LEN {
        return Err(Error::Format {
            what: "xbcrypt chunk",
            offset,
            reason: format!("invalid {field} {value}"),
        }
        .into());
    }
    Ok(value as usize)
}

/// Parse one chunk from the front of `buf`. `base_offset` is the stream
/// position of `buf[0]`, used in error reports.
pub fn parse_chunk(buf: &[u8], base_offset: u64) -> Result<Parsed> {
    if buf.len() < MAGIC_LEN {
        return Ok(Parsed::Incomplete);
    }
    let version = Version::from_magic(&buf[..MAGIC_LEN]).ok_or_else(|| Error::Format {
        what: "xbcrypt chunk",
        offset: base_offset,
        reason: "wrong chunk magic".into(),
    })?;
    if buf.len() < FIXED_HEADER_LEN {
        return Ok(Parsed::Incomplete);
    }

    let original_len = check_len(le_u64(buf, 16), "original size", base_offset + 16)?;
    let encrypted_len = check_len(le_u64(buf, 24), "encrypted size", base_offset + 24)?;
    let expected_hash = if version.has_hash() { HASH_LEN } else { 0 };
    if encrypted_len != original_len + expected_hash {
        return Err(Error::Format {
            what: "xbcrypt chunk",
            offset: base_offset + 24,
            reason: format!(
                "encrypted size {encrypted_len} does not match original size {original_len}"
            ),
        }
        .into());
    }
    let checksum = u32::from_le_bytes([buf[32], buf[33], buf[34], buf[35]]);

    let mut pos = FIXED_HEADER_LEN;
    let mut iv = Vec::new();
    if version.has_iv() {
        if buf.len() < pos + 8 {
            return Ok(Parsed::Incomplete);
        }
        let iv_len = check_len(le_u64(buf, pos), "iv size", base_offset + pos as u64)?;
        if iv_len != 0 && iv_len != IV_LEN {
            return Err(Error::Format {
                what: "xbcrypt chunk",
                offset: base_offset + pos as u64,
                reason: format!("unsupported iv size {iv_len}"),
            }
            .into());
        }
        pos += 8;
        if buf.len() < pos + iv_len {
            return Ok(Parsed::Incomplete);
        }
        iv.extend_from_slice(&buf[pos..pos + iv_len]);
        pos += iv_len;
    }
    if version.has_hash() && iv.is_empty() {
        return Err(Error::Format {
            what: "xbcrypt chunk",
            offset: base_offset + FIXED_HEADER_LEN as u64,
            reason: "version 3 chunk without iv".into(),
        }
        .into());
    }

    if buf.len() < pos + encrypted_len {
        return Ok(Parsed::Incomplete);
    }
    let ciphertext = buf[pos..pos + encrypted_len].to_vec();
    pos += encrypted_len;

    Ok(Parsed::Chunk(
        CryptChunk {
            version,
            original_len: original_len as u64,
            checksum,
            iv,
            ciphertext,
        },
        pos,
    ))
}

/// Encrypt `plaintext` into one encoded chunk of the given version.
pub fn encrypt_chunk(cipher: &mut CipherHandle, version: Version, plaintext: &[u8]) -> Result<Vec<u8>> {
    let checksum = crc32fast::hash(plaintext);

    let mut iv = [0u8; IV_LEN];
    if version.has_iv() {
        rand::thread_rng().fill_bytes(&mut iv);
    }

    let mut body = Vec::with_capacity(plaintext.len() + HASH_LEN);
    body.extend_from_slice(plaintext);
    if version.has_hash() {
        body.extend_from_slice(&Sha256::digest(plaintext));
    }
    let counter = if version == Version::V3 { iv } else { [0u8; IV_LEN] };
    cipher.apply(&counter, &mut body)?;

    let header_len = FIXED_HEADER_LEN + if version.has_iv() { 8 + IV_LEN } else { 0 };
    let mut out = Vec::with_capacity(header_len + body.len());
    out.extend_from_slice(version.magic());
    out.extend_from_slice(&0u64.to_le_bytes());
    out.extend_from_slice(&(plaintext.len() as u64).to_le_bytes());
    out.extend_from_slice(&(body.len() as u64).to_le_bytes());
    out.extend_from_slice(&checksum.to_le_bytes());
    if version.has_iv() {
        out.extend_from_slice(&(IV_LEN as u64).to_le_bytes());
        out.extend_from_slice(&iv);
    }
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decrypt and verify one chunk. `index` is the chunk's position in its
/// file, reported on failure.
pub fn decrypt_chunk(cipher: &mut CipherHandle, chunk: CryptChunk, index: u64) -> Result<Vec<u8>> {
    let mut counter = [0u8; IV_LEN];
    if chunk.version == Version::V3 {
        counter.copy_from_slice(&chunk.iv);
    }

    let mut body = chunk.ciphertext;
    cipher.apply(&counter, &mut body)?;

    let original_len = chunk.original_len as usize;
    if chunk.version.has_hash() {
        let (plain, hash) = body.split_at(original_len);
        if Sha256::digest(plain).as_slice() != hash {
            return Err(Error::DecryptFailed {
                chunk: index,
                reason: "plaintext hash mismatch".into(),
            }
            .into());
        }
    }
    body.truncate(original_len);

    let computed = crc32fast::hash(&body);
    if computed != chunk.checksum {
        return Err(Error::DecryptFailed {
            chunk: index,
            reason: format!(
                "checksum mismatch: expected {:#010x}, got {:#010x}",
                chunk.checksum, computed
            ),
        }
        .into());
    }
    Ok(body)
}
