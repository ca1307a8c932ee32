//! xbstream container format.
//!
//! A stream is a sequence of self-describing chunks, each tagged with the
//! path of the logical file it belongs to, so any number of files can be
//! interleaved in one byte stream:
//!
//! ```text
//! magic "XBSTCK01" (8) | flags (1) | type (1) | path_len (4, LE) | path
//!   payload: | payload_len (8, LE) | payload_offset (8, LE) | crc32 (4, LE) | payload
//!   sparse:  | map_size (4, LE) | payload_len | payload_offset | crc32
//!            | map_size * (skip (4, LE), len (4, LE)) | payload
//!   eof:     (nothing)
//! ```
//!
//! The CRC-32 (ISO 3309) covers the sparse map, if any, then the payload.

pub mod extract;
pub mod reader;
pub mod writer;

pub use extract::{extract, list, ExtractOptions};
pub use reader::StreamReader;
pub use writer::{
    punch_zero_blocks, StreamFile, StreamWriter, XbstreamDatasink, SPARSE_BLOCK_SIZE,
};

pub const CHUNK_MAGIC: &[u8; 8] = b"XBSTCK01";
/// Readers that do not know a chunk's type may skip it.
pub const FLAG_IGNORABLE: u8 = 0x01;
/// magic + flags + type + path length.
pub const CHUNK_HEADER_CONSTANT_LEN: usize = 8 + 1 + 1 + 4;
/// Paths must be strictly shorter than this.
pub const MAX_PATH_LEN: usize = 512;
/// Default buffering per file before a payload chunk is emitted.
pub const DEFAULT_CHUNK_SIZE: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkType {
    Payload,
    Sparse,
    Eof,
    /// Unrecognised type byte carried with the ignorable flag.
    Unknown(u8),
}

impl ChunkType {
    pub fn code(self) -> u8 {
        match self {
            ChunkType::Payload => b'P',
            ChunkType::Sparse => b'S',
            ChunkType::Eof => b'E',
            ChunkType::Unknown(c) => c,
        }
    }

    pub fn from_code(code: u8) -> Self {
        match code {
            b'P' => ChunkType::Payload,
            b'S' => ChunkType::Sparse,
            b'E' => ChunkType::Eof,
            other => ChunkType::Unknown(other),
        }
    }
}

/// One run of a sparse payload: `skip` bytes of hole followed by `len`
/// bytes taken from the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SparseChunk {
    pub skip: u32,
    pub len: u32,
}

/// A decoded chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub flags: u8,
    pub chunk_type: ChunkType,
    pub path: String,
    /// Destination offset of the payload inside its file.
    pub offset: u64,
    pub checksum: u32,
    pub sparse_map: Vec<SparseChunk>,
    pub data: Vec<u8>,
    /// Position of the checksum field in the stream, for error reports.
    pub checksum_offset: u64,
}

impl Chunk {
    /// Verify the stored checksum. Kept separate from reading so callers can
    /// validate off the hot path.
    pub fn validate_checksum(&self) -> crate::Result<()> {
        let computed = chunk_checksum(&self.sparse_map, &self.data);
        if computed != self.checksum {
            return Err(crate::Error::Format {
                what: "xbstream chunk",
                offset: self.checksum_offset,
                reason: format!(
                    "checksum mismatch for {}: expected {:#010x}, read {:#010x}",
                    self.path, computed, self.checksum
                ),
            }
            .into());
        }
        Ok(())
    }

    /// Number of file bytes the chunk covers, holes included.
    pub fn extent(&self) -> u64 {
        if self.sparse_map.is_empty() {
            self.data.len() as u64
        } else {
            self.sparse_map
                .iter()
                .map(|s| u64::from(s.skip) + u64::from(s.len))
                .sum()
        }
    }
}

pub(crate) fn chunk_checksum(sparse_map: &[SparseChunk], data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    for entry in sparse_map {
        hasher.update(&entry.skip.to_le_bytes());
        hasher.update(&entry.len.to_le_bytes());
    }
    hasher.update(data);
    hasher.finalize()
}

/// Serialise a chunk header, sparse map and payload.
pub(crate) fn encode_chunk(
    chunk_type: ChunkType,
    flags: u8,
    path: &str,
    offset: u64,
    sparse_map: &[SparseChunk],
    data: &[u8],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(
        CHUNK_HEADER_CONSTANT_LEN + path.len() + 24 + sparse_map.len() * 8 + data.len(),
    );
    out.extend_from_slice(CHUNK_MAGIC);
    out.push(flags);
    out.push(chunk_type.code());
    out.extend_from_slice(&(path.len() as u32).to_le_bytes());
    out.extend_from_slice(path.as_bytes());
    if chunk_type == ChunkType::Eof {
        return out;
    }
    if chunk_type == ChunkType::Sparse {
        out.extend_from_slice(&(sparse_map.len() as u32).to_le_bytes());
    }
    out.extend_from_slice(&(data.len() as u64).to_le_bytes());
    out.extend_from_slice(&offset.to_le_bytes());
    out.extend_from_slice(&chunk_checksum(sparse_map, data).to_le_bytes());
    for entry in sparse_map {
        out.extend_from_slice(&entry.skip.to_le_bytes());
        out.extend_from_slice(&entry.len.to_le_bytes());
    }
    out.extend_from_slice(data);
    out
}
