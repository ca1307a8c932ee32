//! Sequential xbstream chunk reader.

use std::io::{self, Read};

use super::{
    Chunk, ChunkType, SparseChunk, CHUNK_HEADER_CONSTANT_LEN, CHUNK_MAGIC, FLAG_IGNORABLE,
    MAX_PATH_LEN,
};
use crate::{Error, Result};

pub struct StreamReader<R> {
    inner: R,
    offset: u64,
}

/// Read until `buf` is full or the source is exhausted.
fn read_full<R: Read>(r: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn truncated(offset: u64, expected: usize, got: usize) -> anyhow::Error {
    Error::Format {
        what: "xbstream chunk",
        offset,
        reason: format!("unexpected end of stream: expected {expected} bytes, got {got}"),
    }
    .into()
}

impl<R: Read> StreamReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, offset: 0 }
    }

    /// Bytes consumed from the underlying reader so far.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    fn read_exact_at(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        let got = (&mut self.inner).take(len as u64).read_to_end(&mut data)?;
        if got < len {
            return Err(truncated(self.offset, len, got));
        }
        self.offset += len as u64;
        Ok(data)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut buf = [0u8; N];
        let got = read_full(&mut self.inner, &mut buf)?;
        if got < N {
            return Err(truncated(self.offset, N, got));
        }
        self.offset += N as u64;
        Ok(buf)
    }

    /// Read the next chunk. Returns `Ok(None)` on a clean end of stream,
    /// i.e. when no byte of a new chunk header is available.
    pub fn read_chunk(&mut self) -> Result<Option<Chunk>> {
        let start = self.offset;
        let mut header = [0u8; CHUNK_HEADER_CONSTANT_LEN];
        let got = read_full(&mut self.inner, &mut header)?;
        if got == 0 {
            return Ok(None);
        }
        if got < CHUNK_HEADER_CONSTANT_LEN {
            return Err(truncated(start, CHUNK_HEADER_CONSTANT_LEN, got));
        }
        self.offset += CHUNK_HEADER_CONSTANT_LEN as u64;

        if &header[..8] != CHUNK_MAGIC {
            return Err(Error::Format {
                what: "xbstream chunk",
                offset: start,
                reason: "wrong chunk magic".into(),
            }
            .into());
        }

        let flags = header[8];
        let chunk_type = ChunkType::from_code(header[9]);
        if matches!(chunk_type, ChunkType::Unknown(_)) && flags & FLAG_IGNORABLE == 0 {
            return Err(Error::Format {
                what: "xbstream chunk",
                offset: start + 9,
                reason: format!("unknown chunk type {:#04x}", header[9]),
            }
            .into());
        }

        let path_len = u32::from_le_bytes([header[10], header[11], header[12], header[13]]) as usize;
        if path_len >= MAX_PATH_LEN {
            return Err(Error::Format {
                what: "xbstream chunk",
                offset: start + 10,
                reason: format!("path length {path_len} is too large"),
            }
            .into());
        }
        let path_offset = self.offset;
        let path_bytes = self.read_exact_at(path_len)?;
        let path = String::from_utf8(path_bytes).map_err(|_| Error::Format {
            what: "xbstream chunk",
            offset: path_offset,
            reason: "path is not valid UTF-8".into(),
        })?;

        if chunk_type == ChunkType::Eof {
            return Ok(Some(Chunk {
                flags,
                chunk_type,
                path,
                offset: 0,
                checksum: 0,
                sparse_map: Vec::new(),
                data: Vec::new(),
                checksum_offset: self.offset,
            }));
        }

        let map_size = if chunk_type == ChunkType::Sparse {
            u32::from_le_bytes(self.read_array::<4>()?) as usize
        } else {
            0
        };

        let len_offset = self.offset;
        let payload_len = u64::from_le_bytes(self.read_array::<8>()?);
        let payload_len = usize::try_from(payload_len).map_err(|_| Error::Format {
            what: "xbstream chunk",
            offset: len_offset,
            reason: format!("chunk length {payload_len} is too large"),
        })?;
        let offset = u64::from_le_bytes(self.read_array::<8>()?);
        if offset > i64::MAX as u64 {
            return Err(Error::Format {
                what: "xbstream chunk",
                offset: len_offset + 8,
                reason: format!("chunk offset {offset} is too large"),
            }
            .into());
        }
        let checksum_offset = self.offset;
        let checksum = u32::from_le_bytes(self.read_array::<4>()?);

        let map_bytes = self.read_exact_at(map_size * 8)?;
        let sparse_map = map_bytes
            .chunks_exact(8)
            .map(|e| SparseChunk {
                skip: u32::from_le_bytes([e[0], e[1], e[2], e[3]]),
                len: u32::from_le_bytes([e[4], e[5], e[6], e[7]]),
            })
            .collect();
        let data = self.read_exact_at(payload_len)?;

        Ok(Some(Chunk {
            flags,
            chunk_type,
            path,
            offset,
            checksum,
            sparse_map,
            data,
            checksum_offset,
        }))
    }
}

impl<R: Read> Iterator for StreamReader<R> {
    type Item = Result<Chunk>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read_chunk().transpose()
    }
}
