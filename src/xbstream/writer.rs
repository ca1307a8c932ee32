//! xbstream writer.
//!
//! Many files may be written concurrently into one stream: each [`StreamFile`]
//! buffers its own data and emits whole chunks through the shared
//! [`StreamWriter`], which serialises chunk emission under a mutex.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use super::{encode_chunk, ChunkType, SparseChunk, DEFAULT_CHUNK_SIZE, MAX_PATH_LEN};
use crate::{
    datasink::{Datasink, Sink},
    Error, Result,
};

/// Hole granularity used when zero runs are turned into sparse chunks.
pub const SPARSE_BLOCK_SIZE: usize = 4096;

/// Split `data` into a sparse map and the payload it references. Only whole
/// zero blocks of `block` bytes become holes.
pub fn punch_zero_blocks(data: &[u8], block: usize) -> (Vec<SparseChunk>, Vec<u8>) {
    let block = block.max(1);
    let mut map = Vec::new();
    let mut payload = Vec::with_capacity(data.len());
    let (mut skip, mut len) = (0u32, 0u32);
    for piece in data.chunks(block) {
        if piece.len() == block && piece.iter().all(|&b| b == 0) {
            if len > 0 {
                map.push(SparseChunk { skip, len });
                (skip, len) = (0, 0);
            }
            skip += piece.len() as u32;
        } else {
            len += piece.len() as u32;
            payload.extend_from_slice(piece);
        }
    }
    if skip > 0 || len > 0 {
        map.push(SparseChunk { skip, len });
    }
    (map, payload)
}

pub struct StreamWriter {
    dest: Mutex<Option<Box<dyn Sink>>>,
    chunk_size: usize,
}

impl StreamWriter {
    pub fn new(dest: Box<dyn Sink>, chunk_size: usize) -> Arc<Self> {
        Arc::new(Self {
            dest: Mutex::new(Some(dest)),
            chunk_size: chunk_size.max(1),
        })
    }

    /// Start a new logical file in the stream.
    pub fn open(self: &Arc<Self>, path: &str) -> Result<StreamFile> {
        if path.len() >= MAX_PATH_LEN {
            return Err(Error::Format {
                what: "xbstream path",
                offset: 0,
                reason: format!("path {path} is longer than {} bytes", MAX_PATH_LEN - 1),
            }
            .into());
        }
        Ok(StreamFile {
            writer: Arc::clone(self),
            path: path.to_string(),
            buf: Vec::new(),
            offset: 0,
        })
    }

    fn emit(&self, bytes: &[u8]) -> Result<()> {
        let mut guard = self.dest.lock();
        match guard.as_mut() {
            Some(dest) => dest.write(bytes),
            None => Err(Error::Worker("xbstream writer already finished".into()).into()),
        }
    }

    /// Close the destination. Files still open afterwards fail on flush.
    pub fn finish(&self) -> Result<()> {
        let dest = self.dest.lock().take();
        match dest {
            Some(dest) => dest.close(),
            None => Ok(()),
        }
    }
}

/// One logical file inside a stream.
pub struct StreamFile {
    writer: Arc<StreamWriter>,
    path: String,
    buf: Vec<u8>,
    offset: u64,
}

impl StreamFile {
    fn flush_buffer(&mut self) -> Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let chunk = encode_chunk(ChunkType::Payload, 0, &self.path, self.offset, &[], &self.buf);
        self.writer.emit(&chunk)?;
        self.offset += self.buf.len() as u64;
        self.buf.clear();
        Ok(())
    }

    pub fn write_data(&mut self, data: &[u8]) -> Result<()> {
        let chunk_size = self.writer.chunk_size;
        if self.buf.len() + data.len() < chunk_size {
            self.buf.extend_from_slice(data);
            return Ok(());
        }
        self.flush_buffer()?;
        if data.len() >= chunk_size {
            let chunk = encode_chunk(ChunkType::Payload, 0, &self.path, self.offset, &[], data);
            self.writer.emit(&chunk)?;
            self.offset += data.len() as u64;
        } else {
            self.buf.extend_from_slice(data);
        }
        Ok(())
    }

    /// Write `data` laid out according to `map`: each entry skips a hole,
    /// then takes `len` bytes from `data`.
    pub fn write_sparse(&mut self, data: &[u8], map: &[SparseChunk]) -> Result<()> {
        let mapped: u64 = map.iter().map(|s| u64::from(s.len)).sum();
        if mapped != data.len() as u64 {
            return Err(Error::Format {
                what: "xbstream sparse map",
                offset: self.offset,
                reason: format!("map covers {mapped} bytes, payload has {}", data.len()),
            }
            .into());
        }
        self.flush_buffer()?;
        let chunk = encode_chunk(ChunkType::Sparse, 0, &self.path, self.offset, map, data);
        self.writer.emit(&chunk)?;
        self.offset += map
            .iter()
            .map(|s| u64::from(s.skip) + u64::from(s.len))
            .sum::<u64>();
        Ok(())
    }

    /// Like [`write_data`](Self::write_data), but whole zero blocks of
    /// [`SPARSE_BLOCK_SIZE`] bytes are stored as holes.
    pub fn write_punched(&mut self, data: &[u8]) -> Result<()> {
        let (map, payload) = punch_zero_blocks(data, SPARSE_BLOCK_SIZE);
        if payload.len() == data.len() {
            return self.write_data(data);
        }
        self.write_sparse(&payload, &map)
    }

    /// Flush buffered data and write the file's EOF chunk.
    pub fn finish(mut self) -> Result<()> {
        self.flush_buffer()?;
        let eof = encode_chunk(ChunkType::Eof, 0, &self.path, 0, &[], &[]);
        self.writer.emit(&eof)
    }
}

impl Sink for StreamFile {
    fn path(&self) -> &str {
        &self.path
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        self.write_data(buf)
    }

    fn close(self: Box<Self>) -> Result<()> {
        (*self).finish()
    }
}

/// Datasink that multiplexes every opened file into a single stream written
/// to one destination file.
pub struct XbstreamDatasink {
    writer: Arc<StreamWriter>,
}

impl XbstreamDatasink {
    pub fn new(dest: &dyn Datasink, stream_name: &str, chunk_size: usize) -> Result<Self> {
        let out = dest.open(stream_name)?;
        debug!(stream = stream_name, chunk_size, "xbstream output opened");
        Ok(Self {
            writer: StreamWriter::new(out, chunk_size),
        })
    }

    pub fn with_default_chunk(dest: &dyn Datasink, stream_name: &str) -> Result<Self> {
        Self::new(dest, stream_name, DEFAULT_CHUNK_SIZE)
    }

    /// Open a file with access to the sparse writes.
    pub fn open_file(&self, path: &str) -> Result<StreamFile> {
        self.writer.open(path)
    }
}

impl Datasink for XbstreamDatasink {
    fn open(&self, path: &str) -> Result<Box<dyn Sink>> {
        Ok(Box::new(self.open_file(path)?))
    }

    fn finish(&self) -> Result<()> {
        self.writer.finish()
    }
}
