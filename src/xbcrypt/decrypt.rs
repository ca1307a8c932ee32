//! Decrypting datasink.
//!
//! The inverse of [`super::EncryptDatasink`]: bytes arrive in arbitrary
//! slices, so a chunk may straddle two `write` calls. Incomplete input is kept
//! and completed by the next call; whole chunks are decrypted on the pool in
//! rounds and written downstream in order.

use std::sync::Arc;

use super::{decrypt_chunk, parse_chunk, CipherHandle, CryptKey, CryptOptions, Parsed, SUFFIX};
use crate::{
    datasink::{Datasink, Sink},
    logging::{self, PoolSnapshot},
    pool::WorkerPool,
    Error, Result,
};

/// Chunks collected per dispatch, as a multiple of the thread count.
const CHUNKS_PER_THREAD: usize = 8;

pub struct DecryptDatasink {
    dest: Arc<dyn Datasink>,
    key: Arc<CryptKey>,
    opts: CryptOptions,
}

impl DecryptDatasink {
    pub fn new(dest: Arc<dyn Datasink>, key: CryptKey, opts: CryptOptions) -> Self {
        Self {
            dest,
            key: Arc::new(key),
            opts,
        }
    }
}

impl Datasink for DecryptDatasink {
    fn open(&self, path: &str) -> Result<Box<dyn Sink>> {
        let plain_path = path.strip_suffix(SUFFIX).unwrap_or(path);
        let dest = self.dest.open(plain_path)?;
        let key = Arc::clone(&self.key);
        let pool = WorkerPool::new("decrypt", self.opts.threads, |_| {
            Ok(CipherHandle::new(Arc::clone(&key)))
        })?;
        let snapshot = PoolSnapshot {
            codec: "xbcrypt-decrypt",
            path: dest.path().to_string(),
            threads: pool.threads(),
            ..Default::default()
        };
        Ok(Box::new(DecryptFile {
            dest,
            pool,
            buf: Vec::new(),
            buf_offset: 0,
            next_index: 0,
            snapshot,
        }))
    }

    fn remove(&self, path: &str) -> Result<()> {
        self.dest.remove(path.strip_suffix(SUFFIX).unwrap_or(path))
    }

    fn finish(&self) -> Result<()> {
        self.dest.finish()
    }
}

struct DecryptFile {
    dest: Box<dyn Sink>,
    pool: WorkerPool<CipherHandle>,
    buf: Vec<u8>,
    /// Stream offset of `buf[0]`.
    buf_offset: u64,
    next_index: u64,
    snapshot: PoolSnapshot,
}

impl DecryptFile {
    fn process(&mut self) -> Result<()> {
        let batch_limit = self.pool.threads() * CHUNKS_PER_THREAD;
        loop {
            let mut batch = Vec::new();
            let mut used = 0usize;
            while batch.len() < batch_limit {
                match parse_chunk(&self.buf[used..], self.buf_offset + used as u64)? {
                    Parsed::Chunk(chunk, len) => {
                        used += len;
                        batch.push((self.next_index + batch.len() as u64, chunk));
                    }
                    Parsed::Incomplete => break,
                }
            }
            if batch.is_empty() {
                return Ok(());
            }

            let count = batch.len();
            self.snapshot.bytes_in += used as u64;
            let plain = self
                .pool
                .map_ordered(batch, |cipher, (index, chunk)| decrypt_chunk(cipher, chunk, index))?;
            for data in plain {
                self.snapshot.bytes_out += data.len() as u64;
                self.dest.write(&data)?;
            }
            self.buf.drain(..used);
            self.buf_offset += used as u64;
            self.next_index += count as u64;
            self.snapshot.chunks += count as u64;
        }
    }
}

impl Sink for DecryptFile {
    fn path(&self) -> &str {
        self.dest.path()
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        self.buf.extend_from_slice(buf);
        self.process()
    }

    fn close(self: Box<Self>) -> Result<()> {
        if !self.buf.is_empty() {
            return Err(Error::Format {
                what: "xbcrypt chunk",
                offset: self.buf_offset,
                reason: format!(
                    "{} bytes of incomplete chunk left at close of {}",
                    self.buf.len(),
                    self.dest.path()
                ),
            }
            .into());
        }
        logging::log_pool_metrics(&self.snapshot);
        let DecryptFile { dest, pool, .. } = *self;
        drop(pool);
        dest.close()
    }
}
