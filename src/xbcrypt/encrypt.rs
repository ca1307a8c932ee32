//! Encrypting datasink.
//!
//! Writes are cut into fixed-size chunks and encrypted on a pool of
//! persistent workers, one cipher handle per worker. Each round dispatches
//! up to `threads` chunks and reaps them in index order before anything is
//! written downstream, so the output chunk order always equals the input
//! order regardless of the thread count.

use std::sync::Arc;

use super::{encrypt_chunk, CipherHandle, CryptKey, CryptOptions, Version, SUFFIX};
use crate::{
    datasink::{Datasink, Sink},
    logging::{self, PoolSnapshot},
    pool::WorkerPool,
    Result,
};

pub struct EncryptDatasink {
    dest: Arc<dyn Datasink>,
    key: Arc<CryptKey>,
    opts: CryptOptions,
}

impl EncryptDatasink {
    pub fn new(dest: Arc<dyn Datasink>, key: CryptKey, opts: CryptOptions) -> Self {
        Self {
            dest,
            key: Arc::new(key),
            opts,
        }
    }
}

impl Datasink for EncryptDatasink {
    fn open(&self, path: &str) -> Result<Box<dyn Sink>> {
        let dest = self.dest.open(&format!("{path}{SUFFIX}"))?;
        let key = Arc::clone(&self.key);
        let pool = WorkerPool::new("encrypt", self.opts.threads, |_| {
            Ok(CipherHandle::new(Arc::clone(&key)))
        })?;
        let snapshot = PoolSnapshot {
            codec: "xbcrypt",
            path: dest.path().to_string(),
            threads: pool.threads(),
            ..Default::default()
        };
        Ok(Box::new(EncryptFile {
            dest,
            pool,
            version: self.opts.version,
            chunk_size: self.opts.chunk_size.max(1),
            pending: Vec::new(),
            snapshot,
        }))
    }

    fn remove(&self, path: &str) -> Result<()> {
        self.dest.remove(&format!("{path}{SUFFIX}"))
    }

    fn finish(&self) -> Result<()> {
        self.dest.finish()
    }
}

struct EncryptFile {
    dest: Box<dyn Sink>,
    pool: WorkerPool<CipherHandle>,
    version: Version,
    chunk_size: usize,
    pending: Vec<u8>,
    snapshot: PoolSnapshot,
}

impl EncryptFile {
    /// Encrypt whole chunks from `pending`; with `all` the trailing short
    /// chunk goes too.
    fn drain(&mut self, all: bool) -> Result<()> {
        let whole = self.pending.len() / self.chunk_size * self.chunk_size;
        let take = if all { self.pending.len() } else { whole };
        if take == 0 {
            return Ok(());
        }

        let chunks: Vec<Vec<u8>> = self.pending[..take]
            .chunks(self.chunk_size)
            .map(<[u8]>::to_vec)
            .collect();
        self.pending.drain(..take);

        let version = self.version;
        self.snapshot.chunks += chunks.len() as u64;
        self.snapshot.bytes_in += take as u64;
        let encoded = self
            .pool
            .map_ordered(chunks, move |cipher, plain| encrypt_chunk(cipher, version, &plain))?;
        for chunk in encoded {
            self.snapshot.bytes_out += chunk.len() as u64;
            self.dest.write(&chunk)?;
        }
        Ok(())
    }
}

impl Sink for EncryptFile {
    fn path(&self) -> &str {
        self.dest.path()
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        self.pending.extend_from_slice(buf);
        if self.pending.len() >= self.chunk_size * self.pool.threads() {
            self.drain(false)?;
        }
        Ok(())
    }

    fn close(mut self: Box<Self>) -> Result<()> {
        self.drain(true)?;
        logging::log_pool_metrics(&self.snapshot);
        let EncryptFile { dest, pool, .. } = *self;
        drop(pool);
        dest.close()
    }
}
