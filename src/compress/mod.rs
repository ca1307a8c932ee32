//! Parallel chunked compression datasink.
//!
//! Each chunk becomes an independent zstd or LZ4 frame; frames are written in
//! input order, so the output is an ordinary multi-frame stream any stock
//! decompressor can read.

use std::{io::Write, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::{
    datasink::{Datasink, Sink},
    logging::{self, PoolSnapshot},
    pool::WorkerPool,
    Error, Result,
};

pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum CompressAlgo {
    Zstd,
    Lz4,
}

impl CompressAlgo {
    pub fn suffix(self) -> &'static str {
        match self {
            CompressAlgo::Zstd => ".zst",
            CompressAlgo::Lz4 => ".lz4",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompressOptions {
    pub algo: CompressAlgo,
    pub threads: usize,
    pub chunk_size: usize,
    /// zstd level; ignored for LZ4.
    pub level: i32,
}

impl Default for CompressOptions {
    fn default() -> Self {
        Self {
            algo: CompressAlgo::Zstd,
            threads: 1,
            chunk_size: DEFAULT_CHUNK_SIZE,
            level: 1,
        }
    }
}

/// Per-worker compressor state.
enum Codec {
    Zstd(zstd::bulk::Compressor<'static>),
    Lz4,
}

impl Codec {
    fn compress(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Codec::Zstd(c) => Ok(c.compress(data)?),
            Codec::Lz4 => {
                let mut enc = lz4_flex::frame::FrameEncoder::new(Vec::with_capacity(data.len()));
                enc.write_all(data)?;
                enc.finish()
                    .map_err(|e| Error::Worker(format!("lz4 frame: {e}")).into())
            }
        }
    }
}

pub struct CompressDatasink {
    dest: Arc<dyn Datasink>,
    opts: CompressOptions,
}

impl CompressDatasink {
    pub fn new(dest: Arc<dyn Datasink>, opts: CompressOptions) -> Self {
        Self { dest, opts }
    }
}

impl Datasink for CompressDatasink {
    fn open(&self, path: &str) -> Result<Box<dyn Sink>> {
        let dest = self
            .dest
            .open(&format!("{path}{}", self.opts.algo.suffix()))?;
        let algo = self.opts.algo;
        let level = self.opts.level;
        let pool = WorkerPool::new("compress", self.opts.threads, |_| match algo {
            CompressAlgo::Zstd => Ok(Codec::Zstd(zstd::bulk::Compressor::new(level)?)),
            CompressAlgo::Lz4 => Ok(Codec::Lz4),
        })?;
        let snapshot = PoolSnapshot {
            codec: "compress",
            path: dest.path().to_string(),
            threads: pool.threads(),
            ..Default::default()
        };
        Ok(Box::new(CompressFile {
            dest,
            pool,
            chunk_size: self.opts.chunk_size.max(1),
            pending: Vec::new(),
            snapshot,
        }))
    }

    fn remove(&self, path: &str) -> Result<()> {
        self.dest
            .remove(&format!("{path}{}", self.opts.algo.suffix()))
    }

    fn finish(&self) -> Result<()> {
        self.dest.finish()
    }
}

struct CompressFile {
    dest: Box<dyn Sink>,
    pool: WorkerPool<Codec>,
    chunk_size: usize,
    pending: Vec<u8>,
    snapshot: PoolSnapshot,
}

impl CompressFile {
    fn drain(&mut self, all: bool) -> Result<()> {
        let take = if all {
            self.pending.len()
        } else {
            self.pending.len() / self.chunk_size * self.chunk_size
        };
        if take == 0 {
            return Ok(());
        }
        let chunks: Vec<Vec<u8>> = self.pending[..take]
            .chunks(self.chunk_size)
            .map(<[u8]>::to_vec)
            .collect();
        self.pending.drain(..take);
        self.snapshot.chunks += chunks.len() as u64;
        self.snapshot.bytes_in += take as u64;

        let frames = self
            .pool
            .map_ordered(chunks, |codec, data| codec.compress(&data))?;
        for frame in frames {
            self.snapshot.bytes_out += frame.len() as u64;
            self.dest.write(&frame)?;
        }
        Ok(())
    }
}

impl Sink for CompressFile {
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
        let CompressFile { dest, pool, .. } = *self;
        drop(pool);
        dest.close()
    }
}
