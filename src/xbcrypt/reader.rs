//! Pull encrypted chunks out of a byte source.

use std::io::Read;

use super::{parse_chunk, CryptChunk, Parsed};
use crate::{Error, Result};

const READ_BLOCK: usize = 64 * 1024;

/// Reads whole chunks from `R`, buffering partial input between calls.
pub struct CryptReader<R> {
    inner: R,
    buf: Vec<u8>,
    /// Stream offset of `buf[0]`.
    offset: u64,
    eof: bool,
}

impl<R: Read> CryptReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::new(),
            offset: 0,
            eof: false,
        }
    }

    /// Next chunk, or `None` at a clean end of input.
    pub fn read_chunk(&mut self) -> Result<Option<CryptChunk>> {
        loop {
            if let Parsed::Chunk(chunk, used) = parse_chunk(&self.buf, self.offset)? {
                self.buf.drain(..used);
                self.offset += used as u64;
                return Ok(Some(chunk));
            }
            if self.eof {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(Error::Format {
                    what: "xbcrypt chunk",
                    offset: self.offset,
                    reason: format!("stream ends inside a chunk ({} bytes left)", self.buf.len()),
                }
                .into());
            }
            let start = self.buf.len();
            self.buf.resize(start + READ_BLOCK, 0);
            let n = loop {
                match self.inner.read(&mut self.buf[start..]) {
                    Ok(n) => break n,
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        self.buf.truncate(start);
                        return Err(e.into());
                    }
                }
            };
            self.buf.truncate(start + n);
            if n == 0 {
                self.eof = true;
            }
        }
    }
}

impl<R: Read> Iterator for CryptReader<R> {
    type Item = Result<CryptChunk>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read_chunk().transpose()
    }
}
