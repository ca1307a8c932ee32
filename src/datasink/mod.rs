//! Destination sinks.
//!
//! A [`Datasink`] opens named output files; each open file is a [`Sink`]
//! accepting ordered `write` calls. Codecs (xbstream, xbcrypt, compression)
//! are themselves datasinks that pipe into another one, so an output chain
//! is assembled by nesting them.

use crate::Result;

pub mod local;
pub mod memory;

pub use local::{FileDatasink, LocalDatasink, StdoutDatasink};
pub use memory::MemoryDatasink;

/// One open output file.
pub trait Sink: Send {
    /// Path the file was opened under, after any suffix the sink appended.
    fn path(&self) -> &str;

    fn write(&mut self, buf: &[u8]) -> Result<()>;

    /// Flush pending data and release the file.
    fn close(self: Box<Self>) -> Result<()>;
}

/// Factory of output files.
pub trait Datasink: Send + Sync {
    fn open(&self, path: &str) -> Result<Box<dyn Sink>>;

    /// Delete a file written earlier. Sinks that cannot take data back (for
    /// example a stream already sent downstream) leave it in place.
    fn remove(&self, _path: &str) -> Result<()> {
        Ok(())
    }

    /// Flush state shared between files, once all files are closed.
    fn finish(&self) -> Result<()> {
        Ok(())
    }
}

/// Open `path` on `sink`, write `data` and close it.
pub fn write_file(sink: &dyn Datasink, path: &str, data: &[u8]) -> Result<()> {
    let mut file = sink.open(path)?;
    file.write(data)?;
    file.close()
}
