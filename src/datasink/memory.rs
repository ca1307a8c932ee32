//! In-memory datasink, handy for assembling small metadata files and for
//! inspecting output without touching disk.

use std::{collections::BTreeMap, sync::Arc};

use parking_lot::Mutex;

use super::{Datasink, Sink};
use crate::Result;

#[derive(Debug, Default, Clone)]
pub struct MemoryDatasink {
    files: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
}

impl MemoryDatasink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Contents of a closed file.
    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.files.lock().get(path).cloned()
    }

    pub fn paths(&self) -> Vec<String> {
        self.files.lock().keys().cloned().collect()
    }
}

struct MemoryFile {
    path: String,
    buf: Vec<u8>,
    files: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
}

impl Sink for MemoryFile {
    fn path(&self) -> &str {
        &self.path
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        self.buf.extend_from_slice(buf);
        Ok(())
    }

    fn close(self: Box<Self>) -> Result<()> {
        let MemoryFile { path, buf, files } = *self;
        files.lock().insert(path, buf);
        Ok(())
    }
}

impl Datasink for MemoryDatasink {
    fn open(&self, path: &str) -> Result<Box<dyn Sink>> {
        Ok(Box::new(MemoryFile {
            path: path.to_string(),
            buf: Vec::new(),
            files: Arc::clone(&self.files),
        }))
    }

    fn remove(&self, path: &str) -> Result<()> {
        self.files.lock().remove(path);
        Ok(())
    }
}
