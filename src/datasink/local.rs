//! Datasinks backed by the local filesystem and by stdout.

use std::{
    fs::{self, File, OpenOptions},
    io::{self, BufWriter, Write},
    path::{Component, Path, PathBuf},
};

use tracing::debug;

use super::{Datasink, Sink};
use crate::{Error, Result};

/// Writes files below a target directory, creating parents as needed.
#[derive(Debug, Clone)]
pub struct LocalDatasink {
    root: PathBuf,
}

impl LocalDatasink {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let rel = Path::new(path);
        let safe = rel
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if !safe {
            return Err(Error::Config(format!("refusing to write outside target: {path}")).into());
        }
        Ok(self.root.join(rel))
    }
}

struct LocalFile {
    path: String,
    writer: BufWriter<File>,
}

impl Sink for LocalFile {
    fn path(&self) -> &str {
        &self.path
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        self.writer
            .write_all(buf)
            .map_err(|source| Error::FileIo {
                path: self.path.clone(),
                source,
            })?;
        Ok(())
    }

    fn close(mut self: Box<Self>) -> Result<()> {
        self.writer.flush().map_err(|source| Error::FileIo {
            path: self.path.clone(),
            source,
        })?;
        Ok(())
    }
}

impl Datasink for LocalDatasink {
    fn open(&self, path: &str) -> Result<Box<dyn Sink>> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&full)
            .map_err(|source| Error::FileIo {
                path: full.display().to_string(),
                source,
            })?;
        debug!(path = %full.display(), "opened local output");
        Ok(Box::new(LocalFile {
            path: path.to_string(),
            writer: BufWriter::new(file),
        }))
    }

    fn remove(&self, path: &str) -> Result<()> {
        let full = self.resolve(path)?;
        match fs::remove_file(&full) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Sends every opened file to stdout. Only meaningful underneath a stream
/// container, which opens exactly one destination.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdoutDatasink;

struct StdoutFile {
    path: String,
}

impl Sink for StdoutFile {
    fn path(&self) -> &str {
        &self.path
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        io::stdout().lock().write_all(buf)?;
        Ok(())
    }

    fn close(self: Box<Self>) -> Result<()> {
        io::stdout().lock().flush()?;
        Ok(())
    }
}

impl Datasink for StdoutDatasink {
    fn open(&self, path: &str) -> Result<Box<dyn Sink>> {
        Ok(Box::new(StdoutFile {
            path: path.to_string(),
        }))
    }
}

/// Sends every opened file to one fixed path. Used where a codec runs over a
/// single input and the output name is given by the caller.
#[derive(Debug, Clone)]
pub struct FileDatasink {
    path: PathBuf,
}

impl FileDatasink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Datasink for FileDatasink {
    fn open(&self, _path: &str) -> Result<Box<dyn Sink>> {
        let file = File::create(&self.path).map_err(|source| Error::FileIo {
            path: self.path.display().to_string(),
            source,
        })?;
        Ok(Box::new(LocalFile {
            path: self.path.display().to_string(),
            writer: BufWriter::new(file),
        }))
    }
}
