//! Where live redo log bytes come from.

use std::{
    fs::File,
    os::unix::fs::FileExt,
    path::{Path, PathBuf},
};

use tracing::debug;

use super::{latest_checkpoint, Checkpoint, LOG_FILE_HDR_SIZE, OS_FILE_LOG_BLOCK_SIZE};
use crate::{Error, Result};

/// Read access to the circular redo log of a running server.
pub trait LogSource: Send {
    /// Fill `buf` with log bytes starting at the block-aligned `lsn`,
    /// following the ring across file boundaries.
    fn read_log(&mut self, buf: &mut [u8], lsn: u64) -> Result<()>;

    /// Bytes of log data the ring holds before it wraps.
    fn capacity(&self) -> u64;

    /// Newest valid checkpoint, re-read from disk.
    fn latest_checkpoint(&mut self) -> Result<Checkpoint>;

    /// The raw header of the first log file.
    fn header(&mut self) -> Result<Vec<u8>>;
}

/// `ib_logfile0`, `ib_logfile1`, ... in a directory.
pub struct LogFiles {
    files: Vec<(PathBuf, File)>,
    file_size: u64,
    /// Any checkpoint pins the mapping between LSNs and file offsets.
    anchor: Checkpoint,
}

impl LogFiles {
    pub fn open(dir: &Path) -> Result<Self> {
        let mut files = Vec::new();
        let mut file_size = None;
        loop {
            let path = dir.join(format!("ib_logfile{}", files.len()));
            let file = match File::open(&path) {
                Ok(f) => f,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => break,
                Err(source) => {
                    return Err(Error::FileIo {
                        path: path.display().to_string(),
                        source,
                    }
                    .into())
                }
            };
            let len = file.metadata()?.len();
            match file_size {
                None => file_size = Some(len),
                Some(size) if size != len => {
                    return Err(Error::Config(format!(
                        "{} is {len} bytes, expected {size} like the other log files",
                        path.display()
                    ))
                    .into())
                }
                Some(_) => {}
            }
            files.push((path, file));
        }
        let Some(file_size) = file_size else {
            return Err(Error::Config(format!("no ib_logfile0 in {}", dir.display())).into());
        };
        if file_size <= LOG_FILE_HDR_SIZE || (file_size - LOG_FILE_HDR_SIZE) % OS_FILE_LOG_BLOCK_SIZE as u64 != 0 {
            return Err(Error::Config(format!("unsupported log file size {file_size}")).into());
        }

        let mut this = Self {
            files,
            file_size,
            anchor: Checkpoint {
                number: 0,
                lsn: 0,
                offset: LOG_FILE_HDR_SIZE,
            },
        };
        this.anchor = this.latest_checkpoint()?;
        debug!(
            files = this.files.len(),
            file_size,
            checkpoint_lsn = this.anchor.lsn,
            "opened redo log files"
        );
        Ok(this)
    }

    fn data_per_file(&self) -> u64 {
        self.file_size - LOG_FILE_HDR_SIZE
    }

    /// Offset of `lsn` in the concatenated files, headers included.
    fn real_offset(&self, lsn: u64) -> u64 {
        let per_file = self.data_per_file();
        let capacity = self.capacity();
        let anchor_file = self.anchor.offset / self.file_size;
        let anchor = self.anchor.offset - LOG_FILE_HDR_SIZE * (1 + anchor_file);

        let data_offset = if lsn >= self.anchor.lsn {
            (anchor + (lsn - self.anchor.lsn) % capacity) % capacity
        } else {
            (anchor + capacity - (self.anchor.lsn - lsn) % capacity) % capacity
        };
        data_offset + LOG_FILE_HDR_SIZE * (1 + data_offset / per_file)
    }
}

impl LogSource for LogFiles {
    fn read_log(&mut self, buf: &mut [u8], lsn: u64) -> Result<()> {
        let mut lsn = lsn;
        let mut done = 0;
        while done < buf.len() {
            let real = self.real_offset(lsn);
            let file_no = (real / self.file_size) as usize;
            let in_file = real % self.file_size;
            let len = ((self.file_size - in_file) as usize).min(buf.len() - done);
            let (path, file) = &self.files[file_no];
            file.read_exact_at(&mut buf[done..done + len], in_file)
                .map_err(|source| Error::FileIo {
                    path: path.display().to_string(),
                    source,
                })?;
            done += len;
            lsn += len as u64;
        }
        Ok(())
    }

    fn capacity(&self) -> u64 {
        self.data_per_file() * self.files.len() as u64
    }

    fn latest_checkpoint(&mut self) -> Result<Checkpoint> {
        let header = self.header()?;
        latest_checkpoint(&header).ok_or_else(|| {
            Error::Format {
                what: "redo log header",
                offset: 0,
                reason: "no valid checkpoint".into(),
            }
            .into()
        })
    }

    fn header(&mut self) -> Result<Vec<u8>> {
        let mut header = vec![0u8; LOG_FILE_HDR_SIZE as usize];
        let (path, file) = &self.files[0];
        file.read_exact_at(&mut header, 0)
            .map_err(|source| Error::FileIo {
                path: path.display().to_string(),
                source,
            })?;
        Ok(header)
    }
}
