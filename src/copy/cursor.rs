//! Tablespace file cursor.
//!
//! Reads page-aligned batches chosen by the read filter into a private
//! buffer and verifies every page checksum. Any corrupted page makes the
//! whole batch be read again, up to a bounded number of attempts; pages of
//! the doublewrite buffer in the system tablespace are exempt from checks.

use std::{
    fs::File,
    io,
    os::unix::fs::FileExt,
    path::Path,
    thread,
    time::Duration,
};

use tracing::{debug, warn};

use super::{read_filter::ReadFilterCtx, throttle::Throttle, ReadFilter};
use crate::{
    page::{
        self, checksum, is_doublewrite_page, PageSize, FSP_HEADER_OFFSET, FSP_SPACE_FLAGS,
        TRX_SYS_SPACE, UNIV_PAGE_SIZE_ORIG,
    },
    Error, Result,
};

/// Positional reads over a tablespace. Implemented for [`File`]; tests plug
/// in sources that misbehave on purpose.
pub trait PageSource: Send {
    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> io::Result<usize>;
    fn size(&mut self) -> io::Result<u64>;
}

impl PageSource for File {
    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        FileExt::read_at(self, buf, offset)
    }

    fn size(&mut self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }
}

#[derive(Debug, Clone)]
pub struct CursorOptions {
    /// Batch buffer size in pages.
    pub buffer_pages: usize,
    /// Read attempts per batch before corruption is fatal.
    pub retries: u32,
    pub retry_backoff: Duration,
    /// `innodb_page_size` of the server, used for the system tablespace.
    pub server_page_size: usize,
}

impl Default for CursorOptions {
    fn default() -> Self {
        Self {
            buffer_pages: 64,
            retries: 10,
            retry_backoff: Duration::from_millis(100),
            server_page_size: UNIV_PAGE_SIZE_ORIG,
        }
    }
}

/// Space id and page sizes read from the first page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpaceHeader {
    pub space_id: u32,
    pub flags: u32,
    pub page_size: PageSize,
}

fn read_full(source: &mut dyn PageSource, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match source.read_at(&mut buf[filled..], offset + filled as u64) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Read the space id and flags from the header of page 0. Files too short
/// to hold a header are treated as empty tablespaces of the server page size.
pub fn read_space_header(
    source: &mut dyn PageSource,
    server_page_size: usize,
) -> io::Result<SpaceHeader> {
    let mut head = [0u8; FSP_HEADER_OFFSET + FSP_SPACE_FLAGS + 4];
    let n = read_full(source, &mut head, 0)?;
    if n < head.len() {
        return Ok(SpaceHeader {
            space_id: 0,
            flags: 0,
            page_size: PageSize::uncompressed(server_page_size),
        });
    }
    let space_id = page::read_u32(&head, page::FIL_PAGE_SPACE_ID);
    let flags = page::fsp_flags(&head);
    let page_size = if space_id == TRX_SYS_SPACE {
        PageSize::uncompressed(server_page_size)
    } else {
        PageSize::from_flags(flags, server_page_size)
    };
    Ok(SpaceHeader {
        space_id,
        flags,
        page_size,
    })
}

#[cfg(target_os = "linux")]
fn advise_sequential(file: &File) {
    use std::os::fd::AsRawFd;
    // Advisory only; failure changes nothing but read-ahead behaviour.
    unsafe {
        libc::posix_fadvise(file.as_raw_fd(), 0, 0, libc::POSIX_FADV_SEQUENTIAL);
    }
}

#[cfg(not(target_os = "linux"))]
fn advise_sequential(_file: &File) {}

pub struct Cursor {
    source: Box<dyn PageSource>,
    rel_path: String,
    header: SpaceHeader,
    opts: CursorOptions,
    filter: ReadFilterCtx,
    data_file_size: u64,
    buf: Vec<u8>,
    buf_read: usize,
    buf_offset: u64,
    retries_used: u32,
    pages_read: u64,
}

impl Cursor {
    /// Open a tablespace file. Returns `Ok(None)` when the file no longer
    /// exists, which happens when a table is dropped during the backup.
    pub fn open(
        path: &Path,
        rel_path: &str,
        filter: &ReadFilter,
        opts: &CursorOptions,
    ) -> Result<Option<Self>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(Error::FileIo {
                    path: path.display().to_string(),
                    source,
                }
                .into())
            }
        };
        advise_sequential(&file);
        Self::from_source(Box::new(file), rel_path, filter, opts).map(Some)
    }

    pub fn from_source(
        mut source: Box<dyn PageSource>,
        rel_path: &str,
        filter: &ReadFilter,
        opts: &CursorOptions,
    ) -> Result<Self> {
        let io_err = |source| Error::FileIo {
            path: rel_path.to_string(),
            source,
        };
        let header = read_space_header(source.as_mut(), opts.server_page_size).map_err(io_err)?;
        let data_file_size = source.size().map_err(io_err)?;
        let physical = header.page_size.physical;
        let capacity = opts.buffer_pages.max(1) * physical;
        let filter =
            ReadFilterCtx::init(filter, header.space_id, physical, data_file_size, capacity);

        debug!(
            path = rel_path,
            space_id = header.space_id,
            page_size = physical,
            size = data_file_size,
            "cursor opened"
        );
        Ok(Self {
            source,
            rel_path: rel_path.to_string(),
            header,
            opts: opts.clone(),
            filter,
            data_file_size,
            buf: vec![0u8; capacity],
            buf_read: 0,
            buf_offset: 0,
            retries_used: 0,
            pages_read: 0,
        })
    }

    pub fn rel_path(&self) -> &str {
        &self.rel_path
    }

    pub fn space_id(&self) -> u32 {
        self.header.space_id
    }

    pub fn space_flags(&self) -> u32 {
        self.header.flags
    }

    pub fn page_size(&self) -> PageSize {
        self.header.page_size
    }

    /// Shared tablespaces are never compacted.
    pub fn is_system(&self) -> bool {
        page::is_system_space(self.header.space_id)
    }

    /// Number of whole pages in the file when it was opened.
    pub fn space_size(&self) -> u64 {
        self.data_file_size / self.header.page_size.physical as u64
    }

    /// Bytes of the last batch.
    pub fn batch(&self) -> &[u8] {
        &self.buf[..self.buf_read]
    }

    /// Page number of the first page of the last batch.
    pub fn batch_page_no(&self) -> u64 {
        self.buf_offset / self.header.page_size.physical as u64
    }

    pub fn batch_offset(&self) -> u64 {
        self.buf_offset
    }

    pub fn pages_read(&self) -> u64 {
        self.pages_read
    }

    /// Re-reads caused by corruption over the cursor's lifetime.
    pub fn retries_used(&self) -> u32 {
        self.retries_used
    }

    /// Returns the first page of `batch` that fails verification.
    fn find_corrupted(&self, batch: &[u8], first_page: u64) -> Option<u64> {
        let physical = self.header.page_size.physical;
        for (i, page) in batch.chunks_exact(physical).enumerate() {
            let page_no = first_page + i as u64;
            if self.header.space_id == TRX_SYS_SPACE
                && is_doublewrite_page(page_no, self.header.page_size.logical)
            {
                continue;
            }
            if checksum::is_corrupted(page, self.header.page_size) {
                return Some(page_no);
            }
        }
        None
    }

    /// Read the next batch. Returns `Ok(false)` at end of file.
    pub fn read_batch(&mut self, throttle: &Throttle) -> Result<bool> {
        let physical = self.header.page_size.physical as u64;
        let (offset, len) = self.filter.get_next_batch();
        let len = (len.min(self.buf.len() as u64) / physical * physical) as usize;
        if len == 0 {
            if offset < self.data_file_size && self.data_file_size - offset < physical {
                warn!(
                    path = %self.rel_path,
                    offset,
                    size = self.data_file_size,
                    "ignoring trailing partial page"
                );
            }
            self.buf_read = 0;
            return Ok(false);
        }

        let first_page = offset / physical;
        let mut attempts_left = self.opts.retries.max(1);
        loop {
            throttle.acquire();
            let n = {
                let buf = &mut self.buf[..len];
                read_full(self.source.as_mut(), buf, offset).map_err(|source| Error::FileIo {
                    path: self.rel_path.clone(),
                    source,
                })?
            };
            let n = n / physical as usize * physical as usize;
            if n == 0 {
                // The file shrank under us.
                self.buf_read = 0;
                return Ok(false);
            }

            match self.find_corrupted(&self.buf[..n], first_page) {
                None => {
                    self.buf_read = n;
                    self.buf_offset = offset;
                    self.pages_read += n as u64 / physical;
                    self.filter.update(n as u64);
                    return Ok(true);
                }
                Some(page_no) => {
                    attempts_left -= 1;
                    if attempts_left == 0 {
                        return Err(Error::Corruption {
                            path: self.rel_path.clone(),
                            offset: page_no * physical,
                            page_no,
                        }
                        .into());
                    }
                    self.retries_used += 1;
                    warn!(
                        path = %self.rel_path,
                        page_no,
                        attempts_left,
                        "page checksum mismatch, re-reading batch"
                    );
                    thread::sleep(self.opts.retry_backoff);
                }
            }
        }
    }
}
