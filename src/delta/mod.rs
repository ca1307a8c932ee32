//! Incremental delta files (`.delta`) and their `.meta` sidecar.
//!
//! A delta file is a sequence of clusters. Each cluster starts with a header
//! page: a 4-byte magic followed by big-endian page numbers, one per data
//! page stored in the following slots. `xtra` marks a full cluster with more
//! to come, `XTRA` the last one. A last cluster that is not full carries a
//! `0xFFFFFFFF` sentinel after its final page number.

use std::{
    fs::{File, OpenOptions},
    io::{self, Read},
    os::unix::fs::FileExt,
    path::Path,
};

use tracing::debug;

use crate::{datasink::Sink, page::UNIV_PAGE_SIZE_MAX, Error, Result};

pub const DELTA_MAGIC_MORE: &[u8; 4] = b"xtra";
pub const DELTA_MAGIC_FINAL: &[u8; 4] = b"XTRA";
pub const DELTA_END: u32 = 0xFFFF_FFFF;
pub const DELTA_SUFFIX: &str = ".delta";
pub const META_SUFFIX: &str = ".meta";

/// Contents of the `.meta` sidecar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeltaMeta {
    /// Logical page size.
    pub page_size: u64,
    /// Physical page size for compressed tablespaces, 0 otherwise.
    pub zip_size: u64,
    pub space_id: u32,
    pub space_flags: u32,
}

impl DeltaMeta {
    /// Size of one stored page.
    pub fn physical_page_size(&self) -> usize {
        if self.zip_size != 0 {
            self.zip_size as usize
        } else {
            self.page_size as usize
        }
    }

    pub fn to_text(&self) -> String {
        format!(
            "page_size = {}\nzip_size = {}\nspace_id = {}\nspace_flags = {}\n",
            self.page_size, self.zip_size, self.space_id, self.space_flags
        )
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut page_size = None;
        let mut zip_size = 0u64;
        let mut space_id = None;
        let mut space_flags = 0u32;
        for line in text.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.trim();
            let bad = || Error::Format {
                what: "delta meta",
                offset: 0,
                reason: format!("bad value for {}: {value:?}", key.trim()),
            };
            match key.trim() {
                "page_size" => page_size = Some(value.parse::<u64>().map_err(|_| bad())?),
                "zip_size" => zip_size = value.parse().map_err(|_| bad())?,
                "space_id" => space_id = Some(value.parse::<u32>().map_err(|_| bad())?),
                "space_flags" => space_flags = value.parse().map_err(|_| bad())?,
                _ => {}
            }
        }
        let (Some(page_size), Some(space_id)) = (page_size, space_id) else {
            return Err(Error::Format {
                what: "delta meta",
                offset: 0,
                reason: "page_size and space_id are required".into(),
            }
            .into());
        };
        let meta = Self {
            page_size,
            zip_size,
            space_id,
            space_flags,
        };
        let physical = meta.physical_page_size();
        if physical < 1024 || physical > UNIV_PAGE_SIZE_MAX || !physical.is_power_of_two() {
            return Err(Error::Format {
                what: "delta meta",
                offset: 0,
                reason: format!("unsupported page size {physical}"),
            }
            .into());
        }
        Ok(meta)
    }

    pub fn read(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| Error::FileIo {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&text)
    }
}

/// Accumulates changed pages into clusters and writes them to a sink.
pub struct DeltaWriter {
    page_size: usize,
    buf: Vec<u8>,
    /// Slots used in the current cluster, header page included.
    npages: usize,
    clusters: u64,
    pages: u64,
}

impl DeltaWriter {
    pub fn new(page_size: usize) -> Self {
        let mut buf = vec![0u8; (page_size / 4) * page_size];
        buf[..4].copy_from_slice(DELTA_MAGIC_MORE);
        Self {
            page_size,
            buf,
            npages: 1,
            clusters: 0,
            pages: 0,
        }
    }

    fn capacity(&self) -> usize {
        self.page_size / 4
    }

    /// Append one page. A full cluster is only flushed, as a "more"
    /// cluster, once another page arrives for the next one.
    pub fn push(&mut self, page_no: u32, page: &[u8], dst: &mut dyn Sink) -> Result<()> {
        debug_assert_eq!(page.len(), self.page_size);
        if self.npages == self.capacity() {
            self.buf[..4].copy_from_slice(DELTA_MAGIC_MORE);
            dst.write(&self.buf)?;
            self.clusters += 1;
            self.buf[..self.page_size].fill(0);
            self.npages = 1;
        }

        let slot = self.npages;
        self.buf[slot * 4..slot * 4 + 4].copy_from_slice(&page_no.to_be_bytes());
        self.buf[slot * self.page_size..(slot + 1) * self.page_size].copy_from_slice(page);
        self.npages += 1;
        self.pages += 1;
        Ok(())
    }

    /// Write the final cluster. Always emits at least its header page; the
    /// end marker is only stored when the cluster has a free slot.
    pub fn finish(&mut self, dst: &mut dyn Sink) -> Result<()> {
        if self.npages != self.capacity() {
            let slot = self.npages;
            self.buf[slot * 4..slot * 4 + 4].copy_from_slice(&DELTA_END.to_be_bytes());
        }
        self.buf[..4].copy_from_slice(DELTA_MAGIC_FINAL);
        dst.write(&self.buf[..self.npages * self.page_size])?;
        self.clusters += 1;
        debug!(
            clusters = self.clusters,
            pages = self.pages,
            "delta finished"
        );
        Ok(())
    }

    pub fn pages_written(&self) -> u64 {
        self.pages
    }
}

/// Sequential reader over the entries of a delta file.
pub struct DeltaReader<R> {
    inner: R,
    page_size: usize,
    header: Vec<u8>,
    /// Next header slot to return; 0 when a new header must be read.
    slot: usize,
    offset: u64,
    done: bool,
}

fn read_full<R: Read>(r: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

impl<R: Read> DeltaReader<R> {
    pub fn new(inner: R, page_size: usize) -> Self {
        Self {
            inner,
            page_size,
            header: vec![0u8; page_size],
            slot: 0,
            offset: 0,
            done: false,
        }
    }

    fn invalid(&self, reason: impl Into<String>) -> anyhow::Error {
        Error::Format {
            what: "delta file",
            offset: self.offset,
            reason: reason.into(),
        }
        .into()
    }

    fn read_block(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = read_full(&mut self.inner, buf)?;
        self.offset += n as u64;
        Ok(n)
    }

    /// Next `(page_no, page)` entry, or `None` after the final cluster.
    pub fn next_page(&mut self) -> Result<Option<(u32, Vec<u8>)>> {
        loop {
            if self.done {
                return Ok(None);
            }
            if self.slot == 0 {
                let mut header = std::mem::take(&mut self.header);
                let n = self.read_block(&mut header)?;
                self.header = header;
                if n != self.page_size {
                    return Err(self.invalid("truncated cluster header"));
                }
                let magic = &self.header[..4];
                if magic != DELTA_MAGIC_MORE && magic != DELTA_MAGIC_FINAL {
                    return Err(self.invalid("bad cluster magic"));
                }
                self.slot = 1;
            }

            let capacity = self.page_size / 4;
            let is_final = &self.header[..4] == DELTA_MAGIC_FINAL;
            if self.slot == capacity {
                self.slot = 0;
                if is_final {
                    self.done = true;
                }
                continue;
            }

            let at = self.slot * 4;
            let page_no = u32::from_be_bytes([
                self.header[at],
                self.header[at + 1],
                self.header[at + 2],
                self.header[at + 3],
            ]);
            if page_no == DELTA_END {
                if !is_final {
                    return Err(self.invalid("end marker inside a non-final cluster"));
                }
                self.done = true;
                return Ok(None);
            }

            let mut page = vec![0u8; self.page_size];
            if self.read_block(&mut page)? != self.page_size {
                return Err(self.invalid(format!("truncated page {page_no}")));
            }
            self.slot += 1;
            return Ok(Some((page_no, page)));
        }
    }
}

impl<R: Read> Iterator for DeltaReader<R> {
    type Item = Result<(u32, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_page().transpose()
    }
}

/// Apply `delta` to `base`. Every entry is an absolute-offset page write, so
/// applying the same delta again leaves the file unchanged. Returns the
/// number of pages written.
pub fn apply_delta(base: &Path, delta: &Path, meta: &DeltaMeta) -> Result<u64> {
    let page_size = meta.physical_page_size();
    let target = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(base)
        .map_err(|source| Error::FileIo {
            path: base.display().to_string(),
            source,
        })?;
    let source = File::open(delta).map_err(|source| Error::FileIo {
        path: delta.display().to_string(),
        source,
    })?;

    let mut applied = 0u64;
    for entry in DeltaReader::new(io::BufReader::new(source), page_size) {
        let (page_no, page) = entry?;
        target.write_all_at(&page, u64::from(page_no) * page_size as u64)?;
        applied += 1;
    }
    target.sync_all()?;
    debug!(base = %base.display(), applied, "delta applied");
    Ok(applied)
}
