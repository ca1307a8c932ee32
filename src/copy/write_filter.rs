//! Write filters: what reaches the destination for each batch read by the
//! cursor.

use tracing::{debug, warn};

use super::{cursor::Cursor, CopySinks};
use crate::{
    datasink::{self, Datasink, Sink},
    delta::{DeltaMeta, DeltaWriter, DELTA_SUFFIX, META_SUFFIX},
    page::{self, FIL_PAGE_INDEX, FIRST_CLUSTERED_INDEX_PAGE_NO, PAGE_BTR_SEG_TOP, PAGE_HEADER, PAGE_INDEX_ID},
    Result,
};

pub const PAGE_MAP_SUFFIX: &str = ".pmap";

/// Selected write filter, shared by every file of a backup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteFilterKind {
    #[default]
    WriteThrough,
    /// Keep only pages with an LSN above `baseline_lsn`, in delta format.
    Incremental { baseline_lsn: u64 },
    /// Drop secondary index pages and record them in a page map.
    Compact,
}

/// Per-file write filter state.
pub enum WriteFilter {
    WriteThrough,
    Incremental {
        baseline_lsn: u64,
        writer: DeltaWriter,
    },
    Compact(CompactFilter),
}

impl WriteFilter {
    /// Set up the filter for the file behind `cursor`. Returns the filter and
    /// the name the data file must be opened under in `sinks.data`.
    pub fn init(
        kind: WriteFilterKind,
        cursor: &Cursor,
        dst_name: &str,
        sinks: CopySinks<'_>,
    ) -> Result<(Self, String)> {
        match kind {
            WriteFilterKind::WriteThrough => Ok((WriteFilter::WriteThrough, dst_name.to_string())),
            WriteFilterKind::Incremental { baseline_lsn } => {
                let page_size = cursor.page_size();
                let meta = DeltaMeta {
                    page_size: page_size.logical as u64,
                    zip_size: if page_size.is_compressed() {
                        page_size.physical as u64
                    } else {
                        0
                    },
                    space_id: cursor.space_id(),
                    space_flags: cursor.space_flags(),
                };
                datasink::write_file(
                    sinks.meta,
                    &format!("{dst_name}{META_SUFFIX}"),
                    meta.to_text().as_bytes(),
                )?;
                Ok((
                    WriteFilter::Incremental {
                        baseline_lsn,
                        writer: DeltaWriter::new(page_size.physical),
                    },
                    format!("{dst_name}{DELTA_SUFFIX}"),
                ))
            }
            WriteFilterKind::Compact => Ok((
                WriteFilter::Compact(CompactFilter::init(cursor, dst_name, sinks.meta)?),
                dst_name.to_string(),
            )),
        }
    }

    /// Run the last batch of `cursor` through the filter. Returns the number
    /// of data bytes written to `dst`.
    pub fn process(&mut self, cursor: &Cursor, dst: &mut dyn Sink) -> Result<u64> {
        match self {
            WriteFilter::WriteThrough => {
                dst.write(cursor.batch())?;
                Ok(cursor.batch().len() as u64)
            }
            WriteFilter::Incremental {
                baseline_lsn,
                writer,
            } => {
                let physical = cursor.page_size().physical;
                let first = cursor.batch_page_no();
                let before = writer.pages_written();
                for (i, page) in cursor.batch().chunks_exact(physical).enumerate() {
                    if page::page_lsn(page) <= *baseline_lsn {
                        continue;
                    }
                    writer.push((first + i as u64) as u32, page, dst)?;
                }
                Ok((writer.pages_written() - before) * physical as u64)
            }
            WriteFilter::Compact(compact) => compact.process(cursor, dst),
        }
    }

    /// Flush whatever the filter still holds once the cursor is exhausted.
    pub fn finalize(&mut self, cursor: &Cursor, dst: &mut dyn Sink) -> Result<()> {
        match self {
            WriteFilter::WriteThrough => Ok(()),
            WriteFilter::Incremental { writer, .. } => {
                writer.finish(dst)?;
                debug!(
                    path = cursor.rel_path(),
                    pages = writer.pages_written(),
                    "incremental delta written"
                );
                Ok(())
            }
            WriteFilter::Compact(compact) => compact.finalize(cursor),
        }
    }
}

/// Compact filter state for one tablespace.
pub struct CompactFilter {
    /// Set for the system tablespace and for spaces whose clustered index
    /// root cannot be identified: everything is copied.
    skip: bool,
    free_limit: u64,
    clustered_index: Option<u64>,
    inside_skipped_range: bool,
    page_map: Option<Box<dyn Sink>>,
    skipped_pages: u64,
}

impl CompactFilter {
    fn init(cursor: &Cursor, dst_name: &str, datasink: &dyn Datasink) -> Result<Self> {
        let skip = cursor.is_system();
        let page_map = if skip {
            None
        } else {
            Some(datasink.open(&format!("{dst_name}{PAGE_MAP_SUFFIX}"))?)
        };
        Ok(Self {
            skip,
            free_limit: 0,
            clustered_index: None,
            inside_skipped_range: false,
            page_map,
            skipped_pages: 0,
        })
    }

    pub fn skipped_pages(&self) -> u64 {
        self.skipped_pages
    }

    fn write_endpoint(&mut self, page_no: u64) -> Result<()> {
        if let Some(map) = self.page_map.as_mut() {
            map.write(&(page_no as u32).to_be_bytes())?;
        }
        Ok(())
    }

    fn should_skip(&mut self, cursor: &Cursor, page: &[u8], page_no: u64) -> bool {
        let page_type = page::page_type(page);

        if page_no == 0 {
            self.free_limit = u64::from(page::fsp_free_limit(page));
        } else if page_no == FIRST_CLUSTERED_INDEX_PAGE_NO {
            if page_type != FIL_PAGE_INDEX {
                warn!(
                    path = cursor.rel_path(),
                    page_type,
                    "clustered index root page is uninitialized, space will not be compacted"
                );
                self.skip = true;
                return false;
            }
            self.clustered_index = Some(page::read_u64(page, PAGE_HEADER + PAGE_INDEX_ID));
        } else if page_no >= self.free_limit {
            // Pages above the free limit were never initialised.
            return self.free_limit > 0;
        } else if let Some(clustered) = self.clustered_index {
            if page_type == FIL_PAGE_INDEX
                && page::read_u64(page, PAGE_HEADER + PAGE_INDEX_ID) != clustered
            {
                // Root pages carry a segment header and must be kept.
                let seg = PAGE_HEADER + PAGE_BTR_SEG_TOP;
                return page::read_u32(page, seg) == 0
                    && page::read_u32(page, seg + 4) == 0
                    && page::read_u16(page, seg + 8) == 0;
            }
        }
        false
    }

    fn process(&mut self, cursor: &Cursor, dst: &mut dyn Sink) -> Result<u64> {
        let batch = cursor.batch();
        if self.skip {
            dst.write(batch)?;
            return Ok(batch.len() as u64);
        }

        let physical = cursor.page_size().physical;
        let first = cursor.batch_page_no();
        let mut written = 0u64;
        let mut write_from: Option<usize> = None;

        for (i, page) in batch.chunks_exact(physical).enumerate() {
            let page_no = first + i as u64;
            let at = i * physical;

            // The page-3 check may switch compaction off mid-batch.
            if self.skip || !self.should_skip(cursor, page, page_no) {
                write_from.get_or_insert(at);
                if self.inside_skipped_range {
                    self.inside_skipped_range = false;
                    self.write_endpoint(page_no - 1)?;
                }
                continue;
            }

            if let Some(from) = write_from.take() {
                dst.write(&batch[from..at])?;
                written += (at - from) as u64;
            }
            if !self.inside_skipped_range {
                self.inside_skipped_range = true;
                self.write_endpoint(page_no)?;
            }
            self.skipped_pages += 1;
        }

        if let Some(from) = write_from {
            dst.write(&batch[from..])?;
            written += (batch.len() - from) as u64;
        }
        Ok(written)
    }

    fn finalize(&mut self, cursor: &Cursor) -> Result<()> {
        if self.inside_skipped_range {
            self.write_endpoint(cursor.space_size().saturating_sub(1))?;
            self.inside_skipped_range = false;
        }
        if let Some(map) = self.page_map.take() {
            map.close()?;
        }
        if self.skipped_pages > 0 {
            debug!(
                path = cursor.rel_path(),
                skipped = self.skipped_pages,
                "compacted tablespace"
            );
        }
        Ok(())
    }
}
