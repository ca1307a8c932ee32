//! Read filters: decide which byte range of a tablespace to read next.
//!
//! All variants hand out page-aligned `(offset, len)` batches capped at the
//! cursor's buffer capacity; a zero length means the file is done. State only
//! advances through [`ReadFilterCtx::update`], which the cursor calls after a
//! batch was read and verified, so a retried batch is re-read unchanged.

use std::sync::Arc;

use crate::changed::{ChangedPageBitmap, PageTracking};

/// Which pages of each tablespace to copy.
#[derive(Debug, Clone, Default)]
pub enum ReadFilter {
    /// Every page.
    #[default]
    PassThrough,
    /// Pages set in a changed-page bitmap.
    Bitmap(Arc<ChangedPageBitmap>),
    /// Pages reported by the engine's page tracking.
    PageTracking(Arc<PageTracking>),
}

#[derive(Debug)]
enum FilterState {
    PassThrough,
    Bitmap {
        bitmap: Arc<ChangedPageBitmap>,
        /// End page (exclusive) of the current changed run.
        run_end: u64,
    },
    Tracking {
        tracking: Arc<PageTracking>,
        run_end: u64,
    },
}

/// Per-file read filter state.
#[derive(Debug)]
pub struct ReadFilterCtx {
    state: FilterState,
    space_id: u32,
    page_size: u64,
    offset: u64,
    data_file_size: u64,
    buffer_capacity: u64,
}

impl ReadFilterCtx {
    pub fn init(
        filter: &ReadFilter,
        space_id: u32,
        page_size: usize,
        data_file_size: u64,
        buffer_capacity: usize,
    ) -> Self {
        let state = match filter {
            ReadFilter::PassThrough => FilterState::PassThrough,
            ReadFilter::Bitmap(bitmap) => FilterState::Bitmap {
                bitmap: Arc::clone(bitmap),
                run_end: 0,
            },
            ReadFilter::PageTracking(tracking) if tracking.needs_full_scan(space_id) => {
                FilterState::PassThrough
            }
            ReadFilter::PageTracking(tracking) => FilterState::Tracking {
                tracking: Arc::clone(tracking),
                run_end: 0,
            },
        };
        let page_size = page_size as u64;
        Self {
            state,
            space_id,
            page_size,
            offset: 0,
            data_file_size,
            // Never less than one page so that progress is always possible.
            buffer_capacity: (buffer_capacity as u64 / page_size).max(1) * page_size,
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Next range to read; `len == 0` signals end of file.
    pub fn get_next_batch(&mut self) -> (u64, u64) {
        let page_size = self.page_size;
        let max_pages = self.buffer_capacity / page_size;
        let space_id = self.space_id;

        let run_end = match &mut self.state {
            FilterState::PassThrough => None,
            FilterState::Bitmap { bitmap, run_end } => {
                let page = self.offset / page_size;
                if page >= *run_end {
                    match bitmap.next_run(space_id, page, max_pages) {
                        Some(run) => {
                            self.offset = run.start * page_size;
                            *run_end = run.end;
                        }
                        None => return (self.offset, 0),
                    }
                }
                Some(*run_end)
            }
            FilterState::Tracking { tracking, run_end } => {
                let page = self.offset / page_size;
                if page >= *run_end {
                    match tracking.next_run(space_id, page, max_pages) {
                        Some(run) => {
                            self.offset = run.start * page_size;
                            *run_end = run.end;
                        }
                        None => return (self.offset, 0),
                    }
                }
                Some(*run_end)
            }
        };

        if self.offset >= self.data_file_size {
            return (self.offset, 0);
        }
        let mut len = self.data_file_size - self.offset;
        if let Some(end) = run_end {
            len = len.min(end * page_size - self.offset);
        }
        (self.offset, len.min(self.buffer_capacity))
    }

    /// Record that `len` bytes starting at the current offset were consumed.
    pub fn update(&mut self, len: u64) {
        self.offset += len;
    }
}
