//! Parallel tablespace copy.
//!
//! A fixed number of worker threads drain a shared queue of tablespaces.
//! Each worker owns the cursor and write filter of its current file and
//! streams it to the datasink. The first fatal error stops every worker at
//! its next batch and is returned to the caller; there is no partial result.

pub mod cursor;
pub mod read_filter;
pub mod throttle;
pub mod write_filter;

use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Instant,
};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error};

pub use cursor::{Cursor, CursorOptions, PageSource};
pub use read_filter::{ReadFilter, ReadFilterCtx};
pub use throttle::Throttle;
pub use write_filter::{WriteFilter, WriteFilterKind, PAGE_MAP_SUFFIX};

use crate::{
    datasink::Datasink,
    delta::META_SUFFIX,
    logging::{self, CopySnapshot},
    Error, Result,
};

/// One data file to copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tablespace {
    pub path: PathBuf,
    /// Name of the copy inside the backup.
    pub rel_path: String,
}

#[derive(Debug, Clone)]
pub struct CopyOptions {
    pub threads: usize,
    pub cursor: CursorOptions,
    pub read_filter: ReadFilter,
    pub write_filter: WriteFilterKind,
    /// Read iterations per second across all workers; 0 is unlimited.
    pub throttle: u64,
    /// Set from outside to stop all workers at their next batch.
    pub cancel: Option<Arc<AtomicBool>>,
}

impl Default for CopyOptions {
    fn default() -> Self {
        Self {
            threads: 1,
            cursor: CursorOptions::default(),
            read_filter: ReadFilter::PassThrough,
            write_filter: WriteFilterKind::WriteThrough,
            throttle: 0,
            cancel: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOutcome {
    Copied,
    /// The tablespace was dropped before or while it was copied.
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileReport {
    pub rel_path: String,
    pub space_id: Option<u32>,
    pub outcome: FileOutcome,
    pub pages_read: u64,
    pub bytes_written: u64,
    pub retries: u32,
}

impl FileReport {
    fn skipped(rel_path: &str, space_id: Option<u32>) -> Self {
        Self {
            rel_path: rel_path.to_string(),
            space_id,
            outcome: FileOutcome::Skipped,
            pages_read: 0,
            bytes_written: 0,
            retries: 0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CopyReport {
    /// Sorted by `rel_path`.
    pub files: Vec<FileReport>,
}

impl CopyReport {
    pub fn copied(&self) -> impl Iterator<Item = &FileReport> {
        self.files
            .iter()
            .filter(|f| f.outcome == FileOutcome::Copied)
    }

    pub fn skipped(&self) -> impl Iterator<Item = &FileReport> {
        self.files
            .iter()
            .filter(|f| f.outcome == FileOutcome::Skipped)
    }

    pub fn bytes_written(&self) -> u64 {
        self.files.iter().map(|f| f.bytes_written).sum()
    }
}

/// Destinations of a copy. Page data goes to `data`; sidecar files (delta
/// metadata, page maps) skip compression and go to `meta`.
#[derive(Clone, Copy)]
pub struct CopySinks<'a> {
    pub data: &'a dyn Datasink,
    pub meta: &'a dyn Datasink,
}

impl<'a> CopySinks<'a> {
    /// Data and sidecars written to the same datasink.
    pub fn single(datasink: &'a dyn Datasink) -> Self {
        Self {
            data: datasink,
            meta: datasink,
        }
    }
}

fn sidecar_of(kind: WriteFilterKind, rel_path: &str) -> Option<String> {
    match kind {
        WriteFilterKind::WriteThrough => None,
        WriteFilterKind::Incremental { .. } => Some(format!("{rel_path}{META_SUFFIX}")),
        WriteFilterKind::Compact => Some(format!("{rel_path}{PAGE_MAP_SUFFIX}")),
    }
}

/// Copy one tablespace to `sinks`, checking `abort` before every batch.
pub fn copy_file(
    ts: &Tablespace,
    opts: &CopyOptions,
    sinks: CopySinks<'_>,
    throttle: &Throttle,
    abort: &AtomicBool,
    worker: usize,
) -> Result<FileReport> {
    let started = Instant::now();
    let Some(mut cursor) = Cursor::open(&ts.path, &ts.rel_path, &opts.read_filter, &opts.cursor)?
    else {
        logging::log_copy_skipped(worker, &ts.rel_path, "file no longer exists");
        return Ok(FileReport::skipped(&ts.rel_path, None));
    };

    let (mut filter, data_name) =
        WriteFilter::init(opts.write_filter, &cursor, &ts.rel_path, sinks)?;
    let mut dst = sinks.data.open(&data_name)?;
    debug!(worker, path = %ts.rel_path, dest = dst.path(), "copying");

    let mut bytes_written = 0u64;
    loop {
        if abort.load(Ordering::Acquire) {
            return Err(Error::Aborted(format!("copy of {} interrupted", ts.rel_path)).into());
        }
        if !cursor.read_batch(throttle)? {
            break;
        }
        bytes_written += filter.process(&cursor, dst.as_mut())?;
    }
    filter.finalize(&cursor, dst.as_mut())?;
    dst.close()?;

    if !ts.path.exists() {
        sinks.data.remove(&data_name)?;
        if let Some(name) = sidecar_of(opts.write_filter, &ts.rel_path) {
            sinks.meta.remove(&name)?;
        }
        logging::log_copy_skipped(worker, &ts.rel_path, "dropped during copy");
        return Ok(FileReport::skipped(&ts.rel_path, Some(cursor.space_id())));
    }

    logging::log_copy_done(&CopySnapshot {
        worker,
        path: ts.rel_path.clone(),
        space_id: cursor.space_id(),
        pages_read: cursor.pages_read(),
        bytes_written,
        retries: cursor.retries_used(),
        elapsed: started.elapsed(),
    });
    Ok(FileReport {
        rel_path: ts.rel_path.clone(),
        space_id: Some(cursor.space_id()),
        outcome: FileOutcome::Copied,
        pages_read: cursor.pages_read(),
        bytes_written,
        retries: cursor.retries_used(),
    })
}

/// Copy all `files` with `opts.threads` workers.
pub fn copy_files(
    files: Vec<Tablespace>,
    sinks: CopySinks<'_>,
    opts: &CopyOptions,
) -> Result<CopyReport> {
    let throttle = Throttle::new(opts.throttle)?;
    let threads = opts.threads.max(1).min(files.len().max(1));

    let queue = Mutex::new(files.into_iter());
    let remaining = Mutex::new(queue.lock().len());
    let progressed = Condvar::new();
    let abort = opts.cancel.clone().unwrap_or_default();
    let abort = abort.as_ref();
    let first_error: Mutex<Option<anyhow::Error>> = Mutex::new(None);
    let reports = Mutex::new(Vec::new());

    let fail = |err: anyhow::Error| {
        abort.store(true, Ordering::Release);
        let mut slot = first_error.lock();
        if slot.is_none() {
            *slot = Some(err);
        }
        let _guard = remaining.lock();
        progressed.notify_all();
    };

    thread::scope(|scope| {
        for worker in 0..threads {
            let (queue, remaining, progressed) = (&queue, &remaining, &progressed);
            let (reports, throttle, fail) = (&reports, &throttle, &fail);
            let spawned = thread::Builder::new()
                .name(format!("copy-{worker}"))
                .spawn_scoped(scope, move || loop {
                    if abort.load(Ordering::Acquire) {
                        break;
                    }
                    let Some(ts) = queue.lock().next() else {
                        break;
                    };
                    match copy_file(&ts, opts, sinks, throttle, abort, worker) {
                        Ok(report) => reports.lock().push(report),
                        Err(err) => {
                            if !abort.load(Ordering::Acquire) {
                                error!(worker, path = %ts.rel_path, error = %err, "copy failed");
                            }
                            fail(err);
                            break;
                        }
                    }
                    let mut left = remaining.lock();
                    *left -= 1;
                    progressed.notify_all();
                });
            if let Err(err) = spawned {
                fail(err.into());
                break;
            }
        }

        let mut left = remaining.lock();
        while *left > 0 && !abort.load(Ordering::Acquire) {
            progressed.wait(&mut left);
        }
    });
    throttle.stop();

    if let Some(err) = first_error.into_inner() {
        return Err(err);
    }
    if abort.load(Ordering::Acquire) {
        return Err(Error::Aborted("copy interrupted".into()).into());
    }
    let mut files = reports.into_inner();
    files.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
    Ok(CopyReport { files })
}
