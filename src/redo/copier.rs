//! Background copy of the redo log while data files are being copied.
//!
//! The copier starts at the newest checkpoint, copies whatever the server has
//! already written, then keeps following the log from a dedicated thread,
//! waking up every `copy_interval`. [`LogCopier::stop`] waits until a target
//! LSN has been scanned, takes one last pass that also keeps the trailing
//! partial block, and checks that no checkpoint overtook the copy.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use super::{
    align_down, align_up, block_checkpoint_no, block_checksum_is_ok, block_data_len,
    block_hdr_no, block_no_for_lsn, block_stored_checksum, stamp_block_checksum, Checkpoint,
    LogSource, LOG_CHECKPOINT_1, LOG_CHECKPOINT_2, LOG_FILE_HDR_SIZE, LOG_HEADER_CREATOR,
    LOG_HEADER_CREATOR_LEN, LOG_HEADER_START_LSN, OS_FILE_LOG_BLOCK_SIZE,
};
use crate::{
    datasink::{Datasink, Sink},
    logging::{self, LogCopySnapshot},
    Error, Result,
};

/// Name of the copied log inside the backup.
pub const LOG_FILE_NAME: &str = "xtrabackup_logfile";

const CREATOR: &str = "xtrabkup ";
const BLOCK: u64 = OS_FILE_LOG_BLOCK_SIZE as u64;

#[derive(Debug, Clone)]
pub struct LogCopyOptions {
    /// Pause between passes once the copier has caught up.
    pub copy_interval: Duration,
    /// Bytes read and scanned per step.
    pub scan_window: usize,
    /// Bytes copied per pass at most.
    pub read_buffer: usize,
    /// Set from outside to make the copier give up.
    pub cancel: Option<Arc<AtomicBool>>,
}

impl Default for LogCopyOptions {
    fn default() -> Self {
        Self {
            copy_interval: Duration::from_secs(1),
            scan_window: 64 * 1024,
            read_buffer: 16 * 64 * 1024,
            cancel: None,
        }
    }
}

/// What ended up in the copied log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogCopyResult {
    pub start_checkpoint: Checkpoint,
    /// Checkpoint LSN right before the copier stopped.
    pub last_checkpoint_lsn: u64,
    /// End of the copied log.
    pub scanned_lsn: u64,
    pub bytes_copied: u64,
}

#[derive(Debug, Default)]
struct Control {
    stop_lsn: Option<u64>,
    aborted: bool,
}

struct Shared {
    control: Mutex<Control>,
    wake: Condvar,
    scanned_lsn: AtomicU64,
    cancel: Option<Arc<AtomicBool>>,
}

impl Shared {
    /// A dead log thread stops the data copy too.
    fn fail(&self, err: &anyhow::Error) {
        if matches!(err.downcast_ref::<Error>(), Some(Error::Aborted(_))) {
            return;
        }
        if let Some(cancel) = &self.cancel {
            if !cancel.swap(true, Ordering::AcqRel) {
                warn!(error = %err, "redo log copy failed, cancelling backup");
            }
        }
    }

    fn cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|c| c.load(Ordering::Acquire))
    }
}

/// Outcome of scanning one window.
#[derive(Debug)]
struct Scan {
    /// Bytes of the window that may be written out.
    write_len: usize,
    finished: bool,
    scanned_lsn: u64,
}

/// Walk the blocks of `window`, which starts at the aligned `start_lsn`.
fn scan_window(window: &[u8], start_lsn: u64, capacity: u64, is_last: bool) -> Result<Scan> {
    let blocks_in_group = u64::from(block_no_for_lsn(capacity)) - 1;
    let mut scanned_lsn = start_lsn;
    let mut scanned_checkpoint_no = 0u32;
    let mut finished = false;

    for block in window.chunks_exact(OS_FILE_LOG_BLOCK_SIZE) {
        let no = u64::from(block_hdr_no(block));
        let expected = u64::from(block_no_for_lsn(scanned_lsn));
        let checksum_ok = block_checksum_is_ok(block);

        if no != expected && checksum_ok {
            if blocks_in_group > 0
                && ((no < expected && (expected - no) % blocks_in_group == 0)
                    || no == 0
                    || (expected | 0x4000_0000).wrapping_sub(no) % blocks_in_group == 0)
            {
                // A block from the previous lap of the ring: nothing newer yet.
                finished = true;
                break;
            }
            let wrapped = blocks_in_group > 0 && no.wrapping_sub(expected) % blocks_in_group == 0;
            return Err(Error::LogCorruption {
                lsn: scanned_lsn,
                reason: if wrapped {
                    format!(
                        "expected block {expected}, found {no}: the log wrapped around \
                         before it could be copied"
                    )
                } else {
                    format!("expected block {expected}, found {no}")
                },
            }
            .into());
        }
        if !checksum_ok {
            debug!(
                lsn = scanned_lsn,
                block = no,
                stored = block_stored_checksum(block),
                "log block checksum mismatch, block probably not fully written yet"
            );
            finished = true;
            break;
        }

        let checkpoint_no = block_checkpoint_no(block);
        if scanned_checkpoint_no > 0
            && checkpoint_no < scanned_checkpoint_no
            && scanned_checkpoint_no - checkpoint_no > 0x8000_0000
        {
            // Leftovers of a flush from before the last recovery.
            finished = true;
            break;
        }

        let data_len = block_data_len(block);
        scanned_lsn += data_len as u64;
        scanned_checkpoint_no = checkpoint_no;
        if data_len < OS_FILE_LOG_BLOCK_SIZE {
            finished = true;
            break;
        }
    }

    let write_len = if finished {
        let mut len = align_up(scanned_lsn) - start_lsn;
        if !is_last && scanned_lsn % BLOCK != 0 {
            len -= BLOCK;
        }
        len as usize
    } else {
        window.len()
    };
    Ok(Scan {
        write_len,
        finished,
        scanned_lsn,
    })
}

/// State owned by whoever is currently copying.
struct Tail {
    sink: Box<dyn Sink>,
    buf: Vec<u8>,
    window: usize,
    start_lsn: u64,
    scanned_lsn: u64,
    bytes_copied: u64,
}

impl Tail {
    /// One pass over the log. Returns whether the end of the written log was
    /// reached.
    fn copy_once(&mut self, source: &mut dyn LogSource, is_last: bool) -> Result<bool> {
        let capacity = source.capacity();
        let mut start = align_down(self.scanned_lsn);
        let mut scanned = start;
        let mut len = 0usize;
        let mut finished = false;

        while !finished && len + self.window <= self.buf.len() {
            let window = &mut self.buf[len..len + self.window];
            source.read_log(window, start)?;
            let scan = scan_window(window, start, capacity, is_last)?;
            finished = scan.finished;
            scanned = scan.scanned_lsn;
            len += scan.write_len;
            start += self.window as u64;
        }

        if len > 0 {
            self.sink.write(&self.buf[..len])?;
            self.bytes_copied += len as u64;
        }
        self.scanned_lsn = scanned;
        Ok(finished)
    }

    fn snapshot(&self, last_pass: bool) -> LogCopySnapshot {
        LogCopySnapshot {
            start_lsn: self.start_lsn,
            scanned_lsn: self.scanned_lsn,
            bytes_copied: self.bytes_copied,
            last_pass,
        }
    }
}

/// Header of the copied log: the server's header with our creator string,
/// the start LSN of the first copied block and a checkpoint pointing into
/// the copy.
fn backup_log_header(mut header: Vec<u8>, checkpoint: &Checkpoint) -> Vec<u8> {
    let start_lsn = align_down(checkpoint.lsn);
    header[LOG_HEADER_START_LSN..LOG_HEADER_START_LSN + 8].copy_from_slice(&start_lsn.to_be_bytes());

    let creator = &mut header[LOG_HEADER_CREATOR..LOG_HEADER_CREATOR + LOG_HEADER_CREATOR_LEN];
    creator.fill(0);
    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let text = format!("{CREATOR}{stamp}");
    let n = text.len().min(LOG_HEADER_CREATOR_LEN);
    creator[..n].copy_from_slice(&text.as_bytes()[..n]);
    stamp_block_checksum(&mut header[..OS_FILE_LOG_BLOCK_SIZE]);

    let local = Checkpoint {
        offset: LOG_FILE_HDR_SIZE + (checkpoint.lsn - start_lsn),
        ..*checkpoint
    };
    header[LOG_CHECKPOINT_1..LOG_CHECKPOINT_1 + OS_FILE_LOG_BLOCK_SIZE]
        .copy_from_slice(&local.encode());
    header[LOG_CHECKPOINT_2..LOG_CHECKPOINT_2 + OS_FILE_LOG_BLOCK_SIZE].fill(0);
    header
}

/// Handle on the running log copy thread.
pub struct LogCopier {
    shared: Arc<Shared>,
    source: Arc<Mutex<Box<dyn LogSource>>>,
    handle: Option<JoinHandle<Result<Tail>>>,
    start_checkpoint: Checkpoint,
}

impl LogCopier {
    /// Find the start checkpoint, create the log copy in `datasink`, copy
    /// everything written so far and start the copy thread.
    pub fn start(
        mut source: Box<dyn LogSource>,
        datasink: &dyn Datasink,
        opts: LogCopyOptions,
    ) -> Result<Self> {
        // The server may be writing a checkpoint right now; retry until two
        // reads agree.
        let mut checkpoint = source.latest_checkpoint()?;
        loop {
            let again = source.latest_checkpoint()?;
            if again.number == checkpoint.number {
                break;
            }
            checkpoint = again;
        }

        let window = align_down(opts.scan_window.max(OS_FILE_LOG_BLOCK_SIZE) as u64) as usize;
        let mut sink = datasink.open(LOG_FILE_NAME)?;
        sink.write(&backup_log_header(source.header()?, &checkpoint))?;

        let mut tail = Tail {
            sink,
            buf: vec![0u8; opts.read_buffer.max(window)],
            window,
            start_lsn: checkpoint.lsn,
            scanned_lsn: checkpoint.lsn,
            bytes_copied: 0,
        };
        while !tail.copy_once(source.as_mut(), false)? {}
        info!(
            checkpoint_lsn = checkpoint.lsn,
            scanned_lsn = tail.scanned_lsn,
            "redo log copy started"
        );

        let shared = Arc::new(Shared {
            control: Mutex::new(Control::default()),
            wake: Condvar::new(),
            scanned_lsn: AtomicU64::new(tail.scanned_lsn),
            cancel: opts.cancel.clone(),
        });
        let source = Arc::new(Mutex::new(source));

        let handle = {
            let shared = Arc::clone(&shared);
            let source = Arc::clone(&source);
            let interval = opts.copy_interval;
            thread::Builder::new()
                .name("log-copy".into())
                .spawn(move || {
                    let result = copy_loop(tail, &shared, &source, interval);
                    if let Err(err) = &result {
                        shared.fail(err);
                    }
                    result
                })?
        };

        Ok(Self {
            shared,
            source,
            handle: Some(handle),
            start_checkpoint: checkpoint,
        })
    }

    pub fn start_checkpoint(&self) -> Checkpoint {
        self.start_checkpoint
    }

    /// End of the log copied so far.
    pub fn scanned_lsn(&self) -> u64 {
        self.shared.scanned_lsn.load(Ordering::Acquire)
    }

    pub fn latest_checkpoint(&self) -> Result<Checkpoint> {
        self.source.lock().latest_checkpoint()
    }

    /// Copy at least up to `lsn`, run the final pass and close the copy.
    pub fn stop(mut self, lsn: u64) -> Result<LogCopyResult> {
        let last_checkpoint_lsn = self.latest_checkpoint()?.lsn;
        info!(lsn, last_checkpoint_lsn, "stopping redo log copy");
        {
            let mut control = self.shared.control.lock();
            control.stop_lsn = Some(lsn);
            self.shared.wake.notify_all();
        }
        let tail = self.join()?;

        if last_checkpoint_lsn > tail.scanned_lsn {
            return Err(Error::LogOverwritten {
                checkpoint_lsn: last_checkpoint_lsn,
                scanned_lsn: tail.scanned_lsn,
            }
            .into());
        }
        let result = LogCopyResult {
            start_checkpoint: self.start_checkpoint,
            last_checkpoint_lsn,
            scanned_lsn: tail.scanned_lsn,
            bytes_copied: tail.bytes_copied,
        };
        tail.sink.close()?;
        Ok(result)
    }

    /// Stop without a final pass; the copy is left incomplete. Returns the
    /// error the copy thread died of, if it failed on its own.
    pub fn abort(mut self) -> Option<anyhow::Error> {
        match self.abort_thread()? {
            Ok(_) => None,
            Err(err) if matches!(err.downcast_ref::<Error>(), Some(Error::Aborted(_))) => None,
            Err(err) => Some(err),
        }
    }

    fn abort_thread(&mut self) -> Option<Result<Tail>> {
        {
            let mut control = self.shared.control.lock();
            control.aborted = true;
            self.shared.wake.notify_all();
        }
        let handle = self.handle.take()?;
        Some(
            handle
                .join()
                .unwrap_or_else(|_| Err(Error::Worker("log copy thread panicked".into()).into())),
        )
    }

    fn join(&mut self) -> Result<Tail> {
        let handle = self
            .handle
            .take()
            .ok_or_else(|| Error::Worker("log copy thread already stopped".into()))?;
        handle
            .join()
            .map_err(|_| Error::Worker("log copy thread panicked".into()))?
    }
}

impl Drop for LogCopier {
    fn drop(&mut self) {
        if self.handle.is_some() {
            let _ = self.abort_thread();
        }
    }
}

fn copy_loop(
    mut tail: Tail,
    shared: &Shared,
    source: &Mutex<Box<dyn LogSource>>,
    interval: Duration,
) -> Result<Tail> {
    loop {
        {
            let control = shared.control.lock();
            if control.aborted {
                return Err(Error::Aborted("redo log copy aborted".into()).into());
            }
            if control.stop_lsn.is_some_and(|stop| stop <= tail.scanned_lsn) {
                break;
            }
        }
        if shared.cancelled() {
            return Err(Error::Aborted("redo log copy interrupted".into()).into());
        }

        let finished = tail.copy_once(source.lock().as_mut(), false)?;
        shared.scanned_lsn.store(tail.scanned_lsn, Ordering::Release);

        if finished {
            logging::log_redo_progress(tail.snapshot(false));
            let mut control = shared.control.lock();
            if !control.aborted && control.stop_lsn.is_none() {
                shared.wake.wait_for(&mut control, interval);
            } else if control
                .stop_lsn
                .is_some_and(|stop| stop > tail.scanned_lsn)
            {
                // The server has not written up to the target yet.
                warn!(
                    scanned_lsn = tail.scanned_lsn,
                    "waiting for the redo log to reach the stop lsn"
                );
                shared.wake.wait_for(&mut control, interval);
            }
        }
    }

    tail.copy_once(source.lock().as_mut(), true)?;
    shared.scanned_lsn.store(tail.scanned_lsn, Ordering::Release);
    logging::log_redo_progress(tail.snapshot(true));
    Ok(tail)
}
