//! Logging initialization using `tracing` and `tracing-subscriber`.

use std::time::Duration;

use tracing::{info, warn};
use tracing_subscriber::{fmt, util::SubscriberInitExt, EnvFilter};

use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum LogFormat {
    #[default]
    Human,
    Json,
}

/// Outcome of copying one tablespace, emitted once per file.
#[derive(Debug, Clone, Default)]
pub struct CopySnapshot {
    pub worker: usize,
    pub path: String,
    pub space_id: u32,
    pub pages_read: u64,
    pub bytes_written: u64,
    pub retries: u32,
    pub elapsed: Duration,
}

/// Progress of the redo log copier.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogCopySnapshot {
    pub start_lsn: u64,
    pub scanned_lsn: u64,
    pub bytes_copied: u64,
    pub last_pass: bool,
}

/// Chunk statistics of a pooled codec (encryption, compression) for one file.
#[derive(Debug, Clone, Default)]
pub struct PoolSnapshot {
    pub codec: &'static str,
    pub path: String,
    pub threads: usize,
    pub chunks: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

/// Initialize global tracing subscriber. Safe to call multiple times; subsequent
/// calls will no-op.
pub fn init_logging(format: LogFormat) -> Result<()> {
    if tracing::dispatcher::has_been_set() {
        return Ok(());
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    match format {
        LogFormat::Human => {
            let _ = builder.finish().try_init();
        }
        LogFormat::Json => {
            let _ = builder.json().finish().try_init();
        }
    };

    Ok(())
}

pub fn log_copy_done(snapshot: &CopySnapshot) {
    if snapshot.retries > 0 {
        warn!(
            target = "xbk::copy",
            worker = snapshot.worker,
            path = %snapshot.path,
            space_id = snapshot.space_id,
            pages_read = snapshot.pages_read,
            bytes_written = snapshot.bytes_written,
            retries = snapshot.retries,
            elapsed_ms = snapshot.elapsed.as_millis() as u64,
            "copy_file_done_with_retries"
        );
    } else {
        info!(
            target = "xbk::copy",
            worker = snapshot.worker,
            path = %snapshot.path,
            space_id = snapshot.space_id,
            pages_read = snapshot.pages_read,
            bytes_written = snapshot.bytes_written,
            elapsed_ms = snapshot.elapsed.as_millis() as u64,
            "copy_file_done"
        );
    }
}

pub fn log_redo_progress(snapshot: LogCopySnapshot) {
    info!(
        target = "xbk::redo",
        start_lsn = snapshot.start_lsn,
        scanned_lsn = snapshot.scanned_lsn,
        bytes_copied = snapshot.bytes_copied,
        last_pass = snapshot.last_pass,
        "log_copy_progress"
    );
}

pub fn log_pool_metrics(snapshot: &PoolSnapshot) {
    info!(
        target = "xbk::pool",
        codec = snapshot.codec,
        path = %snapshot.path,
        threads = snapshot.threads,
        chunks = snapshot.chunks,
        bytes_in = snapshot.bytes_in,
        bytes_out = snapshot.bytes_out,
        "pool_file_closed"
    );
}

pub fn log_copy_skipped(worker: usize, path: &str, reason: &str) {
    info!(
        target = "xbk::copy",
        worker,
        path,
        reason,
        "copy_file_skipped"
    );
}
