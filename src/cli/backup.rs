//! Implementation of `xbk backup`.

use std::{
    path::PathBuf,
    sync::{atomic::Ordering, Arc},
    time::Duration,
};

use clap::Args;
use tracing::{info, warn};

use crate::{
    backup::{self, Baseline, BackupOptions, Target},
    changed::ChangedPageBitmap,
    compress::{CompressAlgo, CompressOptions},
    copy::{CopyOptions, CursorOptions, ReadFilter},
    redo::LogCopyOptions,
    xbcrypt::{CryptOptions, Version},
    Error, Result,
};

use super::EncryptKeyArgs;

#[derive(Debug, Clone, Args)]
pub struct BackupArgs {
    /// Server data directory holding `ibdata*` and the `*.ibd` files.
    #[arg(long = "datadir")]
    pub datadir: PathBuf,

    /// Directory of `ib_logfile*`; defaults to the data directory.
    #[arg(long = "log-dir")]
    pub log_dir: Option<PathBuf>,

    /// Write plain files below this directory.
    #[arg(long = "target-dir", required_unless_present = "stream", conflicts_with = "stream")]
    pub target_dir: Option<PathBuf>,

    /// Write a single xbstream to stdout.
    #[arg(long = "stream", default_value_t = false)]
    pub stream: bool,

    /// Number of tablespaces copied in parallel.
    #[arg(long = "parallel", default_value_t = 1)]
    pub parallel: usize,

    /// Read iterations per second across all copy threads; 0 disables throttling.
    #[arg(long = "throttle", default_value_t = 0)]
    pub throttle: u64,

    /// Pages read per batch.
    #[arg(long = "read-buffer-pages", default_value_t = 64)]
    pub read_buffer_pages: usize,

    /// Page size of the system tablespace.
    #[arg(long = "innodb-page-size", default_value_t = 16384)]
    pub server_page_size: usize,

    /// Milliseconds between redo log passes.
    #[arg(long = "log-copy-interval", default_value_t = 1000)]
    pub log_copy_interval_ms: u64,

    /// Take an incremental backup on top of the backup in this directory.
    #[arg(long = "incremental-basedir", conflicts_with = "incremental_lsn")]
    pub incremental_basedir: Option<PathBuf>,

    /// Take an incremental backup of pages newer than this LSN.
    #[arg(long = "incremental-lsn")]
    pub incremental_lsn: Option<u64>,

    /// Only read pages listed in this changed-page file (`space_id page_no` per line).
    #[arg(long = "changed-pages")]
    pub changed_pages: Option<PathBuf>,

    /// Skip secondary index pages.
    #[arg(long = "compact", default_value_t = false)]
    pub compact: bool,

    /// Compress every output file.
    #[arg(long = "compress", value_enum)]
    pub compress: Option<CompressAlgo>,

    #[arg(long = "compress-threads", default_value_t = 1)]
    pub compress_threads: usize,

    #[arg(long = "compress-chunk-size", default_value_t = crate::compress::DEFAULT_CHUNK_SIZE)]
    pub compress_chunk_size: usize,

    /// zstd compression level.
    #[arg(long = "compress-level", default_value_t = 1)]
    pub compress_level: i32,

    #[command(flatten)]
    pub encrypt: EncryptKeyArgs,
}

/// Changed-page list: one `space_id page_no` pair per non-empty line.
fn load_changed_pages(path: &std::path::Path) -> Result<ChangedPageBitmap> {
    let text = std::fs::read_to_string(path).map_err(|source| Error::FileIo {
        path: path.display().to_string(),
        source,
    })?;
    let mut bitmap = ChangedPageBitmap::new();
    for (line_no, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.split_whitespace();
        let parsed = match (fields.next(), fields.next(), fields.next()) {
            (Some(space), Some(page), None) => space.parse::<u32>().ok().zip(page.parse::<u64>().ok()),
            _ => None,
        };
        let Some((space_id, page_no)) = parsed else {
            return Err(Error::Cli(format!(
                "{}:{}: expected `space_id page_no`",
                path.display(),
                line_no + 1
            ))
            .into());
        };
        bitmap.mark(space_id, page_no);
    }
    Ok(bitmap)
}

impl BackupArgs {
    pub fn into_options(self) -> Result<BackupOptions> {
        let target = match (self.target_dir, self.stream) {
            (Some(dir), false) => Target::Dir(dir),
            (None, true) => Target::Stdout,
            _ => return Err(Error::Cli("exactly one of --target-dir or --stream is required".into()).into()),
        };
        let incremental = match (self.incremental_basedir, self.incremental_lsn) {
            (Some(dir), None) => Some(Baseline::Dir(dir)),
            (None, Some(lsn)) => Some(Baseline::Lsn(lsn)),
            (None, None) => None,
            (Some(_), Some(_)) => {
                return Err(Error::Cli(
                    "--incremental-basedir and --incremental-lsn are mutually exclusive".into(),
                )
                .into())
            }
        };
        let read_filter = match (&self.changed_pages, &incremental) {
            (Some(path), Some(_)) => ReadFilter::Bitmap(Arc::new(load_changed_pages(path)?)),
            (Some(_), None) => {
                return Err(Error::Cli("--changed-pages only applies to incremental backups".into()).into())
            }
            (None, _) => ReadFilter::PassThrough,
        };

        let encrypt = self.encrypt.load()?.map(|key| {
            (
                key,
                CryptOptions {
                    threads: self.encrypt.threads,
                    chunk_size: self.encrypt.chunk_size,
                    version: Version::V3,
                },
            )
        });
        let compress = self.compress.map(|algo| CompressOptions {
            algo,
            threads: self.compress_threads,
            chunk_size: self.compress_chunk_size,
            level: self.compress_level,
        });

        let mut opts = BackupOptions::new(self.datadir, target);
        opts.log_dir = self.log_dir;
        opts.copy = CopyOptions {
            threads: self.parallel,
            cursor: CursorOptions {
                buffer_pages: self.read_buffer_pages,
                server_page_size: self.server_page_size,
                ..CursorOptions::default()
            },
            read_filter,
            throttle: self.throttle,
            ..CopyOptions::default()
        };
        opts.log = LogCopyOptions {
            copy_interval: Duration::from_millis(self.log_copy_interval_ms),
            ..LogCopyOptions::default()
        };
        opts.incremental = incremental;
        opts.compact = self.compact;
        opts.compress = compress;
        opts.encrypt = encrypt;
        Ok(opts)
    }
}

pub fn execute(args: BackupArgs) -> Result<()> {
    let opts = args.into_options()?;

    let cancel = Arc::clone(&opts.cancel);
    ctrlc::set_handler(move || {
        warn!("interrupt received, stopping backup");
        cancel.store(true, Ordering::Release);
    })
    .map_err(|e| Error::Cli(format!("failed to install signal handler: {e}")))?;

    let summary = backup::run_backup(opts)?;
    info!(
        backup_id = %summary.manifest.backup_id,
        to_lsn = summary.checkpoints.to_lsn,
        "backup finished"
    );
    Ok(())
}
