//! End-to-end backup driver.
//!
//! A backup starts the redo log copier, copies every tablespace under the
//! data directory through the configured output chain, stops the log copier
//! at the newest checkpoint and finally records the LSN range in
//! `xtrabackup_checkpoints` plus a JSON manifest.

pub mod metadata;

use std::{
    path::{Path, PathBuf},
    sync::{atomic::AtomicBool, Arc},
    time::Instant,
};

use tracing::{debug, info, warn};
use walkdir::WalkDir;

pub use metadata::{
    BackupType, Checkpoints, CopyMode, Manifest, ManifestFile, CHECKPOINTS_FILE, MANIFEST_FILE,
};

use crate::{
    compress::{CompressDatasink, CompressOptions},
    copy::{self, CopyOptions, CopyReport, CopySinks, Tablespace, WriteFilterKind},
    datasink::{self, Datasink, LocalDatasink, StdoutDatasink},
    redo::{LogCopier, LogCopyOptions, LogCopyResult, LogFiles},
    xbcrypt::{CryptKey, CryptOptions, EncryptDatasink},
    xbstream::{self, XbstreamDatasink},
    Error, Result,
};

/// Name of the stream file when an xbstream is written into a datasink.
pub const DEFAULT_STREAM_NAME: &str = "backup.xbstream";
const SYSTEM_TABLESPACE_PREFIX: &str = "ibdata";

/// Where the backup goes.
pub enum Target {
    /// Plain files below a directory.
    Dir(PathBuf),
    /// A single xbstream on stdout.
    Stdout,
    /// Any datasink, optionally multiplexed into one xbstream file of that name.
    Datasink {
        sink: Arc<dyn Datasink>,
        stream: Option<String>,
    },
}

/// What the incremental baseline is taken from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Baseline {
    Lsn(u64),
    /// Directory of an earlier backup holding `xtrabackup_checkpoints`.
    Dir(PathBuf),
}

pub struct BackupOptions {
    pub datadir: PathBuf,
    /// Directory of `ib_logfile*`; the data directory when `None`.
    pub log_dir: Option<PathBuf>,
    pub target: Target,
    /// Threads, cursor, read filter and throttle. The write filter is chosen
    /// from `incremental` and `compact`.
    pub copy: CopyOptions,
    pub log: LogCopyOptions,
    pub incremental: Option<Baseline>,
    pub compact: bool,
    pub compress: Option<CompressOptions>,
    pub encrypt: Option<(CryptKey, CryptOptions)>,
    /// Shared with the copy workers and the log copier.
    pub cancel: Arc<AtomicBool>,
}

impl BackupOptions {
    pub fn new(datadir: impl Into<PathBuf>, target: Target) -> Self {
        Self {
            datadir: datadir.into(),
            log_dir: None,
            target,
            copy: CopyOptions::default(),
            log: LogCopyOptions::default(),
            incremental: None,
            compact: false,
            compress: None,
            encrypt: None,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackupSummary {
    pub checkpoints: Checkpoints,
    pub manifest: Manifest,
    pub copy: CopyReport,
    pub log: LogCopyResult,
}

/// The data chain every copied file and the redo log go through, and the
/// uncompressed chain used for metadata files.
struct OutputChain {
    data: Arc<dyn Datasink>,
    meta: Arc<dyn Datasink>,
    streamed: bool,
}

impl OutputChain {
    fn build(
        target: Target,
        compress: Option<CompressOptions>,
        encrypt: Option<(CryptKey, CryptOptions)>,
    ) -> Result<Self> {
        let (base, streamed): (Arc<dyn Datasink>, bool) = match target {
            Target::Dir(dir) => (Arc::new(LocalDatasink::new(dir)?), false),
            Target::Stdout => (
                Arc::new(XbstreamDatasink::with_default_chunk(&StdoutDatasink, "stdout")?),
                true,
            ),
            Target::Datasink { sink, stream: None } => (sink, false),
            Target::Datasink {
                sink,
                stream: Some(name),
            } => (
                Arc::new(XbstreamDatasink::new(
                    sink.as_ref(),
                    &name,
                    xbstream::DEFAULT_CHUNK_SIZE,
                )?),
                true,
            ),
        };
        let meta: Arc<dyn Datasink> = match encrypt {
            Some((key, opts)) => Arc::new(EncryptDatasink::new(base, key, opts)),
            None => base,
        };
        let data: Arc<dyn Datasink> = match compress {
            Some(opts) => Arc::new(CompressDatasink::new(Arc::clone(&meta), opts)),
            None => Arc::clone(&meta),
        };
        Ok(Self {
            data,
            meta,
            streamed,
        })
    }
}

fn is_system_tablespace(name: &str) -> bool {
    name.strip_prefix(SYSTEM_TABLESPACE_PREFIX)
        .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
}

/// Every `*.ibd` file below `datadir` plus the system tablespace files at
/// its top level, sorted by relative path.
pub fn enumerate_tablespaces(datadir: &Path) -> Result<Vec<Tablespace>> {
    if !datadir.is_dir() {
        return Err(Error::Config(format!("{} is not a directory", datadir.display())).into());
    }
    let mut files = Vec::new();
    for entry in WalkDir::new(datadir).follow_links(false) {
        let entry = entry.map_err(|e| Error::Config(format!("walking {}: {e}", datadir.display())))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        let wanted = name.ends_with(".ibd") || (entry.depth() == 1 && is_system_tablespace(&name));
        if !wanted {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(datadir)
            .map_err(|e| Error::Config(e.to_string()))?;
        let rel_path = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        files.push(Tablespace {
            path: entry.path().to_path_buf(),
            rel_path,
        });
    }
    files.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
    debug!(datadir = %datadir.display(), count = files.len(), "tablespaces found");
    Ok(files)
}

fn resolve_baseline(baseline: &Baseline) -> Result<u64> {
    match baseline {
        Baseline::Lsn(lsn) => Ok(*lsn),
        Baseline::Dir(dir) => Checkpoints::incremental_base(dir),
    }
}

/// Run a complete backup.
pub fn run_backup(opts: BackupOptions) -> Result<BackupSummary> {
    let started = Instant::now();
    let from_lsn = opts.incremental.as_ref().map(resolve_baseline).transpose()?;
    let (write_filter, mode) = match (from_lsn, opts.compact) {
        (Some(_), true) => {
            return Err(Error::Config("a backup cannot be both incremental and compact".into()).into())
        }
        (Some(baseline_lsn), false) => (
            WriteFilterKind::Incremental { baseline_lsn },
            CopyMode::Incremental,
        ),
        (None, true) => (WriteFilterKind::Compact, CopyMode::Compact),
        (None, false) => (WriteFilterKind::WriteThrough, CopyMode::Full),
    };

    let files = enumerate_tablespaces(&opts.datadir)?;
    let log_dir = opts.log_dir.clone().unwrap_or_else(|| opts.datadir.clone());
    let source = LogFiles::open(&log_dir)?;

    let compression = opts.compress.as_ref().map(|c| c.algo);
    let encryption = opts.encrypt.as_ref().map(|(key, _)| key.algo());
    let chain = OutputChain::build(opts.target, opts.compress, opts.encrypt)?;

    let log_opts = LogCopyOptions {
        cancel: Some(Arc::clone(&opts.cancel)),
        ..opts.log
    };
    let copier = LogCopier::start(Box::new(source), chain.data.as_ref(), log_opts)?;
    info!(
        files = files.len(),
        checkpoint_lsn = copier.start_checkpoint().lsn,
        mode = ?mode,
        "backup started"
    );

    let copy_opts = CopyOptions {
        write_filter,
        cancel: Some(Arc::clone(&opts.cancel)),
        ..opts.copy
    };
    let report = match copy::copy_files(
        files,
        CopySinks {
            data: chain.data.as_ref(),
            meta: chain.meta.as_ref(),
        },
        &copy_opts,
    ) {
        Ok(report) => report,
        Err(err) => {
            // Workers stopped because the log copy died: report why.
            return Err(copier.abort().unwrap_or(err));
        }
    };

    let end = match copier.latest_checkpoint() {
        Ok(checkpoint) => checkpoint,
        Err(err) => {
            return Err(copier.abort().unwrap_or(err));
        }
    };
    let log = copier.stop(end.lsn)?;

    let checkpoints = Checkpoints {
        backup_type: if from_lsn.is_some() {
            BackupType::Incremental
        } else {
            BackupType::FullBackuped
        },
        from_lsn: from_lsn.unwrap_or(0),
        to_lsn: log.last_checkpoint_lsn,
        last_lsn: log.scanned_lsn,
        compact: opts.compact,
    };
    datasink::write_file(
        chain.meta.as_ref(),
        CHECKPOINTS_FILE,
        checkpoints.to_text().as_bytes(),
    )?;

    let mut manifest = Manifest::new(mode, &checkpoints, &report);
    manifest.compression = compression;
    manifest.encryption = encryption;
    manifest.streamed = chain.streamed;
    datasink::write_file(chain.meta.as_ref(), MANIFEST_FILE, &manifest.to_json()?)?;
    chain.data.finish()?;

    let skipped = report.skipped().count();
    if skipped > 0 {
        warn!(skipped, "tablespaces dropped during backup were left out");
    }
    info!(
        backup_id = %manifest.backup_id,
        copied = report.copied().count(),
        skipped,
        bytes = report.bytes_written(),
        from_lsn = checkpoints.from_lsn,
        to_lsn = checkpoints.to_lsn,
        last_lsn = checkpoints.last_lsn,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "backup completed"
    );

    Ok(BackupSummary {
        checkpoints,
        manifest,
        copy: report,
        log,
    })
}
