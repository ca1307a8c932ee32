#[path = "../common/mod.rs"]
mod common;

use std::{
    fs,
    path::{Path, PathBuf},
    sync::{atomic::Ordering, Arc},
    time::Duration,
};

use common::{
    build_datadir, make_page, orders_tablespace, rewrite_page, DATA_LSN, LOG_START_LSN, PAGE,
};
use tempfile::tempdir;
use xbk::{
    backup::{
        self, BackupOptions, BackupType, Baseline, Checkpoints, CopyMode, Manifest, Target,
        CHECKPOINTS_FILE, MANIFEST_FILE,
    },
    datasink::{Datasink, MemoryDatasink, Sink},
    delta::{DeltaMeta, DeltaReader},
    redo::{LOG_FILE_HDR_SIZE, LOG_FILE_NAME},
    Error,
};

fn options(datadir: &Path, target: Target) -> BackupOptions {
    let mut opts = BackupOptions::new(datadir, target);
    opts.copy.threads = 2;
    opts.copy.cursor.retry_backoff = Duration::from_millis(1);
    opts.log.copy_interval = Duration::from_millis(10);
    opts
}

fn manifest_in(dir: &Path) -> xbk::Result<Manifest> {
    Manifest::from_json(&fs::read(dir.join(MANIFEST_FILE))?)
}

#[test]
fn full_backup_copies_every_tablespace_and_the_log() -> xbk::Result<()> {
    let data = tempdir()?;
    let end = build_datadir(data.path());
    let target = tempdir()?;

    let summary = backup::run_backup(options(data.path(), Target::Dir(target.path().into())))?;

    for rel in ["ibdata1", "shop/orders.ibd", "shop/items.ibd"] {
        assert_eq!(
            fs::read(target.path().join(rel))?,
            fs::read(data.path().join(rel))?,
            "{rel}"
        );
    }
    assert!(!target.path().join("ib_logfile0").exists());

    let log = fs::read(target.path().join(LOG_FILE_NAME))?;
    assert_eq!(log.len(), LOG_FILE_HDR_SIZE as usize + 4 * 512);

    let cp = Checkpoints::read(&target.path().join(CHECKPOINTS_FILE))?;
    assert_eq!(cp, summary.checkpoints);
    assert_eq!(cp.backup_type, BackupType::FullBackuped);
    assert_eq!(cp.from_lsn, 0);
    assert_eq!(cp.to_lsn, LOG_START_LSN);
    assert_eq!(cp.last_lsn, end);

    let manifest = manifest_in(target.path())?;
    assert_eq!(manifest.mode, CopyMode::Full);
    assert!(!manifest.streamed);
    let paths: Vec<&str> = manifest.files.iter().map(|f| f.path.as_str()).collect();
    assert_eq!(paths, vec!["ibdata1", "shop/items.ibd", "shop/orders.ibd"]);
    assert_eq!(manifest.files[2].space_id, Some(5));
    assert_eq!(manifest.files[2].pages, 8);
    Ok(())
}

#[test]
fn incremental_backup_from_an_earlier_backup_writes_deltas() -> xbk::Result<()> {
    let data = tempdir()?;
    build_datadir(data.path());
    let full = tempdir()?;
    backup::run_backup(options(data.path(), Target::Dir(full.path().into())))?;

    // Two pages change after the full backup.
    let newer = LOG_START_LSN + 100;
    rewrite_page(&data.path().join("shop/items.ibd"), 3, &make_page(6, 3, newer));
    rewrite_page(&data.path().join("shop/items.ibd"), 4, &make_page(6, 4, newer));

    let inc = tempdir()?;
    let mut opts = options(data.path(), Target::Dir(inc.path().into()));
    opts.incremental = Some(Baseline::Dir(full.path().into()));
    let summary = backup::run_backup(opts)?;
    assert_eq!(summary.checkpoints.backup_type, BackupType::Incremental);
    assert_eq!(summary.checkpoints.from_lsn, LOG_START_LSN);

    let delta = fs::read(inc.path().join("shop/items.ibd.delta"))?;
    let pages: Vec<u32> = DeltaReader::new(&delta[..], PAGE)
        .map(|e| e.map(|(n, _)| n))
        .collect::<xbk::Result<_>>()?;
    assert_eq!(pages, vec![3, 4]);
    let meta = DeltaMeta::read(&inc.path().join("shop/items.ibd.meta"))?;
    assert_eq!(meta.space_id, 6);

    // Untouched spaces get a delta holding only the final header.
    let orders = fs::read(inc.path().join("shop/orders.ibd.delta"))?;
    assert_eq!(orders.len(), PAGE);
    assert!(!inc.path().join("shop/items.ibd").exists());
    assert_eq!(manifest_in(inc.path())?.mode, CopyMode::Incremental);
    Ok(())
}

#[test]
fn incremental_backup_from_an_explicit_lsn() -> xbk::Result<()> {
    let data = tempdir()?;
    build_datadir(data.path());
    let inc = tempdir()?;
    let mut opts = options(data.path(), Target::Dir(inc.path().into()));
    // Below every page LSN: each page is part of the delta.
    opts.incremental = Some(Baseline::Lsn(DATA_LSN - 1));
    backup::run_backup(opts)?;

    let delta = fs::read(inc.path().join("ibdata1.delta"))?;
    assert_eq!(DeltaReader::new(&delta[..], PAGE).count(), 4);
    Ok(())
}

#[test]
fn compact_backup_writes_page_maps() -> xbk::Result<()> {
    let data = tempdir()?;
    build_datadir(data.path());
    let target = tempdir()?;
    let mut opts = options(data.path(), Target::Dir(target.path().into()));
    opts.compact = true;
    let summary = backup::run_backup(opts)?;
    assert!(summary.checkpoints.compact);

    let orders = orders_tablespace(5, DATA_LSN);
    let mut expected = orders[..5 * PAGE].to_vec();
    expected.extend_from_slice(&orders[7 * PAGE..]);
    assert_eq!(fs::read(target.path().join("shop/orders.ibd"))?, expected);

    let map = fs::read(target.path().join("shop/orders.ibd.pmap"))?;
    assert_eq!(map, [5u32.to_be_bytes(), 6u32.to_be_bytes()].concat());
    assert!(!target.path().join("ibdata1.pmap").exists());
    assert_eq!(
        fs::read(target.path().join("ibdata1"))?,
        fs::read(data.path().join("ibdata1"))?
    );
    let cp = Checkpoints::read(&target.path().join(CHECKPOINTS_FILE))?;
    assert!(cp.compact);
    Ok(())
}

#[test]
fn incremental_and_compact_cannot_be_combined() -> xbk::Result<()> {
    let data = tempdir()?;
    build_datadir(data.path());
    let target = tempdir()?;
    let mut opts = options(data.path(), Target::Dir(target.path().into()));
    opts.compact = true;
    opts.incremental = Some(Baseline::Lsn(1));
    let err = backup::run_backup(opts).unwrap_err();
    assert!(matches!(err.downcast_ref::<Error>(), Some(Error::Config(_))));
    Ok(())
}

/// Deletes a source tablespace as soon as its copy is opened, standing in
/// for a `DROP TABLE` that races with the backup.
struct DroppingSink {
    inner: MemoryDatasink,
    victim: String,
    source: PathBuf,
}

impl Datasink for DroppingSink {
    fn open(&self, path: &str) -> xbk::Result<Box<dyn Sink>> {
        if path == self.victim {
            fs::remove_file(&self.source)?;
        }
        self.inner.open(path)
    }

    fn remove(&self, path: &str) -> xbk::Result<()> {
        self.inner.remove(path)
    }
}

#[test]
fn tablespace_dropped_during_copy_is_left_out() -> xbk::Result<()> {
    let data = tempdir()?;
    build_datadir(data.path());
    let mem = MemoryDatasink::new();
    let sink = DroppingSink {
        inner: mem.clone(),
        victim: "shop/items.ibd".into(),
        source: data.path().join("shop/items.ibd"),
    };
    let target = Target::Datasink {
        sink: Arc::new(sink),
        stream: None,
    };
    let summary = backup::run_backup(options(data.path(), target))?;

    assert_eq!(summary.copy.skipped().count(), 1);
    assert!(mem.get("shop/items.ibd").is_none());
    assert!(mem.get("shop/orders.ibd").is_some());

    let manifest = Manifest::from_json(&mem.get(MANIFEST_FILE).expect("manifest"))?;
    let items = manifest
        .files
        .iter()
        .find(|f| f.path == "shop/items.ibd")
        .expect("listed");
    assert!(items.skipped);
    assert_eq!(items.space_id, Some(6));
    Ok(())
}

#[test]
fn persistent_page_corruption_fails_the_backup() -> xbk::Result<()> {
    let data = tempdir()?;
    build_datadir(data.path());
    let mut bad = make_page(6, 2, DATA_LSN);
    bad[PAGE / 2] ^= 0xFF;
    rewrite_page(&data.path().join("shop/items.ibd"), 2, &bad);

    let target = tempdir()?;
    let mut opts = options(data.path(), Target::Dir(target.path().into()));
    opts.copy.cursor.retries = 3;
    let err = backup::run_backup(opts).unwrap_err();
    match err.downcast_ref::<Error>() {
        Some(Error::Corruption { path, page_no, .. }) => {
            assert_eq!(path, "shop/items.ibd");
            assert_eq!(*page_no, 2);
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert!(!target.path().join(CHECKPOINTS_FILE).exists());
    Ok(())
}

#[test]
fn raised_cancel_flag_aborts_the_backup() -> xbk::Result<()> {
    let data = tempdir()?;
    build_datadir(data.path());
    let target = tempdir()?;
    let opts = options(data.path(), Target::Dir(target.path().into()));
    opts.cancel.store(true, Ordering::Release);
    let err = backup::run_backup(opts).unwrap_err();
    assert!(matches!(err.downcast_ref::<Error>(), Some(Error::Aborted(_))));
    Ok(())
}

#[test]
fn missing_redo_log_is_a_config_error() -> xbk::Result<()> {
    let data = tempdir()?;
    build_datadir(data.path());
    fs::remove_file(data.path().join("ib_logfile0"))?;
    let target = tempdir()?;
    let err = backup::run_backup(options(data.path(), Target::Dir(target.path().into())))
        .unwrap_err();
    assert!(matches!(err.downcast_ref::<Error>(), Some(Error::Config(_))));
    Ok(())
}
