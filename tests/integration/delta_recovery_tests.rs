//! Full backup, incremental on top, deltas merged back: the merged copy must
//! equal the data directory at the time of the incremental backup.
#[path = "../common/mod.rs"]
mod common;

use std::{fs, path::Path, time::Duration};

use common::{build_datadir, make_page, rewrite_page, tablespace, write_tablespace, PAGE};
use tempfile::tempdir;
use xbk::{
    backup::{self, BackupOptions, Baseline, Checkpoints, Target, CHECKPOINTS_FILE},
    delta::{self, DeltaMeta},
};

const TABLESPACES: [&str; 3] = ["ibdata1", "shop/items.ibd", "shop/orders.ibd"];

fn backup_into(datadir: &Path, target: &Path, baseline: Option<&Path>) -> xbk::Result<()> {
    let mut opts = BackupOptions::new(datadir, Target::Dir(target.into()));
    opts.copy.threads = 3;
    opts.copy.cursor.buffer_pages = 2;
    opts.log.copy_interval = Duration::from_millis(10);
    opts.incremental = baseline.map(|b| Baseline::Dir(b.into()));
    backup::run_backup(opts).map(|_| ())
}

fn merge(full: &Path, inc: &Path, rel: &str) -> xbk::Result<u64> {
    let meta = DeltaMeta::read(&inc.join(format!("{rel}.meta")))?;
    delta::apply_delta(&full.join(rel), &inc.join(format!("{rel}.delta")), &meta)
}

#[test]
fn merged_deltas_reproduce_the_changed_data_directory() -> xbk::Result<()> {
    let data = tempdir()?;
    build_datadir(data.path());
    let full = tempdir()?;
    backup_into(data.path(), full.path(), None)?;
    let base_lsn = Checkpoints::incremental_base(full.path())?;

    // Changes after the full backup: rewritten pages plus a grown file.
    let newer = base_lsn + 1;
    rewrite_page(&data.path().join("ibdata1"), 2, &make_page(0, 2, newer));
    rewrite_page(&data.path().join("shop/orders.ibd"), 1, &make_page(5, 1, newer));
    let mut items = fs::read(data.path().join("shop/items.ibd"))?;
    for n in 5..9 {
        items.extend_from_slice(&make_page(6, n, newer));
    }
    write_tablespace(&data.path().join("shop/items.ibd"), &items);

    let inc = tempdir()?;
    backup_into(data.path(), inc.path(), Some(full.path()))?;

    let mut applied = 0;
    for rel in TABLESPACES {
        applied += merge(full.path(), inc.path(), rel)?;
    }
    assert_eq!(applied, 1 + 1 + 4);

    for rel in TABLESPACES {
        assert_eq!(
            fs::read(full.path().join(rel))?,
            fs::read(data.path().join(rel))?,
            "{rel} differs after merge"
        );
    }
    Ok(())
}

#[test]
fn merging_the_same_delta_twice_changes_nothing() -> xbk::Result<()> {
    let data = tempdir()?;
    build_datadir(data.path());
    let full = tempdir()?;
    backup_into(data.path(), full.path(), None)?;

    let newer = Checkpoints::read(&full.path().join(CHECKPOINTS_FILE))?.to_lsn + 10;
    rewrite_page(&data.path().join("shop/items.ibd"), 3, &make_page(6, 3, newer));
    let inc = tempdir()?;
    backup_into(data.path(), inc.path(), Some(full.path()))?;

    merge(full.path(), inc.path(), "shop/items.ibd")?;
    let once = fs::read(full.path().join("shop/items.ibd"))?;
    merge(full.path(), inc.path(), "shop/items.ibd")?;
    assert_eq!(fs::read(full.path().join("shop/items.ibd"))?, once);
    assert_eq!(once, fs::read(data.path().join("shop/items.ibd"))?);
    Ok(())
}

#[test]
fn chained_incrementals_apply_in_order() -> xbk::Result<()> {
    let data = tempdir()?;
    build_datadir(data.path());
    let full = tempdir()?;
    backup_into(data.path(), full.path(), None)?;
    let base = Checkpoints::incremental_base(full.path())?;

    rewrite_page(&data.path().join("shop/items.ibd"), 1, &make_page(6, 1, base + 1));
    let first = tempdir()?;
    backup_into(data.path(), first.path(), Some(full.path()))?;

    // The second incremental builds on the first one's checkpoint.
    rewrite_page(&data.path().join("shop/items.ibd"), 2, &make_page(6, 2, base + 2));
    let second = tempdir()?;
    backup_into(data.path(), second.path(), Some(first.path()))?;

    for inc in [first.path(), second.path()] {
        merge(full.path(), inc, "shop/items.ibd")?;
    }
    assert_eq!(
        fs::read(full.path().join("shop/items.ibd"))?,
        fs::read(data.path().join("shop/items.ibd"))?
    );
    Ok(())
}

#[test]
fn apply_delta_command_merges_with_the_default_meta_path() -> xbk::Result<()> {
    let dir = tempdir()?;
    let base = dir.path().join("t.ibd");
    write_tablespace(&base, &tablespace(9, 3, |_| 5));

    let target = tempdir()?;
    let data = tempdir()?;
    build_datadir(data.path());
    let mut updated = tablespace(9, 3, |_| 5);
    updated[2 * PAGE..].copy_from_slice(&make_page(9, 2, 99_999));
    write_tablespace(&data.path().join("db/t.ibd"), &updated);

    let mut opts = BackupOptions::new(data.path(), Target::Dir(target.path().into()));
    opts.log.copy_interval = Duration::from_millis(10);
    opts.incremental = Some(Baseline::Lsn(1000));
    backup::run_backup(opts)?;

    let delta_path = target.path().join("db/t.ibd.delta");
    xbk::run([
        "xbk",
        "apply-delta",
        "--base",
        base.to_str().expect("utf-8 path"),
        "--delta",
        delta_path.to_str().expect("utf-8 path"),
    ])?;
    assert_eq!(fs::read(&base)?, updated);
    Ok(())
}
