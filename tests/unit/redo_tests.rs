#[path = "../common/mod.rs"]
mod common;

use std::{
    fs::{self, OpenOptions},
    os::unix::fs::FileExt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use common::{write_redo_log, LOG_START_LSN};
use tempfile::tempdir;
use xbk::{
    datasink::MemoryDatasink,
    redo::{
        self, Checkpoint, LogCopier, LogCopyOptions, LogFiles, LogSource, LOG_CHECKPOINT_1,
        LOG_CHECKPOINT_2, LOG_FILE_HDR_SIZE, LOG_FILE_NAME, LOG_HEADER_CREATOR,
        LOG_HEADER_START_LSN, OS_FILE_LOG_BLOCK_SIZE,
    },
    Error,
};

const HDR: usize = LOG_FILE_HDR_SIZE as usize;

fn quick() -> LogCopyOptions {
    LogCopyOptions {
        copy_interval: Duration::from_millis(10),
        scan_window: 4096,
        read_buffer: 4 * 4096,
        cancel: None,
    }
}

#[test]
fn log_files_report_ring_capacity_and_checkpoint() -> xbk::Result<()> {
    let dir = tempdir()?;
    write_redo_log(dir.path(), 16, 2, 100);
    let mut files = LogFiles::open(dir.path())?;
    assert_eq!(files.capacity(), 16 * 512);
    let cp = files.latest_checkpoint()?;
    assert_eq!(cp.lsn, LOG_START_LSN);
    assert_eq!(cp.offset, LOG_FILE_HDR_SIZE);

    let mut block = vec![0u8; 512];
    files.read_log(&mut block, LOG_START_LSN)?;
    assert_eq!(redo::block_hdr_no(&block), redo::block_no_for_lsn(LOG_START_LSN));
    assert!(redo::block_flush_bit(&block));
    Ok(())
}

#[test]
fn log_files_must_share_one_size() -> xbk::Result<()> {
    let dir = tempdir()?;
    write_redo_log(dir.path(), 16, 2, 100);
    fs::write(dir.path().join("ib_logfile1"), vec![0u8; HDR + 8 * 512])?;
    let err = LogFiles::open(dir.path()).err().expect("size mismatch rejected");
    assert!(matches!(err.downcast_ref::<Error>(), Some(Error::Config(_))));

    let empty = tempdir()?;
    let err = LogFiles::open(empty.path()).err().expect("missing log rejected");
    assert!(matches!(err.downcast_ref::<Error>(), Some(Error::Config(_))));
    Ok(())
}

#[test]
fn header_without_checkpoint_is_a_format_error() -> xbk::Result<()> {
    let dir = tempdir()?;
    fs::write(dir.path().join("ib_logfile0"), vec![0u8; HDR + 4 * 512])?;
    let err = LogFiles::open(dir.path()).err().expect("no checkpoint");
    assert!(matches!(err.downcast_ref::<Error>(), Some(Error::Format { .. })));
    Ok(())
}

#[test]
fn copy_holds_everything_up_to_the_partial_block() -> xbk::Result<()> {
    let dir = tempdir()?;
    let end = write_redo_log(dir.path(), 16, 3, 200);
    assert_eq!(end, LOG_START_LSN + 3 * 512 + 200);
    let server = fs::read(dir.path().join("ib_logfile0"))?;

    let mem = MemoryDatasink::new();
    let copier = LogCopier::start(Box::new(LogFiles::open(dir.path())?), &mem, quick())?;
    assert_eq!(copier.start_checkpoint().lsn, LOG_START_LSN);
    let result = copier.stop(end)?;

    assert_eq!(result.scanned_lsn, end);
    assert_eq!(result.last_checkpoint_lsn, LOG_START_LSN);
    assert_eq!(result.bytes_copied, 4 * 512);

    let copy = mem.get(LOG_FILE_NAME).expect("log copy written");
    assert_eq!(copy.len(), HDR + 4 * 512);
    assert_eq!(&copy[HDR..], &server[HDR..HDR + 4 * 512]);

    let start = u64::from_be_bytes(copy[LOG_HEADER_START_LSN..LOG_HEADER_START_LSN + 8].try_into()?);
    assert_eq!(start, LOG_START_LSN);
    assert!(copy[LOG_HEADER_CREATOR..].starts_with(b"xtrabkup "));
    let cp = Checkpoint::parse(&copy[LOG_CHECKPOINT_1..LOG_CHECKPOINT_1 + 512])
        .expect("checkpoint block");
    assert_eq!(cp.lsn, LOG_START_LSN);
    assert_eq!(cp.offset, LOG_FILE_HDR_SIZE);
    assert!(copy[LOG_CHECKPOINT_2..LOG_CHECKPOINT_2 + 512].iter().all(|&b| b == 0));
    Ok(())
}

#[test]
fn copier_follows_log_growth_until_the_stop_lsn() -> xbk::Result<()> {
    let dir = tempdir()?;
    write_redo_log(dir.path(), 16, 1, 100);
    let mem = MemoryDatasink::new();
    let copier = LogCopier::start(Box::new(LogFiles::open(dir.path())?), &mem, quick())?;

    // The server writes more log in place.
    let staging = tempdir()?;
    let end = write_redo_log(staging.path(), 16, 6, 300);
    let grown = fs::read(staging.path().join("ib_logfile0"))?;
    let live = OpenOptions::new()
        .write(true)
        .open(dir.path().join("ib_logfile0"))?;
    live.write_all_at(&grown, 0)?;

    let result = copier.stop(end)?;
    assert_eq!(result.scanned_lsn, end);

    let copy = mem.get(LOG_FILE_NAME).expect("log copy written");
    assert_eq!(copy.len(), HDR + 7 * 512);
    assert_eq!(&copy[HDR..], &grown[HDR..HDR + 7 * 512]);
    Ok(())
}

#[test]
fn checkpoint_past_the_copy_means_the_log_was_overwritten() -> xbk::Result<()> {
    let dir = tempdir()?;
    let end = write_redo_log(dir.path(), 16, 2, 100);
    let mem = MemoryDatasink::new();
    let copier = LogCopier::start(Box::new(LogFiles::open(dir.path())?), &mem, quick())?;

    let newer = Checkpoint {
        number: 2,
        lsn: end + 100_000,
        offset: LOG_FILE_HDR_SIZE,
    };
    let live = OpenOptions::new()
        .write(true)
        .open(dir.path().join("ib_logfile0"))?;
    live.write_all_at(&newer.encode(), LOG_CHECKPOINT_2 as u64)?;

    let err = copier.stop(end).unwrap_err();
    match err.downcast_ref::<Error>() {
        Some(Error::LogOverwritten {
            checkpoint_lsn,
            scanned_lsn,
        }) => {
            assert_eq!(*checkpoint_lsn, end + 100_000);
            assert_eq!(*scanned_lsn, end);
        }
        other => panic!("unexpected error {other:?}"),
    }
    Ok(())
}

#[test]
fn cancel_flag_stops_a_waiting_copier() -> xbk::Result<()> {
    let dir = tempdir()?;
    let end = write_redo_log(dir.path(), 16, 2, 100);
    let cancel = Arc::new(AtomicBool::new(false));
    let opts = LogCopyOptions {
        cancel: Some(Arc::clone(&cancel)),
        ..quick()
    };
    let mem = MemoryDatasink::new();
    let copier = LogCopier::start(Box::new(LogFiles::open(dir.path())?), &mem, opts)?;
    cancel.store(true, Ordering::Release);

    // The log never reaches this LSN, so only the flag can end the wait.
    let err = copier.stop(end + 4096).unwrap_err();
    assert!(matches!(err.downcast_ref::<Error>(), Some(Error::Aborted(_))));
    Ok(())
}

#[test]
fn corrupt_block_raises_the_cancel_flag() -> xbk::Result<()> {
    let dir = tempdir()?;
    write_redo_log(dir.path(), 16, 0, 100);
    let cancel = Arc::new(AtomicBool::new(false));
    let opts = LogCopyOptions {
        cancel: Some(Arc::clone(&cancel)),
        ..quick()
    };
    let mem = MemoryDatasink::new();
    let copier = LogCopier::start(Box::new(LogFiles::open(dir.path())?), &mem, opts)?;

    // Block 0 fills up and block 1 carries the number of a block three
    // positions further on, with a valid checksum.
    let mut blocks = vec![0u8; 2 * OS_FILE_LOG_BLOCK_SIZE];
    let (first, second) = blocks.split_at_mut(OS_FILE_LOG_BLOCK_SIZE);
    redo::init_block(first, LOG_START_LSN, 512, 12, 1, true);
    redo::init_block(second, LOG_START_LSN + 4 * 512, 512, 12, 1, false);
    let live = OpenOptions::new()
        .write(true)
        .open(dir.path().join("ib_logfile0"))?;
    live.write_all_at(&blocks, LOG_FILE_HDR_SIZE)?;

    let deadline = Instant::now() + Duration::from_secs(5);
    while !cancel.load(Ordering::Acquire) && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    assert!(cancel.load(Ordering::Acquire), "log failure must cancel the backup");

    let err = copier.abort().expect("copy thread error is reported");
    match err.downcast_ref::<Error>() {
        Some(Error::LogCorruption { lsn, .. }) => assert_eq!(*lsn, LOG_START_LSN + 512),
        other => panic!("unexpected error {other:?}"),
    }
    Ok(())
}

#[test]
fn aborting_a_healthy_copier_reports_nothing() -> xbk::Result<()> {
    let dir = tempdir()?;
    write_redo_log(dir.path(), 16, 2, 100);
    let cancel = Arc::new(AtomicBool::new(false));
    let opts = LogCopyOptions {
        cancel: Some(Arc::clone(&cancel)),
        ..quick()
    };
    let mem = MemoryDatasink::new();
    let copier = LogCopier::start(Box::new(LogFiles::open(dir.path())?), &mem, opts)?;
    assert!(copier.abort().is_none());
    assert!(!cancel.load(Ordering::Acquire));
    Ok(())
}
