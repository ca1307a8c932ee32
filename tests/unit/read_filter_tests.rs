#[path = "../common/mod.rs"]
mod common;

use std::sync::Arc;

use common::{tablespace, write_tablespace, PAGE};
use tempfile::tempdir;
use xbk::{
    changed::{ChangedPageBitmap, PageTracking},
    copy::{Cursor, CursorOptions, ReadFilter, ReadFilterCtx, Throttle},
    page::DICT_SPACE_ID,
};

const P: u64 = PAGE as u64;

/// Drain a filter context, consuming every batch whole.
fn batches(ctx: &mut ReadFilterCtx) -> Vec<(u64, u64)> {
    let mut out = Vec::new();
    loop {
        let (offset, len) = ctx.get_next_batch();
        if len == 0 {
            return out;
        }
        assert_eq!(offset % P, 0, "unaligned offset {offset}");
        assert_eq!(len % P, 0, "unaligned length {len}");
        out.push((offset / P, len / P));
        ctx.update(len);
    }
}

fn bitmap_with(ranges: &[(u32, u64, u64)]) -> ReadFilter {
    let mut bitmap = ChangedPageBitmap::new();
    for &(space, first, last) in ranges {
        bitmap.mark_range(space, first, last);
    }
    ReadFilter::Bitmap(Arc::new(bitmap))
}

#[test]
fn bitmap_yields_one_batch_per_changed_run() {
    let filter = bitmap_with(&[(4, 5, 9), (4, 20, 20)]);
    let mut ctx = ReadFilterCtx::init(&filter, 4, PAGE, 30 * P, 64 * PAGE);
    let got = batches(&mut ctx);
    assert_eq!(got, vec![(5, 5), (20, 1)]);
    let total: u64 = got.iter().map(|(_, n)| n * P).sum();
    assert_eq!(total, 6 * P);
}

#[test]
fn bitmap_runs_are_split_at_buffer_capacity() {
    let filter = bitmap_with(&[(4, 2, 11)]);
    let mut ctx = ReadFilterCtx::init(&filter, 4, PAGE, 30 * P, 4 * PAGE);
    assert_eq!(batches(&mut ctx), vec![(2, 4), (6, 4), (10, 2)]);
}

#[test]
fn bitmap_without_the_space_reads_nothing() {
    let filter = bitmap_with(&[(4, 0, 3)]);
    let mut ctx = ReadFilterCtx::init(&filter, 5, PAGE, 30 * P, 64 * PAGE);
    assert!(batches(&mut ctx).is_empty());
}

#[test]
fn retried_batch_is_handed_out_unchanged() {
    let filter = bitmap_with(&[(4, 5, 9)]);
    let mut ctx = ReadFilterCtx::init(&filter, 4, PAGE, 30 * P, 64 * PAGE);
    let first = ctx.get_next_batch();
    assert_eq!(ctx.get_next_batch(), first);
    ctx.update(first.1);
    assert_eq!(ctx.get_next_batch().1, 0);
}

#[test]
fn page_tracking_follows_tracked_pages() {
    let mut tracking = PageTracking::new();
    tracking.add_pages(9, [0, 1, 2, 7, 8, 15]);
    let filter = ReadFilter::PageTracking(Arc::new(tracking));
    let mut ctx = ReadFilterCtx::init(&filter, 9, PAGE, 12 * P, 2 * PAGE);
    // Page 15 lies past the end of the file.
    assert_eq!(batches(&mut ctx), vec![(0, 2), (2, 1), (7, 2)]);
}

#[test]
fn dictionary_space_is_always_scanned_whole() {
    let filter = ReadFilter::PageTracking(Arc::new(PageTracking::new()));
    let mut ctx = ReadFilterCtx::init(&filter, DICT_SPACE_ID, PAGE, 3 * P, 64 * PAGE);
    assert_eq!(batches(&mut ctx), vec![(0, 3)]);
}

#[test]
fn cursor_reads_only_filtered_pages() -> xbk::Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("t.ibd");
    write_tablespace(&path, &tablespace(4, 30, |n| u64::from(n) + 1));

    let filter = bitmap_with(&[(4, 5, 9), (4, 20, 20)]);
    let mut cursor = Cursor::open(&path, "t.ibd", &filter, &CursorOptions::default())?
        .expect("file exists");
    let throttle = Throttle::disabled();

    let mut seen = Vec::new();
    while cursor.read_batch(&throttle)? {
        let first = cursor.batch_page_no();
        for (i, page) in cursor.batch().chunks_exact(PAGE).enumerate() {
            assert_eq!(u64::from(xbk::page::page_no(page)), first + i as u64);
        }
        seen.push((first, cursor.batch().len() / PAGE));
    }
    assert_eq!(seen, vec![(5, 5), (20, 1)]);
    assert_eq!(cursor.pages_read(), 6);
    Ok(())
}
