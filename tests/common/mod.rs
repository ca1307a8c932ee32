//! Synthetic tablespaces and redo logs shared by the test targets.
#![allow(dead_code)]

use std::{fs, path::Path};

use xbk::{
    page::{
        self, checksum, FIL_PAGE_INDEX, FIL_PAGE_LSN, FIL_PAGE_OFFSET, FIL_PAGE_SPACE_ID,
        FIL_PAGE_TYPE, FSP_FREE_LIMIT, FSP_HEADER_OFFSET, FSP_SIZE, FSP_SPACE_FLAGS, PAGE_HEADER,
        PAGE_INDEX_ID,
    },
    redo::{self, Checkpoint, LOG_CHECKPOINT_1, LOG_FILE_HDR_SIZE, OS_FILE_LOG_BLOCK_SIZE},
};

pub const PAGE: usize = 16384;

/// A valid uncompressed page with a recognisable body.
pub fn make_page(space_id: u32, page_no: u32, lsn: u64) -> Vec<u8> {
    let mut p = vec![0u8; PAGE];
    page::write_u32(&mut p, FIL_PAGE_OFFSET, page_no);
    page::write_u64(&mut p, FIL_PAGE_LSN, lsn);
    page::write_u32(&mut p, FIL_PAGE_SPACE_ID, space_id);
    for (i, b) in p[page::FIL_PAGE_DATA + 64..PAGE - 8].iter_mut().enumerate() {
        *b = ((i as u32 + page_no * 7 + space_id) % 251) as u8;
    }
    checksum::stamp_crc32(&mut p);
    p
}

/// Page 0 carrying the FSP header.
pub fn make_page0(space_id: u32, size_pages: u32, free_limit: u32, lsn: u64) -> Vec<u8> {
    let mut p = vec![0u8; PAGE];
    page::write_u64(&mut p, FIL_PAGE_LSN, lsn);
    page::write_u32(&mut p, FIL_PAGE_SPACE_ID, space_id);
    page::write_u32(&mut p, FSP_HEADER_OFFSET, space_id);
    page::write_u32(&mut p, FSP_HEADER_OFFSET + FSP_SIZE, size_pages);
    page::write_u32(&mut p, FSP_HEADER_OFFSET + FSP_FREE_LIMIT, free_limit);
    page::write_u32(&mut p, FSP_HEADER_OFFSET + FSP_SPACE_FLAGS, 0);
    checksum::stamp_crc32(&mut p);
    p
}

/// An index page of `index_id`; `root` leaves a non-zero segment header.
pub fn make_index_page(space_id: u32, page_no: u32, lsn: u64, index_id: u64, root: bool) -> Vec<u8> {
    let mut p = make_page(space_id, page_no, lsn);
    p[FIL_PAGE_TYPE..FIL_PAGE_TYPE + 2].copy_from_slice(&FIL_PAGE_INDEX.to_be_bytes());
    page::write_u64(&mut p, PAGE_HEADER + PAGE_INDEX_ID, index_id);
    let seg = PAGE_HEADER + page::PAGE_BTR_SEG_TOP;
    if root {
        page::write_u32(&mut p, seg, space_id);
        page::write_u32(&mut p, seg + 4, 2);
        p[seg + 8..seg + 10].copy_from_slice(&50u16.to_be_bytes());
    } else {
        p[seg..seg + 10].fill(0);
    }
    checksum::stamp_crc32(&mut p);
    p
}

/// Tablespace of `pages` pages where page `n` has LSN `lsn_of(n)`.
pub fn tablespace(space_id: u32, pages: u32, lsn_of: impl Fn(u32) -> u64) -> Vec<u8> {
    let mut out = make_page0(space_id, pages, pages, lsn_of(0));
    for n in 1..pages {
        out.extend_from_slice(&make_page(space_id, n, lsn_of(n)));
    }
    out
}

pub fn write_tablespace(path: &Path, data: &[u8]) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, data).unwrap();
}

/// LSN of the checkpoint in logs built by [`write_redo_log`].
pub const LOG_START_LSN: u64 = 8192;

/// `ib_logfile0` with a checkpoint at [`LOG_START_LSN`] followed by
/// `full_blocks` full blocks and one block holding `tail_len` bytes.
/// Returns the LSN the written log ends at.
pub fn write_redo_log(dir: &Path, data_blocks: usize, full_blocks: usize, tail_len: u16) -> u64 {
    let block = OS_FILE_LOG_BLOCK_SIZE;
    let file_size = LOG_FILE_HDR_SIZE as usize + data_blocks * block;
    let mut file = vec![0u8; file_size];

    file[redo::LOG_HEADER_START_LSN..redo::LOG_HEADER_START_LSN + 8]
        .copy_from_slice(&LOG_START_LSN.to_be_bytes());
    redo::stamp_block_checksum(&mut file[..block]);
    let checkpoint = Checkpoint {
        number: 1,
        lsn: LOG_START_LSN,
        offset: LOG_FILE_HDR_SIZE,
    };
    file[LOG_CHECKPOINT_1..LOG_CHECKPOINT_1 + block].copy_from_slice(&checkpoint.encode());

    let mut lsn = LOG_START_LSN;
    for i in 0..=full_blocks {
        let at = LOG_FILE_HDR_SIZE as usize + i * block;
        let len = if i == full_blocks { tail_len } else { block as u16 };
        let body = &mut file[at..at + block];
        for (j, b) in body[redo::LOG_BLOCK_HDR_SIZE..redo::LOG_BLOCK_CHECKSUM]
            .iter_mut()
            .enumerate()
        {
            *b = ((i + j) % 199) as u8;
        }
        redo::init_block(body, lsn, len, 12, 1, i == 0);
        lsn += u64::from(len);
    }
    fs::write(dir.join("ib_logfile0"), file).unwrap();
    lsn
}

/// Secondary-index layout used by the compact backups: pages 5 and 6 belong
/// to index 200 and can be dropped.
pub fn orders_tablespace(space_id: u32, lsn: u64) -> Vec<u8> {
    let mut data = make_page0(space_id, 8, 8, lsn);
    data.extend(make_page(space_id, 1, lsn));
    data.extend(make_page(space_id, 2, lsn));
    data.extend(make_index_page(space_id, 3, lsn, 100, true));
    data.extend(make_index_page(space_id, 4, lsn, 200, true));
    data.extend(make_index_page(space_id, 5, lsn, 200, false));
    data.extend(make_index_page(space_id, 6, lsn, 200, false));
    data.extend(make_index_page(space_id, 7, lsn, 100, false));
    data
}

/// LSN stamped on every page of [`build_datadir`].
pub const DATA_LSN: u64 = 100;

/// A data directory with a system tablespace, two tables and a redo log.
/// Returns the LSN the redo log ends at.
pub fn build_datadir(dir: &Path) -> u64 {
    write_tablespace(&dir.join("ibdata1"), &tablespace(0, 4, |_| DATA_LSN));
    write_tablespace(&dir.join("shop/orders.ibd"), &orders_tablespace(5, DATA_LSN));
    write_tablespace(&dir.join("shop/items.ibd"), &tablespace(6, 5, |_| DATA_LSN));
    write_redo_log(dir, 16, 3, 200)
}

/// Overwrite page `page_no` of a tablespace in place.
pub fn rewrite_page(path: &Path, page_no: u32, page: &[u8]) {
    use std::os::unix::fs::FileExt;
    let file = fs::OpenOptions::new().write(true).open(path).unwrap();
    file.write_all_at(page, u64::from(page_no) * PAGE as u64).unwrap();
}
