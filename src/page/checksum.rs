//! Page checksum verification.
//!
//! Accepts every algorithm the engine may have written: CRC-32C, the legacy
//! InnoDB fold checksums and the `none` magic.

use super::{
    read_u32, PageSize, FIL_PAGE_DATA, FIL_PAGE_END_LSN_OLD_CHKSUM, FIL_PAGE_FILE_FLUSH_LSN,
    FIL_PAGE_LSN, FIL_PAGE_OFFSET, FIL_PAGE_SPACE_OR_CHKSUM, FIL_PAGE_TYPE,
};

/// Checksum value written when `innodb_checksum_algorithm=none`.
pub const BUF_NO_CHECKSUM_MAGIC: u32 = 0xDEAD_BEEF;

const UT_HASH_RANDOM_MASK: u64 = 1_463_735_687;
const UT_HASH_RANDOM_MASK2: u64 = 1_653_893_711;

fn fold_pair(n1: u64, n2: u64) -> u64 {
    ((((n1 ^ n2 ^ UT_HASH_RANDOM_MASK2) << 8).wrapping_add(n1)) ^ UT_HASH_RANDOM_MASK)
        .wrapping_add(n2)
}

fn fold_binary(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .fold(0u64, |fold, &b| fold_pair(fold, u64::from(b)))
}

/// CRC-32C checksum of an uncompressed page.
pub fn page_crc32(page: &[u8]) -> u32 {
    let end = page.len() - FIL_PAGE_END_LSN_OLD_CHKSUM;
    crc32c::crc32c(&page[FIL_PAGE_OFFSET..FIL_PAGE_FILE_FLUSH_LSN])
        ^ crc32c::crc32c(&page[FIL_PAGE_DATA..end])
}

/// Legacy "new" InnoDB checksum stored in the page header.
pub fn page_innodb_new(page: &[u8]) -> u32 {
    let end = page.len() - FIL_PAGE_END_LSN_OLD_CHKSUM;
    let sum = fold_binary(&page[FIL_PAGE_OFFSET..FIL_PAGE_FILE_FLUSH_LSN])
        .wrapping_add(fold_binary(&page[FIL_PAGE_DATA..end]));
    (sum & 0xFFFF_FFFF) as u32
}

/// Legacy "old" InnoDB checksum stored in the page trailer.
pub fn page_innodb_old(page: &[u8]) -> u32 {
    (fold_binary(&page[..FIL_PAGE_FILE_FLUSH_LSN]) & 0xFFFF_FFFF) as u32
}

/// CRC-32C checksum of a ROW_FORMAT=COMPRESSED page.
pub fn zip_page_crc32(page: &[u8]) -> u32 {
    crc32c::crc32c(&page[FIL_PAGE_OFFSET..FIL_PAGE_LSN])
        ^ crc32c::crc32c(&page[FIL_PAGE_TYPE..FIL_PAGE_TYPE + 2])
        ^ crc32c::crc32c(&page[FIL_PAGE_DATA..])
}

fn is_all_zero(page: &[u8]) -> bool {
    page.iter().all(|&b| b == 0)
}

/// Returns `true` when the page fails every accepted checksum algorithm.
///
/// `page` must be exactly one physical page.
pub fn is_corrupted(page: &[u8], page_size: PageSize) -> bool {
    debug_assert_eq!(page.len(), page_size.physical);

    if is_all_zero(page) {
        return false;
    }

    if page_size.is_compressed() {
        let stored = read_u32(page, FIL_PAGE_SPACE_OR_CHKSUM);
        return stored != BUF_NO_CHECKSUM_MAGIC && stored != zip_page_crc32(page);
    }

    let size = page.len();
    let lsn_low = read_u32(page, FIL_PAGE_LSN + 4);
    if lsn_low != read_u32(page, size - 4) {
        return true;
    }

    let field1 = read_u32(page, FIL_PAGE_SPACE_OR_CHKSUM);
    let field2 = read_u32(page, size - FIL_PAGE_END_LSN_OLD_CHKSUM);

    if field1 == BUF_NO_CHECKSUM_MAGIC && field2 == BUF_NO_CHECKSUM_MAGIC {
        return false;
    }

    let crc = page_crc32(page);
    if field1 == crc && field2 == crc {
        return false;
    }

    // Very old formats left field 1 unused and stored the LSN high word in field 2.
    let field2_ok = field2 == page_innodb_old(page) || field2 == read_u32(page, FIL_PAGE_LSN);
    let field1_ok = field1 == 0 || field1 == page_innodb_new(page);
    !(field1_ok && field2_ok)
}

/// Stamp a CRC-32C checksum into the header and trailer of an uncompressed
/// page, keeping the trailer LSN in sync with the header LSN.
pub fn stamp_crc32(page: &mut [u8]) {
    let size = page.len();
    let lsn_low = read_u32(page, FIL_PAGE_LSN + 4);
    page[size - 4..].copy_from_slice(&lsn_low.to_be_bytes());
    let crc = page_crc32(page);
    page[FIL_PAGE_SPACE_OR_CHKSUM..FIL_PAGE_SPACE_OR_CHKSUM + 4]
        .copy_from_slice(&crc.to_be_bytes());
    page[size - FIL_PAGE_END_LSN_OLD_CHKSUM..size - 4].copy_from_slice(&crc.to_be_bytes());
}

/// Stamp the compressed-page checksum into the header.
pub fn stamp_zip_crc32(page: &mut [u8]) {
    let crc = zip_page_crc32(page);
    page[FIL_PAGE_SPACE_OR_CHKSUM..FIL_PAGE_SPACE_OR_CHKSUM + 4]
        .copy_from_slice(&crc.to_be_bytes());
}
