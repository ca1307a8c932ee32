//! InnoDB page layout: header offsets, tablespace flags and page-size probing.
//!
//! All multi-byte fields inside a page are big-endian.

pub mod checksum;

/// Default logical page size (`innodb_page_size`).
pub const UNIV_PAGE_SIZE_ORIG: usize = 16384;
pub const UNIV_PAGE_SIZE_MIN: usize = 4096;
pub const UNIV_PAGE_SIZE_MAX: usize = 65536;
pub const UNIV_ZIP_SIZE_MIN: usize = 1024;

pub const FIL_PAGE_SPACE_OR_CHKSUM: usize = 0;
pub const FIL_PAGE_OFFSET: usize = 4;
pub const FIL_PAGE_LSN: usize = 16;
pub const FIL_PAGE_TYPE: usize = 24;
pub const FIL_PAGE_FILE_FLUSH_LSN: usize = 26;
pub const FIL_PAGE_SPACE_ID: usize = 34;
pub const FIL_PAGE_DATA: usize = 38;
/// Size of the page trailer (old-style checksum + low 32 bits of the LSN).
pub const FIL_PAGE_END_LSN_OLD_CHKSUM: usize = 8;

pub const FSP_HEADER_OFFSET: usize = FIL_PAGE_DATA;
pub const FSP_SIZE: usize = 8;
pub const FSP_FREE_LIMIT: usize = 12;
pub const FSP_SPACE_FLAGS: usize = 16;

pub const PAGE_HEADER: usize = FIL_PAGE_DATA;
pub const PAGE_INDEX_ID: usize = 28;
pub const PAGE_BTR_SEG_TOP: usize = 36 + 10;

/// B-tree node page type.
pub const FIL_PAGE_INDEX: u16 = 17855;

/// Space id of the system tablespace (`ibdata1`).
pub const TRX_SYS_SPACE: u32 = 0;
/// Space id of the data dictionary tablespace (`mysql.ibd`).
pub const DICT_SPACE_ID: u32 = 0xFFFF_FFFE;

/// Page number of the clustered index root in a file-per-table tablespace.
pub const FIRST_CLUSTERED_INDEX_PAGE_NO: u64 = 3;

const FSP_FLAGS_POS_ZIP_SSIZE: u32 = 1;
const FSP_FLAGS_MASK_ZIP_SSIZE: u32 = 0xF << FSP_FLAGS_POS_ZIP_SSIZE;
const FSP_FLAGS_POS_PAGE_SSIZE: u32 = 6;
const FSP_FLAGS_MASK_PAGE_SSIZE: u32 = 0xF << FSP_FLAGS_POS_PAGE_SSIZE;

pub fn read_u16(page: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([page[offset], page[offset + 1]])
}

pub fn read_u32(page: &[u8], offset: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&page[offset..offset + 4]);
    u32::from_be_bytes(b)
}

pub fn read_u64(page: &[u8], offset: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&page[offset..offset + 8]);
    u64::from_be_bytes(b)
}

pub fn write_u32(page: &mut [u8], offset: usize, value: u32) {
    page[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
}

pub fn write_u64(page: &mut [u8], offset: usize, value: u64) {
    page[offset..offset + 8].copy_from_slice(&value.to_be_bytes());
}

pub fn page_no(page: &[u8]) -> u32 {
    read_u32(page, FIL_PAGE_OFFSET)
}

pub fn page_lsn(page: &[u8]) -> u64 {
    read_u64(page, FIL_PAGE_LSN)
}

pub fn page_type(page: &[u8]) -> u16 {
    read_u16(page, FIL_PAGE_TYPE)
}

pub fn page_space_id(page: &[u8]) -> u32 {
    read_u32(page, FIL_PAGE_SPACE_ID)
}

/// Tablespace flags stored in the FSP header of page 0.
pub fn fsp_flags(page0: &[u8]) -> u32 {
    read_u32(page0, FSP_HEADER_OFFSET + FSP_SPACE_FLAGS)
}

/// First page number not yet initialised in the tablespace (FSP header of page 0).
pub fn fsp_free_limit(page0: &[u8]) -> u32 {
    read_u32(page0, FSP_HEADER_OFFSET + FSP_FREE_LIMIT)
}

/// Page sizes of one tablespace.
///
/// `physical` is what is stored on disk (smaller than `logical` for
/// ROW_FORMAT=COMPRESSED tablespaces).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageSize {
    pub logical: usize,
    pub physical: usize,
}

impl PageSize {
    pub fn uncompressed(size: usize) -> Self {
        Self {
            logical: size,
            physical: size,
        }
    }

    pub fn is_compressed(&self) -> bool {
        self.physical != self.logical
    }

    /// Decode page sizes from FSP flags. `server_page_size` is used when the
    /// flags carry no explicit logical size.
    pub fn from_flags(flags: u32, server_page_size: usize) -> Self {
        let page_ssize = (flags & FSP_FLAGS_MASK_PAGE_SSIZE) >> FSP_FLAGS_POS_PAGE_SSIZE;
        let zip_ssize = (flags & FSP_FLAGS_MASK_ZIP_SSIZE) >> FSP_FLAGS_POS_ZIP_SSIZE;

        let logical = if page_ssize == 0 {
            if server_page_size == 0 {
                UNIV_PAGE_SIZE_ORIG
            } else {
                server_page_size
            }
        } else {
            (UNIV_ZIP_SIZE_MIN >> 1) << page_ssize
        };
        let physical = if zip_ssize == 0 {
            logical
        } else {
            (UNIV_ZIP_SIZE_MIN >> 1) << zip_ssize
        };

        Self { logical, physical }
    }

    /// Encode as FSP flags (page and zip shift only).
    pub fn to_flags(&self) -> u32 {
        let shift = |size: usize| (size / (UNIV_ZIP_SIZE_MIN >> 1)).trailing_zeros();
        let mut flags = 0u32;
        if self.logical != UNIV_PAGE_SIZE_ORIG {
            flags |= shift(self.logical) << FSP_FLAGS_POS_PAGE_SSIZE;
        }
        if self.is_compressed() {
            flags |= shift(self.physical) << FSP_FLAGS_POS_ZIP_SSIZE;
        }
        flags
    }
}

/// Number of pages in one extent for the given logical page size.
pub fn extent_size(logical_page_size: usize) -> u64 {
    if logical_page_size <= UNIV_PAGE_SIZE_ORIG {
        (1_048_576 / logical_page_size) as u64
    } else {
        64
    }
}

/// Whether `page_no` of a system tablespace lies in the doublewrite buffer.
pub fn is_doublewrite_page(page_no: u64, logical_page_size: usize) -> bool {
    let extent = extent_size(logical_page_size);
    page_no >= extent && page_no < extent * 3
}

/// Whether a space id belongs to a tablespace shared by the whole engine.
pub fn is_system_space(space_id: u32) -> bool {
    space_id == TRX_SYS_SPACE || space_id == DICT_SPACE_ID
}
