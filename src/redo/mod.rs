//! Redo log block and checkpoint formats.
//!
//! The log is a ring of 512-byte blocks addressed by LSN. Every block starts
//! with a 12-byte header (block number with the flush bit, data length,
//! first record group, checkpoint number) and ends with a 4-byte checksum.

pub mod copier;
pub mod source;

pub use copier::{LogCopier, LogCopyOptions, LogCopyResult, LOG_FILE_NAME};
pub use source::{LogFiles, LogSource};

pub const OS_FILE_LOG_BLOCK_SIZE: usize = 512;
pub const LOG_BLOCK_HDR_NO: usize = 0;
pub const LOG_BLOCK_FLUSH_BIT_MASK: u32 = 0x8000_0000;
pub const LOG_BLOCK_HDR_DATA_LEN: usize = 4;
pub const LOG_BLOCK_FIRST_REC_GROUP: usize = 6;
pub const LOG_BLOCK_CHECKPOINT_NO: usize = 8;
pub const LOG_BLOCK_HDR_SIZE: usize = 12;
pub const LOG_BLOCK_CHECKSUM: usize = OS_FILE_LOG_BLOCK_SIZE - 4;

/// Every log file starts with this many bytes of header.
pub const LOG_FILE_HDR_SIZE: u64 = 2048;
pub const LOG_HEADER_FORMAT: usize = 0;
pub const LOG_HEADER_START_LSN: usize = 8;
pub const LOG_HEADER_CREATOR: usize = 16;
pub const LOG_HEADER_CREATOR_LEN: usize = 32;
/// Offsets of the two checkpoint blocks in the first log file.
pub const LOG_CHECKPOINT_1: usize = 512;
pub const LOG_CHECKPOINT_2: usize = 1536;
pub const LOG_CHECKPOINT_NO: usize = 0;
pub const LOG_CHECKPOINT_LSN: usize = 8;
pub const LOG_CHECKPOINT_OFFSET: usize = 16;

/// Block numbers wrap at this mask.
const LOG_BLOCK_NO_MASK: u64 = 0x3FFF_FFFF;

fn be_u16(b: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([b[at], b[at + 1]])
}

fn be_u32(b: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
}

fn be_u64(b: &[u8], at: usize) -> u64 {
    let mut v = [0u8; 8];
    v.copy_from_slice(&b[at..at + 8]);
    u64::from_be_bytes(v)
}

/// Block number of the block containing `lsn`.
pub fn block_no_for_lsn(lsn: u64) -> u32 {
    (((lsn / OS_FILE_LOG_BLOCK_SIZE as u64) & LOG_BLOCK_NO_MASK) + 1) as u32
}

pub fn block_hdr_no(block: &[u8]) -> u32 {
    be_u32(block, LOG_BLOCK_HDR_NO) & !LOG_BLOCK_FLUSH_BIT_MASK
}

pub fn block_flush_bit(block: &[u8]) -> bool {
    be_u32(block, LOG_BLOCK_HDR_NO) & LOG_BLOCK_FLUSH_BIT_MASK != 0
}

pub fn block_data_len(block: &[u8]) -> usize {
    usize::from(be_u16(block, LOG_BLOCK_HDR_DATA_LEN))
}

pub fn block_first_rec_group(block: &[u8]) -> usize {
    usize::from(be_u16(block, LOG_BLOCK_FIRST_REC_GROUP))
}

pub fn block_checkpoint_no(block: &[u8]) -> u32 {
    be_u32(block, LOG_BLOCK_CHECKPOINT_NO)
}

pub fn block_stored_checksum(block: &[u8]) -> u32 {
    be_u32(block, LOG_BLOCK_CHECKSUM)
}

/// CRC-32C over everything but the trailer.
pub fn block_checksum_crc32(block: &[u8]) -> u32 {
    crc32c::crc32c(&block[..LOG_BLOCK_CHECKSUM])
}

/// Pre-CRC32 log block checksum.
pub fn block_checksum_innodb(block: &[u8]) -> u32 {
    let mut sum: u32 = 1;
    let mut sh = 0u32;
    for &b in &block[..LOG_BLOCK_CHECKSUM] {
        sum &= 0x7FFF_FFFF;
        sum = sum.wrapping_add(u32::from(b));
        sum = sum.wrapping_add(u32::from(b) << sh);
        sh += 1;
        if sh > 24 {
            sh = 0;
        }
    }
    sum
}

/// Accepts CRC-32C, the legacy fold checksum and the very old format where
/// the trailer repeats the block number.
pub fn block_checksum_is_ok(block: &[u8]) -> bool {
    let stored = block_stored_checksum(block);
    stored == block_checksum_crc32(block)
        || stored == block_checksum_innodb(block)
        || stored == be_u32(block, LOG_BLOCK_HDR_NO)
}

/// Fill in the header of a 512-byte block and stamp its CRC-32C checksum.
pub fn init_block(
    block: &mut [u8],
    lsn: u64,
    data_len: u16,
    first_rec_group: u16,
    checkpoint_no: u32,
    flush: bool,
) {
    let mut no = block_no_for_lsn(lsn);
    if flush {
        no |= LOG_BLOCK_FLUSH_BIT_MASK;
    }
    block[LOG_BLOCK_HDR_NO..LOG_BLOCK_HDR_NO + 4].copy_from_slice(&no.to_be_bytes());
    block[LOG_BLOCK_HDR_DATA_LEN..LOG_BLOCK_HDR_DATA_LEN + 2]
        .copy_from_slice(&data_len.to_be_bytes());
    block[LOG_BLOCK_FIRST_REC_GROUP..LOG_BLOCK_FIRST_REC_GROUP + 2]
        .copy_from_slice(&first_rec_group.to_be_bytes());
    block[LOG_BLOCK_CHECKPOINT_NO..LOG_BLOCK_CHECKPOINT_NO + 4]
        .copy_from_slice(&checkpoint_no.to_be_bytes());
    stamp_block_checksum(block);
}

pub fn stamp_block_checksum(block: &mut [u8]) {
    let crc = block_checksum_crc32(block);
    block[LOG_BLOCK_CHECKSUM..LOG_BLOCK_CHECKSUM + 4].copy_from_slice(&crc.to_be_bytes());
}

/// A checkpoint record from a log file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    pub number: u64,
    pub lsn: u64,
    /// Byte offset of `lsn` within the log files, headers included.
    pub offset: u64,
}

impl Checkpoint {
    /// Decode a checkpoint block; `None` if its checksum does not match.
    pub fn parse(block: &[u8]) -> Option<Self> {
        if block.len() < OS_FILE_LOG_BLOCK_SIZE
            || block_stored_checksum(block) != block_checksum_crc32(block)
        {
            return None;
        }
        Some(Self {
            number: be_u64(block, LOG_CHECKPOINT_NO),
            lsn: be_u64(block, LOG_CHECKPOINT_LSN),
            offset: be_u64(block, LOG_CHECKPOINT_OFFSET),
        })
    }

    pub fn encode(&self) -> [u8; OS_FILE_LOG_BLOCK_SIZE] {
        let mut block = [0u8; OS_FILE_LOG_BLOCK_SIZE];
        block[LOG_CHECKPOINT_NO..LOG_CHECKPOINT_NO + 8].copy_from_slice(&self.number.to_be_bytes());
        block[LOG_CHECKPOINT_LSN..LOG_CHECKPOINT_LSN + 8].copy_from_slice(&self.lsn.to_be_bytes());
        block[LOG_CHECKPOINT_OFFSET..LOG_CHECKPOINT_OFFSET + 8]
            .copy_from_slice(&self.offset.to_be_bytes());
        stamp_block_checksum(&mut block);
        block
    }
}

/// The newer of the two checkpoints in a log file header.
pub fn latest_checkpoint(header: &[u8]) -> Option<Checkpoint> {
    let first = header
        .get(LOG_CHECKPOINT_1..LOG_CHECKPOINT_1 + OS_FILE_LOG_BLOCK_SIZE)
        .and_then(Checkpoint::parse);
    let second = header
        .get(LOG_CHECKPOINT_2..LOG_CHECKPOINT_2 + OS_FILE_LOG_BLOCK_SIZE)
        .and_then(Checkpoint::parse);
    match (first, second) {
        (Some(a), Some(b)) => Some(if b.number > a.number { b } else { a }),
        (a, b) => a.or(b),
    }
}

pub fn align_down(lsn: u64) -> u64 {
    lsn / OS_FILE_LOG_BLOCK_SIZE as u64 * OS_FILE_LOG_BLOCK_SIZE as u64
}

pub fn align_up(lsn: u64) -> u64 {
    align_down(lsn + OS_FILE_LOG_BLOCK_SIZE as u64 - 1)
}
