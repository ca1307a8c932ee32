#[path = "../common/mod.rs"]
mod common;

use std::io::Cursor as IoCursor;

use common::{make_page, make_page0, PAGE};
use xbk::{
    copy::{cursor::read_space_header, PageSource},
    page::{checksum, PageSize, FSP_HEADER_OFFSET, FSP_SPACE_FLAGS},
};

/// In-memory page source.
struct Bytes(IoCursor<Vec<u8>>);

impl PageSource for Bytes {
    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
        let data = self.0.get_ref();
        let start = (offset as usize).min(data.len());
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        Ok(n)
    }

    fn size(&mut self) -> std::io::Result<u64> {
        Ok(self.0.get_ref().len() as u64)
    }
}

#[test]
fn generated_pages_pass_verification() {
    let ps = PageSize::uncompressed(PAGE);
    for n in 1..8 {
        assert!(!checksum::is_corrupted(&make_page(9, n, 1000 + u64::from(n)), ps));
    }
    assert!(!checksum::is_corrupted(&make_page0(9, 8, 8, 1), ps));
}

#[test]
fn single_bit_flip_in_body_is_detected() {
    let ps = PageSize::uncompressed(PAGE);
    let mut page = make_page(9, 3, 5000);
    page[PAGE / 2] ^= 0x04;
    assert!(checksum::is_corrupted(&page, ps));
}

#[test]
fn header_reads_space_id_and_compressed_size() {
    let zip = PageSize {
        logical: 16384,
        physical: 4096,
    };
    let mut page0 = make_page0(42, 4, 4, 1)[..4096].to_vec();
    xbk::page::write_u32(&mut page0, FSP_HEADER_OFFSET + FSP_SPACE_FLAGS, zip.to_flags());

    let header = read_space_header(&mut Bytes(IoCursor::new(page0)), 16384).unwrap();
    assert_eq!(header.space_id, 42);
    assert_eq!(header.page_size, zip);
    assert_eq!(header.flags, zip.to_flags());
}

#[test]
fn system_space_uses_server_page_size() {
    let mut page0 = make_page0(0, 4, 4, 1);
    // Flags claim 4 KiB pages, but space 0 always follows the server setting.
    let small = PageSize::uncompressed(4096).to_flags();
    xbk::page::write_u32(&mut page0, FSP_HEADER_OFFSET + FSP_SPACE_FLAGS, small);
    let header = read_space_header(&mut Bytes(IoCursor::new(page0)), 8192).unwrap();
    assert_eq!(header.space_id, 0);
    assert_eq!(header.page_size, PageSize::uncompressed(8192));
}

#[test]
fn short_file_is_an_empty_space() {
    let header = read_space_header(&mut Bytes(IoCursor::new(vec![1, 2, 3])), 16384).unwrap();
    assert_eq!(header.space_id, 0);
    assert_eq!(header.page_size, PageSize::uncompressed(16384));
}
