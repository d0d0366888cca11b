use crate::constants::PageFlags;

/// A page number within the map.
pub(crate) type PageNo = u64;

/// Header written at the front of every self-identifying page.
///
/// Continuation pages of a multi-page overflow record carry no header;
/// their leading bytes are raw value data. The stored `pgno` is what lets
/// the dirty-page classifier reject pointers into such pages.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub(crate) struct PageHeader {
    /// Self-identifying page number
    pub pgno: PageNo,
    /// Page kind bits (`PageFlags`)
    pub flags: u16,
    pub _reserved: u16,
    /// Bytes used after the header, or the page count for an overflow head
    pub used: u32,
}

/// Bytes occupied by the header at the front of a page.
pub(crate) const PAGE_HDR: usize = std::mem::size_of::<PageHeader>();

impl PageHeader {
    pub(crate) fn new(pgno: PageNo, flags: PageFlags, used: u32) -> Self {
        PageHeader {
            pgno,
            flags: flags.bits(),
            _reserved: 0,
            used,
        }
    }

    /// Whether the stored flag bits name exactly one legal standalone page
    /// kind. Anything else means the header bytes are not a header at all
    /// (a pointer into the middle of a multi-page record) or the page is a
    /// partial kind that must never be handed out.
    pub(crate) fn is_legal_kind(&self) -> bool {
        let kind = PageFlags::from_bits(self.flags);
        kind == Some(PageFlags::LEAF)
            || kind == Some(PageFlags::OVERFLOW)
            || kind == Some(PageFlags::META)
    }
}

/// Number of pages an overflow record of `len` value bytes occupies,
/// header included.
pub(crate) fn overflow_pages(len: usize, page_size: usize) -> u64 {
    ((PAGE_HDR + len + page_size - 1) / page_size) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legal_kinds() {
        assert!(PageHeader::new(3, PageFlags::LEAF, 0).is_legal_kind());
        assert!(PageHeader::new(7, PageFlags::OVERFLOW, 2).is_legal_kind());
        assert!(PageHeader::new(0, PageFlags::META, 0).is_legal_kind());
    }

    #[test]
    fn illegal_kinds() {
        let mut hdr = PageHeader::new(3, PageFlags::LEAF, 0);
        hdr.flags = (PageFlags::LEAF | PageFlags::META).bits();
        assert!(!hdr.is_legal_kind());
        hdr.flags = 0;
        assert!(!hdr.is_legal_kind());
        hdr.flags = 0x4000;
        assert!(!hdr.is_legal_kind());
    }

    #[test]
    fn overflow_page_count() {
        assert_eq!(overflow_pages(1, 4096), 1);
        assert_eq!(overflow_pages(4096 - PAGE_HDR, 4096), 1);
        assert_eq!(overflow_pages(4096 - PAGE_HDR + 1, 4096), 2);
        assert_eq!(overflow_pages(3 * 4096, 4096), 4);
    }
}
