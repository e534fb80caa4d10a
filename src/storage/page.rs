use serde::{Deserialize, Serialize};

use crate::common::{Lsn, PageId, EFFECTIVE_PAGE_SIZE, NO_LSN};

/// A fixed-size block of data plus the LSN of the most recent log record
/// reflected on it. The page LSN is what redo compares against to decide
/// whether a logged change has already reached this page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page {
    id: PageId,
    page_lsn: Lsn,
    data: Vec<u8>,
}

impl Page {
    pub fn new(id: PageId) -> Self {
        Self {
            id,
            page_lsn: NO_LSN,
            data: vec![0; EFFECTIVE_PAGE_SIZE],
        }
    }

    pub fn id(&self) -> PageId {
        self.id
    }

    pub fn page_lsn(&self) -> Lsn {
        self.page_lsn
    }

    pub fn set_page_lsn(&mut self, lsn: Lsn) {
        self.page_lsn = lsn;
    }

    /// Reads `len` bytes starting at `offset`.
    pub fn read(&self, offset: usize, len: usize) -> &[u8] {
        assert!(offset + len <= EFFECTIVE_PAGE_SIZE, "page read out of bounds");
        &self.data[offset..offset + len]
    }

    /// Writes `bytes` starting at `offset`. Does not touch the page LSN;
    /// callers stamp it with the LSN of the record describing this write.
    pub fn write(&mut self, offset: usize, bytes: &[u8]) {
        assert!(
            offset + bytes.len() <= EFFECTIVE_PAGE_SIZE,
            "page write out of bounds"
        );
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_starts_zeroed() {
        let page = Page::new(7);
        assert_eq!(page.id(), 7);
        assert_eq!(page.page_lsn(), NO_LSN);
        assert!(page.data().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_write_then_read() {
        let mut page = Page::new(7);
        page.write(10, &[0xAB, 0xCD]);
        page.set_page_lsn(42);
        assert_eq!(page.read(10, 2), &[0xAB, 0xCD]);
        assert_eq!(page.page_lsn(), 42);
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn test_write_past_effective_size() {
        let mut page = Page::new(7);
        page.write(EFFECTIVE_PAGE_SIZE - 1, &[0, 0]);
    }
}
