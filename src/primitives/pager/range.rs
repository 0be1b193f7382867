use std::fmt;

use serde::Serialize;

use crate::primitives::bytes::{Deserializer, Serializer};
use crate::types::{page::INVALID_PAGE_IDX, PageId, Result};

/// A contiguous span of pages, the unit of allocation.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize)]
pub struct PageRange {
    /// First page of the span.
    pub start_page_idx: u64,
    /// Number of pages in the span.
    pub num_pages: u64,
}

impl PageRange {
    /// Creates a range covering `num_pages` pages starting at `start_page_idx`.
    pub const fn new(start_page_idx: u64, num_pages: u64) -> Self {
        Self {
            start_page_idx,
            num_pages,
        }
    }

    /// The "no range" value carried by a fresh database header.
    pub const fn invalid() -> Self {
        Self::new(INVALID_PAGE_IDX, 0)
    }

    /// Returns false for the sentinel produced by [`PageRange::invalid`].
    pub fn is_valid(&self) -> bool {
        self.start_page_idx != INVALID_PAGE_IDX
    }

    /// One past the last page of the span.
    pub fn end(&self) -> u64 {
        self.start_page_idx + self.num_pages
    }

    /// The pages from `offset` to the end of the span.
    pub fn subrange(&self, offset: u64) -> PageRange {
        debug_assert!(offset <= self.num_pages, "subrange offset past end");
        PageRange::new(self.start_page_idx + offset, self.num_pages - offset)
    }

    /// Whether `page` lies inside the span.
    pub fn contains(&self, page: PageId) -> bool {
        page.0 >= self.start_page_idx && page.0 < self.end()
    }

    /// Whether the two spans share at least one page.
    pub fn overlaps(&self, other: &PageRange) -> bool {
        self.start_page_idx < other.end() && other.start_page_idx < self.end()
    }

    /// Iterates the pages of the span.
    pub fn iter_pages(&self) -> impl Iterator<Item = PageId> {
        (self.start_page_idx..self.end()).map(PageId)
    }

    /// The page at `offset` within the span.
    pub fn page(&self, offset: u64) -> PageId {
        PageId(self.start_page_idx + offset)
    }

    pub(crate) fn serialize(&self, ser: &mut Serializer) {
        ser.write_u64(self.start_page_idx);
        ser.write_u64(self.num_pages);
    }

    pub(crate) fn deserialize(de: &mut Deserializer<'_>) -> Result<Self> {
        let start_page_idx = de.read_u64()?;
        let num_pages = de.read_u64()?;
        Ok(Self::new(start_page_idx, num_pages))
    }
}

impl Default for PageRange {
    fn default() -> Self {
        Self::invalid()
    }
}

impl fmt::Display for PageRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "{{{}, {}}}", self.start_page_idx, self.num_pages)
        } else {
            f.write_str("{invalid}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subrange_keeps_the_tail() {
        let range = PageRange::new(10, 8);
        assert_eq!(range.subrange(3), PageRange::new(13, 5));
        assert_eq!(range.subrange(8).num_pages, 0);
    }

    #[test]
    fn overlap_is_half_open() {
        let a = PageRange::new(10, 5);
        assert!(a.overlaps(&PageRange::new(14, 1)));
        assert!(!a.overlaps(&PageRange::new(15, 3)));
        assert!(!a.overlaps(&PageRange::new(5, 5)));
        assert!(a.contains(PageId(14)));
        assert!(!a.contains(PageId(15)));
    }

    #[test]
    fn default_is_invalid() {
        let range = PageRange::default();
        assert!(!range.is_valid());
        assert_eq!(range.to_string(), "{invalid}");
    }
}
