use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::debug;

use super::frame::{BufferPool, PageReadPolicy, PinnedPage};
use super::range::PageRange;
use crate::primitives::io::FileIo;
use crate::types::{
    page::{pages_for_bytes, PAGE_SIZE},
    FileId, PageId, PenumbraError, Result,
};

/// A paged file registered with the shared buffer pool.
///
/// The logical page count can run ahead of the physical length: pages added
/// by [`FileHandle::add_new_pages`] exist only in bookkeeping until something
/// writes them or [`FileHandle::materialize_logical_size`] grows the file.
pub struct FileHandle {
    file_id: FileId,
    io: Arc<dyn FileIo>,
    pool: Arc<BufferPool>,
    num_pages: AtomicU64,
}

impl FileHandle {
    /// Wraps `io` with an explicit logical page count.
    pub fn new(file_id: FileId, io: Arc<dyn FileIo>, pool: Arc<BufferPool>, num_pages: u64) -> Self {
        pool.register_file(file_id, Arc::clone(&io));
        Self {
            file_id,
            io,
            pool,
            num_pages: AtomicU64::new(num_pages),
        }
    }

    /// Wraps `io`, deriving the page count from its length. At least
    /// `reserved_pages` pages are reported even for an empty file.
    pub fn open(
        file_id: FileId,
        io: Arc<dyn FileIo>,
        pool: Arc<BufferPool>,
        reserved_pages: u64,
    ) -> Result<Self> {
        let num_pages = pages_for_bytes(io.len()?).max(reserved_pages);
        Ok(Self::new(file_id, io, pool, num_pages))
    }

    /// Identifier used for buffer pool frames of this file.
    pub fn file_id(&self) -> FileId {
        self.file_id
    }

    /// Underlying positioned I/O.
    pub fn io(&self) -> &Arc<dyn FileIo> {
        &self.io
    }

    /// Buffer pool this file caches its pages in.
    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    /// Whether the file lives only in memory.
    pub fn is_in_memory(&self) -> bool {
        self.io.is_in_memory()
    }

    /// Logical number of pages.
    pub fn num_pages(&self) -> u64 {
        self.num_pages.load(Ordering::Acquire)
    }

    /// Appends `n` pages to the logical file and returns the first of them.
    pub fn add_new_pages(&self, n: u64) -> PageId {
        PageId(self.num_pages.fetch_add(n, Ordering::AcqRel))
    }

    /// Pins `page` through the buffer pool.
    pub fn pin_page(&self, page: PageId, policy: PageReadPolicy) -> Result<PinnedPage> {
        self.pool.pin(self.file_id, page, policy)
    }

    /// Reads `page` without pinning: the cached frame when one exists,
    /// otherwise straight from disk with zeros past the physical end.
    pub fn optimistic_read_page<R>(
        &self,
        page: PageId,
        f: impl FnOnce(&[u8]) -> Result<R>,
    ) -> Result<R> {
        let cached = self
            .pool
            .with_cached_page(self.file_id, page, |buf| buf.to_vec());
        let buf = match cached {
            Some(buf) => buf,
            None => {
                let mut buf = vec![0u8; PAGE_SIZE];
                self.io.read_at_or_zero(page.byte_offset(), &mut buf)?;
                buf
            }
        };
        f(&buf)
    }

    /// Writes a full page directly to the file and refreshes any cached frame.
    pub fn write_page_to_file(&self, page: PageId, buf: &[u8]) -> Result<()> {
        if buf.len() != PAGE_SIZE {
            return Err(PenumbraError::Invalid("page write must cover a full page"));
        }
        self.io.write_at(page.byte_offset(), buf)?;
        self.pool.update_frame_if_cached(self.file_id, page, buf);
        if page.0 >= self.num_pages() {
            self.num_pages.fetch_max(page.0 + 1, Ordering::AcqRel);
        }
        Ok(())
    }

    /// Drops the cached frame of `page` if it is not pinned.
    pub fn remove_page_from_frame_if_necessary(&self, page: PageId) -> bool {
        self.pool.remove_page_if_cached(self.file_id, page)
    }

    /// Drops every cached frame covering `range`.
    pub fn remove_page_range_from_frames(&self, range: PageRange) {
        for page in range.iter_pages() {
            self.remove_page_from_frame_if_necessary(page);
        }
    }

    /// Writes back every dirty frame of this file.
    pub fn flush_all_dirty_pages(&self) -> Result<usize> {
        self.pool.flush_file(self.file_id)
    }

    /// Grows the physical file to its logical page count.
    pub fn materialize_logical_size(&self) -> Result<()> {
        let logical = self.num_pages() * PAGE_SIZE as u64;
        if self.io.len()? < logical {
            debug!(file = %self.file_id, pages = self.num_pages(), "file_handle.extend");
            self.io.truncate(logical)?;
        }
        Ok(())
    }

    /// Discards cached frames and truncates the file to `num_pages` pages.
    pub fn reset_to(&self, num_pages: u64) -> Result<()> {
        self.pool.drop_file_frames(self.file_id);
        self.io.truncate(num_pages * PAGE_SIZE as u64)?;
        self.num_pages.store(num_pages, Ordering::Release);
        Ok(())
    }

    /// Shrinks the file to `num_pages`, discarding cached frames past the end.
    pub fn truncate_pages(&self, num_pages: u64) -> Result<()> {
        self.pool.drop_frames_from(self.file_id, PageId(num_pages));
        if self.io.len()? > num_pages * PAGE_SIZE as u64 {
            self.io.truncate(num_pages * PAGE_SIZE as u64)?;
        }
        self.num_pages.store(num_pages, Ordering::Release);
        Ok(())
    }

    /// Makes previous writes durable.
    pub fn sync(&self) -> Result<()> {
        self.io.sync_all()
    }
}
