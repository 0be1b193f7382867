use tracing::debug;

use crate::primitives::pager::{FileHandle, PageManager, PageRange};
use crate::types::{page::PAGE_SIZE, PageId, PenumbraError, Result};

use super::shadow::ShadowFile;
use super::shadow_utils::{fill_page, insert_new_page, update_page};

/// Stages a serialized blob in page-sized buffers before it is given pages.
#[derive(Default)]
pub struct MetaWriter {
    pages: Vec<Box<[u8]>>,
    /// Bytes used in the last buffer.
    tail_len: usize,
}

impl MetaWriter {
    /// Creates an empty writer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `data`, splitting it across page boundaries as needed.
    pub fn write(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            if self.pages.is_empty() || self.tail_len == PAGE_SIZE {
                self.pages.push(vec![0u8; PAGE_SIZE].into_boxed_slice());
                self.tail_len = 0;
            }
            let room = PAGE_SIZE - self.tail_len;
            let take = room.min(data.len());
            let tail = self.pages.last_mut().expect("page pushed above");
            tail[self.tail_len..self.tail_len + take].copy_from_slice(&data[..take]);
            self.tail_len += take;
            data = &data[take..];
        }
    }

    /// Buffer of staged page `idx`.
    pub fn get_page(&self, idx: usize) -> Option<&[u8]> {
        self.pages.get(idx).map(|page| &page[..])
    }

    /// Number of staged pages.
    pub fn num_pages(&self) -> u64 {
        self.pages.len() as u64
    }

    /// Staged bytes.
    pub fn len(&self) -> usize {
        match self.pages.len() {
            0 => 0,
            n => (n - 1) * PAGE_SIZE + self.tail_len,
        }
    }

    /// Returns true if nothing was written.
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Allocates a range sized to the staged pages and writes them through
    /// the shadow file. An empty writer allocates nothing and returns an
    /// invalid range.
    pub fn flush(
        &self,
        page_manager: &PageManager,
        fh: &FileHandle,
        shadow_file: &ShadowFile,
    ) -> Result<PageRange> {
        if self.is_empty() {
            return Ok(PageRange::invalid());
        }
        let range = page_manager.allocate_page_range(self.num_pages())?;
        self.flush_into(range, fh, shadow_file)?;
        Ok(range)
    }

    /// Writes the staged pages into `range`, zero-filling pages of the range
    /// past the staged ones.
    pub fn flush_into(&self, range: PageRange, fh: &FileHandle, shadow_file: &ShadowFile) -> Result<()> {
        if self.num_pages() > range.num_pages {
            return Err(PenumbraError::Invalid("staged pages exceed the target range"));
        }
        for offset in 0..range.num_pages {
            let page = range.page(offset);
            let staged = self.get_page(offset as usize).unwrap_or(&[]);
            write_page(fh, page, shadow_file, staged)?;
        }
        debug!(
            range = %range,
            staged = self.num_pages(),
            bytes = self.len(),
            "meta_writer.flush"
        );
        Ok(())
    }
}

/// Pages at the logical end of `fh` are appended through [`insert_new_page`];
/// ranges handed out by the page manager are already inside the file and go
/// through [`update_page`].
fn write_page(fh: &FileHandle, page: PageId, shadow_file: &ShadowFile, bytes: &[u8]) -> Result<()> {
    if page.0 >= fh.num_pages() {
        let inserted = insert_new_page(fh, shadow_file, |buf| {
            fill_page(buf, bytes);
            Ok(())
        })?;
        if inserted != page {
            return Err(PenumbraError::Invalid("inserted page does not match target"));
        }
        return Ok(());
    }
    update_page(fh, page, true, shadow_file, |buf| {
        fill_page(buf, bytes);
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::io::StdFileIo;
    use crate::primitives::pager::BufferPool;
    use crate::storage::shadow_utils::read_shadow_version_of_page;
    use crate::types::FileId;
    use std::sync::Arc;
    use tempfile::tempdir;

    #[test]
    fn writes_split_across_page_boundaries() {
        let mut writer = MetaWriter::new();
        writer.write(&[1u8; PAGE_SIZE - 2]);
        writer.write(&[2u8; 5]);
        assert_eq!(writer.num_pages(), 2);
        assert_eq!(writer.len(), PAGE_SIZE + 3);
        let first = writer.get_page(0).unwrap();
        assert_eq!(&first[PAGE_SIZE - 3..], &[1, 2, 2]);
        assert_eq!(&writer.get_page(1).unwrap()[..4], &[2, 2, 2, 0]);
        assert!(writer.get_page(2).is_none());
    }

    #[test]
    fn exact_page_fill_does_not_open_a_new_page() {
        let mut writer = MetaWriter::new();
        writer.write(&[9u8; PAGE_SIZE]);
        assert_eq!(writer.num_pages(), 1);
        writer.write(&[1]);
        assert_eq!(writer.num_pages(), 2);
    }

    #[test]
    fn flush_into_zero_fills_unused_pages() -> Result<()> {
        let dir = tempdir().unwrap();
        let pool = Arc::new(BufferPool::new(16));
        let data = Arc::new(FileHandle::new(
            FileId(0),
            Arc::new(StdFileIo::open(dir.path().join("data"))?),
            Arc::clone(&pool),
            1,
        ));
        let shadow = ShadowFile::open(Arc::new(StdFileIo::open(dir.path().join("shadow"))?), pool)?;
        let pm = PageManager::new(Arc::clone(&data));

        let mut writer = MetaWriter::new();
        writer.write(b"catalog bytes");
        let range = pm.allocate_page_range(3)?;
        writer.flush_into(range, &data, &shadow)?;
        assert_eq!(shadow.num_shadow_pages(), 3);
        let head = read_shadow_version_of_page(&data, range.page(0), &shadow, |b| Ok(b[..13].to_vec()))?;
        assert_eq!(head, b"catalog bytes");
        let zeroed = read_shadow_version_of_page(&data, range.page(2), &shadow, |b| {
            Ok(b.iter().all(|&x| x == 0))
        })?;
        assert!(zeroed);

        let too_small = PageRange::new(range.start_page_idx, 0);
        assert!(writer.flush_into(too_small, &data, &shadow).is_err());
        Ok(())
    }

    #[test]
    fn flush_into_appends_pages_past_the_logical_end() -> Result<()> {
        let dir = tempdir().unwrap();
        let pool = Arc::new(BufferPool::new(16));
        let data = Arc::new(FileHandle::new(
            FileId(0),
            Arc::new(StdFileIo::open(dir.path().join("data"))?),
            Arc::clone(&pool),
            1,
        ));
        let shadow = ShadowFile::open(Arc::new(StdFileIo::open(dir.path().join("shadow"))?), pool)?;

        let mut writer = MetaWriter::new();
        writer.write(&[7u8; PAGE_SIZE + 1]);
        let tail = PageRange::new(data.num_pages(), 2);
        writer.flush_into(tail, &data, &shadow)?;
        assert_eq!(data.num_pages(), 3);
        assert_eq!(shadow.num_shadow_pages(), 2);
        let second = read_shadow_version_of_page(&data, PageId(2), &shadow, |b| Ok((b[0], b[1])))?;
        assert_eq!(second, (7, 0));

        // A range with a gap before it cannot be appended in place.
        let detached = PageRange::new(data.num_pages() + 4, 2);
        assert!(matches!(
            writer.flush_into(detached, &data, &shadow),
            Err(PenumbraError::Invalid(_))
        ));
        Ok(())
    }

    #[test]
    fn empty_writer_allocates_nothing() -> Result<()> {
        let dir = tempdir().unwrap();
        let pool = Arc::new(BufferPool::new(4));
        let data = Arc::new(FileHandle::new(
            FileId(0),
            Arc::new(StdFileIo::open(dir.path().join("data"))?),
            Arc::clone(&pool),
            1,
        ));
        let shadow = ShadowFile::open(Arc::new(StdFileIo::open(dir.path().join("shadow"))?), pool)?;
        let pm = PageManager::new(Arc::clone(&data));
        let range = MetaWriter::new().flush(&pm, &data, &shadow)?;
        assert!(!range.is_valid());
        assert!(!pm.changed_since_last_checkpoint());
        Ok(())
    }
}
