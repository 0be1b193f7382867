use std::collections::HashMap;
use std::convert::TryInto;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::primitives::bytes::{Deserializer, Serializer};
use crate::primitives::io::FileIo;
use crate::primitives::pager::{BufferPool, FileHandle, PageReadPolicy, PinnedPage};
use crate::types::{
    page::PAGE_SIZE, record_crc32, FileId, PageId, PenumbraError, Result,
};

/// Buffer pool identifier of the shadow file.
pub const SHADOW_FILE_ID: FileId = FileId(1);

const SHADOW_MAGIC: [u8; 4] = *b"PNBS";
const SHADOW_HEADER_LEN: usize = 12;
const RECORDS_TAG: u8 = b'S';

/// Original location a shadow page stands in for.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ShadowPageRecord {
    /// File owning the original page.
    pub file_id: FileId,
    /// Page index within that file.
    pub original_page: PageId,
}

#[derive(Default)]
struct ShadowState {
    index: HashMap<(FileId, PageId), PageId>,
    /// `records[i]` describes shadow page `i + 1`; page 0 is the file header.
    records: Vec<ShadowPageRecord>,
    /// Records below this index belong to committed transactions.
    committed: usize,
}

/// Copy-on-write staging area for pages modified ahead of a checkpoint.
///
/// Layout on disk after [`ShadowFile::flush_all`]: page 0 holds
/// `{magic, num_shadow_pages}`, pages `1..=n` hold shadow contents, and the
/// bytes after page `n` hold the checksummed record table.
pub struct ShadowFile {
    fh: Arc<FileHandle>,
    state: Mutex<ShadowState>,
}

impl ShadowFile {
    /// Opens an empty shadow file over `io`, discarding previous contents.
    pub fn open(io: Arc<dyn FileIo>, pool: Arc<BufferPool>) -> Result<Self> {
        io.truncate(0)?;
        let fh = FileHandle::new(SHADOW_FILE_ID, io, pool, 1);
        Ok(Self {
            fh: Arc::new(fh),
            state: Mutex::new(ShadowState::default()),
        })
    }

    /// Handle of the shadow file itself.
    pub fn file_handle(&self) -> &Arc<FileHandle> {
        &self.fh
    }

    /// Whether `page` of `file_id` has a shadow copy.
    pub fn has_shadow_page(&self, file_id: FileId, page: PageId) -> bool {
        self.state.lock().index.contains_key(&(file_id, page))
    }

    /// Shadow page standing in for `page` of `file_id`, if any.
    pub fn shadow_page(&self, file_id: FileId, page: PageId) -> Option<PageId> {
        self.state.lock().index.get(&(file_id, page)).copied()
    }

    /// Returns the shadow page for `page`, creating one if needed. The flag is
    /// true when the shadow page was created by this call.
    pub fn get_or_create_shadow_page(&self, file_id: FileId, page: PageId) -> (PageId, bool) {
        let mut state = self.state.lock();
        if let Some(shadow) = state.index.get(&(file_id, page)) {
            return (*shadow, false);
        }
        let shadow = self.fh.add_new_pages(1);
        debug_assert_eq!(shadow.0 as usize, state.records.len() + 1);
        state.index.insert((file_id, page), shadow);
        state.records.push(ShadowPageRecord {
            file_id,
            original_page: page,
        });
        (shadow, true)
    }

    /// Pins a shadow page through the buffer pool.
    pub fn pin_shadow_page(&self, shadow: PageId, policy: PageReadPolicy) -> Result<PinnedPage> {
        self.fh.pin_page(shadow, policy)
    }

    /// Number of shadow pages.
    pub fn num_shadow_pages(&self) -> usize {
        self.state.lock().records.len()
    }

    /// Shadow records in shadow page order.
    pub fn records(&self) -> Vec<ShadowPageRecord> {
        self.state.lock().records.clone()
    }

    /// Writes every shadow page, the record table and the header, then syncs.
    pub fn flush_all(&self) -> Result<()> {
        let records = self.records();
        let written = self.fh.flush_all_dirty_pages()?;
        let num_pages = records.len() as u64;
        let mut table = Serializer::new();
        table.write_u64(num_pages);
        for record in &records {
            table.write_u32(record.file_id.0);
            table.write_u64(record.original_page.0);
        }
        let crc = record_crc32(RECORDS_TAG, table.as_slice());
        table.write_u32(crc);
        let table_off = PageId(num_pages + 1).byte_offset();
        let io = self.fh.io();
        io.truncate(table_off)?;
        io.write_at(table_off, table.as_slice())?;
        io.write_at(0, &encode_header(num_pages))?;
        io.sync_all()?;
        debug!(shadow_pages = num_pages, written, "shadow.flush_all");
        Ok(())
    }

    /// Copies every shadow page of `target`'s file onto its original location
    /// and syncs the target.
    pub fn apply_shadow_pages(&self, target: &FileHandle) -> Result<usize> {
        let records = self.records();
        let mut applied = 0usize;
        for (idx, record) in records.iter().enumerate() {
            if record.file_id != target.file_id() {
                continue;
            }
            let shadow = PageId(idx as u64 + 1);
            self.fh.optimistic_read_page(shadow, |buf| {
                target.write_page_to_file(record.original_page, buf)
            })?;
            applied += 1;
        }
        target.sync()?;
        debug!(applied, "shadow.apply");
        Ok(applied)
    }

    /// Redoes the replay from a flushed shadow file during recovery.
    pub fn replay_shadow_page_records(shadow_io: &dyn FileIo, data_io: &dyn FileIo) -> Result<usize> {
        let len = shadow_io.len()?;
        let mut bytes = vec![0u8; len as usize];
        shadow_io.read_at(0, &mut bytes)?;
        let num_pages = decode_header(&bytes)?;
        let mut de = Deserializer::at(&bytes, PageId(num_pages + 1).byte_offset())?;
        let table_start = de.offset();
        let count = de.read_u64()?;
        if count != num_pages {
            return Err(PenumbraError::Corruption("shadow record count mismatch"));
        }
        let mut records = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let file_id = FileId(de.read_u32()?);
            let original_page = PageId(de.read_u64()?);
            records.push(ShadowPageRecord {
                file_id,
                original_page,
            });
        }
        let table_end = de.offset();
        let stored_crc = de.read_u32()?;
        if record_crc32(RECORDS_TAG, &bytes[table_start..table_end]) != stored_crc {
            return Err(PenumbraError::Corruption("shadow record table crc mismatch"));
        }
        for (idx, record) in records.iter().enumerate() {
            let start = (idx + 1) * PAGE_SIZE;
            data_io.write_at(record.original_page.byte_offset(), &bytes[start..start + PAGE_SIZE])?;
        }
        data_io.sync_all()?;
        info!(pages = records.len(), "shadow.replay");
        Ok(records.len())
    }

    /// Marks every shadow page created so far as committed.
    pub fn commit(&self) {
        let mut state = self.state.lock();
        state.committed = state.records.len();
    }

    /// Destroys the shadow pages created since the last [`ShadowFile::commit`].
    ///
    /// Returns the number of shadow pages dropped.
    pub fn rollback_uncommitted(&self) -> Result<usize> {
        let mut state = self.state.lock();
        let keep = state.committed;
        if state.records.len() == keep {
            return Ok(0);
        }
        let dropped: Vec<ShadowPageRecord> = state.records.drain(keep..).collect();
        for record in &dropped {
            state.index.remove(&(record.file_id, record.original_page));
        }
        self.fh.truncate_pages(keep as u64 + 1)?;
        debug!(dropped = dropped.len(), kept = keep, "shadow.rollback");
        Ok(dropped.len())
    }

    /// Forgets every shadow page and truncates the file to its header page.
    pub fn clear(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.index.clear();
        state.records.clear();
        state.committed = 0;
        self.fh.reset_to(1)?;
        Ok(())
    }
}

fn encode_header(num_pages: u64) -> [u8; SHADOW_HEADER_LEN] {
    let mut buf = [0u8; SHADOW_HEADER_LEN];
    buf[0..4].copy_from_slice(&SHADOW_MAGIC);
    buf[4..12].copy_from_slice(&num_pages.to_be_bytes());
    buf
}

fn decode_header(bytes: &[u8]) -> Result<u64> {
    if bytes.len() < PAGE_SIZE {
        return Err(PenumbraError::Corruption("shadow file header truncated"));
    }
    if bytes[0..4] != SHADOW_MAGIC {
        return Err(PenumbraError::Corruption("shadow file magic mismatch"));
    }
    let num_pages = u64::from_be_bytes(bytes[4..12].try_into().unwrap());
    let pages_end = (num_pages as usize)
        .checked_add(1)
        .and_then(|n| n.checked_mul(PAGE_SIZE))
        .ok_or(PenumbraError::Corruption("shadow page count overflow"))?;
    if pages_end > bytes.len() {
        return Err(PenumbraError::Corruption("shadow pages truncated"));
    }
    Ok(num_pages)
}
