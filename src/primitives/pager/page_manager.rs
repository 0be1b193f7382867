use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use super::file_handle::FileHandle;
use super::freelist::FreeSpaceManager;
use super::range::PageRange;
use crate::primitives::bytes::{Deserializer, Serializer};
use crate::types::{PenumbraError, Result};

struct PageManagerState {
    fsm: FreeSpaceManager,
    /// Ranges handed out by the active transaction that a rollback reclaims.
    uncommitted: Vec<PageRange>,
    /// Bumped by every allocation and free; cleared at finalize.
    version: u64,
}

/// Sole authority for acquiring and releasing page ranges of the data file.
pub struct PageManager {
    data_fh: Arc<FileHandle>,
    state: Mutex<PageManagerState>,
}

impl PageManager {
    /// Creates a page manager with an empty free list over `data_fh`.
    pub fn new(data_fh: Arc<FileHandle>) -> Self {
        Self {
            data_fh,
            state: Mutex::new(PageManagerState {
                fsm: FreeSpaceManager::new(),
                uncommitted: Vec::new(),
                version: 0,
            }),
        }
    }

    /// The data file this manager allocates from.
    pub fn data_fh(&self) -> &Arc<FileHandle> {
        &self.data_fh
    }

    /// Allocates `num_pages` pages, reclaimed if the transaction rolls back.
    pub fn allocate_page_range(&self, num_pages: u64) -> Result<PageRange> {
        self.allocate_page_range_opts(num_pages, true)
    }

    /// Allocates `num_pages` pages, reusing a free range when one fits and
    /// extending the file otherwise.
    pub fn allocate_page_range_opts(
        &self,
        num_pages: u64,
        reclaim_on_rollback: bool,
    ) -> Result<PageRange> {
        if num_pages == 0 {
            return Err(PenumbraError::Invalid("cannot allocate zero pages"));
        }
        let mut state = self.state.lock();
        let range = match state.fsm.pop_free_pages(num_pages) {
            Some(range) => range,
            None => {
                let start = self.data_fh.add_new_pages(num_pages);
                PageRange::new(start.0, num_pages)
            }
        };
        if reclaim_on_rollback {
            state.uncommitted.push(range);
        }
        state.version += 1;
        debug!(range = %range, reclaim_on_rollback, "page_manager.allocate");
        Ok(range)
    }

    /// Releases `range`. The pages stay unusable until the next checkpoint finalizes.
    pub fn free_page_range(&self, range: PageRange) {
        if range.num_pages == 0 || !range.is_valid() {
            return;
        }
        let mut state = self.state.lock();
        state.fsm.add_uncheckpointed_free_pages(range);
        state.version += 1;
        debug!(range = %range, "page_manager.free");
    }

    /// Makes the active transaction's allocations and frees permanent.
    pub fn commit(&self) {
        let mut state = self.state.lock();
        state.uncommitted.clear();
        state.fsm.commit_uncheckpointed();
    }

    /// Returns the active transaction's allocations to the free list and
    /// discards its pending frees.
    pub fn rollback(&self) {
        let mut state = self.state.lock();
        let reclaimed = std::mem::take(&mut state.uncommitted);
        for range in &reclaimed {
            self.data_fh.remove_page_range_from_frames(*range);
            state.fsm.add_free_pages(*range);
        }
        state.fsm.rollback_checkpoint();
        debug!(reclaimed = reclaimed.len(), "page_manager.rollback");
    }

    /// Runs once the checkpoint is durable: pending frees become reusable.
    pub fn finalize_checkpoint(&self) {
        let mut state = self.state.lock();
        state.uncommitted.clear();
        state.fsm.finalize_checkpoint(&self.data_fh);
        state.version = 0;
    }

    /// Whether anything was allocated or freed since the last checkpoint.
    pub fn changed_since_last_checkpoint(&self) -> bool {
        self.state.lock().version > 0
    }

    /// Upper bound on the pages the free-space image will occupy.
    pub fn estimate_pages_needed_for_serialize(&self) -> u64 {
        self.state.lock().fsm.estimate_pages_needed_for_serialize()
    }

    /// Writes the free-space state.
    pub fn serialize(&self, ser: &mut Serializer) {
        self.state.lock().fsm.serialize(ser);
    }

    /// Replaces the free-space state with a serialized image.
    pub fn deserialize(&self, de: &mut Deserializer<'_>) -> Result<()> {
        let fsm = FreeSpaceManager::deserialize(de)?;
        let mut state = self.state.lock();
        state.fsm = fsm;
        state.uncommitted.clear();
        state.version = 0;
        Ok(())
    }

    /// Number of reusable free entries.
    pub fn num_free_entries(&self) -> usize {
        self.state.lock().fsm.num_entries()
    }

    /// Reusable free entries `[start, end)`.
    pub fn free_entries(&self, start: usize, end: usize) -> Vec<PageRange> {
        self.state.lock().fsm.entries(start, end)
    }

    /// Ranges freed since the last checkpoint.
    pub fn pending_free_entries(&self) -> Vec<PageRange> {
        self.state.lock().fsm.uncheckpointed_entries().to_vec()
    }

    /// Total free pages, pending frees included.
    pub fn total_free_pages(&self) -> u64 {
        self.state.lock().fsm.total_free_pages()
    }
}
