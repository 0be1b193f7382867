use std::collections::BTreeSet;

use tracing::debug;

use super::file_handle::FileHandle;
use super::range::PageRange;
use crate::primitives::bytes::{Deserializer, Serializer};
use crate::types::{page::pages_for_bytes, PenumbraError, Result};

/// One bucket per power of two of a u64 page count.
const NUM_FREE_LISTS: usize = 64;

/// Bucket entry, ordered by size first so a lower-bound lookup finds the
/// smallest entry that fits.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
struct FreeEntry {
    num_pages: u64,
    start_page_idx: u64,
}

impl From<PageRange> for FreeEntry {
    fn from(range: PageRange) -> Self {
        FreeEntry {
            num_pages: range.num_pages,
            start_page_idx: range.start_page_idx,
        }
    }
}

impl From<FreeEntry> for PageRange {
    fn from(entry: FreeEntry) -> Self {
        PageRange::new(entry.start_page_idx, entry.num_pages)
    }
}

fn free_list_level(num_pages: u64) -> usize {
    debug_assert!(num_pages > 0);
    (u64::BITS - 1 - num_pages.leading_zeros()) as usize
}

/// Size-class bucketed free list of page ranges.
///
/// Bucket `k` holds ranges whose length lies in `[2^k, 2^(k+1))`. Ranges
/// freed by a transaction are parked in an uncheckpointed list and only become
/// allocatable once [`FreeSpaceManager::finalize_checkpoint`] runs.
#[derive(Clone, Debug)]
pub struct FreeSpaceManager {
    free_lists: Vec<BTreeSet<FreeEntry>>,
    uncheckpointed: Vec<PageRange>,
    /// Prefix of `uncheckpointed` that belongs to committed transactions.
    committed_uncheckpointed: usize,
    num_entries: usize,
}

impl Default for FreeSpaceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl FreeSpaceManager {
    /// Creates an empty free list.
    pub fn new() -> Self {
        Self {
            free_lists: vec![BTreeSet::new(); NUM_FREE_LISTS],
            uncheckpointed: Vec::new(),
            committed_uncheckpointed: 0,
            num_entries: 0,
        }
    }

    /// Makes `range` immediately reusable.
    pub fn add_free_pages(&mut self, range: PageRange) {
        if range.num_pages == 0 {
            return;
        }
        let level = free_list_level(range.num_pages);
        if self.free_lists[level].insert(FreeEntry::from(range)) {
            self.num_entries += 1;
        }
    }

    /// Removes and returns the first `num_pages` pages of the smallest
    /// sufficient free entry, re-inserting any remainder.
    pub fn pop_free_pages(&mut self, num_pages: u64) -> Option<PageRange> {
        debug_assert!(num_pages > 0, "zero-page allocation requested");
        if num_pages == 0 {
            return None;
        }
        let probe = FreeEntry {
            num_pages,
            start_page_idx: 0,
        };
        for level in free_list_level(num_pages)..NUM_FREE_LISTS {
            let found = self.free_lists[level].range(probe..).next().copied();
            if let Some(entry) = found {
                self.free_lists[level].remove(&entry);
                self.num_entries -= 1;
                return Some(self.split_page_range(entry.into(), num_pages));
            }
        }
        None
    }

    fn split_page_range(&mut self, range: PageRange, num_pages: u64) -> PageRange {
        if range.num_pages > num_pages {
            self.add_free_pages(range.subrange(num_pages));
        }
        PageRange::new(range.start_page_idx, num_pages)
    }

    /// Parks `range` until the freeing transaction has been checkpointed.
    pub fn add_uncheckpointed_free_pages(&mut self, range: PageRange) {
        if range.num_pages == 0 {
            return;
        }
        self.uncheckpointed.push(range);
    }

    /// Records that every pending free so far belongs to a committed
    /// transaction and must survive a later rollback.
    pub fn commit_uncheckpointed(&mut self) {
        self.committed_uncheckpointed = self.uncheckpointed.len();
    }

    /// Drops the pending frees of the aborted transaction without making them reusable.
    pub fn rollback_checkpoint(&mut self) {
        let discarded = self.uncheckpointed.len() - self.committed_uncheckpointed;
        self.uncheckpointed.truncate(self.committed_uncheckpointed);
        debug!(discarded, "freelist.rollback_checkpoint");
    }

    /// Moves pending frees into the buckets and coalesces adjacent ranges.
    ///
    /// Cached frames of the freed pages are dropped from the buffer pool first
    /// so a later reuse never observes stale contents.
    pub fn finalize_checkpoint(&mut self, data_fh: &FileHandle) {
        let pending = std::mem::take(&mut self.uncheckpointed);
        self.committed_uncheckpointed = 0;
        for range in &pending {
            data_fh.remove_page_range_from_frames(*range);
            self.add_free_pages(*range);
        }
        self.merge_page_ranges();
        debug!(
            finalized = pending.len(),
            entries = self.num_entries,
            "freelist.finalize_checkpoint"
        );
    }

    fn merge_page_ranges(&mut self) {
        let mut all: Vec<PageRange> = self
            .free_lists
            .iter_mut()
            .flat_map(|list| std::mem::take(list).into_iter())
            .map(PageRange::from)
            .collect();
        self.num_entries = 0;
        all.sort_by_key(|range| range.start_page_idx);
        let mut merged: Vec<PageRange> = Vec::with_capacity(all.len());
        for range in all {
            if let Some(last) = merged.last_mut() {
                if last.end() == range.start_page_idx {
                    last.num_pages += range.num_pages;
                    continue;
                }
            }
            merged.push(range);
        }
        for range in merged {
            self.add_free_pages(range);
        }
    }

    /// Number of reusable entries across all buckets.
    pub fn num_entries(&self) -> usize {
        self.num_entries
    }

    /// Reusable entries `[start, end)` in bucket order.
    pub fn entries(&self, start: usize, end: usize) -> Vec<PageRange> {
        if end <= start {
            return Vec::new();
        }
        self.free_lists
            .iter()
            .flat_map(|list| list.iter())
            .skip(start)
            .take(end - start)
            .copied()
            .map(PageRange::from)
            .collect()
    }

    /// Ranges freed since the last checkpoint, not yet reusable.
    pub fn uncheckpointed_entries(&self) -> &[PageRange] {
        &self.uncheckpointed
    }

    /// Total pages held by buckets and the pending list.
    pub fn total_free_pages(&self) -> u64 {
        let bucketed: u64 = self
            .free_lists
            .iter()
            .flat_map(|list| list.iter())
            .map(|entry| entry.num_pages)
            .sum();
        bucketed + self.uncheckpointed.iter().map(|r| r.num_pages).sum::<u64>()
    }

    /// Upper bound on the pages needed by [`FreeSpaceManager::serialize`]
    /// given the current state. Allocating never adds entries, so the bound
    /// stays valid across allocations made after it is computed.
    pub fn estimate_pages_needed_for_serialize(&self) -> u64 {
        let entries = (self.num_entries + self.uncheckpointed.len()) as u64;
        pages_for_bytes(8 + entries * 16)
    }

    /// Writes every entry, including pending frees, which become reusable
    /// once the checkpoint carrying this image finalizes.
    pub fn serialize(&self, ser: &mut Serializer) {
        ser.write_u64((self.num_entries + self.uncheckpointed.len()) as u64);
        for entry in self.free_lists.iter().flat_map(|list| list.iter()) {
            PageRange::from(*entry).serialize(ser);
        }
        for range in &self.uncheckpointed {
            range.serialize(ser);
        }
    }

    /// Rebuilds the free list from a serialized image.
    pub fn deserialize(de: &mut Deserializer<'_>) -> Result<Self> {
        let count = de.read_u64()?;
        if count > (de.remaining() / 16) as u64 {
            return Err(PenumbraError::Corruption("free space entry count too large"));
        }
        let mut fsm = FreeSpaceManager::new();
        for _ in 0..count {
            let range = PageRange::deserialize(de)?;
            if range.num_pages == 0 || !range.is_valid() {
                return Err(PenumbraError::Corruption("invalid free page range"));
            }
            fsm.add_free_pages(range);
        }
        fsm.merge_page_ranges();
        Ok(fsm)
    }
}
