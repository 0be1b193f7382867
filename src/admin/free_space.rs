use std::path::Path;

use serde::Serialize;

use crate::admin::options::AdminOpenOptions;
use crate::admin::util::open_database;
use crate::admin::Result;
use crate::db::Database;

/// One free page run.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct FreeSpaceEntry {
    /// First free page.
    pub start_page_idx: u64,
    /// Length of the run in pages.
    pub num_pages: u64,
}

/// A page of the free list as seen after the last checkpoint.
#[derive(Debug, Clone, Serialize)]
pub struct FreeSpaceReport {
    /// Offset of the first returned entry.
    pub offset: usize,
    /// Number of entries in the whole free list.
    pub total_entries: usize,
    /// Free pages across the whole free list.
    pub total_free_pages: u64,
    /// Frees that become reusable at the next checkpoint.
    pub pending_entries: usize,
    /// Entries ordered by size bucket, then run length, then start page.
    pub entries: Vec<FreeSpaceEntry>,
}

/// Lists at most `limit` free-list entries starting at `offset`.
pub fn free_space_entries(db: &Database, offset: usize, limit: usize) -> FreeSpaceReport {
    let pm = db.storage().page_manager();
    let entries = db
        .free_space_entries(offset, limit)
        .into_iter()
        .map(|range| FreeSpaceEntry {
            start_page_idx: range.start_page_idx,
            num_pages: range.num_pages,
        })
        .collect();
    FreeSpaceReport {
        offset,
        total_entries: pm.num_free_entries(),
        total_free_pages: pm.total_free_pages(),
        pending_entries: pm.pending_free_entries().len(),
        entries,
    }
}

/// Opens the database at `path` and lists a page of its free list.
///
/// # Errors
///
/// Returns an error if the database cannot be opened.
pub fn free_space(
    path: impl AsRef<Path>,
    opts: &AdminOpenOptions,
    offset: usize,
    limit: usize,
) -> Result<FreeSpaceReport> {
    let db = open_database(path.as_ref(), opts)?;
    Ok(free_space_entries(&db, offset, limit))
}
