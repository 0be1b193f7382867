use std::path::Path;

use serde::Serialize;

use crate::admin::error::AdminError;
use crate::admin::util::file_len;
use crate::admin::Result;
use crate::primitives::io::StdFileIo;
use crate::primitives::wal::Wal;
use crate::storage::{shadow_path, wal_path, DatabaseHeader};
use crate::types::page::{pages_for_bytes, PAGE_SIZE};

/// Header of a database file read without opening the database.
#[derive(Debug, Clone, Serialize)]
pub struct HeaderReport {
    /// Path of the data file.
    pub path: String,
    /// Size of the data file in bytes.
    pub file_size_bytes: u64,
    /// Pages in the data file.
    pub num_pages: u64,
    /// Page size of this build.
    pub page_size: usize,
    /// Header of the last checkpoint; `None` before the first one.
    pub header: Option<DatabaseHeader>,
    /// Records in the WAL not yet covered by a checkpoint.
    pub wal_records: usize,
    /// Whether the WAL ends with a checkpoint record whose shadow pages
    /// still have to be replayed.
    pub pending_shadow_replay: bool,
    /// Whether a shadow file is present.
    pub shadow_exists: bool,
}

/// Reads the header at page 0 and summarizes the WAL and shadow file.
///
/// Nothing is modified, so this is safe to run while recovery is pending.
///
/// # Errors
///
/// Returns an error if the data file does not exist or its header belongs to
/// another format or version.
pub fn header_report(path: impl AsRef<Path>) -> Result<HeaderReport> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(AdminError::missing_database(path));
    }
    let io = StdFileIo::open_read_only(path)?;
    let header = DatabaseHeader::read(&io)?;
    let file_size_bytes = file_len(path).unwrap_or(0);

    let wal_file = wal_path(path);
    let scan = if wal_file.exists() {
        Some(Wal::scan_io(&StdFileIo::open_read_only(&wal_file)?)?)
    } else {
        None
    };
    Ok(HeaderReport {
        path: path.display().to_string(),
        file_size_bytes,
        num_pages: pages_for_bytes(file_size_bytes),
        page_size: PAGE_SIZE,
        header,
        wal_records: scan.as_ref().map_or(0, |s| s.records),
        pending_shadow_replay: scan.as_ref().is_some_and(|s| s.ends_with_checkpoint),
        shadow_exists: shadow_path(path).exists(),
    })
}
