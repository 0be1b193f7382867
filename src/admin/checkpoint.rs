use std::path::Path;
use std::time::Instant;

use serde::Serialize;

use crate::admin::options::AdminOpenOptions;
use crate::admin::util::open_database;
use crate::admin::Result;
use crate::db::RecoveryMode;
use crate::storage::DatabaseHeader;

/// Report generated after executing a checkpoint operation.
#[derive(Debug, Clone, Serialize)]
pub struct CheckpointReport {
    /// Duration of the checkpoint operation in milliseconds.
    pub duration_ms: f64,
    /// How the database was recovered when it was opened.
    pub recovery: RecoveryMode,
    /// Whether a new catalog blob was written.
    pub catalog_written: bool,
    /// Whether a new metadata blob was written.
    pub metadata_written: bool,
    /// Pages copied from the shadow file onto the data file.
    pub shadow_pages: usize,
    /// Header in effect after the checkpoint.
    pub header: DatabaseHeader,
}

/// Executes a checkpoint operation on a database.
///
/// Opens the database at the given path (replaying the WAL if a previous
/// process crashed), runs a checkpoint and returns a report with timing.
///
/// # Errors
///
/// Returns an error if the database cannot be opened or the checkpoint fails.
pub fn checkpoint(path: impl AsRef<Path>, opts: &AdminOpenOptions) -> Result<CheckpointReport> {
    let path = path.as_ref();
    let db = open_database(path, opts)?;
    let start = Instant::now();
    let outcome = db.checkpoint()?;
    let elapsed = start.elapsed();
    Ok(CheckpointReport {
        duration_ms: elapsed.as_secs_f64() * 1_000.0,
        recovery: db.recovery_report().mode,
        catalog_written: outcome.catalog_written,
        metadata_written: outcome.metadata_written,
        shadow_pages: outcome.shadow_pages,
        header: outcome.header,
    })
}
