use std::path::Path;

use serde::Serialize;
use tracing::info;

use crate::primitives::io::{remove_file_if_exists, StdFileIo};
use crate::primitives::wal::{Wal, WalScan};
use crate::storage::{shadow_path, wal_path, ShadowFile};
use crate::types::{PenumbraError, Result};

/// How startup brought the files back to a consistent state.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryMode {
    /// Nothing was logged since the last checkpoint.
    Clean,
    /// A checkpoint had reached its WAL record; its shadow pages were replayed.
    ShadowReplay,
    /// Committed transactions were replayed from the WAL.
    WalReplay,
}

/// Outcome of startup recovery.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct RecoveryReport {
    /// Which path recovery took.
    pub mode: RecoveryMode,
    /// Shadow pages copied onto the data file.
    pub shadow_pages: usize,
    /// Commit records replayed after loading the checkpoint.
    pub replayed_commits: usize,
}

pub(crate) struct RecoveryPlan {
    pub(crate) report: RecoveryReport,
    pub(crate) commits: Vec<Vec<u8>>,
}

/// Brings the data file up to date before the storage manager opens it.
///
/// Runs against the raw files: opening the storage manager starts a fresh
/// shadow file, so a flushed shadow must be replayed first.
pub(crate) fn prepare(path: &Path) -> Result<RecoveryPlan> {
    let wal_file = wal_path(path);
    let shadow_file = shadow_path(path);
    let scan = if wal_file.exists() {
        Wal::scan_io(&StdFileIo::open_read_only(&wal_file)?)?
    } else {
        WalScan::default()
    };

    if scan.records == 0 {
        remove_file_if_exists(&shadow_file)?;
        return Ok(RecoveryPlan {
            report: RecoveryReport {
                mode: RecoveryMode::Clean,
                shadow_pages: 0,
                replayed_commits: 0,
            },
            commits: Vec::new(),
        });
    }

    if scan.ends_with_checkpoint {
        if !shadow_file.exists() {
            return Err(PenumbraError::Corruption(
                "wal ends with a checkpoint but the shadow file is missing",
            ));
        }
        let shadow_io = StdFileIo::open_read_only(&shadow_file)?;
        let data_io = StdFileIo::open(path)?;
        let shadow_pages = ShadowFile::replay_shadow_page_records(&shadow_io, &data_io)?;
        drop(shadow_io);
        remove_file_if_exists(&wal_file)?;
        remove_file_if_exists(&shadow_file)?;
        info!(shadow_pages, "recovery.shadow_replay");
        return Ok(RecoveryPlan {
            report: RecoveryReport {
                mode: RecoveryMode::ShadowReplay,
                shadow_pages,
                replayed_commits: 0,
            },
            commits: Vec::new(),
        });
    }

    remove_file_if_exists(&shadow_file)?;
    info!(
        commits = scan.commits.len(),
        valid_up_to = scan.valid_up_to,
        "recovery.wal_replay"
    );
    Ok(RecoveryPlan {
        report: RecoveryReport {
            mode: RecoveryMode::WalReplay,
            shadow_pages: 0,
            replayed_commits: scan.commits.len(),
        },
        commits: scan.commits,
    })
}
