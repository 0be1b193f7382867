use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::primitives::concurrency::SingleWriter;
use crate::primitives::pager::PageRange;
use crate::storage::{
    AutoCheckpointContext, BlobCatalog, CheckpointOutcome, CheckpointStage, Checkpointer,
    ChunkStore, DatabaseHeader, StorageManager,
};
use crate::types::{PenumbraError, Result, TransactionType};

use super::config::DatabaseOptions;
use super::recovery::{self, RecoveryMode, RecoveryReport};
use super::transaction::{apply_ops, decode_ops, TxnOp, WriteTxn};

struct DbState {
    catalog: BlobCatalog,
    checkpointer: Checkpointer,
}

/// An open database: storage files, catalog and checkpoint state.
///
/// Readers and checkpoints serialize on an internal lock; write
/// transactions additionally go through a single-writer gate.
pub struct Database {
    storage: StorageManager<ChunkStore>,
    state: Mutex<DbState>,
    writer: SingleWriter,
    options: DatabaseOptions,
    recovery: RecoveryReport,
    poisoned: AtomicBool,
}

impl Database {
    /// Opens or creates the database at `path`, running recovery first.
    pub fn open(path: impl AsRef<Path>, options: DatabaseOptions) -> Result<Self> {
        if options.in_memory {
            return Self::open_with_storage(
                StorageManager::in_memory(options.buffer_pool_pages, ChunkStore::new())?,
                options,
                None,
            );
        }
        let path = path.as_ref();
        if !options.create_if_missing && !path.exists() {
            return Err(PenumbraError::NotFound);
        }
        let plan = recovery::prepare(path)?;
        let storage = StorageManager::open(path, options.buffer_pool_pages, ChunkStore::new())?;
        Self::open_with_storage(storage, options, Some(plan))
    }

    /// Opens a database that lives only in memory.
    pub fn open_in_memory() -> Result<Self> {
        Self::open("", DatabaseOptions::in_memory())
    }

    fn open_with_storage(
        storage: StorageManager<ChunkStore>,
        options: DatabaseOptions,
        plan: Option<recovery::RecoveryPlan>,
    ) -> Result<Self> {
        let mut catalog = BlobCatalog::new();
        let mut checkpointer = Checkpointer::new(options.checkpoint_settings());
        checkpointer.read_checkpoint(&storage, &mut catalog)?;

        let (report, commits) = match plan {
            Some(plan) => (plan.report, plan.commits),
            None => (
                RecoveryReport {
                    mode: RecoveryMode::Clean,
                    shadow_pages: 0,
                    replayed_commits: 0,
                },
                Vec::new(),
            ),
        };
        for payload in &commits {
            let ops = decode_ops(payload)?;
            apply_ops(&ops, &mut catalog, &mut storage.table_store());
        }
        info!(
            mode = ?report.mode,
            shadow_pages = report.shadow_pages,
            replayed_commits = report.replayed_commits,
            "db.open"
        );
        Ok(Self {
            storage,
            state: Mutex::new(DbState {
                catalog,
                checkpointer,
            }),
            writer: SingleWriter::new(),
            options,
            recovery: report,
            poisoned: AtomicBool::new(false),
        })
    }

    /// Options the database was opened with.
    pub fn options(&self) -> &DatabaseOptions {
        &self.options
    }

    /// What recovery did when the database was opened.
    pub fn recovery_report(&self) -> RecoveryReport {
        self.recovery
    }

    /// Storage components, for page-level access.
    pub fn storage(&self) -> &StorageManager<ChunkStore> {
        &self.storage
    }

    /// Header of the last successful checkpoint.
    pub fn header(&self) -> DatabaseHeader {
        self.state.lock().checkpointer.current_header()
    }

    /// Whether a failed checkpoint left the database needing recovery.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    pub(crate) fn ensure_usable(&self) -> Result<()> {
        if self.is_poisoned() {
            return Err(PenumbraError::Invalid(
                "database must be reopened after a failed checkpoint",
            ));
        }
        Ok(())
    }

    /// Starts the single write transaction.
    pub fn begin_write(&self) -> Result<WriteTxn<'_>> {
        self.ensure_usable()?;
        let guard = self.writer.acquire_writer()?;
        Ok(WriteTxn::new(self, guard))
    }

    /// Reads chunk `name` as of the last commit.
    pub fn read_chunk(&self, name: &str) -> Result<Option<Vec<u8>>> {
        self.ensure_usable()?;
        let _state = self.state.lock();
        self.storage.table_store().get(
            name,
            self.storage.data_fh(),
            self.storage.shadow_file(),
            TransactionType::ReadOnly,
        )
    }

    /// Names of all visible chunks.
    pub fn chunk_names(&self) -> Vec<String> {
        self.storage.table_store().names()
    }

    /// Value of catalog entry `name`.
    pub fn catalog_entry(&self, name: &str) -> Option<Vec<u8>> {
        self.state.lock().catalog.get(name).map(<[u8]>::to_vec)
    }

    /// Names of all catalog entries.
    pub fn catalog_names(&self) -> Vec<String> {
        self.state
            .lock()
            .catalog
            .names()
            .map(str::to_string)
            .collect()
    }

    /// One page of the checkpointed free list, ordered by bucket.
    pub fn free_space_entries(&self, offset: usize, limit: usize) -> Vec<PageRange> {
        let pm = self.storage.page_manager();
        pm.free_entries(offset, offset.saturating_add(limit))
    }

    /// Runs a checkpoint unless a write transaction is active.
    pub fn checkpoint(&self) -> Result<CheckpointOutcome> {
        self.ensure_usable()?;
        let _gate = self
            .writer
            .try_acquire_checkpoint()
            .ok_or(PenumbraError::Invalid("write transaction in progress"))?;
        let mut state = self.state.lock();
        self.run_checkpoint(&mut state)
    }

    #[doc(hidden)]
    pub fn set_checkpoint_failpoint(&self, stage: Option<CheckpointStage>) {
        self.state.lock().checkpointer.set_failpoint(stage);
    }

    pub(crate) fn apply_committed(
        &self,
        ops: &[TxnOp],
        trx_type: TransactionType,
        estimated_txn_bytes: u64,
    ) -> Result<()> {
        let mut state = self.state.lock();
        apply_ops(ops, &mut state.catalog, &mut self.storage.table_store());
        self.storage.commit_transaction();
        let ctx = AutoCheckpointContext {
            trx_type,
            estimated_txn_bytes,
        };
        let wal_size = self.storage.wal().file_size()?;
        if state.checkpointer.can_auto_checkpoint(&ctx, wal_size) {
            debug!(wal_size, estimated_txn_bytes, "db.auto_checkpoint");
            self.run_checkpoint(&mut state)?;
        }
        Ok(())
    }

    fn run_checkpoint(&self, state: &mut DbState) -> Result<CheckpointOutcome> {
        let DbState {
            catalog,
            checkpointer,
        } = state;
        match checkpointer.write_checkpoint(&self.storage, catalog) {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                if checkpointer.requires_recovery() {
                    self.poisoned.store(true, Ordering::Release);
                    error!(error = %err, "db.checkpoint.requires_recovery");
                } else if let Err(rollback_err) = checkpointer.rollback(&self.storage) {
                    self.poisoned.store(true, Ordering::Release);
                    error!(error = %rollback_err, "db.checkpoint.rollback_failed");
                } else {
                    warn!(error = %err, "db.checkpoint.rolled_back");
                }
                Err(err)
            }
        }
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if self.options.in_memory || self.is_poisoned() {
            return;
        }
        let mut state = self.state.lock();
        if let Err(err) = self.run_checkpoint(&mut state) {
            warn!(error = %err, "db.close.checkpoint_failed");
        }
    }
}
