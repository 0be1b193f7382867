use std::time::Instant;

use tracing::{debug, error, info, warn};

use crate::primitives::bytes::{Deserializer, Serializer};
use crate::primitives::concurrency::WriterGuard;
use crate::primitives::pager::PageRange;
use crate::storage::{BlobCatalog, ChunkStore};
use crate::types::{PenumbraError, Result, TransactionType};

use super::Database;

/// The state of a write transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    /// Transaction is active and can accept operations
    Active,
    /// Transaction has been successfully committed
    Committed,
    /// Transaction has been rolled back
    RolledBack,
}

const OP_PUT_CHUNK: u8 = 1;
const OP_DELETE_CHUNK: u8 = 2;
const OP_PUT_CATALOG: u8 = 3;
const OP_REMOVE_CATALOG: u8 = 4;

/// One buffered change of a write transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TxnOp {
    PutChunk { name: String, bytes: Vec<u8> },
    DeleteChunk { name: String },
    PutCatalog { name: String, value: Vec<u8> },
    RemoveCatalog { name: String },
}

impl TxnOp {
    fn estimated_bytes(&self) -> u64 {
        let payload = match self {
            TxnOp::PutChunk { name, bytes } => name.len() + bytes.len(),
            TxnOp::PutCatalog { name, value } => name.len() + value.len(),
            TxnOp::DeleteChunk { name } | TxnOp::RemoveCatalog { name } => name.len(),
        };
        payload as u64 + 17
    }
}

/// Encodes the ops of one transaction as a WAL commit payload.
pub(crate) fn encode_ops(ops: &[TxnOp]) -> Vec<u8> {
    let mut ser = Serializer::new();
    ser.write_u64(ops.len() as u64);
    for op in ops {
        match op {
            TxnOp::PutChunk { name, bytes } => {
                ser.write_u8(OP_PUT_CHUNK);
                ser.write_str(name);
                ser.write_bytes(bytes);
            }
            TxnOp::DeleteChunk { name } => {
                ser.write_u8(OP_DELETE_CHUNK);
                ser.write_str(name);
            }
            TxnOp::PutCatalog { name, value } => {
                ser.write_u8(OP_PUT_CATALOG);
                ser.write_str(name);
                ser.write_bytes(value);
            }
            TxnOp::RemoveCatalog { name } => {
                ser.write_u8(OP_REMOVE_CATALOG);
                ser.write_str(name);
            }
        }
    }
    ser.into_inner()
}

/// Decodes a WAL commit payload written by [`encode_ops`].
pub(crate) fn decode_ops(payload: &[u8]) -> Result<Vec<TxnOp>> {
    let mut de = Deserializer::new(payload);
    let count = de.read_u64()?;
    if count > de.remaining() as u64 {
        return Err(PenumbraError::Corruption("commit op count too large"));
    }
    let mut ops = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let tag = de.read_u8()?;
        let name = de.read_string()?;
        let op = match tag {
            OP_PUT_CHUNK => TxnOp::PutChunk {
                name,
                bytes: de.read_bytes()?.to_vec(),
            },
            OP_DELETE_CHUNK => TxnOp::DeleteChunk { name },
            OP_PUT_CATALOG => TxnOp::PutCatalog {
                name,
                value: de.read_bytes()?.to_vec(),
            },
            OP_REMOVE_CATALOG => TxnOp::RemoveCatalog { name },
            _ => return Err(PenumbraError::Corruption("unknown commit op")),
        };
        ops.push(op);
    }
    if !de.is_finished() {
        return Err(PenumbraError::Corruption("trailing bytes in commit payload"));
    }
    Ok(ops)
}

/// Applies committed ops to the in-memory catalog and table store.
pub(crate) fn apply_ops(ops: &[TxnOp], catalog: &mut BlobCatalog, store: &mut ChunkStore) {
    for op in ops {
        match op {
            TxnOp::PutChunk { name, bytes } => store.put(name.clone(), bytes.clone()),
            TxnOp::DeleteChunk { name } => {
                store.delete(name);
            }
            TxnOp::PutCatalog { name, value } => catalog.put(name.clone(), value.clone()),
            TxnOp::RemoveCatalog { name } => {
                catalog.remove(name);
            }
        }
    }
}

/// The single active write transaction of a [`Database`].
///
/// Changes are buffered until [`WriteTxn::commit`], which logs them to the
/// WAL before they become visible. Dropping an uncommitted transaction rolls
/// it back.
///
/// ```no_run
/// use penumbra::{Database, DatabaseOptions};
///
/// let db = Database::open("graph.db", DatabaseOptions::default())?;
/// let mut txn = db.begin_write()?;
/// txn.put_catalog_entry("person", b"schema".to_vec())?;
/// txn.put_chunk("person/0", vec![0u8; 64])?;
/// txn.commit()?;
/// # Ok::<(), penumbra::PenumbraError>(())
/// ```
pub struct WriteTxn<'db> {
    db: &'db Database,
    _guard: WriterGuard,
    ops: Vec<TxnOp>,
    state: TxState,
    started: Instant,
}

impl<'db> WriteTxn<'db> {
    pub(crate) fn new(db: &'db Database, guard: WriterGuard) -> Self {
        debug!("txn.begin");
        Self {
            db,
            _guard: guard,
            ops: Vec::new(),
            state: TxState::Active,
            started: Instant::now(),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TxState {
        self.state
    }

    /// Number of buffered operations.
    pub fn num_ops(&self) -> usize {
        self.ops.len()
    }

    /// Writes `bytes` under chunk `name`.
    pub fn put_chunk(&mut self, name: impl Into<String>, bytes: Vec<u8>) -> Result<()> {
        let name = checked_name(name.into())?;
        self.ops.push(TxnOp::PutChunk { name, bytes });
        Ok(())
    }

    /// Deletes chunk `name`; deleting a missing chunk is a no-op.
    pub fn delete_chunk(&mut self, name: impl Into<String>) -> Result<()> {
        let name = checked_name(name.into())?;
        self.ops.push(TxnOp::DeleteChunk { name });
        Ok(())
    }

    /// Writes catalog entry `name`.
    pub fn put_catalog_entry(&mut self, name: impl Into<String>, value: Vec<u8>) -> Result<()> {
        let name = checked_name(name.into())?;
        self.ops.push(TxnOp::PutCatalog { name, value });
        Ok(())
    }

    /// Removes catalog entry `name`; removing a missing entry is a no-op.
    pub fn remove_catalog_entry(&mut self, name: impl Into<String>) -> Result<()> {
        let name = checked_name(name.into())?;
        self.ops.push(TxnOp::RemoveCatalog { name });
        Ok(())
    }

    /// Reads chunk `name` including this transaction's own buffered writes.
    pub fn get_chunk(&self, name: &str) -> Result<Option<Vec<u8>>> {
        for op in self.ops.iter().rev() {
            match op {
                TxnOp::PutChunk { name: n, bytes } if n == name => return Ok(Some(bytes.clone())),
                TxnOp::DeleteChunk { name: n } if n == name => return Ok(None),
                _ => {}
            }
        }
        self.db.read_chunk(name)
    }

    /// Allocates raw pages from the data file; released again on rollback.
    pub fn allocate_page_range(&mut self, num_pages: u64) -> Result<PageRange> {
        self.db.storage().page_manager().allocate_page_range(num_pages)
    }

    /// Frees raw pages; they become reusable after the next checkpoint.
    pub fn free_page_range(&mut self, range: PageRange) {
        self.db.storage().page_manager().free_page_range(range);
    }

    /// Makes the buffered changes durable and visible.
    ///
    /// An automatic checkpoint may run afterwards; its error is returned
    /// even though the commit itself is already durable.
    pub fn commit(mut self) -> Result<()> {
        if let Err(err) = self.db.ensure_usable() {
            self.rollback_inner();
            return Err(err);
        }
        let payload = encode_ops(&self.ops);
        if !self.db.options().in_memory {
            if let Err(err) = self.db.storage().wal().log_commit(&payload) {
                self.rollback_inner();
                return Err(err);
            }
        }
        self.state = TxState::Committed;
        info!(
            ops = self.ops.len(),
            bytes = payload.len(),
            duration_ms = self.started.elapsed().as_millis() as u64,
            "txn.commit"
        );
        let estimated: u64 = self.ops.iter().map(TxnOp::estimated_bytes).sum();
        let ops = std::mem::take(&mut self.ops);
        self.db
            .apply_committed(&ops, TransactionType::Write, estimated)
    }

    /// Discards the buffered changes and any page allocations.
    pub fn rollback(mut self) {
        self.rollback_inner();
    }

    fn rollback_inner(&mut self) {
        if self.state != TxState::Active {
            return;
        }
        self.ops.clear();
        self.state = TxState::RolledBack;
        if let Err(err) = self.db.storage().rollback_transaction() {
            error!(error = %err, "txn.rollback.shadow_failed");
            return;
        }
        warn!("txn.rollback");
    }
}

impl Drop for WriteTxn<'_> {
    fn drop(&mut self) {
        self.rollback_inner();
    }
}

fn checked_name(name: String) -> Result<String> {
    if name.is_empty() {
        return Err(PenumbraError::Invalid("name must not be empty"));
    }
    Ok(name)
}
