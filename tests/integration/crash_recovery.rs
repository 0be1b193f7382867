#![allow(missing_docs)]

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Once;

use penumbra::storage::{shadow_path, wal_path, CheckpointStage};
use penumbra::types::page::PAGE_SIZE;
use penumbra::{Database, DatabaseOptions, PenumbraError, RecoveryMode, Result};
use tempfile::tempdir;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("penumbra=info"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .try_init();
    });
}

fn open(path: &Path) -> Result<Database> {
    Database::open(path, DatabaseOptions::manual_checkpoint())
}

fn header_bytes(path: &Path) -> Vec<u8> {
    let bytes = fs::read(path).expect("read data file");
    bytes[..PAGE_SIZE].to_vec()
}

/// Commits `v1`, checkpoints it, commits `v2` and crashes the second
/// checkpoint right after `stage`.
fn crash_second_checkpoint(path: &Path, stage: CheckpointStage) -> Result<Vec<u8>> {
    let db = open(path)?;
    let mut txn = db.begin_write()?;
    txn.put_chunk("a", vec![1; 2 * PAGE_SIZE])?;
    txn.put_catalog_entry("person", b"v1".to_vec())?;
    txn.commit()?;
    db.checkpoint()?;
    let committed_header = header_bytes(path);

    let mut txn = db.begin_write()?;
    txn.put_chunk("a", vec![2; 3 * PAGE_SIZE])?;
    txn.put_chunk("b", vec![3; 10])?;
    txn.put_catalog_entry("person", b"v2".to_vec())?;
    txn.commit()?;
    db.set_checkpoint_failpoint(Some(stage));
    assert!(db.checkpoint().is_err());
    assert!(db.is_poisoned());
    drop(db);
    Ok(committed_header)
}

fn assert_second_commit_visible(db: &Database) -> Result<()> {
    assert_eq!(db.read_chunk("a")?, Some(vec![2; 3 * PAGE_SIZE]));
    assert_eq!(db.read_chunk("b")?, Some(vec![3; 10]));
    assert_eq!(db.catalog_entry("person"), Some(b"v2".to_vec()));
    Ok(())
}

#[test]
fn crash_before_wal_record_keeps_old_header_and_replays_commit() -> Result<()> {
    init_tracing();
    let dir = tempdir().expect("tmpdir");
    let path = dir.path().join("shadow_flushed.db");
    let committed_header = crash_second_checkpoint(&path, CheckpointStage::ShadowFlushed)?;

    assert_eq!(header_bytes(&path), committed_header);
    assert!(shadow_path(&path).exists());

    let db = open(&path)?;
    let report = db.recovery_report();
    assert_eq!(report.mode, RecoveryMode::WalReplay);
    assert_eq!(report.replayed_commits, 1);
    assert_second_commit_visible(&db)?;

    // The replayed commit is checkpointed normally from here on.
    db.checkpoint()?;
    drop(db);
    let db = open(&path)?;
    assert_eq!(db.recovery_report().mode, RecoveryMode::Clean);
    assert_second_commit_visible(&db)?;
    Ok(())
}

#[test]
fn crash_after_wal_record_replays_shadow_pages() -> Result<()> {
    init_tracing();
    let dir = tempdir().expect("tmpdir");
    let path = dir.path().join("wal_logged.db");
    let committed_header = crash_second_checkpoint(&path, CheckpointStage::WalLogged)?;
    assert_eq!(header_bytes(&path), committed_header);

    let db = open(&path)?;
    let report = db.recovery_report();
    assert_eq!(report.mode, RecoveryMode::ShadowReplay);
    assert!(report.shadow_pages > 0);
    assert_ne!(header_bytes(&path), committed_header);
    assert_second_commit_visible(&db)?;
    assert!(db.storage().wal().is_empty());
    Ok(())
}

#[test]
fn crash_after_apply_is_replayed_idempotently() -> Result<()> {
    init_tracing();
    let dir = tempdir().expect("tmpdir");
    let path = dir.path().join("applied.db");
    crash_second_checkpoint(&path, CheckpointStage::ShadowApplied)?;

    let db = open(&path)?;
    assert_eq!(db.recovery_report().mode, RecoveryMode::ShadowReplay);
    assert_second_commit_visible(&db)?;
    Ok(())
}

#[test]
fn recovered_free_list_never_hands_out_live_pages() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let path = dir.path().join("free_list.db");
    crash_second_checkpoint(&path, CheckpointStage::WalLogged)?;

    let db = open(&path)?;
    let live = [
        db.storage().table_store().location("a").expect("a persisted").range,
        db.header().catalog_page_range,
        db.header().metadata_page_range,
    ];
    let pm = db.storage().page_manager();
    for free in pm.free_entries(0, pm.num_free_entries()) {
        for range in &live {
            assert!(!free.overlaps(range), "free {free} overlaps live {range}");
        }
    }
    Ok(())
}

#[test]
fn torn_wal_tail_is_ignored() -> Result<()> {
    init_tracing();
    let dir = tempdir().expect("tmpdir");
    let path = dir.path().join("torn.db");
    {
        let db = open(&path)?;
        let mut txn = db.begin_write()?;
        txn.put_chunk("kept", vec![7; 100])?;
        txn.commit()?;
        // simulate a crash: no close-time checkpoint
        std::mem::forget(db);
    }
    let mut wal = OpenOptions::new()
        .append(true)
        .open(wal_path(&path))
        .expect("open wal");
    wal.write_all(&[1, 0, 0, 0, 0, 0, 0, 64, 0xde, 0xad])
        .expect("append torn record");
    drop(wal);

    let db = open(&path)?;
    assert_eq!(db.recovery_report().replayed_commits, 1);
    assert_eq!(db.read_chunk("kept")?, Some(vec![7; 100]));

    let mut txn = db.begin_write()?;
    txn.put_chunk("after", vec![8])?;
    txn.commit()?;
    std::mem::forget(db);

    let db = open(&path)?;
    assert_eq!(db.recovery_report().replayed_commits, 2);
    assert_eq!(db.read_chunk("after")?, Some(vec![8]));
    Ok(())
}

#[test]
fn damaged_wal_header_refuses_to_open() -> Result<()> {
    init_tracing();
    let dir = tempdir().expect("tmpdir");
    let path = dir.path().join("bad_wal_header.db");
    {
        let db = open(&path)?;
        let mut txn = db.begin_write()?;
        txn.put_chunk("kept", vec![5; 32])?;
        txn.commit()?;
        std::mem::forget(db);
    }
    let wal_file = wal_path(&path);
    let mut bytes = fs::read(&wal_file).expect("read wal");
    let wal_len = bytes.len();
    bytes[13] ^= 0xFF;
    fs::write(&wal_file, &bytes).expect("write wal");

    assert!(matches!(open(&path), Err(PenumbraError::Corruption(_))));
    assert_eq!(fs::read(&wal_file).expect("read wal").len(), wal_len);

    // Restoring the header brings the commit back.
    bytes[13] ^= 0xFF;
    fs::write(&wal_file, &bytes).expect("write wal");
    let db = open(&path)?;
    assert_eq!(db.recovery_report().mode, RecoveryMode::WalReplay);
    assert_eq!(db.read_chunk("kept")?, Some(vec![5; 32]));
    Ok(())
}

#[test]
fn rolled_back_transaction_is_not_replayed() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let path = dir.path().join("rollback.db");
    {
        let db = open(&path)?;
        let mut txn = db.begin_write()?;
        txn.put_chunk("kept", vec![1])?;
        txn.commit()?;
        let mut txn = db.begin_write()?;
        txn.put_chunk("dropped", vec![2])?;
        drop(txn);
        std::mem::forget(db);
    }
    let db = open(&path)?;
    assert_eq!(db.read_chunk("kept")?, Some(vec![1]));
    assert_eq!(db.read_chunk("dropped")?, None);
    Ok(())
}
