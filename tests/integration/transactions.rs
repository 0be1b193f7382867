#![allow(missing_docs)]

use std::thread;

use penumbra::storage::shadow_utils::{read_page, update_page};
use penumbra::storage::DATA_FILE_ID;
use penumbra::{Database, DatabaseOptions, PenumbraError, Result, TransactionType, TxState};
use tempfile::tempdir;

#[test]
fn single_writer_is_enforced() -> Result<()> {
    let db = Database::open_in_memory()?;
    let txn = db.begin_write()?;
    assert_eq!(txn.state(), TxState::Active);
    assert!(matches!(db.begin_write(), Err(PenumbraError::Invalid(_))));
    txn.rollback();
    let txn = db.begin_write()?;
    txn.commit()?;
    Ok(())
}

#[test]
fn rollback_returns_allocations_to_the_free_list() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let db = Database::open(dir.path().join("db"), DatabaseOptions::manual_checkpoint())?;
    let first = {
        let mut txn = db.begin_write()?;
        let range = txn.allocate_page_range(4)?;
        txn.rollback();
        range
    };
    let pm = db.storage().page_manager();
    assert_eq!(pm.free_entries(0, pm.num_free_entries()), vec![first]);

    let mut txn = db.begin_write()?;
    let again = txn.allocate_page_range(4)?;
    assert_eq!(again, first);
    txn.commit()?;
    assert_eq!(pm.num_free_entries(), 0);
    Ok(())
}

#[test]
fn rollback_keeps_frees_of_earlier_commits() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let db = Database::open(dir.path().join("db"), DatabaseOptions::manual_checkpoint())?;
    let mut txn = db.begin_write()?;
    let a = txn.allocate_page_range(1)?;
    let b = txn.allocate_page_range(1)?;
    txn.commit()?;

    let mut txn = db.begin_write()?;
    txn.free_page_range(a);
    txn.commit()?;
    let mut txn = db.begin_write()?;
    txn.free_page_range(b);
    drop(txn);

    let pm = db.storage().page_manager();
    assert_eq!(pm.pending_free_entries(), vec![a]);
    db.checkpoint()?;
    let free = pm.free_entries(0, pm.num_free_entries());
    assert!(free.iter().any(|r| r.contains(a.page(0))));
    assert!(free.iter().all(|r| !r.overlaps(&b)));
    Ok(())
}

#[test]
fn rolled_back_raw_writes_never_reach_the_data_file() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let db = Database::open(dir.path().join("db"), DatabaseOptions::manual_checkpoint())?;
    let storage = db.storage();

    let mut txn = db.begin_write()?;
    let aborted = txn.allocate_page_range(1)?;
    update_page(storage.data_fh(), aborted.page(0), true, storage.shadow_file(), |buf| {
        buf.fill(0xEE);
        Ok(())
    })?;
    txn.rollback();
    assert_eq!(storage.shadow_file().num_shadow_pages(), 0);
    assert!(!storage.shadow_file().has_shadow_page(DATA_FILE_ID, aborted.page(0)));

    let mut txn = db.begin_write()?;
    let reused = txn.allocate_page_range(1)?;
    assert_eq!(reused, aborted);
    update_page(storage.data_fh(), reused.page(0), true, storage.shadow_file(), |buf| {
        buf[0] = 1;
        Ok(())
    })?;
    txn.commit()?;
    db.checkpoint()?;

    read_page(
        storage.data_fh(),
        reused.page(0),
        storage.shadow_file(),
        TransactionType::ReadOnly,
        |buf| {
            assert_eq!(buf[0], 1);
            assert!(buf[1..].iter().all(|&b| b == 0), "aborted bytes leaked");
            Ok(())
        },
    )?;
    Ok(())
}

#[test]
fn dropped_transaction_applies_nothing() -> Result<()> {
    let db = Database::open_in_memory()?;
    {
        let mut txn = db.begin_write()?;
        txn.put_chunk("a", vec![1])?;
        txn.put_catalog_entry("person", vec![2])?;
    }
    assert_eq!(db.read_chunk("a")?, None);
    assert_eq!(db.catalog_entry("person"), None);
    Ok(())
}

#[test]
fn auto_checkpoint_empties_the_wal() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let opts = DatabaseOptions {
        checkpoint_threshold: 1024,
        ..DatabaseOptions::default()
    };
    let db = Database::open(dir.path().join("db"), opts)?;

    let mut txn = db.begin_write()?;
    txn.put_chunk("small", vec![1; 8])?;
    txn.commit()?;
    assert!(!db.storage().wal().is_empty(), "below threshold stays in the WAL");

    let mut txn = db.begin_write()?;
    txn.put_chunk("large", vec![2; 4096])?;
    txn.commit()?;
    assert!(db.storage().wal().is_empty());
    assert!(db.header().metadata_page_range.is_valid());
    assert!(db.storage().table_store().location("large").is_some());
    Ok(())
}

#[test]
fn readers_run_alongside_the_writer() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let db = Database::open(dir.path().join("db"), DatabaseOptions::manual_checkpoint())?;
    let mut txn = db.begin_write()?;
    txn.put_chunk("shared", vec![0; 64])?;
    txn.commit()?;
    db.checkpoint()?;

    thread::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(|| {
                for _ in 0..50 {
                    let chunk = db.read_chunk("shared").expect("read").expect("present");
                    assert_eq!(chunk.len(), 64);
                    assert!(chunk.iter().all(|&b| b == chunk[0]));
                }
            });
        }
        scope.spawn(|| {
            for round in 1..=10u8 {
                let mut txn = db.begin_write().expect("writer");
                txn.put_chunk("shared", vec![round; 64]).expect("put");
                txn.commit().expect("commit");
                if round % 3 == 0 {
                    db.checkpoint().expect("checkpoint");
                }
            }
        });
    });
    assert_eq!(db.read_chunk("shared")?, Some(vec![10; 64]));
    Ok(())
}
