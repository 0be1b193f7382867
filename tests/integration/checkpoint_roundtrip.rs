#![allow(missing_docs)]

use std::sync::Once;

use penumbra::primitives::io::StdFileIo;
use penumbra::storage::shadow_utils::{read_page, update_page};
use penumbra::storage::DatabaseHeader;
use penumbra::types::page::PAGE_SIZE;
use penumbra::{Database, DatabaseOptions, Result, TransactionType};
use tempfile::tempdir;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("penumbra::storage=debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .try_init();
    });
}

fn pattern(seed: u8) -> Vec<u8> {
    (0..PAGE_SIZE).map(|i| (i as u8).wrapping_mul(31) ^ seed).collect()
}

#[test]
fn raw_pages_become_visible_after_checkpoint() -> Result<()> {
    init_tracing();
    let dir = tempdir().expect("tmpdir");
    let path = dir.path().join("raw.db");
    let range = {
        let db = Database::open(&path, DatabaseOptions::manual_checkpoint())?;
        let storage = db.storage();
        let mut txn = db.begin_write()?;
        let range = txn.allocate_page_range(2)?;
        for (offset, page) in range.iter_pages().enumerate() {
            let bytes = pattern(offset as u8);
            update_page(storage.data_fh(), page, true, storage.shadow_file(), |buf| {
                buf.copy_from_slice(&bytes);
                Ok(())
            })?;
        }
        txn.commit()?;

        // Only the checkpointer sees staged pages.
        let page = range.page(0);
        read_page(
            storage.data_fh(),
            page,
            storage.shadow_file(),
            TransactionType::ReadOnly,
            |buf| {
                assert!(buf.iter().all(|&b| b == 0));
                Ok(())
            },
        )?;
        read_page(
            storage.data_fh(),
            page,
            storage.shadow_file(),
            TransactionType::Checkpoint,
            |buf| {
                assert_eq!(buf, &pattern(0)[..]);
                Ok(())
            },
        )?;

        let outcome = db.checkpoint()?;
        assert!(outcome.shadow_pages >= 3, "two data pages plus the header");
        range
    };

    let db = Database::open(&path, DatabaseOptions::manual_checkpoint())?;
    let storage = db.storage();
    for (offset, page) in range.iter_pages().enumerate() {
        read_page(
            storage.data_fh(),
            page,
            storage.shadow_file(),
            TransactionType::ReadOnly,
            |buf| {
                assert_eq!(buf, &pattern(offset as u8)[..]);
                Ok(())
            },
        )?;
    }
    let again = db.begin_write()?.allocate_page_range(2)?;
    assert!(!again.overlaps(&range), "checkpointed allocation handed out again");
    Ok(())
}

#[test]
fn chunks_and_catalog_survive_many_checkpoints() -> Result<()> {
    init_tracing();
    let dir = tempdir().expect("tmpdir");
    let path = dir.path().join("chunks.db");
    {
        let db = Database::open(&path, DatabaseOptions::manual_checkpoint())?;
        for round in 0..5u8 {
            let mut txn = db.begin_write()?;
            txn.put_catalog_entry(format!("table{round}"), vec![round; 3])?;
            txn.put_chunk(format!("chunk{round}"), vec![round; 3 * PAGE_SIZE + 7])?;
            if round > 0 {
                txn.delete_chunk(format!("chunk{}", round - 1))?;
            }
            txn.commit()?;
            db.checkpoint()?;
        }
    }
    let db = Database::open(&path, DatabaseOptions::manual_checkpoint())?;
    assert_eq!(db.chunk_names(), vec!["chunk4".to_string()]);
    assert_eq!(db.read_chunk("chunk4")?, Some(vec![4u8; 3 * PAGE_SIZE + 7]));
    assert_eq!(db.read_chunk("chunk3")?, None);
    assert_eq!(db.catalog_names().len(), 5);
    assert_eq!(db.catalog_entry("table2"), Some(vec![2u8; 3]));
    Ok(())
}

#[test]
fn churn_reuses_freed_pages() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let path = dir.path().join("churn.db");
    let db = Database::open(&path, DatabaseOptions::manual_checkpoint())?;
    let mut sizes = Vec::new();
    for round in 0..12u8 {
        let mut txn = db.begin_write()?;
        txn.put_chunk("hot", vec![round; 5 * PAGE_SIZE])?;
        txn.put_catalog_entry("version", vec![round])?;
        txn.commit()?;
        db.checkpoint()?;
        sizes.push(db.storage().data_fh().num_pages());
    }
    // Freed pages only become reusable one checkpoint later, so the file
    // settles after a couple of rounds.
    let settled = sizes[4];
    assert!(sizes[4..].iter().all(|&n| n == settled), "file kept growing: {sizes:?}");
    Ok(())
}

#[test]
fn on_disk_header_matches_current_header() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let path = dir.path().join("header.db");
    let db = Database::open(&path, DatabaseOptions::manual_checkpoint())?;
    let mut txn = db.begin_write()?;
    txn.put_catalog_entry("person", b"schema".to_vec())?;
    txn.commit()?;
    let outcome = db.checkpoint()?;
    let on_disk = DatabaseHeader::read(&StdFileIo::open_read_only(&path)?)?;
    assert_eq!(on_disk, Some(outcome.header));
    assert_eq!(db.header(), outcome.header);

    let unchanged = db.checkpoint()?;
    assert!(!unchanged.catalog_written);
    assert!(!unchanged.metadata_written);
    assert_eq!(unchanged.header, outcome.header);
    Ok(())
}
