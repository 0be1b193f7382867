#![allow(missing_docs)]

use std::path::{Path, PathBuf};

use assert_cmd::cargo::cargo_bin_cmd;
use penumbra::{Database, DatabaseOptions};
use serde_json::Value;
use tempfile::TempDir;

fn setup_db(name: &str) -> (TempDir, PathBuf) {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join(format!("{name}.penumbra"));
    seed(&path).expect("seed data");
    (dir, path)
}

fn seed(path: &Path) -> penumbra::Result<()> {
    let db = Database::open(path, DatabaseOptions::manual_checkpoint())?;
    let mut txn = db.begin_write()?;
    txn.put_catalog_entry("person", b"name:str".to_vec())?;
    txn.put_chunk("person/0", vec![1; 3 * 4096])?;
    txn.put_chunk("person/1", vec![2; 4096])?;
    txn.commit()?;
    db.checkpoint()?;

    let mut txn = db.begin_write()?;
    txn.delete_chunk("person/0")?;
    txn.commit()?;
    db.checkpoint()?;
    db.checkpoint()?;
    Ok(())
}

fn json_output(args: &[&str], db_path: &Path) -> Value {
    let output = cargo_bin_cmd!("penumbra")
        .args(["--format", "json"])
        .args(args)
        .arg(db_path)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    serde_json::from_slice(&output).expect("valid json")
}

#[test]
fn header_reports_checkpointed_ranges() {
    let (_dir, db_path) = setup_db("header");
    let report = json_output(&["header"], &db_path);
    let header = &report["header"];
    assert_eq!(header["storage_version"], 1);
    assert!(header["catalog_page_range"]["num_pages"].as_u64().unwrap() > 0);
    assert!(header["metadata_page_range"]["num_pages"].as_u64().unwrap() > 0);
    assert_eq!(report["wal_records"], 0);
    assert_eq!(report["pending_shadow_replay"], false);
}

#[test]
fn free_space_lists_reclaimed_pages() {
    let (_dir, db_path) = setup_db("free_space");
    let report = json_output(&["free-space"], &db_path);
    let total = report["total_entries"].as_u64().unwrap();
    assert!(total > 0, "deleted chunk pages should be free");
    assert!(report["total_free_pages"].as_u64().unwrap() >= 3);
    assert_eq!(report["entries"].as_array().unwrap().len() as u64, total);

    let page = json_output(&["free-space", "--offset", "0", "--limit", "1"], &db_path);
    assert_eq!(page["entries"].as_array().unwrap().len(), 1);
    assert_eq!(page["total_entries"].as_u64().unwrap(), total);
}

#[test]
fn checkpoint_command_reports_timing() {
    let (_dir, db_path) = setup_db("checkpoint");
    let report = json_output(&["checkpoint"], &db_path);
    assert!(report["duration_ms"].as_f64().unwrap() >= 0.0);
    assert_eq!(report["recovery"], "clean");
    assert_eq!(report["catalog_written"], false);
}

#[test]
fn text_output_is_human_readable() {
    let (_dir, db_path) = setup_db("text");
    let output = cargo_bin_cmd!("penumbra")
        .arg("header")
        .arg(&db_path)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8(output).expect("utf8");
    assert!(text.contains("storage_version=1"));
    assert!(text.contains("catalog={"));
}

#[test]
fn missing_database_fails() {
    let dir = TempDir::new().expect("tempdir");
    cargo_bin_cmd!("penumbra")
        .arg("free-space")
        .arg(dir.path().join("absent.penumbra"))
        .assert()
        .failure();
}
