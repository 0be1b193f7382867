use std::fs;
use std::path::Path;

use crate::db::Database;

use crate::admin::error::{AdminError, Result};
use crate::admin::options::AdminOpenOptions;

/// Opens the database at `path`, running recovery if needed.
///
/// # Errors
///
/// Returns an error if the database doesn't exist and `create_if_missing` is false,
/// or if opening or recovering the database fails.
pub fn open_database(path: &Path, opts: &AdminOpenOptions) -> Result<Database> {
    if !path.exists() {
        if !opts.create_if_missing {
            return Err(AdminError::missing_database(path));
        }
        ensure_parent_dir(path)?;
    }
    Ok(Database::open(path, opts.database_options())?)
}

pub(crate) fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

pub(crate) fn file_len(path: &Path) -> Option<u64> {
    fs::metadata(path).ok().map(|m| m.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_database_is_reported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("absent.db");
        let err = open_database(&path, &AdminOpenOptions::default())
            .err()
            .unwrap();
        assert!(matches!(err, AdminError::MissingDatabase(p) if p == path));
    }

    #[test]
    fn create_if_missing_makes_parent_dirs() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/deeper/graph.db");
        let opts = AdminOpenOptions {
            create_if_missing: true,
            ..AdminOpenOptions::default()
        };
        let db = open_database(&path, &opts).unwrap();
        drop(db);
        assert!(path.exists());
    }
}
