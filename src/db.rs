use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use tracing::warn;

use crate::{
    debug,
    error::{Result, SerieslyError},
    store::{Store, DB_EXT},
};

pub fn db_path(root: &Path, name: &str) -> PathBuf {
    root.join(format!("{name}.{DB_EXT}"))
}

/// Characters the original route table allowed in database names.
pub fn is_valid_dbname(name: &str) -> bool {
    !name.is_empty()
        && name.chars().all(|c| {
            c.is_ascii_alphanumeric() || matches!(c, '-' | '%' | '+' | '(' | ')' | '$' | '_')
        })
}

/// Database names present under the root, in sorted order.
pub fn db_list(root: &Path) -> Vec<String> {
    let mut names = Vec::new();
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(err) => {
            warn!("error listing {}: {err}", root.display());
            return names;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        if path.extension().and_then(|e| e.to_str()) != Some(DB_EXT) {
            continue;
        }
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            names.push(stem.to_string());
        }
    }
    names.sort();
    names
}

/// A store handle tied into the open-handle debug registry. Dropping the
/// handle deregisters it.
pub struct DbHandle {
    pub store: Arc<Store>,
    name: String,
    id: u64,
}

impl DbHandle {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for DbHandle {
    fn drop(&mut self) {
        debug::record_close(self.id);
        debug::db_stat(&self.name).note_close();
    }
}

/// Opens an existing database for reading or writing.
pub fn open(root: &Path, name: &str, site: &'static str) -> Result<DbHandle> {
    let path = db_path(root, name);
    let store = Arc::new(Store::open(&path, false)?);
    let id = debug::record_open(&path.to_string_lossy(), site);
    let stat = debug::db_stat(name);
    stat.note_open();
    Ok(DbHandle {
        store,
        name: name.to_string(),
        id,
    })
}

/// Creates a new, empty database file. Fails if one already exists.
pub fn create(root: &Path, name: &str) -> Result<()> {
    let path = db_path(root, name);
    if path.exists() {
        return Err(SerieslyError::StoreOpen(format!(
            "database {name} already exists"
        )));
    }
    let store = Store::open(&path, true)?;
    drop(store);
    Ok(())
}

/// Removes the database file. The caller is responsible for shutting down
/// any writer first.
pub fn delete(root: &Path, name: &str) -> Result<()> {
    let path = db_path(root, name);
    fs::remove_file(&path).map_err(|err| {
        if err.kind() == std::io::ErrorKind::NotFound {
            SerieslyError::NotFound
        } else {
            SerieslyError::Io(err)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn name_validation_matches_the_route_class() {
        assert!(is_valid_dbname("metrics-1"));
        assert!(is_valid_dbname("a$b(c)+d_e%f"));
        assert!(!is_valid_dbname(""));
        assert!(!is_valid_dbname("has/slash"));
        assert!(!is_valid_dbname("has space"));
    }

    #[test]
    fn create_list_delete() {
        let dir = TempDir::new().unwrap();
        create(dir.path(), "one").unwrap();
        create(dir.path(), "two").unwrap();
        assert!(create(dir.path(), "one").is_err());
        assert_eq!(db_list(dir.path()), vec!["one", "two"]);

        delete(dir.path(), "one").unwrap();
        assert_eq!(db_list(dir.path()), vec!["two"]);
        assert!(matches!(
            delete(dir.path(), "one"),
            Err(SerieslyError::NotFound)
        ));
    }

    #[test]
    fn open_requires_an_existing_file() {
        let dir = TempDir::new().unwrap();
        assert!(open(dir.path(), "missing", "test").is_err());
        create(dir.path(), "present").unwrap();
        let handle = open(dir.path(), "present", "test").unwrap();
        assert_eq!(handle.name(), "present");
    }
}
