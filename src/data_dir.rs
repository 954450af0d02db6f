//! Purpose: Load record data files from a directory into a `MemoryStore`.
//! Exports: `load_store`, `record_type_for_path`.
//! Role: File-backed stand-in for the host ORM used by the shipped binary.
//! Invariants: One `<Type>.json` file per record type; the file stem is the type name.
//! Invariants: Files that are not `.json` are ignored; malformed JSON fails the whole load.

use std::path::{Path, PathBuf};

use crate::api::{Error, ErrorKind, MemoryStore, StoredRecord};

pub fn load_store(dir: &Path) -> Result<MemoryStore, Error> {
    let entries = std::fs::read_dir(dir).map_err(|err| {
        Error::new(map_io_error_kind(&err))
            .with_message("failed to read data directory")
            .with_path(dir)
            .with_source(err)
    })?;

    let mut paths: Vec<PathBuf> = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to read data directory entry")
                .with_path(dir)
                .with_source(err)
        })?;
        let path = entry.path();
        if record_type_for_path(&path).is_some() {
            paths.push(path);
        }
    }
    paths.sort();

    let mut store = MemoryStore::new();
    for path in paths {
        let Some(record_type) = record_type_for_path(&path) else {
            continue;
        };
        let rows = read_rows(&path)?;
        let count = rows.len();
        for row in rows {
            store
                .insert(&record_type, row)
                .map_err(|err| err.with_path(&path))?;
        }
        tracing::debug!(record_type = %record_type, count, "loaded record data");
    }
    Ok(store)
}

/// Record type named by a data file path, if it is a data file.
pub fn record_type_for_path(path: &Path) -> Option<String> {
    if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    if stem.is_empty() || stem.starts_with('.') {
        return None;
    }
    Some(stem.to_string())
}

fn read_rows(path: &Path) -> Result<Vec<StoredRecord>, Error> {
    let text = std::fs::read_to_string(path).map_err(|err| {
        Error::new(map_io_error_kind(&err))
            .with_message("failed to read data file")
            .with_path(path)
            .with_source(err)
    })?;
    serde_json::from_str(&text).map_err(|err| {
        Error::new(ErrorKind::Corrupt)
            .with_message("data file is not a JSON array of records")
            .with_path(path)
            .with_hint("Each entry needs an \"id\" and either \"fields\" or \"draft\"/\"live\".")
            .with_source(err)
    })
}

pub(crate) fn map_io_error_kind(err: &std::io::Error) -> ErrorKind {
    match err.kind() {
        std::io::ErrorKind::NotFound => ErrorKind::NotFound,
        _ => ErrorKind::Io,
    }
}
