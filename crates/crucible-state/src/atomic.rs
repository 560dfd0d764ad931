//! Write-temp-then-rename helpers.
//!
//! Every shared mutable file (promotion records, controller state,
//! checkpoints) goes through here so readers never observe a partial write.

use std::fs;
use std::io::Write;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tempfile::NamedTempFile;

use crate::error::StorageError;
use crate::storage_traits::StorageResult;

/// Atomically replace `path` with `data`.
///
/// The temp file is created in the destination directory so the final
/// rename never crosses a filesystem boundary.
pub fn write_atomic(path: &Path, data: &[u8]) -> StorageResult<()> {
    let dir = parent_dir(path)?;
    fs::create_dir_all(dir)?;

    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Atomically create `path` with `data`, failing with `AlreadyExists` if a
/// file is already there. Used where first-writer-wins matters.
pub fn create_atomic(path: &Path, data: &[u8]) -> StorageResult<()> {
    let dir = parent_dir(path)?;
    fs::create_dir_all(dir)?;

    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist_noclobber(path).map_err(|e| e.error)?;
    Ok(())
}

/// Serialize `value` as pretty JSON and atomically replace `path`.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> StorageResult<()> {
    let json = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &json)
}

/// Read and deserialize a JSON file; `Ok(None)` when it does not exist.
pub fn read_json_opt<T: DeserializeOwned>(path: &Path) -> StorageResult<Option<T>> {
    match fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes).map(Some).map_err(|e| {
            StorageError::Corrupt {
                path: path.display().to_string(),
                reason: e.to_string(),
            }
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StorageError::Io(e)),
    }
}

/// Read and deserialize a JSON file that must exist.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> StorageResult<T> {
    read_json_opt(path)?.ok_or_else(|| StorageError::NotFound {
        key: path.display().to_string(),
    })
}

fn parent_dir(path: &Path) -> StorageResult<&Path> {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => Ok(p),
        _ => Ok(Path::new(".")),
    }
}
