//! Append-only line-delimited JSON logs.
//!
//! Used for the audit trail, the symptom feed, the processed-id ledger, the
//! winners ledger and the metric baseline. Lines are never rewritten.

use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use crate::storage_traits::StorageResult;

/// Typed handle over a single `.jsonl` file.
#[derive(Debug)]
pub struct JsonlLog<T> {
    path: PathBuf,
    append_lock: Mutex<()>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonlLog<T>
where
    T: Serialize + DeserializeOwned,
{
    /// Open (lazily) the log at `path`. Parent directories are created on
    /// first append.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            append_lock: Mutex::new(()),
            _marker: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record as a single line.
    pub fn append(&self, record: &T) -> StorageResult<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let _guard = self
            .append_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)?;
            }
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(&line)?;
        file.flush()?;
        Ok(())
    }

    /// Read every well-formed record in file order.
    ///
    /// A torn trailing line (crash mid-append) or any unparsable line is
    /// skipped with a warning rather than failing the whole read.
    pub fn read_all(&self) -> StorageResult<Vec<T>> {
        let file = match fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut out = Vec::new();
        for (lineno, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<T>(&line) {
                Ok(record) => out.push(record),
                Err(e) => warn!(
                    path = %self.path.display(),
                    line = lineno + 1,
                    error = %e,
                    "skipping unparsable jsonl line"
                ),
            }
        }
        Ok(out)
    }
}
