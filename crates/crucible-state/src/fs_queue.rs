//! File-backed `SymptomQueue`: `feed.jsonl` written by the external monitor
//! (or `crucible symptom record`), `processed.jsonl` as the idempotency
//! ledger.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::jsonl::JsonlLog;
use crate::storage_traits::{StorageResult, SymptomQueue, SymptomRecord};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ProcessedEntry {
    id: String,
    processed_at: DateTime<Utc>,
}

/// Symptom feed plus processed-id ledger under one directory.
#[derive(Debug)]
pub struct FsSymptomQueue {
    dir: PathBuf,
    feed: JsonlLog<SymptomRecord>,
    processed: JsonlLog<ProcessedEntry>,
}

impl FsSymptomQueue {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            feed: JsonlLog::new(dir.join("feed.jsonl")),
            processed: JsonlLog::new(dir.join("processed.jsonl")),
            dir,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn processed_ids(&self) -> StorageResult<HashSet<String>> {
        Ok(self
            .processed
            .read_all()?
            .into_iter()
            .map(|entry| entry.id)
            .collect())
    }
}

impl SymptomQueue for FsSymptomQueue {
    fn publish(&self, record: &SymptomRecord) -> StorageResult<()> {
        self.feed.append(record)
    }

    fn pending(&self, limit: usize) -> StorageResult<Vec<SymptomRecord>> {
        let mut seen = self.processed_ids()?;
        let mut out = Vec::new();
        for record in self.feed.read_all()? {
            if out.len() >= limit {
                break;
            }
            if seen.insert(record.id.clone()) {
                out.push(record);
            }
        }
        Ok(out)
    }

    fn mark_processed(&self, id: &str) -> StorageResult<()> {
        if self.processed_ids()?.contains(id) {
            return Ok(());
        }
        self.processed.append(&ProcessedEntry {
            id: id.to_string(),
            processed_at: Utc::now(),
        })
    }
}
