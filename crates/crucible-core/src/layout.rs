//! On-disk layout of a Crucible root directory.

use std::path::{Path, PathBuf};

/// ```text
/// <root>/
///   instances/<instance-id>/     spawned instances (append-only)
///   promotions/                  records, acks, rollback markers, current.json
///   leases/                      <resource>.lease / <resource>.lock
///   symptoms/                    feed.jsonl, processed.jsonl
///   validation/                  pending.json, <instance-id>/checkpoint.json
///   escalation/state.json
///   audit.jsonl  winners.jsonl  baseline.jsonl  lineage.key
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn instances(&self) -> PathBuf {
        self.root.join("instances")
    }

    pub fn promotions(&self) -> PathBuf {
        self.root.join("promotions")
    }

    pub fn leases(&self) -> PathBuf {
        self.root.join("leases")
    }

    pub fn symptoms(&self) -> PathBuf {
        self.root.join("symptoms")
    }

    pub fn validation(&self) -> PathBuf {
        self.root.join("validation")
    }

    pub fn pending_validation(&self) -> PathBuf {
        self.validation().join("pending.json")
    }

    pub fn escalation_state(&self) -> PathBuf {
        self.root.join("escalation").join("state.json")
    }

    pub fn audit_log(&self) -> PathBuf {
        self.root.join("audit.jsonl")
    }

    pub fn winners_log(&self) -> PathBuf {
        self.root.join("winners.jsonl")
    }

    pub fn baseline_log(&self) -> PathBuf {
        self.root.join("baseline.jsonl")
    }

    pub fn lineage_key(&self) -> PathBuf {
        self.root.join("lineage.key")
    }
}
