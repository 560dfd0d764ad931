//! Materialized candidates and their integrity metadata.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::candidate::{Candidate, CandidateId};
use crate::domain::digest::compute_digest;
use crate::domain::error::Result;

/// Instance identifier: `inst-<candidate id>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    pub fn for_candidate(candidate: &CandidateId) -> Self {
        Self(format!("inst-{candidate}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for InstanceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for InstanceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Relative path to SHA-256 of file content, for every file of an instance
/// except the manifest and lineage record themselves.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub files: BTreeMap<String, String>,
}

impl Manifest {
    /// Digest over the canonical JSON of the file map.
    pub fn digest(&self) -> Result<String> {
        compute_digest(&self.files)
    }
}

/// Tamper-evident lineage record. `tag` is an HMAC over every other field;
/// `parent_tag` chains the record to the parent instance's tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineageRecord {
    pub instance_id: InstanceId,
    pub candidate_id: CandidateId,
    pub parent_instance: Option<InstanceId>,
    pub parent_tag: Option<String>,
    pub generation: u32,
    pub created_at: DateTime<Utc>,
    pub manifest_digest: String,
    #[serde(default)]
    pub tag: String,
}

/// A spawned, immutable instance.
#[derive(Debug, Clone, PartialEq)]
pub struct Instance {
    pub id: InstanceId,
    pub path: PathBuf,
    pub candidate: Candidate,
    pub manifest: Manifest,
    pub lineage: LineageRecord,
}

impl Instance {
    pub fn created_at(&self) -> DateTime<Utc> {
        self.lineage.created_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_id_derives_from_candidate() {
        let cid = CandidateId::from("abc123");
        assert_eq!(InstanceId::for_candidate(&cid).as_str(), "inst-abc123");
    }

    #[test]
    fn manifest_digest_tracks_content() {
        let mut m = Manifest::default();
        m.files.insert("config.json".into(), "aa".into());
        let d1 = m.digest().unwrap();
        m.files.insert("config.json".into(), "bb".into());
        assert_ne!(d1, m.digest().unwrap());
    }
}
