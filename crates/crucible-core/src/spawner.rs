//! Instance Spawner.
//!
//! Candidates are materialised into a hidden staging directory next to
//! `instances/` and renamed into place once the manifest and lineage record
//! are written, so readers never see a half-built instance.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crucible_state::atomic::{read_json, write_json_atomic};
use crucible_state::StorageError;

use crate::domain::candidate::Candidate;
use crate::domain::error::{CrucibleError, Result};
use crate::domain::instance::{Instance, InstanceId, LineageRecord, Manifest};
use crate::lineage::{compute_manifest, LineageSigner, LINEAGE_FILE, MANIFEST_FILE};

pub const CANDIDATE_FILE: &str = "candidate.json";
pub const CONFIG_FILE: &str = "config.json";

/// Append-only tree of spawned instances.
#[derive(Debug, Clone)]
pub struct InstanceStore {
    dir: PathBuf,
    signer: LineageSigner,
}

impl InstanceStore {
    pub fn new(dir: impl Into<PathBuf>, signer: LineageSigner) -> Self {
        Self {
            dir: dir.into(),
            signer,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_of(&self, id: &InstanceId) -> PathBuf {
        self.dir.join(id.as_str())
    }

    pub fn exists(&self, id: &InstanceId) -> bool {
        self.path_of(id).is_dir()
    }

    /// Materialise `candidate` as a new instance.
    pub fn spawn(&self, candidate: &Candidate, now: DateTime<Utc>) -> Result<Instance> {
        let id = InstanceId::for_candidate(&candidate.id);
        let target = self.path_of(&id);
        if target.exists() {
            return Err(CrucibleError::InvalidCandidate {
                candidate_id: candidate.id.to_string(),
                reason: format!("instance {id} already exists"),
            });
        }
        fs::create_dir_all(&self.dir)?;

        let staging = tempfile::Builder::new()
            .prefix(".spawn-")
            .tempdir_in(&self.dir)?;

        write_json_atomic(&staging.path().join(CANDIDATE_FILE), candidate)?;
        write_json_atomic(&staging.path().join(CONFIG_FILE), &candidate.params)?;

        let manifest = compute_manifest(staging.path())?;
        let (parent_instance, parent_tag) = match &candidate.parent {
            Some(parent) => {
                let parent_id = InstanceId::for_candidate(parent);
                let tag = self.read_lineage(&parent_id)?.map(|l| l.tag);
                (Some(parent_id), tag)
            }
            None => (None, None),
        };
        let mut lineage = LineageRecord {
            instance_id: id.clone(),
            candidate_id: candidate.id.clone(),
            parent_instance,
            parent_tag,
            generation: candidate.generation,
            created_at: now,
            manifest_digest: manifest.digest()?,
            tag: String::new(),
        };
        self.signer.sign(&mut lineage)?;

        write_json_atomic(&staging.path().join(MANIFEST_FILE), &manifest)?;
        write_json_atomic(&staging.path().join(LINEAGE_FILE), &lineage)?;

        let staged = staging.keep();
        if let Err(e) = fs::rename(&staged, &target) {
            let _ = fs::remove_dir_all(&staged);
            return Err(e.into());
        }
        debug!(instance_id = %id, generation = candidate.generation, "instance spawned");

        Ok(Instance {
            id,
            path: target,
            candidate: candidate.clone(),
            manifest,
            lineage,
        })
    }

    fn read_lineage(&self, id: &InstanceId) -> Result<Option<LineageRecord>> {
        let path = self.path_of(id).join(LINEAGE_FILE);
        match read_json::<LineageRecord>(&path) {
            Ok(record) => Ok(Some(record)),
            Err(StorageError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Read an instance back without checking its integrity.
    pub fn load(&self, id: &InstanceId) -> Result<Instance> {
        let path = self.path_of(id);
        if !path.is_dir() {
            return Err(CrucibleError::NotFound(format!("instance {id}")));
        }
        let corrupt = |e: StorageError| CrucibleError::CorruptedInstance {
            instance_id: id.to_string(),
            reason: e.to_string(),
        };
        let candidate: Candidate = read_json(&path.join(CANDIDATE_FILE)).map_err(corrupt)?;
        let manifest: Manifest = read_json(&path.join(MANIFEST_FILE)).map_err(corrupt)?;
        let lineage: LineageRecord = read_json(&path.join(LINEAGE_FILE)).map_err(corrupt)?;
        if &lineage.instance_id != id {
            return Err(CrucibleError::CorruptedInstance {
                instance_id: id.to_string(),
                reason: format!("lineage names {}", lineage.instance_id),
            });
        }
        Ok(Instance {
            id: id.clone(),
            path,
            candidate,
            manifest,
            lineage,
        })
    }

    /// Load and verify manifest, lineage tag and parent chain.
    pub fn verify(&self, id: &InstanceId) -> Result<Instance> {
        let instance = self.load(id)?;
        let parent = match &instance.lineage.parent_instance {
            Some(parent_id) => match self.read_lineage(parent_id) {
                Ok(found) => found,
                Err(e) => {
                    return Err(CrucibleError::CorruptedInstance {
                        instance_id: id.to_string(),
                        reason: format!("parent {parent_id} unreadable: {e}"),
                    })
                }
            },
            None => None,
        };
        self.signer.verify_instance(
            &instance.path,
            &instance.manifest,
            &instance.lineage,
            parent.as_ref(),
        )?;
        Ok(instance)
    }

    /// Every instance id with its creation time, oldest first. Unreadable
    /// entries are listed with the directory mtime so retention can still
    /// reclaim them.
    pub fn list(&self) -> Result<Vec<(InstanceId, DateTime<Utc>)>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut out = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || !entry.file_type()?.is_dir() {
                continue;
            }
            let id = InstanceId::from(name);
            let created_at = match self.read_lineage(&id) {
                Ok(Some(lineage)) => lineage.created_at,
                Ok(None) | Err(_) => {
                    warn!(instance_id = %id, "instance has no readable lineage");
                    entry
                        .metadata()?
                        .modified()
                        .map(DateTime::<Utc>::from)
                        .unwrap_or_default()
                }
            };
            out.push((id, created_at));
        }
        out.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        Ok(out)
    }

    pub(crate) fn remove(&self, id: &InstanceId) -> Result<()> {
        match fs::remove_dir_all(self.path_of(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::candidate::CandidateOrigin;
    use crate::domain::search_space::{ParamValue, Params};

    fn store(dir: &Path) -> InstanceStore {
        InstanceStore::new(dir.join("instances"), LineageSigner::new(b"k".repeat(16)))
    }

    fn candidate(parent: Option<&Candidate>) -> Candidate {
        let mut params = Params::new();
        params.insert("threads".into(), ParamValue::Int(4));
        Candidate::new(
            params,
            parent.map_or(0, |p| p.generation + 1),
            parent.map(|p| p.id.clone()),
            CandidateOrigin::Random,
            Utc::now(),
        )
    }

    #[test]
    fn spawn_then_verify() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let c = candidate(None);
        let inst = store.spawn(&c, Utc::now()).unwrap();

        assert!(inst.path.join(CONFIG_FILE).exists());
        assert!(inst.manifest.files.contains_key(CANDIDATE_FILE));
        let again = store.verify(&inst.id).unwrap();
        assert_eq!(again.candidate, c);

        // The staging directory was renamed into place, not left behind.
        let entries: Vec<_> = fs::read_dir(store.dir()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn staging_dirs_are_not_listed() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        store.spawn(&candidate(None), Utc::now()).unwrap();
        fs::create_dir_all(store.dir().join(".spawn-leftover")).unwrap();

        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn spawn_refuses_duplicate() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let c = candidate(None);
        store.spawn(&c, Utc::now()).unwrap();
        assert!(matches!(
            store.spawn(&c, Utc::now()),
            Err(CrucibleError::InvalidCandidate { .. })
        ));
    }

    #[test]
    fn tampered_config_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let inst = store.spawn(&candidate(None), Utc::now()).unwrap();
        fs::write(inst.path.join(CONFIG_FILE), b"{\"threads\":64}").unwrap();

        assert!(matches!(
            store.verify(&inst.id),
            Err(CrucibleError::CorruptedInstance { .. })
        ));
    }

    #[test]
    fn child_chains_to_parent_tag() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let parent = candidate(None);
        let parent_inst = store.spawn(&parent, Utc::now()).unwrap();
        let child = candidate(Some(&parent));
        let child_inst = store.spawn(&child, Utc::now()).unwrap();

        assert_eq!(
            child_inst.lineage.parent_tag.as_deref(),
            Some(parent_inst.lineage.tag.as_str())
        );
        store.verify(&child_inst.id).unwrap();

        // Re-sign the parent with a different generation: its tag changes and
        // the child's chain no longer matches.
        let mut forged = parent_inst.lineage.clone();
        forged.generation = 7;
        LineageSigner::new(b"k".repeat(16)).sign(&mut forged).unwrap();
        write_json_atomic(&parent_inst.path.join(LINEAGE_FILE), &forged).unwrap();

        assert!(matches!(
            store.verify(&child_inst.id),
            Err(CrucibleError::CorruptedInstance { .. })
        ));
    }

    #[test]
    fn remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let inst = store.spawn(&candidate(None), Utc::now()).unwrap();
        store.remove(&inst.id).unwrap();
        store.remove(&inst.id).unwrap();
        assert!(store.list().unwrap().is_empty());
    }
}
