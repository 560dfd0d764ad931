//! Lineage/Manifest Store.
//!
//! A manifest hashes every file of an instance; the lineage record binds the
//! manifest digest, the candidate and the parent chain under an HMAC tag.
//! Verification recomputes all three and reports any mismatch as
//! `CorruptedInstance`.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

use crucible_state::atomic::create_atomic;

use crate::domain::digest::{canonical_json, sha256_hex};
use crate::domain::error::{CrucibleError, Result};
use crate::domain::instance::{LineageRecord, Manifest};

pub const MANIFEST_FILE: &str = "manifest.json";
pub const LINEAGE_FILE: &str = "lineage.json";

type HmacSha256 = Hmac<Sha256>;

/// Hash every regular file under `dir` except the manifest and lineage
/// record. Paths are relative with `/` separators.
pub fn compute_manifest(dir: &Path) -> Result<Manifest> {
    let mut files = BTreeMap::new();
    walk(dir, dir, &mut files)?;
    files.remove(MANIFEST_FILE);
    files.remove(LINEAGE_FILE);
    Ok(Manifest { files })
}

fn walk(root: &Path, dir: &Path, out: &mut BTreeMap<String, String>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            walk(root, &path, out)?;
        } else if file_type.is_file() {
            let rel = path
                .strip_prefix(root)
                .map_err(|e| CrucibleError::Internal(e.to_string()))?
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            out.insert(rel, sha256_hex(&fs::read(&path)?));
        }
    }
    Ok(())
}

/// Signs and verifies lineage tags.
#[derive(Clone)]
pub struct LineageSigner {
    key: Vec<u8>,
}

impl std::fmt::Debug for LineageSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LineageSigner").finish_non_exhaustive()
    }
}

impl LineageSigner {
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Self { key: key.into() }
    }

    pub fn from_hex(key_hex: &str) -> Result<Self> {
        let key = hex::decode(key_hex.trim())
            .map_err(|e| CrucibleError::InvalidConfig(format!("lineage key: {e}")))?;
        Ok(Self::new(key))
    }

    /// Use the hex key in `path`, creating a random one if the file does not
    /// exist yet. Concurrent first runs agree on whichever key landed first.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if !path.exists() {
            let mut key = [0u8; 32];
            rand::thread_rng().fill_bytes(&mut key);
            match create_atomic(path, hex::encode(key).as_bytes()) {
                Ok(()) => {}
                Err(crucible_state::StorageError::Io(e))
                    if e.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e.into()),
            }
        }
        Self::from_hex(&fs::read_to_string(path)?)
    }

    fn mac(&self) -> Result<HmacSha256> {
        HmacSha256::new_from_slice(&self.key)
            .map_err(|e| CrucibleError::InvalidConfig(format!("invalid HMAC key: {e}")))
    }

    fn signed_bytes(record: &LineageRecord) -> Result<Vec<u8>> {
        let mut unsigned = record.clone();
        unsigned.tag = String::new();
        let mut value = serde_json::to_value(&unsigned)?;
        if let Some(obj) = value.as_object_mut() {
            obj.remove("tag");
        }
        Ok(canonical_json(&value)?.into_bytes())
    }

    /// Hex HMAC-SHA256 over the record without its tag.
    pub fn tag_for(&self, record: &LineageRecord) -> Result<String> {
        let mut mac = self.mac()?;
        mac.update(&Self::signed_bytes(record)?);
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    pub fn sign(&self, record: &mut LineageRecord) -> Result<()> {
        record.tag = self.tag_for(record)?;
        Ok(())
    }

    /// Constant-time tag check.
    pub fn verify_tag(&self, record: &LineageRecord) -> Result<bool> {
        let Ok(expected) = hex::decode(&record.tag) else {
            return Ok(false);
        };
        let mut mac = self.mac()?;
        mac.update(&Self::signed_bytes(record)?);
        Ok(mac.verify_slice(&expected).is_ok())
    }

    /// Full integrity check of an instance directory.
    ///
    /// `parent` is the parent's current lineage record when the parent
    /// instance still exists.
    pub fn verify_instance(
        &self,
        dir: &Path,
        manifest: &Manifest,
        lineage: &LineageRecord,
        parent: Option<&LineageRecord>,
    ) -> Result<()> {
        let corrupt = |reason: String| CrucibleError::CorruptedInstance {
            instance_id: lineage.instance_id.to_string(),
            reason,
        };

        let on_disk = compute_manifest(dir)?;
        if &on_disk != manifest {
            let changed: Vec<&String> = on_disk
                .files
                .iter()
                .filter(|(k, v)| manifest.files.get(*k) != Some(*v))
                .map(|(k, _)| k)
                .chain(manifest.files.keys().filter(|k| !on_disk.files.contains_key(*k)))
                .collect();
            return Err(corrupt(format!("content differs from manifest: {changed:?}")));
        }

        let digest = manifest.digest()?;
        if digest != lineage.manifest_digest {
            let mismatch = CrucibleError::DigestMismatch {
                expected: lineage.manifest_digest.clone(),
                actual: digest,
            };
            return Err(corrupt(mismatch.to_string()));
        }

        if !self.verify_tag(lineage)? {
            return Err(corrupt("lineage tag does not verify".to_string()));
        }

        if let (Some(parent), Some(expected)) = (parent, lineage.parent_tag.as_ref()) {
            if &parent.tag != expected {
                return Err(corrupt(format!(
                    "parent {} tag no longer matches the chained tag",
                    parent.instance_id
                )));
            }
        }
        Ok(())
    }
}
