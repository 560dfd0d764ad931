//! Every workspace member inherits its package metadata from the root
//! manifest, and the internal path dependencies pin the same version.

use std::path::{Path, PathBuf};

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .ancestors()
        .nth(2)
        .unwrap()
        .to_path_buf()
}

fn manifest(dir: &Path) -> toml::Value {
    let text = std::fs::read_to_string(dir.join("Cargo.toml")).unwrap();
    text.parse().unwrap()
}

fn inherits(package: &toml::Value, key: &str) -> bool {
    package
        .get(key)
        .and_then(|v| v.get("workspace"))
        .and_then(|v| v.as_bool())
        == Some(true)
}

#[test]
fn members_inherit_version_edition_and_license() {
    let root = workspace_root();
    let doc = manifest(&root);
    let members = doc["workspace"]["members"].as_array().unwrap();
    assert_eq!(members.len(), 5);

    for member in members {
        let member = member.as_str().unwrap();
        let package = manifest(&root.join(member))["package"].clone();
        for key in ["version", "edition", "license"] {
            assert!(
                inherits(&package, key),
                "{member} should set {key}.workspace = true"
            );
        }
    }
}

#[test]
fn internal_dependencies_pin_the_workspace_version() {
    let doc = manifest(&workspace_root());
    let version = doc["workspace"]["package"]["version"].as_str().unwrap();
    let internal: Vec<_> = doc["workspace"]["dependencies"]
        .as_table()
        .unwrap()
        .iter()
        .filter(|(name, _)| name.starts_with("crucible-"))
        .collect();
    assert_eq!(internal.len(), 3);

    for (name, dep) in internal {
        assert_eq!(dep.get("version").and_then(|v| v.as_str()), Some(version), "{name}");
        assert!(dep.get("path").is_some(), "{name} should be a path dependency");
    }
}

#[test]
fn compiled_version_is_the_workspace_version() {
    let doc = manifest(&workspace_root());
    assert_eq!(
        doc["workspace"]["package"]["version"].as_str(),
        Some(crucible_core::VERSION)
    );
}
