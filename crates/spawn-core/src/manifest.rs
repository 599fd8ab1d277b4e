use std::path::PathBuf;

use crate::error::{SpawnError, SpawnResult};

/// Files that must exist locally before a base image can be built.
#[derive(Debug, Clone)]
pub struct ProvisioningManifest {
    root: PathBuf,
    files: Vec<PathBuf>,
}

/// A manifest entry resolved against the manifest root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    /// Path relative to the manifest root; preserved on the guest.
    pub relative: PathBuf,
    pub local: PathBuf,
}

impl ProvisioningManifest {
    pub fn new(root: impl Into<PathBuf>, files: &[String]) -> Self {
        Self {
            root: root.into(),
            files: files.iter().map(PathBuf::from).collect(),
        }
    }

    /// Verify every file exists. Reports all missing files at once.
    pub fn check(&self) -> SpawnResult<Vec<ManifestEntry>> {
        let mut entries = Vec::with_capacity(self.files.len());
        let mut missing = Vec::new();

        for rel in &self.files {
            let local = self.root.join(rel);
            if local.is_file() {
                entries.push(ManifestEntry {
                    relative: rel.clone(),
                    local,
                });
            } else {
                missing.push(local);
            }
        }

        if !missing.is_empty() {
            return Err(SpawnError::MissingFile { missing });
        }
        if entries.is_empty() {
            return Err(SpawnError::Config(
                "provisioning manifest is empty".to_string(),
            ));
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn touch(dir: &Path, rel: &str) {
        let path = dir.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, "#!/bin/sh\n").unwrap();
    }

    #[test]
    fn test_complete_manifest() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "scripts/network.sh");
        touch(dir.path(), "systemd/basebuild.service");

        let manifest = ProvisioningManifest::new(
            dir.path(),
            &["scripts/network.sh".to_string(), "systemd/basebuild.service".to_string()],
        );
        let entries = manifest.check().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].relative, PathBuf::from("scripts/network.sh"));
        assert!(entries[1].local.ends_with("systemd/basebuild.service"));
    }

    #[test]
    fn test_reports_every_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "scripts/network.sh");

        let manifest = ProvisioningManifest::new(
            dir.path(),
            &[
                "scripts/network.sh".to_string(),
                "scripts/firewall.sh".to_string(),
                "scripts/mount.sh".to_string(),
            ],
        );
        match manifest.check().unwrap_err() {
            SpawnError::MissingFile { missing } => {
                assert_eq!(missing.len(), 2);
                assert!(missing[0].ends_with("scripts/firewall.sh"));
                assert!(missing[1].ends_with("scripts/mount.sh"));
            }
            other => panic!("expected MissingFile, got {:?}", other),
        }
    }

    #[test]
    fn test_directory_is_not_a_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("scripts")).unwrap();
        let manifest = ProvisioningManifest::new(dir.path(), &["scripts".to_string()]);
        assert!(matches!(
            manifest.check(),
            Err(SpawnError::MissingFile { .. })
        ));
    }

    #[test]
    fn test_empty_manifest_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = ProvisioningManifest::new(dir.path(), &[]);
        assert!(matches!(manifest.check(), Err(SpawnError::Config(_))));
    }
}
