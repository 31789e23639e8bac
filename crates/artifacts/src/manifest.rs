//! The in-flight download manifest.
//!
//! Written to the snapshot root before the first byte moves; its presence
//! (or any `*.partial` sibling) marks the model as not fully downloaded,
//! across process restarts. Deleted only after validation passes.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use lmn_catalog::resolve::{MANIFEST_NAME, PARTIAL_SUFFIX};
use lmn_domain::{Error, Result};

/// One expected output file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestFile {
    /// Absolute destination path.
    pub path: PathBuf,
    pub url: String,
    /// Declared byte size; zero when the host did not report one.
    #[serde(default)]
    pub size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Manifest {
    pub files: Vec<ManifestFile>,
}

impl Manifest {
    pub fn path_in(snapshot_root: &Path) -> PathBuf {
        snapshot_root.join(MANIFEST_NAME)
    }

    pub fn write(&self, snapshot_root: &Path) -> Result<()> {
        std::fs::create_dir_all(snapshot_root)?;
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(Self::path_in(snapshot_root), json)?;
        Ok(())
    }

    pub fn read(snapshot_root: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(Self::path_in(snapshot_root))?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Validate every entry: output exists, no `.partial` sibling remains,
    /// and the size matches when one was declared.
    pub fn validate(&self) -> Result<()> {
        for file in &self.files {
            if !file.path.is_file() {
                return Err(Error::DownloadIncomplete(format!(
                    "{} is missing",
                    file.path.display()
                )));
            }
            let mut partial = file.path.as_os_str().to_owned();
            partial.push(PARTIAL_SUFFIX);
            if Path::new(&partial).exists() {
                return Err(Error::DownloadIncomplete(format!(
                    "{} still has a partial transfer",
                    file.path.display()
                )));
            }
            if file.size > 0 {
                let actual = std::fs::metadata(&file.path)?.len();
                if actual != file.size {
                    return Err(Error::DownloadIncomplete(format!(
                        "{}: expected {} bytes, found {actual}",
                        file.path.display(),
                        file.size
                    )));
                }
            }
        }
        Ok(())
    }

    /// Remove the manifest after a verified download.
    pub fn remove(snapshot_root: &Path) -> Result<()> {
        let path = Self::path_in(snapshot_root);
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest_for(dir: &Path, name: &str, size: u64) -> Manifest {
        Manifest {
            files: vec![ManifestFile {
                path: dir.join(name),
                url: "https://hub.example/f".into(),
                size,
            }],
        }
    }

    #[test]
    fn write_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = manifest_for(dir.path(), "a.gguf", 3);
        manifest.write(dir.path()).unwrap();
        assert!(Manifest::path_in(dir.path()).exists());

        let read = Manifest::read(dir.path()).unwrap();
        assert_eq!(read.files.len(), 1);
        assert_eq!(read.files[0].size, 3);
    }

    #[test]
    fn validate_checks_existence_partials_and_size() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = manifest_for(dir.path(), "a.gguf", 3);

        // Missing file.
        assert!(manifest.validate().is_err());

        // Wrong size.
        std::fs::write(dir.path().join("a.gguf"), b"xxxx").unwrap();
        assert!(manifest.validate().is_err());

        // Right size but a partial remains.
        std::fs::write(dir.path().join("a.gguf"), b"xyz").unwrap();
        std::fs::write(dir.path().join("a.gguf.partial"), b"").unwrap();
        assert!(manifest.validate().is_err());

        std::fs::remove_file(dir.path().join("a.gguf.partial")).unwrap();
        manifest.validate().unwrap();
    }

    #[test]
    fn undeclared_size_is_not_checked() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = manifest_for(dir.path(), "a.gguf", 0);
        std::fs::write(dir.path().join("a.gguf"), b"whatever").unwrap();
        manifest.validate().unwrap();
    }

    #[test]
    fn remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        manifest_for(dir.path(), "a.gguf", 0).write(dir.path()).unwrap();
        Manifest::remove(dir.path()).unwrap();
        Manifest::remove(dir.path()).unwrap();
        assert!(!Manifest::path_in(dir.path()).exists());
    }
}
