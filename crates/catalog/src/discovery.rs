//! Auto-discovery of loose GGUF models.
//!
//! The configured scan directory is walked recursively for `.gguf` files.
//! A file sitting directly in the root becomes its own `extra.<filename>`
//! entry; a subdirectory with GGUF files becomes one `extra.<dirname>`
//! entry whose main checkpoint is the lexicographically smallest non-mmproj
//! file, with any mmproj file attached as a vision projector.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use lmn_domain::model::{role, ModelEntry, ModelSource, Recipe};
use walkdir::WalkDir;

/// Scan `dir` and build `extra.` entries. A missing directory yields an
/// empty list.
pub fn scan(dir: &Path) -> Vec<ModelEntry> {
    if !dir.is_dir() {
        return Vec::new();
    }

    // Group GGUF files by parent directory.
    let mut by_parent: BTreeMap<PathBuf, Vec<PathBuf>> = BTreeMap::new();
    for file in WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            e.path()
                .extension()
                .map(|ext| ext.eq_ignore_ascii_case("gguf"))
                .unwrap_or(false)
        })
    {
        let parent = file
            .path()
            .parent()
            .unwrap_or(dir)
            .to_path_buf();
        by_parent.entry(parent).or_default().push(file.into_path());
    }

    let mut entries = Vec::new();
    for (parent, mut files) in by_parent {
        files.sort();
        if parent == dir {
            for file in files {
                entries.push(single_file_entry(&file));
            }
        } else if let Some(entry) = directory_entry(&parent, &files) {
            entries.push(entry);
        }
    }

    tracing::info!(dir = %dir.display(), discovered = entries.len(), "model scan complete");
    entries
}

fn single_file_entry(file: &Path) -> ModelEntry {
    let name = format!("extra.{}", file_stem(file));
    let mut entry = ModelEntry::new(name, Recipe::LlamaCpp, file.to_string_lossy());
    entry.labels.insert("custom".to_string());
    entry.source = Some(ModelSource::ExtraModelsDir);
    entry.refresh_derived();
    entry
}

fn directory_entry(parent: &Path, files: &[PathBuf]) -> Option<ModelEntry> {
    let dirname = parent.file_name()?.to_string_lossy().into_owned();

    let mmproj = files.iter().find(|f| is_mmproj(f));
    let main = files.iter().find(|f| !is_mmproj(f))?;

    let mut entry = ModelEntry::new(
        format!("extra.{dirname}"),
        Recipe::LlamaCpp,
        main.to_string_lossy(),
    );
    entry.labels.insert("custom".to_string());
    if let Some(mmproj) = mmproj {
        entry
            .checkpoints
            .insert(role::MMPROJ.to_string(), mmproj.to_string_lossy().into_owned());
        entry.labels.insert("vision".to_string());
    }
    entry.source = Some(ModelSource::ExtraModelsDir);
    entry.refresh_derived();
    Some(entry)
}

fn is_mmproj(path: &Path) -> bool {
    path.file_name()
        .map(|n| n.to_string_lossy().to_ascii_lowercase().contains("mmproj"))
        .unwrap_or(false)
}

fn file_stem(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use lmn_domain::model::ModelType;

    #[test]
    fn missing_dir_scans_empty() {
        assert!(scan(Path::new("/no/such/dir")).is_empty());
    }

    #[test]
    fn root_files_become_single_entries() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("tiny.gguf"), b"x").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"x").unwrap();

        let entries = scan(dir.path());
        assert_eq!(entries.len(), 1);
        let entry = &entries[0];
        assert_eq!(entry.name, "extra.tiny.gguf");
        assert_eq!(entry.model_type, ModelType::Llm);
        assert!(entry.labels.contains("custom"));
        assert!(entry.main_checkpoint().ends_with("tiny.gguf"));
    }

    #[test]
    fn subdir_groups_with_mmproj_and_vision_label() {
        let dir = tempfile::tempdir().unwrap();
        let model_dir = dir.path().join("llava");
        std::fs::create_dir_all(&model_dir).unwrap();
        std::fs::write(model_dir.join("b-main.gguf"), b"x").unwrap();
        std::fs::write(model_dir.join("a-main.gguf"), b"x").unwrap();
        std::fs::write(model_dir.join("MMPROJ-f16.gguf"), b"x").unwrap();

        let entries = scan(dir.path());
        assert_eq!(entries.len(), 1);
        let entry = &entries[0];
        assert_eq!(entry.name, "extra.llava");
        // Smallest non-mmproj file wins.
        assert!(entry.main_checkpoint().ends_with("a-main.gguf"));
        assert!(entry.checkpoints[role::MMPROJ].ends_with("MMPROJ-f16.gguf"));
        assert!(entry.labels.contains("vision"));
    }

    #[test]
    fn mmproj_only_directory_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let model_dir = dir.path().join("projonly");
        std::fs::create_dir_all(&model_dir).unwrap();
        std::fs::write(model_dir.join("mmproj.gguf"), b"x").unwrap();

        assert!(scan(dir.path()).is_empty());
    }
}
