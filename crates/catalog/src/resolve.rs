//! Checkpoint-to-path resolution.
//!
//! A checkpoint reference is resolved against the local mirror of the
//! repository cache (`models--org--repo/snapshots/<rev>/…`), except for
//! local-path references and the FLM recipe (whose engine manages its own
//! storage). Resolution never touches the network: an unresolvable
//! reference yields an empty path, which reads as "not downloaded".

use std::path::{Path, PathBuf};

use lmn_domain::model::{role, CheckpointRef, ModelEntry, ModelSource, Recipe};
use walkdir::WalkDir;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Repository cache layout
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// `org/repo` → `<hub>/models--org--repo`.
pub fn repo_cache_dir(hub_cache: &Path, repo_id: &str) -> PathBuf {
    hub_cache.join(format!("models--{}", repo_id.replace('/', "--")))
}

/// The snapshot directory for a repo: `refs/main` names the revision;
/// when that pointer is missing, the first snapshot present wins.
pub fn snapshot_root(repo_dir: &Path) -> Option<PathBuf> {
    let snapshots = repo_dir.join("snapshots");
    if let Ok(rev) = std::fs::read_to_string(repo_dir.join("refs").join("main")) {
        let candidate = snapshots.join(rev.trim());
        if candidate.is_dir() {
            return Some(candidate);
        }
    }
    let mut dirs: Vec<PathBuf> = std::fs::read_dir(&snapshots)
        .ok()?
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    dirs.sort();
    dirs.into_iter().next()
}

/// Relative paths of every file under `root`, sorted.
fn walk_files(root: &Path) -> Vec<String> {
    let mut files: Vec<String> = WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| {
            e.path()
                .strip_prefix(root)
                .ok()
                .map(|p| p.to_string_lossy().replace('\\', "/"))
        })
        .collect();
    files.sort();
    files
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GGUF variant selection
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Outcome of matching a variant against a repo's GGUF files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GgufSelection {
    /// A rule matched.
    Match(String),
    /// No rule matched; first sorted file returned as legacy fallback.
    Fallback(String),
    /// Nothing to pick from (or strict mode rejected the fallback).
    None,
}

impl GgufSelection {
    pub fn into_option(self) -> Option<String> {
        match self {
            GgufSelection::Match(f) | GgufSelection::Fallback(f) => Some(f),
            GgufSelection::None => None,
        }
    }
}

/// Pick the GGUF file a variant names from `files` (relative paths,
/// mmproj files already excluded). Rules, in order:
/// `*`/empty → first sorted; exact filename when the variant ends in
/// `.gguf`/`.bin`; case-insensitive `<variant>.gguf` suffix;
/// case-insensitive `<variant>/` folder prefix. Anything else falls back
/// to the first sorted file unless `strict` is set.
pub fn select_gguf_file(files: &[String], variant: Option<&str>, strict: bool) -> GgufSelection {
    let mut sorted: Vec<&String> = files.iter().collect();
    sorted.sort();
    let first = match sorted.first() {
        Some(f) => (*f).clone(),
        None => return GgufSelection::None,
    };

    let variant = variant.unwrap_or("");
    if variant.is_empty() || variant == "*" {
        return GgufSelection::Match(first);
    }

    let lower = variant.to_ascii_lowercase();
    if lower.ends_with(".gguf") || lower.ends_with(".bin") {
        if let Some(found) = sorted
            .iter()
            .find(|f| file_name(f).eq_ignore_ascii_case(variant))
        {
            return GgufSelection::Match((*found).clone());
        }
    }

    let suffix = format!("{lower}.gguf");
    if let Some(found) = sorted
        .iter()
        .find(|f| file_name(f).to_ascii_lowercase().ends_with(&suffix))
    {
        return GgufSelection::Match((*found).clone());
    }

    let folder = format!("{lower}/");
    if let Some(found) = sorted
        .iter()
        .find(|f| f.to_ascii_lowercase().starts_with(&folder))
    {
        return GgufSelection::Match((*found).clone());
    }

    if strict {
        GgufSelection::None
    } else {
        GgufSelection::Fallback(first)
    }
}

fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn is_mmproj(path: &str) -> bool {
    file_name(path).to_ascii_lowercase().contains("mmproj")
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Per-role resolution
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Resolve every checkpoint role of `entry` and recompute `downloaded`
/// from the main path.
pub fn resolve_entry(entry: &mut ModelEntry, hub_cache: &Path, strict: bool) {
    let roles: Vec<(String, String)> = entry
        .checkpoints
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    entry.resolved_paths.clear();
    for (role_name, reference) in roles {
        let path = resolve_role(entry, &role_name, &reference, hub_cache, strict);
        entry.resolved_paths.insert(role_name, path);
    }
    entry.downloaded = match entry.recipe {
        // The FLM engine owns its checkpoint store; only refresh_flm flips
        // this flag.
        Recipe::Flm => entry.downloaded,
        _ => {
            let main = entry.main_path();
            !main.is_empty() && is_download_complete(Path::new(main))
        }
    };
}

fn resolve_role(
    entry: &ModelEntry,
    role_name: &str,
    reference: &str,
    hub_cache: &Path,
    strict: bool,
) -> String {
    if entry.recipe == Recipe::Flm {
        // Reference used verbatim: the engine's own pull command manages
        // storage by checkpoint tag.
        return reference.to_string();
    }

    match entry.source {
        Some(ModelSource::LocalPath) => return reference.to_string(),
        Some(ModelSource::LocalUpload) => {
            return hub_cache.join(reference).to_string_lossy().into_owned()
        }
        _ => {}
    }

    let parsed = CheckpointRef::parse(reference);
    let (repo_id, variant) = match &parsed {
        CheckpointRef::LocalPath(p) => return p.clone(),
        CheckpointRef::Repo { repo_id, variant } => (repo_id.as_str(), variant.as_deref()),
    };

    let repo_dir = repo_cache_dir(hub_cache, repo_id);
    let snapshot = match snapshot_root(&repo_dir) {
        Some(s) => s,
        None => return String::new(),
    };
    let files = walk_files(&snapshot);

    let abs = |rel: &str| snapshot.join(rel).to_string_lossy().into_owned();

    if role_name == role::MAIN {
        match entry.recipe {
            Recipe::LlamaCpp => {
                let ggufs: Vec<String> = files
                    .iter()
                    .filter(|f| f.to_ascii_lowercase().ends_with(".gguf") && !is_mmproj(f))
                    .cloned()
                    .collect();
                return match select_gguf_file(&ggufs, variant, strict) {
                    GgufSelection::Match(f) => abs(&f),
                    GgufSelection::Fallback(f) => {
                        tracing::warn!(
                            model = %entry.name,
                            variant = variant.unwrap_or(""),
                            fallback = %f,
                            "gguf variant matched nothing, serving first sorted file"
                        );
                        abs(&f)
                    }
                    GgufSelection::None => String::new(),
                };
            }
            Recipe::RyzenAiLlm => {
                // The usable model directory is wherever genai_config.json
                // landed.
                return files
                    .iter()
                    .find(|f| file_name(f) == "genai_config.json")
                    .map(|f| {
                        let full = snapshot.join(f.as_str());
                        full.parent()
                            .unwrap_or(&snapshot)
                            .to_string_lossy()
                            .into_owned()
                    })
                    .unwrap_or_default();
            }
            Recipe::Kokoro => {
                return files
                    .iter()
                    .find(|f| file_name(f) == "index.json")
                    .map(|f| abs(f))
                    .unwrap_or_default();
            }
            Recipe::WhisperCpp if variant.is_none() => {
                return files
                    .iter()
                    .filter(|f| f.to_ascii_lowercase().ends_with(".bin"))
                    .min()
                    .map(|f| abs(f))
                    .unwrap_or_default();
            }
            _ => {}
        }
    }

    match variant {
        // Exact filename match anywhere in the snapshot subtree; empty
        // signals "not downloaded".
        Some(v) => files
            .iter()
            .find(|f| file_name(f) == v)
            .map(|f| abs(f))
            .unwrap_or_default(),
        None => snapshot.to_string_lossy().into_owned(),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Download completeness
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub const MANIFEST_NAME: &str = ".download_manifest.json";
pub const PARTIAL_SUFFIX: &str = ".partial";

/// A resolved path is complete when it exists and carries no in-flight
/// download markers (a `.partial` sibling or a manifest).
pub fn is_download_complete(path: &Path) -> bool {
    if path.is_file() {
        let mut partial = path.as_os_str().to_owned();
        partial.push(PARTIAL_SUFFIX);
        if Path::new(&partial).exists() {
            return false;
        }
        return match path.parent() {
            Some(parent) => !parent.join(MANIFEST_NAME).exists(),
            None => true,
        };
    }
    if path.is_dir() {
        let children = match std::fs::read_dir(path) {
            Ok(rd) => rd,
            Err(_) => return false,
        };
        for child in children.flatten() {
            let name = child.file_name().to_string_lossy().into_owned();
            if name == MANIFEST_NAME || name.ends_with(PARTIAL_SUFFIX) {
                return false;
            }
        }
        return true;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use lmn_domain::model::ModelEntry;

    fn strs(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn repo_dir_name_replaces_slashes() {
        let dir = repo_cache_dir(Path::new("/hub"), "unsloth/Qwen3-4B-GGUF");
        assert_eq!(
            dir,
            PathBuf::from("/hub/models--unsloth--Qwen3-4B-GGUF")
        );
    }

    #[test]
    fn gguf_empty_variant_takes_first_sorted() {
        let files = strs(&["b.gguf", "a.gguf"]);
        assert_eq!(
            select_gguf_file(&files, None, false),
            GgufSelection::Match("a.gguf".into())
        );
        assert_eq!(
            select_gguf_file(&files, Some("*"), false),
            GgufSelection::Match("a.gguf".into())
        );
    }

    #[test]
    fn gguf_exact_filename_match() {
        let files = strs(&["model-Q4_K_M.gguf", "model-Q8_0.gguf"]);
        assert_eq!(
            select_gguf_file(&files, Some("model-Q8_0.gguf"), false),
            GgufSelection::Match("model-Q8_0.gguf".into())
        );
    }

    #[test]
    fn gguf_suffix_match_is_case_insensitive() {
        let files = strs(&["Model-q4_k_m.GGUF", "model-Q8_0.gguf"]);
        assert_eq!(
            select_gguf_file(&files, Some("Q4_K_M"), false),
            GgufSelection::Match("Model-q4_k_m.GGUF".into())
        );
    }

    #[test]
    fn gguf_folder_prefix_match() {
        let files = strs(&["Q4_K_M/model-00001.gguf", "Q8_0/model-00001.gguf"]);
        assert_eq!(
            select_gguf_file(&files, Some("q4_k_m"), false),
            GgufSelection::Match("Q4_K_M/model-00001.gguf".into())
        );
    }

    #[test]
    fn gguf_fallback_vs_strict() {
        let files = strs(&["a.gguf", "b.gguf"]);
        assert_eq!(
            select_gguf_file(&files, Some("nope"), false),
            GgufSelection::Fallback("a.gguf".into())
        );
        assert_eq!(
            select_gguf_file(&files, Some("nope"), true),
            GgufSelection::None
        );
        assert_eq!(select_gguf_file(&[], None, false), GgufSelection::None);
    }

    #[test]
    fn resolve_llamacpp_repo_entry() {
        let hub = tempfile::tempdir().unwrap();
        let repo = repo_cache_dir(hub.path(), "org/model");
        let snap = repo.join("snapshots").join("abc123");
        std::fs::create_dir_all(&snap).unwrap();
        std::fs::create_dir_all(repo.join("refs")).unwrap();
        std::fs::write(repo.join("refs").join("main"), "abc123").unwrap();
        std::fs::write(snap.join("model-Q4_K_M.gguf"), b"x").unwrap();
        std::fs::write(snap.join("mmproj-F16.gguf"), b"x").unwrap();

        let mut entry = ModelEntry::new("m", Recipe::LlamaCpp, "org/model:Q4_K_M");
        entry
            .checkpoints
            .insert(role::MMPROJ.into(), "org/model:mmproj-F16.gguf".into());
        resolve_entry(&mut entry, hub.path(), false);

        assert!(entry.main_path().ends_with("model-Q4_K_M.gguf"));
        assert!(entry.resolved_paths[role::MMPROJ].ends_with("mmproj-F16.gguf"));
        assert!(entry.downloaded);
    }

    #[test]
    fn resolve_missing_repo_is_not_downloaded() {
        let hub = tempfile::tempdir().unwrap();
        let mut entry = ModelEntry::new("m", Recipe::LlamaCpp, "org/absent");
        resolve_entry(&mut entry, hub.path(), false);
        assert!(entry.main_path().is_empty());
        assert!(!entry.downloaded);
    }

    #[test]
    fn resolve_ryzenai_returns_config_dir() {
        let hub = tempfile::tempdir().unwrap();
        let repo = repo_cache_dir(hub.path(), "amd/npu-model");
        let snap = repo.join("snapshots").join("r1");
        let nested = snap.join("int4");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(nested.join("genai_config.json"), b"{}").unwrap();

        let mut entry = ModelEntry::new("m", Recipe::RyzenAiLlm, "amd/npu-model");
        resolve_entry(&mut entry, hub.path(), false);
        assert!(entry.main_path().ends_with("int4"));
        assert!(entry.downloaded);
    }

    #[test]
    fn resolve_whisper_picks_smallest_bin() {
        let hub = tempfile::tempdir().unwrap();
        let repo = repo_cache_dir(hub.path(), "ggml/whisper");
        let snap = repo.join("snapshots").join("r1");
        std::fs::create_dir_all(&snap).unwrap();
        std::fs::write(snap.join("ggml-tiny.bin"), b"x").unwrap();
        std::fs::write(snap.join("ggml-base.bin"), b"x").unwrap();

        let mut entry = ModelEntry::new("m", Recipe::WhisperCpp, "ggml/whisper");
        resolve_entry(&mut entry, hub.path(), false);
        assert!(entry.main_path().ends_with("ggml-base.bin"));
    }

    #[test]
    fn partial_marker_blocks_completion() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("model.gguf");
        std::fs::write(&file, b"x").unwrap();
        assert!(is_download_complete(&file));

        std::fs::write(dir.path().join("model.gguf.partial"), b"").unwrap();
        assert!(!is_download_complete(&file));
    }

    #[test]
    fn manifest_marker_blocks_completion() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("model.gguf");
        std::fs::write(&file, b"x").unwrap();
        std::fs::write(dir.path().join(MANIFEST_NAME), b"{}").unwrap();
        assert!(!is_download_complete(&file));
        assert!(!is_download_complete(dir.path()));
    }

    #[test]
    fn missing_path_is_incomplete() {
        assert!(!is_download_complete(Path::new("/definitely/not/here")));
    }
}
