//! File-set planning: which repo files one download must fetch.

use lmn_catalog::resolve::{select_gguf_file, GgufSelection};
use lmn_domain::model::{ModelEntry, Recipe};
use lmn_domain::{Error, Result};

/// Config files worth having beside a quantized checkpoint when the repo
/// ships them.
const WELL_KNOWN_CONFIGS: &[&str] = &[
    "config.json",
    "tokenizer.json",
    "tokenizer_config.json",
    "tokenizer.model",
];

/// Select the files the `main` checkpoint requires from `repo_files`
/// (sorted relative paths as reported by the host).
pub fn plan_main_files(
    entry: &ModelEntry,
    variant: Option<&str>,
    repo_files: &[String],
    strict_variant: bool,
) -> Result<Vec<String>> {
    if let Some(variant) = variant.filter(|v| !v.is_empty() && *v != "*") {
        if variant.ends_with(".safetensors") {
            return Ok(vec![variant.to_string()]);
        }
        if entry.recipe == Recipe::LlamaCpp {
            return plan_gguf(entry, variant, repo_files, strict_variant);
        }
        // Other recipes with a variant fetch exactly that file.
        if repo_files.iter().any(|f| f == variant || file_name(f) == variant) {
            let found = repo_files
                .iter()
                .find(|f| *f == variant || file_name(f) == variant)
                .cloned();
            return Ok(found.into_iter().collect());
        }
        return Err(Error::NotFound(format!(
            "{}: file {variant} not present in repository",
            entry.name
        )));
    }

    if entry.recipe == Recipe::LlamaCpp {
        return plan_gguf(entry, "", repo_files, strict_variant);
    }

    // No variant: mirror the whole repository.
    Ok(repo_files.to_vec())
}

fn plan_gguf(
    entry: &ModelEntry,
    variant: &str,
    repo_files: &[String],
    strict_variant: bool,
) -> Result<Vec<String>> {
    let ggufs: Vec<String> = repo_files
        .iter()
        .filter(|f| f.to_ascii_lowercase().ends_with(".gguf") && !is_mmproj(f))
        .cloned()
        .collect();

    let variant_opt = if variant.is_empty() { None } else { Some(variant) };
    let picked = match select_gguf_file(&ggufs, variant_opt, strict_variant) {
        GgufSelection::Match(f) => f,
        GgufSelection::Fallback(f) => {
            tracing::warn!(
                model = %entry.name,
                variant = variant,
                fallback = %f,
                "gguf variant matched no repo file, downloading first sorted file"
            );
            f
        }
        GgufSelection::None => {
            return Err(Error::NotFound(format!(
                "{}: no gguf file matches variant {variant}",
                entry.name
            )))
        }
    };

    // A folder-style variant names a sharded model: take the whole folder.
    let mut files = if let Some((folder, _)) = picked.rsplit_once('/') {
        let prefix = format!("{folder}/");
        repo_files
            .iter()
            .filter(|f| f.starts_with(&prefix) && !is_mmproj(f))
            .cloned()
            .collect()
    } else {
        vec![picked]
    };

    for config in WELL_KNOWN_CONFIGS {
        if repo_files.iter().any(|f| f == config) {
            files.push((*config).to_string());
        }
    }

    Ok(files)
}

fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn is_mmproj(path: &str) -> bool {
    file_name(path).to_ascii_lowercase().contains("mmproj")
}

#[cfg(test)]
mod tests {
    use super::*;
    use lmn_domain::model::ModelEntry;

    fn strs(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn gguf_entry() -> ModelEntry {
        ModelEntry::new("m", Recipe::LlamaCpp, "org/repo:Q4_K_M")
    }

    #[test]
    fn safetensors_variant_is_single_file() {
        let entry = ModelEntry::new("m", Recipe::RyzenAiLlm, "org/repo:model.safetensors");
        let files = plan_main_files(
            &entry,
            Some("model.safetensors"),
            &strs(&["model.safetensors", "other.bin"]),
            false,
        )
        .unwrap();
        assert_eq!(files, vec!["model.safetensors"]);
    }

    #[test]
    fn gguf_variant_picks_one_file_plus_configs() {
        let repo = strs(&[
            "config.json",
            "model-Q4_K_M.gguf",
            "model-Q8_0.gguf",
            "mmproj-F16.gguf",
            "tokenizer.json",
        ]);
        let files = plan_main_files(&gguf_entry(), Some("Q4_K_M"), &repo, false).unwrap();
        assert_eq!(
            files,
            vec!["model-Q4_K_M.gguf", "config.json", "tokenizer.json"]
        );
    }

    #[test]
    fn gguf_folder_variant_takes_all_shards() {
        let repo = strs(&[
            "Q4_K_M/model-00001-of-00002.gguf",
            "Q4_K_M/model-00002-of-00002.gguf",
            "Q8_0/model-00001-of-00001.gguf",
        ]);
        let files = plan_main_files(&gguf_entry(), Some("Q4_K_M"), &repo, false).unwrap();
        assert_eq!(
            files,
            vec![
                "Q4_K_M/model-00001-of-00002.gguf",
                "Q4_K_M/model-00002-of-00002.gguf"
            ]
        );
    }

    #[test]
    fn no_variant_takes_whole_repo_for_non_gguf() {
        let entry = ModelEntry::new("m", Recipe::RyzenAiLlm, "org/repo");
        let repo = strs(&["genai_config.json", "model.onnx"]);
        let files = plan_main_files(&entry, None, &repo, false).unwrap();
        assert_eq!(files, repo);
    }

    #[test]
    fn strict_variant_mismatch_errors() {
        let repo = strs(&["model-Q8_0.gguf"]);
        assert!(plan_main_files(&gguf_entry(), Some("Q4_K_M"), &repo, true).is_err());
        // Legacy mode falls back instead.
        let files = plan_main_files(&gguf_entry(), Some("Q4_K_M"), &repo, false).unwrap();
        assert_eq!(files[0], "model-Q8_0.gguf");
    }
}
