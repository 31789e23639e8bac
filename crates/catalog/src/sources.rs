//! The three persisted catalog sources.
//!
//! - `server_models.json`: read-only built-in catalog, written at install
//!   time. Missing or malformed is fatal at startup.
//! - `user_models.json`: user-registered entries keyed by the suffix after
//!   the `user.` prefix. Missing yields empty; malformed warns and yields
//!   empty.
//! - `recipe_options.json`: per-model saved options. Same tolerance as the
//!   user catalog.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use serde::{Deserialize, Serialize};

use lmn_domain::model::{role, ImageDefaults, ModelEntry, ModelSource, Recipe};
use lmn_domain::options::RecipeOptions;
use lmn_domain::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Raw record shapes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One record as stored in `server_models.json` / `user_models.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawModelRecord {
    pub checkpoint: String,
    pub recipe: Recipe,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mmproj: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub npu_cache: Option<String>,
    #[serde(default, rename = "size")]
    pub size_gb: f64,
    #[serde(default)]
    pub suggested: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<ModelSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_defaults: Option<ImageDefaults>,
}

impl RawModelRecord {
    /// Lift a raw record into a full entry. Derived fields (type, device,
    /// resolved paths, downloaded) are computed by the store afterwards.
    pub fn into_entry(self, name: &str) -> ModelEntry {
        let mut entry = ModelEntry::new(name, self.recipe, self.checkpoint);
        entry.labels = self.labels.into_iter().collect();
        if let Some(mmproj) = self.mmproj {
            entry
                .checkpoints
                .insert(role::MMPROJ.to_string(), mmproj);
        }
        if let Some(npu_cache) = self.npu_cache {
            entry
                .checkpoints
                .insert(role::NPU_CACHE.to_string(), npu_cache);
        }
        entry.size_gb = self.size_gb;
        entry.suggested = self.suggested;
        entry.source = self.source;
        entry.image_defaults = self.image_defaults;
        entry.refresh_derived();
        entry
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Loading
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Load the built-in catalog. Fatal when absent or malformed: a gateway
/// without its shipped catalog is misinstalled.
pub fn load_builtin(path: &Path) -> Result<BTreeMap<String, RawModelRecord>> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!(
            "built-in catalog {} unreadable: {e}",
            path.display()
        ))
    })?;
    serde_json::from_str(&raw).map_err(|e| {
        Error::Config(format!(
            "built-in catalog {} malformed: {e}",
            path.display()
        ))
    })
}

/// Load the user catalog: suffix → record. Missing file is empty;
/// malformed logs and returns empty.
pub fn load_user(path: &Path) -> BTreeMap<String, RawModelRecord> {
    load_tolerant(path, "user catalog")
}

/// Load saved per-model options: model name → options map.
pub fn load_options(path: &Path) -> HashMap<String, RecipeOptions> {
    load_tolerant(path, "recipe options")
}

fn load_tolerant<T: serde::de::DeserializeOwned + Default>(path: &Path, what: &str) -> T {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(_) => return T::default(),
    };
    match serde_json::from_str(&raw) {
        Ok(parsed) => parsed,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "malformed {what}, starting empty");
            T::default()
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Persisting
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub fn save_user(path: &Path, records: &BTreeMap<String, RawModelRecord>) -> Result<()> {
    write_pretty(path, records)
}

pub fn save_options(path: &Path, options: &HashMap<String, RecipeOptions>) -> Result<()> {
    write_pretty(path, options)
}

fn write_pretty<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(value)?;
    std::fs::write(path, json)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use lmn_domain::model::ModelType;

    #[test]
    fn builtin_missing_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_builtin(&dir.path().join("server_models.json")).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn builtin_malformed_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server_models.json");
        std::fs::write(&path, "{oops").unwrap();
        assert!(load_builtin(&path).is_err());
    }

    #[test]
    fn user_missing_is_empty_and_malformed_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("user_models.json");
        assert!(load_user(&path).is_empty());
        std::fs::write(&path, "42").unwrap();
        assert!(load_user(&path).is_empty());
    }

    #[test]
    fn record_lifts_into_entry_with_derived_fields() {
        let record = RawModelRecord {
            checkpoint: "org/model:Q4_K_M".into(),
            recipe: Recipe::LlamaCpp,
            labels: vec!["embeddings".into()],
            mmproj: None,
            npu_cache: None,
            size_gb: 2.5,
            suggested: true,
            source: None,
            image_defaults: None,
        };
        let entry = record.into_entry("some-model");
        assert_eq!(entry.model_type, ModelType::Embedding);
        assert_eq!(entry.device_class, Recipe::LlamaCpp.device_class());
        assert_eq!(entry.main_checkpoint(), "org/model:Q4_K_M");
        assert!(entry.suggested);
    }

    #[test]
    fn user_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("user_models.json");
        let mut records = BTreeMap::new();
        records.insert(
            "mine".to_string(),
            RawModelRecord {
                checkpoint: "/models/mine.gguf".into(),
                recipe: Recipe::LlamaCpp,
                labels: vec!["custom".into()],
                mmproj: None,
                npu_cache: None,
                size_gb: 0.0,
                suggested: false,
                source: Some(ModelSource::LocalPath),
                image_defaults: None,
            },
        );
        save_user(&path, &records).unwrap();
        let loaded = load_user(&path);
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded["mine"].checkpoint, "/models/mine.gguf");
    }
}
