//! The merged in-memory catalog.
//!
//! One mutex guards the cache; every reader clones the entry it needs so
//! no lock is held across slow work. Mutations (register, delete, download
//! completion) update both the disk source and the cache incrementally.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use lmn_domain::model::{ModelEntry, ModelSource, Recipe};
use lmn_domain::options::RecipeOptions;
use lmn_domain::{Error, Result};
use lmn_hardware::SupportFilter;

use crate::discovery;
use crate::resolve;
use crate::sources::{self, RawModelRecord};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Construction
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Where the catalog's files live.
#[derive(Debug, Clone)]
pub struct CatalogPaths {
    pub builtin: PathBuf,
    pub user: PathBuf,
    pub options: PathBuf,
    pub hub_cache: PathBuf,
    pub extra_models_dir: Option<PathBuf>,
}

impl CatalogPaths {
    /// Conventional layout under a state root: catalogs beside each other,
    /// hub cache wherever the environment points.
    pub fn under(cache_root: &Path, extra_models_dir: Option<PathBuf>) -> Self {
        Self {
            builtin: cache_root.join("server_models.json"),
            user: cache_root.join("user_models.json"),
            options: cache_root.join("recipe_options.json"),
            hub_cache: lmn_domain::config::env::hub_cache(),
            extra_models_dir,
        }
    }
}

/// Fields accepted when registering a user model.
#[derive(Debug, Clone)]
pub struct UserModelSpec {
    /// Suffix after the `user.` prefix.
    pub suffix: String,
    pub checkpoint: String,
    pub recipe: Recipe,
    pub labels: Vec<String>,
    pub mmproj: Option<String>,
    pub source: Option<ModelSource>,
}

struct CacheState {
    entries: HashMap<String, ModelEntry>,
    /// Reason per entry the hardware filter rejected at build time.
    filter_reasons: HashMap<String, String>,
}

pub struct Catalog {
    paths: CatalogPaths,
    filter: SupportFilter,
    strict_variant: bool,
    state: Mutex<CacheState>,
}

impl Catalog {
    /// Load all sources and build the cache. Only a broken built-in
    /// catalog fails; everything else degrades with warnings.
    pub fn open(paths: CatalogPaths, filter: SupportFilter, strict_variant: bool) -> Result<Self> {
        let builtin = sources::load_builtin(&paths.builtin)?;
        let user = sources::load_user(&paths.user);
        let options = sources::load_options(&paths.options);

        let mut entries: HashMap<String, ModelEntry> = HashMap::new();
        for (name, record) in builtin {
            entries.insert(name.clone(), record.into_entry(&name));
        }
        for (suffix, record) in user {
            let name = format!("user.{suffix}");
            entries.insert(name.clone(), record.into_entry(&name));
        }
        if let Some(dir) = &paths.extra_models_dir {
            for extra in discovery::scan(dir) {
                // Invariant (i): names are unique; a discovered entry never
                // displaces an existing one.
                if entries.contains_key(&extra.name) {
                    tracing::warn!(name = %extra.name, "discovered model collides with catalog entry, dropping");
                    continue;
                }
                entries.insert(extra.name.clone(), extra);
            }
        }

        let mut filter_reasons = HashMap::new();
        let mut kept = HashMap::new();
        for (name, mut entry) in entries {
            entry.recipe_options = options
                .get(&name)
                .cloned()
                .unwrap_or_default()
                .sanitize(entry.recipe);
            resolve::resolve_entry(&mut entry, &paths.hub_cache, strict_variant);
            match filter.rejection_reason(&entry) {
                Some(reason) => {
                    tracing::debug!(name = %name, reason = %reason, "model filtered out");
                    filter_reasons.insert(name, reason);
                }
                None => {
                    kept.insert(name, entry);
                }
            }
        }

        tracing::info!(
            models = kept.len(),
            filtered = filter_reasons.len(),
            "catalog loaded"
        );

        Ok(Self {
            paths,
            filter,
            strict_variant,
            state: Mutex::new(CacheState {
                entries: kept,
                filter_reasons,
            }),
        })
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Lookups
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// All known (unfiltered-out) entries; `show_all=false` keeps only the
    /// downloaded ones.
    pub fn list(&self, show_all: bool) -> BTreeMap<String, ModelEntry> {
        let state = self.state.lock();
        state
            .entries
            .iter()
            .filter(|(_, e)| show_all || e.downloaded)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn get(&self, name: &str) -> Result<ModelEntry> {
        self.state
            .lock()
            .entries
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }

    /// Lookup that distinguishes "unknown" from "filtered by hardware".
    pub fn lookup(&self, name: &str) -> Result<ModelEntry> {
        let state = self.state.lock();
        if let Some(entry) = state.entries.get(name) {
            return Ok(entry.clone());
        }
        if let Some(reason) = state.filter_reasons.get(name) {
            return Err(Error::ModelNotSupported {
                model: name.to_string(),
                reason: reason.clone(),
            });
        }
        Err(Error::NotFound(name.to_string()))
    }

    /// Read the raw built-in/user sources directly, ignoring the hardware
    /// filter.
    pub fn get_unfiltered(&self, name: &str) -> Result<ModelEntry> {
        let record = self.raw_record(name)?;
        let mut entry = record.into_entry(name);
        entry.recipe_options = sources::load_options(&self.paths.options)
            .remove(name)
            .unwrap_or_default()
            .sanitize(entry.recipe);
        resolve::resolve_entry(&mut entry, &self.paths.hub_cache, self.strict_variant);
        Ok(entry)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.state.lock().entries.contains_key(name)
    }

    pub fn exists_unfiltered(&self, name: &str) -> bool {
        self.raw_record(name).is_ok()
    }

    /// Empty when the entry was not filtered.
    pub fn filter_reason(&self, name: &str) -> String {
        self.state
            .lock()
            .filter_reasons
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Mutations
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Persist a new `user.<suffix>` entry and add it to the cache.
    /// Returns the full name.
    pub fn register_user(&self, spec: UserModelSpec) -> Result<String> {
        if spec.suffix.is_empty() {
            return Err(Error::InvalidRequest("model name must not be empty".into()));
        }
        if spec.checkpoint.is_empty() {
            return Err(Error::InvalidRequest("checkpoint must not be empty".into()));
        }
        let name = format!("user.{}", spec.suffix);

        let mut records = sources::load_user(&self.paths.user);
        records.insert(
            spec.suffix.clone(),
            RawModelRecord {
                checkpoint: spec.checkpoint,
                recipe: spec.recipe,
                labels: spec.labels,
                mmproj: spec.mmproj,
                npu_cache: None,
                size_gb: 0.0,
                suggested: false,
                source: spec.source,
                image_defaults: None,
            },
        );
        sources::save_user(&self.paths.user, &records)?;

        self.add_to_cache(&name)?;
        tracing::info!(name = %name, "user model registered");
        Ok(name)
    }

    /// Persist per-model options and refresh the cached entry.
    pub fn save_options(&self, name: &str, options: RecipeOptions) -> Result<()> {
        let recipe = self.get(name)?.recipe;
        let clean = options.sanitize(recipe);

        let mut all = sources::load_options(&self.paths.options);
        all.insert(name.to_string(), clean.clone());
        sources::save_options(&self.paths.options, &all)?;

        if let Some(entry) = self.state.lock().entries.get_mut(name) {
            entry.recipe_options = clean;
        }
        Ok(())
    }

    /// Flip the in-memory downloaded flag; re-resolve paths on the way up
    /// so `resolved_paths` reflects what just landed on disk.
    pub fn mark_downloaded(&self, name: &str, downloaded: bool) {
        let hub = self.paths.hub_cache.clone();
        let strict = self.strict_variant;
        let mut state = self.state.lock();
        if let Some(entry) = state.entries.get_mut(name) {
            if downloaded {
                resolve::resolve_entry(entry, &hub, strict);
                if entry.recipe == Recipe::Flm {
                    entry.downloaded = true;
                }
            } else {
                entry.downloaded = false;
            }
        }
    }

    /// Rebuild one entry from its raw sources and insert it (used after a
    /// register or an external download).
    pub fn add_to_cache(&self, name: &str) -> Result<()> {
        // get_unfiltered already resolves paths and downloaded state.
        let entry = self.get_unfiltered(name)?;
        let mut state = self.state.lock();
        match self.filter.rejection_reason(&entry) {
            Some(reason) => {
                state.entries.remove(name);
                state.filter_reasons.insert(name.to_string(), reason);
            }
            None => {
                state.filter_reasons.remove(name);
                state.entries.insert(name.to_string(), entry);
            }
        }
        Ok(())
    }

    pub fn remove_from_cache(&self, name: &str) {
        let mut state = self.state.lock();
        state.entries.remove(name);
        state.filter_reasons.remove(name);
    }

    /// Remove a `user.` entry from disk and cache.
    pub fn delete_user(&self, name: &str) -> Result<()> {
        let suffix = name
            .strip_prefix("user.")
            .ok_or_else(|| Error::InvalidRequest(format!("{name} is not a user model")))?;
        let mut records = sources::load_user(&self.paths.user);
        if records.remove(suffix).is_none() {
            return Err(Error::NotFound(name.to_string()));
        }
        sources::save_user(&self.paths.user, &records)?;
        self.remove_from_cache(name);
        tracing::info!(name = %name, "user model deleted");
        Ok(())
    }

    /// The FLM engine owns its checkpoint store: reset the downloaded flag
    /// of every FLM entry from the installer's view of what is pulled.
    pub fn refresh_flm(&self, installed: &HashSet<String>) {
        let mut state = self.state.lock();
        for entry in state.entries.values_mut() {
            if entry.recipe != Recipe::Flm {
                continue;
            }
            let now = installed.contains(entry.main_checkpoint());
            if now != entry.downloaded {
                tracing::info!(
                    name = %entry.name,
                    downloaded = now,
                    "flm checkpoint state changed"
                );
                entry.downloaded = now;
            }
        }
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Internals
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    fn raw_record(&self, name: &str) -> Result<RawModelRecord> {
        if let Some(suffix) = name.strip_prefix("user.") {
            return sources::load_user(&self.paths.user)
                .remove(suffix)
                .ok_or_else(|| Error::NotFound(name.to_string()));
        }
        sources::load_builtin(&self.paths.builtin)?
            .remove(name)
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }

    pub fn hub_cache(&self) -> &Path {
        &self.paths.hub_cache
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lmn_domain::model::ModelType;
    use lmn_domain::options::OptionValue;
    use lmn_hardware::probe::{DeviceInfo, HardwareSnapshot};
    use std::sync::Arc;

    fn cpu_only_filter() -> SupportFilter {
        let mut snap = HardwareSnapshot {
            os: "linux".into(),
            physical_memory_gb: 64.0,
            ..Default::default()
        };
        snap.cpu = DeviceInfo {
            name: "cpu".into(),
            family: "x86_64".into(),
            available: true,
            ..Default::default()
        };
        SupportFilter::new(Arc::new(snap))
    }

    fn write_builtin(dir: &Path, body: &str) {
        std::fs::write(dir.join("server_models.json"), body).unwrap();
    }

    fn open_catalog(dir: &Path) -> Catalog {
        let paths = CatalogPaths {
            builtin: dir.join("server_models.json"),
            user: dir.join("user_models.json"),
            options: dir.join("recipe_options.json"),
            hub_cache: dir.join("hub"),
            extra_models_dir: None,
        };
        Catalog::open(paths, cpu_only_filter(), false).unwrap()
    }

    const BUILTIN: &str = r#"{
        "Qwen3-4B-GGUF": {
            "checkpoint": "unsloth/Qwen3-4B-GGUF:Q4_K_M",
            "recipe": "llamacpp",
            "labels": ["reasoning"],
            "size": 2.5,
            "suggested": true
        },
        "Npu-Chat": {
            "checkpoint": "amd/npu-chat",
            "recipe": "flm",
            "labels": []
        }
    }"#;

    #[test]
    fn open_filters_unsupported_and_keeps_reason() {
        let dir = tempfile::tempdir().unwrap();
        write_builtin(dir.path(), BUILTIN);
        let catalog = open_catalog(dir.path());

        // No NPU on this host: the FLM model is filtered with a reason.
        assert!(catalog.exists("Qwen3-4B-GGUF"));
        assert!(!catalog.exists("Npu-Chat"));
        assert!(!catalog.filter_reason("Npu-Chat").is_empty());
        assert!(catalog.filter_reason("Qwen3-4B-GGUF").is_empty());

        match catalog.lookup("Npu-Chat") {
            Err(Error::ModelNotSupported { reason, .. }) => {
                assert!(reason.contains("flm"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn list_respects_show_all() {
        let dir = tempfile::tempdir().unwrap();
        write_builtin(dir.path(), BUILTIN);
        let catalog = open_catalog(dir.path());

        assert_eq!(catalog.list(true).len(), 1);
        // Nothing is downloaded yet.
        assert!(catalog.list(false).is_empty());
    }

    #[test]
    fn register_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        write_builtin(dir.path(), "{}");
        let catalog = open_catalog(dir.path());

        let name = catalog
            .register_user(UserModelSpec {
                suffix: "my-model".into(),
                checkpoint: "/models/my.gguf".into(),
                recipe: Recipe::LlamaCpp,
                labels: vec!["custom".into()],
                mmproj: None,
                source: Some(ModelSource::LocalPath),
            })
            .unwrap();
        assert_eq!(name, "user.my-model");

        let entry = catalog.get(&name).unwrap();
        assert_eq!(entry.recipe, Recipe::LlamaCpp);
        assert_eq!(entry.model_type, ModelType::Llm);
        assert_eq!(entry.main_checkpoint(), "/models/my.gguf");
        assert!(entry.labels.contains("custom"));
        assert!(catalog.exists_unfiltered(&name));

        // Survives a fresh open.
        drop(catalog);
        let reopened = open_catalog(dir.path());
        assert!(reopened.exists("user.my-model"));
    }

    #[test]
    fn register_rejects_empty_fields() {
        let dir = tempfile::tempdir().unwrap();
        write_builtin(dir.path(), "{}");
        let catalog = open_catalog(dir.path());
        assert!(catalog
            .register_user(UserModelSpec {
                suffix: String::new(),
                checkpoint: "x".into(),
                recipe: Recipe::LlamaCpp,
                labels: vec![],
                mmproj: None,
                source: None,
            })
            .is_err());
    }

    #[test]
    fn delete_user_removes_disk_and_cache() {
        let dir = tempfile::tempdir().unwrap();
        write_builtin(dir.path(), "{}");
        let catalog = open_catalog(dir.path());
        let name = catalog
            .register_user(UserModelSpec {
                suffix: "gone".into(),
                checkpoint: "/m/x.gguf".into(),
                recipe: Recipe::LlamaCpp,
                labels: vec![],
                mmproj: None,
                source: Some(ModelSource::LocalPath),
            })
            .unwrap();

        catalog.delete_user(&name).unwrap();
        assert!(!catalog.exists(&name));
        assert!(matches!(
            catalog.delete_user(&name),
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            catalog.delete_user("Qwen3-4B-GGUF"),
            Err(Error::InvalidRequest(_))
        ));
    }

    #[test]
    fn mark_downloaded_resolves_paths() {
        let dir = tempfile::tempdir().unwrap();
        write_builtin(dir.path(), BUILTIN);
        let catalog = open_catalog(dir.path());

        // Materialize the snapshot on disk, then flip the flag.
        let repo = resolve::repo_cache_dir(
            catalog.hub_cache(),
            "unsloth/Qwen3-4B-GGUF",
        );
        let snap = repo.join("snapshots").join("rev1");
        std::fs::create_dir_all(&snap).unwrap();
        std::fs::write(snap.join("qwen3-Q4_K_M.gguf"), b"x").unwrap();

        catalog.mark_downloaded("Qwen3-4B-GGUF", true);
        let entry = catalog.get("Qwen3-4B-GGUF").unwrap();
        assert!(entry.downloaded);
        assert!(entry.main_path().ends_with("qwen3-Q4_K_M.gguf"));

        catalog.mark_downloaded("Qwen3-4B-GGUF", false);
        assert!(!catalog.get("Qwen3-4B-GGUF").unwrap().downloaded);
    }

    #[test]
    fn save_options_persists_and_updates_cache() {
        let dir = tempfile::tempdir().unwrap();
        write_builtin(dir.path(), BUILTIN);
        let catalog = open_catalog(dir.path());

        let mut options = RecipeOptions::default();
        options.insert("ctx_size", OptionValue::Int(16384));
        options.insert("nonsense", OptionValue::Int(1));
        catalog.save_options("Qwen3-4B-GGUF", options).unwrap();

        let entry = catalog.get("Qwen3-4B-GGUF").unwrap();
        assert_eq!(entry.recipe_options.get_int("ctx_size"), Some(16384));
        assert!(entry.recipe_options.get("nonsense").is_none());

        let on_disk = sources::load_options(&dir.path().join("recipe_options.json"));
        assert_eq!(
            on_disk["Qwen3-4B-GGUF"].get_int("ctx_size"),
            Some(16384)
        );
    }

    #[test]
    fn discovery_collision_drops_extra() {
        let dir = tempfile::tempdir().unwrap();
        let extra = dir.path().join("extra");
        std::fs::create_dir_all(extra.join("Qwen3-4B-GGUF")).unwrap();
        std::fs::write(extra.join("Qwen3-4B-GGUF").join("m.gguf"), b"x").unwrap();
        write_builtin(
            dir.path(),
            r#"{"extra.Qwen3-4B-GGUF": {"checkpoint": "org/x", "recipe": "llamacpp"}}"#,
        );

        let paths = CatalogPaths {
            builtin: dir.path().join("server_models.json"),
            user: dir.path().join("user_models.json"),
            options: dir.path().join("recipe_options.json"),
            hub_cache: dir.path().join("hub"),
            extra_models_dir: Some(extra),
        };
        let catalog = Catalog::open(paths, cpu_only_filter(), false).unwrap();
        let entry = catalog.get("extra.Qwen3-4B-GGUF").unwrap();
        // The built-in record won; the discovered one was dropped.
        assert_eq!(entry.main_checkpoint(), "org/x");
    }

    #[test]
    fn refresh_flm_logs_and_flips() {
        let dir = tempfile::tempdir().unwrap();
        write_builtin(
            dir.path(),
            r#"{"Gguf": {"checkpoint": "org/x", "recipe": "llamacpp"}}"#,
        );
        let catalog = open_catalog(dir.path());

        // No FLM entries on a CPU-only host (filtered), so this is a no-op
        // that must not panic.
        catalog.refresh_flm(&HashSet::from(["amd/npu-chat".to_string()]));
        assert!(catalog.exists("Gguf"));
    }
}
