//! Server configuration: TOML file plus environment overlay.
//!
//! The TOML side covers everything an operator tunes (ports, slot limits,
//! directories); the environment side covers the integration knobs other
//! tools set (`HF_*`, `LEMONADE_*`). Defaults are always valid, so a
//! missing config file is not an error.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::model::{ModelType, Recipe};
use crate::options::RecipeOptions;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    /// Server-wide default recipe options, lowest merge precedence.
    /// Keyed by recipe tag.
    #[serde(default)]
    pub default_options: HashMap<String, RecipeOptions>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "d_port")]
    pub port: u16,
    #[serde(default = "d_host")]
    pub host: String,
    /// Origins allowed for CORS. `["*"]` is permissive.
    #[serde(default = "d_cors_origins")]
    pub allowed_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8000,
            host: "127.0.0.1".into(),
            allowed_origins: d_cors_origins(),
        }
    }
}

/// Per-type instance slot limits. `-1` means unlimited, `0` means a load
/// of that type first evicts everything of that type.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "d_one")]
    pub llm: i64,
    #[serde(default = "d_one")]
    pub embedding: i64,
    #[serde(default = "d_one")]
    pub reranking: i64,
    #[serde(default = "d_one")]
    pub audio: i64,
    #[serde(default = "d_one")]
    pub image: i64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            llm: 1,
            embedding: 1,
            reranking: 1,
            audio: 1,
            image: 1,
        }
    }
}

impl LimitsConfig {
    pub fn limit_for(&self, t: ModelType) -> i64 {
        match t {
            ModelType::Llm => self.llm,
            ModelType::Embedding => self.embedding,
            ModelType::Reranking => self.reranking,
            ModelType::Audio => self.audio,
            ModelType::Image => self.image,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PathsConfig {
    /// Root for lemonade's own state (catalogs, engine binaries, hardware
    /// cache). Defaults to `<platform cache dir>/lemonade`.
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    /// Directory scanned for loose `.gguf` models (`extra.` entries).
    #[serde(default)]
    pub extra_models_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CatalogConfig {
    /// When true, a GGUF variant that matches no file resolves to
    /// `NotFound` instead of falling back to the first sorted file.
    #[serde(default)]
    pub strict_variant_match: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Seconds to wait for an engine health endpoint after spawn.
    #[serde(default = "d_load_timeout")]
    pub load_timeout_sec: u64,
    /// Seconds to wait for graceful engine shutdown before killing.
    #[serde(default = "d_unload_timeout")]
    pub unload_timeout_sec: u64,
    /// Seconds allowed for engine install subprocesses.
    #[serde(default = "d_install_timeout")]
    pub install_timeout_sec: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            load_timeout_sec: 600,
            unload_timeout_sec: 60,
            install_timeout_sec: 3600,
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_port() -> u16 {
    8000
}
fn d_host() -> String {
    "127.0.0.1".into()
}
fn d_cors_origins() -> Vec<String> {
    vec!["http://localhost:*".into(), "http://127.0.0.1:*".into()]
}
fn d_one() -> i64 {
    1
}
fn d_load_timeout() -> u64 {
    600
}
fn d_unload_timeout() -> u64 {
    60
}
fn d_install_timeout() -> u64 {
    3600
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub message: String,
}

impl std::fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl Config {
    /// Collect configuration problems without aborting; the caller decides
    /// whether errors are fatal.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        for (t, limit) in ModelType::ALL
            .iter()
            .map(|t| (*t, self.limits.limit_for(*t)))
        {
            if limit < -1 {
                issues.push(ConfigIssue {
                    severity: ConfigSeverity::Error,
                    message: format!("limits.{t}: {limit} is not a valid slot limit"),
                });
            }
        }

        if let Some(dir) = &self.paths.extra_models_dir {
            if !dir.is_dir() {
                issues.push(ConfigIssue {
                    severity: ConfigSeverity::Warning,
                    message: format!(
                        "paths.extra_models_dir {} does not exist, discovery disabled",
                        dir.display()
                    ),
                });
            }
        }

        for tag in self.default_options.keys() {
            if tag.parse::<Recipe>().is_err() {
                issues.push(ConfigIssue {
                    severity: ConfigSeverity::Warning,
                    message: format!("default_options.{tag}: unknown recipe, ignored"),
                });
            }
        }

        issues
    }

    /// Effective state root: configured `paths.cache_dir` or the platform
    /// cache directory.
    pub fn cache_root(&self) -> PathBuf {
        self.paths
            .cache_dir
            .clone()
            .unwrap_or_else(env::default_cache_root)
    }

    /// Sanitized server-wide default options for one recipe.
    pub fn defaults_for(&self, recipe: Recipe) -> RecipeOptions {
        self.default_options
            .get(recipe.tag())
            .cloned()
            .unwrap_or_default()
            .sanitize(recipe)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Environment overlay
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Environment variables the gateway recognizes. Read at the point of use
/// so tests can set them per-case.
pub mod env {
    use std::path::PathBuf;

    use crate::model::Recipe;

    /// Default lemonade state root under the platform cache directory.
    pub fn default_cache_root() -> PathBuf {
        dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("lemonade")
    }

    /// Repository cache root: `HF_HUB_CACHE`, then `HF_HOME/hub`, then the
    /// platform default.
    pub fn hub_cache() -> PathBuf {
        if let Ok(dir) = std::env::var("HF_HUB_CACHE") {
            if !dir.is_empty() {
                return PathBuf::from(dir);
            }
        }
        if let Ok(home) = std::env::var("HF_HOME") {
            if !home.is_empty() {
                return PathBuf::from(home).join("hub");
            }
        }
        dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("huggingface")
            .join("hub")
    }

    pub fn hf_token() -> Option<String> {
        std::env::var("HF_TOKEN").ok().filter(|t| !t.is_empty())
    }

    pub fn api_key() -> Option<String> {
        std::env::var("LEMONADE_API_KEY")
            .ok()
            .filter(|k| !k.is_empty())
    }

    pub fn offline() -> bool {
        flag("LEMONADE_OFFLINE")
    }

    pub fn filtering_disabled() -> bool {
        flag("LEMONADE_DISABLE_MODEL_FILTERING")
    }

    pub fn dgpu_gtt_enabled() -> bool {
        flag("LEMONADE_ENABLE_DGPU_GTT")
    }

    pub fn skip_processor_check() -> bool {
        flag("RYZENAI_SKIP_PROCESSOR_CHECK")
    }

    /// `LEMONADE_<RECIPE>[_<BACKEND>]_BIN` engine binary override. The
    /// backend-specific form wins over the recipe-wide one.
    pub fn bin_override(recipe: Recipe, backend: Option<&str>) -> Option<PathBuf> {
        if let Some(backend) = backend {
            let var = format!(
                "LEMONADE_{}_{}_BIN",
                recipe.env_tag(),
                backend.to_ascii_uppercase()
            );
            if let Ok(path) = std::env::var(&var) {
                if !path.is_empty() {
                    return Some(PathBuf::from(path));
                }
            }
        }
        let var = format!("LEMONADE_{}_BIN", recipe.env_tag());
        std::env::var(var)
            .ok()
            .filter(|p| !p.is_empty())
            .map(PathBuf::from)
    }

    fn flag(name: &str) -> bool {
        matches!(
            std::env::var(name).as_deref(),
            Ok("1") | Ok("true") | Ok("TRUE") | Ok("True")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.limits.llm, 1);
        assert!(config.validate().is_empty());
    }

    #[test]
    fn negative_limit_is_an_error() {
        let mut config = Config::default();
        config.limits.audio = -3;
        let issues = config.validate();
        assert!(issues
            .iter()
            .any(|i| i.severity == ConfigSeverity::Error && i.message.contains("audio")));
    }

    #[test]
    fn unlimited_limit_is_accepted() {
        let mut config = Config::default();
        config.limits.llm = -1;
        assert!(config.validate().is_empty());
    }
}
