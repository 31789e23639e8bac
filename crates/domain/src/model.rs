//! Model catalog entities.
//!
//! A [`ModelEntry`] is the merged, in-memory record of one known model:
//! which engine recipe serves it, which devices that recipe needs, where its
//! checkpoints come from and where they landed on disk.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Device class
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Bitmask of the physical devices an engine needs.
///
/// An adapter is NPU-exclusive iff [`DeviceClass::has_npu`] is true; the
/// scheduler allows at most one resident instance with that bit set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DeviceClass(u8);

impl DeviceClass {
    pub const NONE: Self = Self(0);
    pub const CPU: Self = Self(1);
    pub const GPU: Self = Self(1 << 1);
    pub const NPU: Self = Self(1 << 2);
    pub const METAL: Self = Self(1 << 3);

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn has_npu(self) -> bool {
        self.0 & Self::NPU.0 != 0
    }

    pub const fn has_gpu(self) -> bool {
        self.0 & Self::GPU.0 != 0
    }
}

impl std::ops::BitOr for DeviceClass {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if self.contains(Self::CPU) {
            parts.push("cpu");
        }
        if self.contains(Self::GPU) {
            parts.push("gpu");
        }
        if self.contains(Self::NPU) {
            parts.push("npu");
        }
        if self.contains(Self::METAL) {
            parts.push("metal");
        }
        if parts.is_empty() {
            parts.push("none");
        }
        write!(f, "{}", parts.join("+"))
    }
}

impl FromStr for DeviceClass {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let mut class = Self::NONE;
        for part in s.split('+') {
            class = class
                | match part.trim() {
                    "cpu" => Self::CPU,
                    "gpu" => Self::GPU,
                    "npu" => Self::NPU,
                    "metal" => Self::METAL,
                    "none" | "" => Self::NONE,
                    other => {
                        return Err(Error::Config(format!("unknown device class: {other}")))
                    }
                };
        }
        Ok(class)
    }
}

impl Serialize for DeviceClass {
    fn serialize<S: serde::Serializer>(&self, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for DeviceClass {
    fn deserialize<D: serde::Deserializer<'de>>(de: D) -> Result<Self, D::Error> {
        let s = String::deserialize(de)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Recipe
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Tag naming an engine family. Each recipe maps to exactly one adapter
/// kind and one static device class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Recipe {
    LlamaCpp,
    RyzenAiLlm,
    Flm,
    WhisperCpp,
    Kokoro,
    SdCpp,
}

impl Recipe {
    pub const ALL: [Recipe; 6] = [
        Recipe::LlamaCpp,
        Recipe::RyzenAiLlm,
        Recipe::Flm,
        Recipe::WhisperCpp,
        Recipe::Kokoro,
        Recipe::SdCpp,
    ];

    /// The wire tag used in catalog files and API responses.
    pub fn tag(self) -> &'static str {
        match self {
            Recipe::LlamaCpp => "llamacpp",
            Recipe::RyzenAiLlm => "ryzenai-llm",
            Recipe::Flm => "flm",
            Recipe::WhisperCpp => "whispercpp",
            Recipe::Kokoro => "kokoro",
            Recipe::SdCpp => "sd-cpp",
        }
    }

    /// Static recipe → device mapping. Invariant (iv): every entry's
    /// device class is exactly this value.
    pub fn device_class(self) -> DeviceClass {
        match self {
            Recipe::LlamaCpp => DeviceClass::CPU | DeviceClass::GPU | DeviceClass::METAL,
            Recipe::RyzenAiLlm => DeviceClass::NPU | DeviceClass::GPU,
            Recipe::Flm => DeviceClass::NPU,
            Recipe::WhisperCpp => DeviceClass::CPU | DeviceClass::NPU,
            Recipe::Kokoro => DeviceClass::CPU,
            Recipe::SdCpp => DeviceClass::CPU | DeviceClass::GPU,
        }
    }

    /// Uppercase tag used in `LEMONADE_<RECIPE>[_<BACKEND>]_BIN` overrides.
    pub fn env_tag(self) -> String {
        self.tag().to_ascii_uppercase().replace('-', "_")
    }
}

impl fmt::Display for Recipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for Recipe {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "llamacpp" => Ok(Recipe::LlamaCpp),
            "ryzenai-llm" => Ok(Recipe::RyzenAiLlm),
            "flm" => Ok(Recipe::Flm),
            "whispercpp" => Ok(Recipe::WhisperCpp),
            "kokoro" => Ok(Recipe::Kokoro),
            "sd-cpp" => Ok(Recipe::SdCpp),
            other => Err(Error::Config(format!("unknown recipe: {other}"))),
        }
    }
}

impl Serialize for Recipe {
    fn serialize<S: serde::Serializer>(&self, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(self.tag())
    }
}

impl<'de> Deserialize<'de> for Recipe {
    fn deserialize<D: serde::Deserializer<'de>>(de: D) -> Result<Self, D::Error> {
        let s = String::deserialize(de)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Model type
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Coarse model kind, derived from labels. Per-type scheduler slot limits
/// are keyed on this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelType {
    Llm,
    Embedding,
    Reranking,
    Audio,
    Image,
}

impl ModelType {
    pub const ALL: [ModelType; 5] = [
        ModelType::Llm,
        ModelType::Embedding,
        ModelType::Reranking,
        ModelType::Audio,
        ModelType::Image,
    ];

    /// LLM is the default when no typed label is present.
    pub fn from_labels<'a, I: IntoIterator<Item = &'a str>>(labels: I) -> Self {
        for label in labels {
            match label {
                "embeddings" => return ModelType::Embedding,
                "reranking" => return ModelType::Reranking,
                "audio" => return ModelType::Audio,
                "image" => return ModelType::Image,
                _ => {}
            }
        }
        ModelType::Llm
    }
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ModelType::Llm => "llm",
            ModelType::Embedding => "embedding",
            ModelType::Reranking => "reranking",
            ModelType::Audio => "audio",
            ModelType::Image => "image",
        };
        f.write_str(s)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Checkpoint references
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Checkpoint role names. `main` is required on every entry.
pub mod role {
    pub const MAIN: &str = "main";
    pub const MMPROJ: &str = "mmproj";
    pub const NPU_CACHE: &str = "npu_cache";
}

/// A parsed checkpoint reference: `repo_id`, `repo_id:variant`, or an
/// absolute local path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointRef {
    Repo { repo_id: String, variant: Option<String> },
    LocalPath(String),
}

impl CheckpointRef {
    pub fn parse(reference: &str) -> Self {
        if is_absolute_path(reference) {
            return CheckpointRef::LocalPath(reference.to_string());
        }
        match reference.split_once(':') {
            Some((repo, variant)) if !variant.is_empty() => CheckpointRef::Repo {
                repo_id: repo.to_string(),
                variant: Some(variant.to_string()),
            },
            Some((repo, _)) => CheckpointRef::Repo {
                repo_id: repo.to_string(),
                variant: None,
            },
            None => CheckpointRef::Repo {
                repo_id: reference.to_string(),
                variant: None,
            },
        }
    }

    pub fn repo_id(&self) -> Option<&str> {
        match self {
            CheckpointRef::Repo { repo_id, .. } => Some(repo_id),
            CheckpointRef::LocalPath(_) => None,
        }
    }

    pub fn variant(&self) -> Option<&str> {
        match self {
            CheckpointRef::Repo { variant, .. } => variant.as_deref(),
            CheckpointRef::LocalPath(_) => None,
        }
    }
}

/// Unix absolute paths plus Windows drive-letter paths. A bare `org/repo`
/// reference never matches.
fn is_absolute_path(s: &str) -> bool {
    if s.starts_with('/') || s.starts_with('\\') {
        return true;
    }
    let bytes = s.as_bytes();
    bytes.len() > 2
        && bytes[0].is_ascii_alphabetic()
        && bytes[1] == b':'
        && (bytes[2] == b'\\' || bytes[2] == b'/')
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Model entry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Where a catalog entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelSource {
    LocalUpload,
    LocalPath,
    ExtraModelsDir,
}

/// Generation defaults attached to image-recipe entries.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ImageDefaults {
    pub steps: u32,
    pub cfg_scale: f32,
    pub width: u32,
    pub height: u32,
}

impl Default for ImageDefaults {
    fn default() -> Self {
        Self {
            steps: 20,
            cfg_scale: 7.5,
            width: 512,
            height: 512,
        }
    }
}

/// One known model, uniquely identified by its canonical name.
///
/// `user.` prefix = user-registered, `extra.` prefix = auto-discovered,
/// anything else is built-in.
#[derive(Debug, Clone, Serialize)]
pub struct ModelEntry {
    pub name: String,
    pub recipe: Recipe,
    pub device_class: DeviceClass,
    pub model_type: ModelType,
    pub labels: BTreeSet<String>,
    /// role → reference string; `main` is always present.
    pub checkpoints: BTreeMap<String, String>,
    /// role → absolute on-disk path; empty until resolved.
    pub resolved_paths: BTreeMap<String, String>,
    pub size_gb: f64,
    pub suggested: bool,
    pub source: Option<ModelSource>,
    pub downloaded: bool,
    pub recipe_options: crate::options::RecipeOptions,
    pub image_defaults: Option<ImageDefaults>,
}

impl ModelEntry {
    pub fn new(name: impl Into<String>, recipe: Recipe, main_checkpoint: impl Into<String>) -> Self {
        let mut checkpoints = BTreeMap::new();
        checkpoints.insert(role::MAIN.to_string(), main_checkpoint.into());
        Self {
            name: name.into(),
            recipe,
            device_class: recipe.device_class(),
            model_type: ModelType::Llm,
            labels: BTreeSet::new(),
            checkpoints,
            resolved_paths: BTreeMap::new(),
            size_gb: 0.0,
            suggested: false,
            source: None,
            downloaded: false,
            recipe_options: Default::default(),
            image_defaults: None,
        }
    }

    pub fn is_user(&self) -> bool {
        self.name.starts_with("user.")
    }

    pub fn is_extra(&self) -> bool {
        self.name.starts_with("extra.")
    }

    pub fn main_checkpoint(&self) -> &str {
        self.checkpoints
            .get(role::MAIN)
            .map(String::as_str)
            .unwrap_or_default()
    }

    pub fn main_ref(&self) -> CheckpointRef {
        CheckpointRef::parse(self.main_checkpoint())
    }

    /// Main resolved path, empty string when not yet resolved.
    pub fn main_path(&self) -> &str {
        self.resolved_paths
            .get(role::MAIN)
            .map(String::as_str)
            .unwrap_or_default()
    }

    /// Recompute the derived fields that depend on labels and recipe.
    pub fn refresh_derived(&mut self) {
        self.model_type = ModelType::from_labels(self.labels.iter().map(String::as_str));
        self.device_class = self.recipe.device_class();
        if self.recipe == Recipe::SdCpp && self.image_defaults.is_none() {
            self.image_defaults = Some(ImageDefaults::default());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_class_bits() {
        let c = DeviceClass::CPU | DeviceClass::NPU;
        assert!(c.has_npu());
        assert!(c.contains(DeviceClass::CPU));
        assert!(!c.contains(DeviceClass::GPU));
        assert_eq!(c.to_string(), "cpu+npu");
        assert_eq!("cpu+npu".parse::<DeviceClass>().unwrap(), c);
    }

    #[test]
    fn recipe_round_trip() {
        for recipe in Recipe::ALL {
            assert_eq!(recipe.tag().parse::<Recipe>().unwrap(), recipe);
        }
        assert!("mystery".parse::<Recipe>().is_err());
    }

    #[test]
    fn npu_recipes_are_exclusive() {
        assert!(Recipe::Flm.device_class().has_npu());
        assert!(Recipe::RyzenAiLlm.device_class().has_npu());
        assert!(!Recipe::Kokoro.device_class().has_npu());
    }

    #[test]
    fn env_tag_uppercases_and_underscores() {
        assert_eq!(Recipe::RyzenAiLlm.env_tag(), "RYZENAI_LLM");
        assert_eq!(Recipe::SdCpp.env_tag(), "SD_CPP");
    }

    #[test]
    fn type_from_labels() {
        assert_eq!(ModelType::from_labels(["reasoning"]), ModelType::Llm);
        assert_eq!(ModelType::from_labels(["embeddings"]), ModelType::Embedding);
        assert_eq!(
            ModelType::from_labels(["custom", "reranking"]),
            ModelType::Reranking
        );
        assert_eq!(ModelType::from_labels([]), ModelType::Llm);
    }

    #[test]
    fn checkpoint_ref_forms() {
        match CheckpointRef::parse("org/repo:Q4_K_M") {
            CheckpointRef::Repo { repo_id, variant } => {
                assert_eq!(repo_id, "org/repo");
                assert_eq!(variant.as_deref(), Some("Q4_K_M"));
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(
            CheckpointRef::parse("/models/foo.gguf"),
            CheckpointRef::LocalPath("/models/foo.gguf".into())
        );
        assert_eq!(
            CheckpointRef::parse("C:\\models\\foo.gguf"),
            CheckpointRef::LocalPath("C:\\models\\foo.gguf".into())
        );
        assert_eq!(CheckpointRef::parse("org/repo").variant(), None);
    }

    #[test]
    fn entry_prefixes() {
        let e = ModelEntry::new("user.mine", Recipe::LlamaCpp, "org/repo");
        assert!(e.is_user());
        assert!(!e.is_extra());
        assert_eq!(e.main_checkpoint(), "org/repo");
    }
}
