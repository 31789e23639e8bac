//! Typed recipe options and their merge rules.
//!
//! Options arrive from three places (per-request overrides, the saved
//! per-model file, server defaults) and merge left-biased. Sentinel values
//! (`""`, `-1`) mean "unset" and are dropped on ingest, so a stored map
//! only ever holds real values.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::model::Recipe;

/// A single option value. Untagged so the JSON files read naturally
/// (`{"ctx_size": 8192, "custom_args": "--mlock"}`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OptionValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl OptionValue {
    /// `""` and `-1` are the legacy "unset" sentinels.
    pub fn is_sentinel(&self) -> bool {
        match self {
            OptionValue::Str(s) => s.is_empty(),
            OptionValue::Int(i) => *i == -1,
            _ => false,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            OptionValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            OptionValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            OptionValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            OptionValue::Float(f) => Some(*f),
            OptionValue::Int(i) => Some(*i as f64),
            _ => None,
        }
    }
}

/// The keys a recipe's adapter recognizes. Anything else is dropped on
/// ingest with a warning.
pub fn allowed_keys(recipe: Recipe) -> &'static [&'static str] {
    match recipe {
        Recipe::LlamaCpp => &["backend", "ctx_size", "gpu_layers", "custom_args"],
        Recipe::RyzenAiLlm => &["backend", "ctx_size"],
        Recipe::Flm => &["ctx_size"],
        Recipe::WhisperCpp => &["backend", "language"],
        Recipe::Kokoro => &["voice", "speed"],
        Recipe::SdCpp => &["backend", "threads"],
    }
}

/// An ordered map of recipe options with sentinel-aware ingestion and
/// left-biased merge.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecipeOptions(pub BTreeMap<String, OptionValue>);

impl RecipeOptions {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&OptionValue> {
        self.0.get(key)
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(OptionValue::as_int)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(OptionValue::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: OptionValue) {
        self.0.insert(key.into(), value);
    }

    /// Keep only keys the recipe recognizes, and drop sentinel values.
    pub fn sanitize(mut self, recipe: Recipe) -> Self {
        let allowed = allowed_keys(recipe);
        self.0.retain(|key, value| {
            if !allowed.contains(&key.as_str()) {
                tracing::warn!(recipe = %recipe, key = %key, "dropping unrecognized option");
                return false;
            }
            !value.is_sentinel()
        });
        self
    }

    /// Left-biased merge: values already present win over `fallback`.
    pub fn merged_over(mut self, fallback: &RecipeOptions) -> Self {
        for (key, value) in &fallback.0 {
            self.0.entry(key.clone()).or_insert_with(|| value.clone());
        }
        self
    }
}

impl FromIterator<(String, OptionValue)> for RecipeOptions {
    fn from_iter<I: IntoIterator<Item = (String, OptionValue)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}
