//! Adapter construction.
//!
//! The factory owns what every adapter needs at birth: the binary cache
//! root, the engine timeouts, and the hardware picture used to choose a
//! default backend when the model's options do not name one.

use std::path::PathBuf;
use std::sync::Arc;

use lmn_domain::config::EngineConfig;
use lmn_domain::model::{ModelEntry, Recipe};
use lmn_domain::{Error, Result};
use lmn_hardware::SupportFilter;

use crate::adapter::Engine;
use crate::flm::FlmEngine;
use crate::kokoro::KokoroEngine;
use crate::llamacpp::LlamaCppEngine;
use crate::ryzenai::RyzenAiEngine;
use crate::sdcpp::SdCppEngine;
use crate::whisper::WhisperEngine;

/// Fastest-first preference when a model does not pin a backend.
const BACKEND_PREFERENCE: &[&str] = &["rocm", "vulkan", "metal", "hybrid", "npu", "cpu"];

pub struct EngineFactory {
    cache_root: PathBuf,
    config: EngineConfig,
    filter: SupportFilter,
}

impl EngineFactory {
    pub fn new(cache_root: PathBuf, config: EngineConfig, filter: SupportFilter) -> Self {
        Self {
            cache_root,
            config,
            filter,
        }
    }

    /// Build the adapter for `entry`'s recipe.
    pub fn create(&self, entry: &ModelEntry) -> Result<Box<dyn Engine>> {
        let backend = self.default_backend(entry.recipe)?;
        let root = self.cache_root.clone();
        let config = self.config;
        Ok(match entry.recipe {
            Recipe::LlamaCpp => Box::new(LlamaCppEngine::new(root, config, backend)),
            Recipe::RyzenAiLlm => Box::new(RyzenAiEngine::new(
                root,
                config,
                Arc::new(self.filter.snapshot().clone()),
                backend,
            )),
            Recipe::Flm => Box::new(FlmEngine::new(root, config)),
            Recipe::WhisperCpp => Box::new(WhisperEngine::new(root, config, backend)),
            Recipe::Kokoro => Box::new(KokoroEngine::new(root, config)),
            Recipe::SdCpp => Box::new(SdCppEngine::new(root, config, backend)),
        })
    }

    fn default_backend(&self, recipe: Recipe) -> Result<&'static str> {
        let supported = self.filter.supported_backends(recipe);
        BACKEND_PREFERENCE
            .iter()
            .find(|b| supported.contains(b))
            .copied()
            .ok_or_else(|| Error::ModelNotSupported {
                model: recipe.tag().to_string(),
                reason: format!("recipe {recipe} has no supported backend on this host"),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lmn_hardware::probe::{DeviceInfo, HardwareSnapshot};

    fn factory(with_gpu: bool) -> EngineFactory {
        let mut snap = HardwareSnapshot {
            os: "linux".into(),
            physical_memory_gb: 32.0,
            ..Default::default()
        };
        snap.cpu = DeviceInfo {
            name: "cpu".into(),
            family: "x86_64".into(),
            available: true,
            ..Default::default()
        };
        if with_gpu {
            snap.discrete_gpus.push(DeviceInfo {
                name: "Radeon RX 7900".into(),
                family: "gfx1100".into(),
                available: true,
                vram_gb: 16.0,
                ..Default::default()
            });
        }
        EngineFactory::new(
            PathBuf::from("/tmp"),
            EngineConfig::default(),
            SupportFilter::new(Arc::new(snap)),
        )
    }

    #[test]
    fn gpu_host_prefers_rocm() {
        assert_eq!(factory(true).default_backend(Recipe::LlamaCpp).unwrap(), "rocm");
        assert_eq!(factory(false).default_backend(Recipe::LlamaCpp).unwrap(), "cpu");
    }

    #[test]
    fn unsupported_recipe_fails_with_reason() {
        // No NPU on either host.
        assert!(matches!(
            factory(true).default_backend(Recipe::Flm),
            Err(Error::ModelNotSupported { .. })
        ));
    }

    #[test]
    fn create_builds_an_adapter_per_recipe() {
        let factory = factory(true);
        let entry = ModelEntry::new("m", Recipe::LlamaCpp, "org/repo");
        let engine = factory.create(&entry).unwrap();
        assert_eq!(engine.recipe(), Recipe::LlamaCpp);
        assert!(crate::adapter::supports(
            engine.as_ref(),
            crate::adapter::Operation::ChatCompletion
        ));
        assert!(!crate::adapter::supports(
            engine.as_ref(),
            crate::adapter::Operation::ImageGenerations
        ));
    }
}
