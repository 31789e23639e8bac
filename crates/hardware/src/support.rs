//! Declarative (recipe, backend) support rules.
//!
//! A catalog entry passes the filter iff its recipe has at least one
//! backend whose OS list and device requirement both match the probed
//! snapshot, and its declared size fits the memory rule. Rejections carry
//! a human-readable reason that the catalog exposes per entry.

use std::sync::Arc;

use lmn_domain::config::env;
use lmn_domain::model::{ModelEntry, Recipe};

use crate::probe::HardwareSnapshot;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Rule table
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy)]
pub enum Requirement {
    /// Any CPU. Always satisfiable once the probe ran.
    Cpu,
    /// Any available GPU, vendor-agnostic.
    GpuAny,
    /// An AMD GPU whose family starts with one of these prefixes.
    GpuFamilyPrefix(&'static [&'static str]),
    /// An NPU with one of these families.
    NpuFamily(&'static [&'static str]),
    /// Apple GPU via Metal.
    Metal,
}

#[derive(Debug, Clone, Copy)]
pub struct SupportRule {
    pub recipe: Recipe,
    pub backend: &'static str,
    pub allowed_os: &'static [&'static str],
    pub requires: Requirement,
}

const ANY_OS: &[&str] = &["linux", "windows", "macos"];
const DESKTOP_OS: &[&str] = &["linux", "windows"];
const XDNA: &[&str] = &["XDNA2"];

/// RDNA3 and newer AMD families with working ROCm inference.
const ROCM_FAMILIES: &[&str] = &["gfx110", "gfx115", "gfx120"];

pub const SUPPORT_TABLE: &[SupportRule] = &[
    SupportRule { recipe: Recipe::LlamaCpp, backend: "cpu", allowed_os: ANY_OS, requires: Requirement::Cpu },
    SupportRule { recipe: Recipe::LlamaCpp, backend: "vulkan", allowed_os: DESKTOP_OS, requires: Requirement::GpuAny },
    SupportRule { recipe: Recipe::LlamaCpp, backend: "rocm", allowed_os: DESKTOP_OS, requires: Requirement::GpuFamilyPrefix(ROCM_FAMILIES) },
    SupportRule { recipe: Recipe::LlamaCpp, backend: "metal", allowed_os: &["macos"], requires: Requirement::Metal },
    SupportRule { recipe: Recipe::RyzenAiLlm, backend: "npu", allowed_os: DESKTOP_OS, requires: Requirement::NpuFamily(XDNA) },
    SupportRule { recipe: Recipe::RyzenAiLlm, backend: "hybrid", allowed_os: DESKTOP_OS, requires: Requirement::NpuFamily(XDNA) },
    SupportRule { recipe: Recipe::Flm, backend: "npu", allowed_os: DESKTOP_OS, requires: Requirement::NpuFamily(XDNA) },
    SupportRule { recipe: Recipe::WhisperCpp, backend: "cpu", allowed_os: ANY_OS, requires: Requirement::Cpu },
    SupportRule { recipe: Recipe::WhisperCpp, backend: "npu", allowed_os: DESKTOP_OS, requires: Requirement::NpuFamily(XDNA) },
    SupportRule { recipe: Recipe::Kokoro, backend: "cpu", allowed_os: ANY_OS, requires: Requirement::Cpu },
    SupportRule { recipe: Recipe::SdCpp, backend: "cpu", allowed_os: ANY_OS, requires: Requirement::Cpu },
    SupportRule { recipe: Recipe::SdCpp, backend: "vulkan", allowed_os: DESKTOP_OS, requires: Requirement::GpuAny },
];

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Filter
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Hardware-backed support decisions. Cheap to clone; the snapshot is
/// shared.
#[derive(Clone)]
pub struct SupportFilter {
    snapshot: Arc<HardwareSnapshot>,
}

impl SupportFilter {
    pub fn new(snapshot: Arc<HardwareSnapshot>) -> Self {
        Self { snapshot }
    }

    pub fn snapshot(&self) -> &HardwareSnapshot {
        &self.snapshot
    }

    /// Backends of `recipe` this host can run, in table order.
    pub fn supported_backends(&self, recipe: Recipe) -> Vec<&'static str> {
        SUPPORT_TABLE
            .iter()
            .filter(|rule| rule.recipe == recipe)
            .filter(|rule| rule.allowed_os.contains(&self.snapshot.os.as_str()))
            .filter(|rule| self.requirement_met(rule.requires))
            .map(|rule| rule.backend)
            .collect()
    }

    /// `None` when the entry can run here, otherwise the reason it cannot.
    /// `LEMONADE_DISABLE_MODEL_FILTERING=1` bypasses every rule.
    pub fn rejection_reason(&self, entry: &ModelEntry) -> Option<String> {
        if env::filtering_disabled() {
            return None;
        }

        if self.snapshot.os == "macos" && entry.recipe != Recipe::LlamaCpp {
            return Some(format!(
                "recipe {} is not supported on macOS (only llamacpp is)",
                entry.recipe
            ));
        }

        if self.supported_backends(entry.recipe).is_empty() {
            return Some(format!(
                "recipe {} has no supported backend on this host ({})",
                entry.recipe,
                self.missing_requirement_hint(entry.recipe)
            ));
        }

        let budget_gb = self
            .snapshot
            .largest_gpu_pool_gb()
            .max(0.8 * self.snapshot.physical_memory_gb);
        if entry.size_gb > 0.0 && entry.size_gb > budget_gb {
            return Some(format!(
                "model needs {:.1} GB but this host can hold at most {:.1} GB",
                entry.size_gb, budget_gb
            ));
        }

        None
    }

    /// Recipe → supported backend list, for `/system-info`.
    pub fn recipes_table(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        for recipe in Recipe::ALL {
            map.insert(
                recipe.tag().to_string(),
                serde_json::json!({
                    "device_class": recipe.device_class().to_string(),
                    "backends": self.supported_backends(recipe),
                }),
            );
        }
        serde_json::Value::Object(map)
    }

    fn requirement_met(&self, requires: Requirement) -> bool {
        let snap = &self.snapshot;
        match requires {
            Requirement::Cpu => snap.cpu.available,
            Requirement::GpuAny => {
                snap.integrated_gpu.available
                    || snap.discrete_gpus.iter().any(|g| g.available)
                    || snap.nvidia_gpus.iter().any(|g| g.available)
            }
            Requirement::GpuFamilyPrefix(prefixes) => snap
                .families()
                .iter()
                .any(|f| prefixes.iter().any(|p| f.starts_with(p))),
            Requirement::NpuFamily(families) => {
                snap.npu.available && families.contains(&snap.npu.family.as_str())
            }
            Requirement::Metal => snap.os == "macos",
        }
    }

    fn missing_requirement_hint(&self, recipe: Recipe) -> String {
        let needs: Vec<&str> = SUPPORT_TABLE
            .iter()
            .filter(|rule| rule.recipe == recipe)
            .map(|rule| match rule.requires {
                Requirement::Cpu => "cpu",
                Requirement::GpuAny => "a gpu",
                Requirement::GpuFamilyPrefix(_) => "a supported amd gpu",
                Requirement::NpuFamily(_) => "an XDNA2 npu",
                Requirement::Metal => "apple metal",
            })
            .collect();
        format!("requires one of: {}", needs.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::DeviceInfo;
    use lmn_domain::model::ModelEntry;

    fn linux_snapshot(npu: bool, gpu_vram_gb: f64, ram_gb: f64) -> Arc<HardwareSnapshot> {
        let mut snap = HardwareSnapshot {
            os: "linux".into(),
            physical_memory_gb: ram_gb,
            ..Default::default()
        };
        snap.cpu = DeviceInfo {
            name: "test cpu".into(),
            family: "x86_64".into(),
            available: true,
            ..Default::default()
        };
        if gpu_vram_gb > 0.0 {
            snap.discrete_gpus.push(DeviceInfo {
                name: "Radeon RX 7900".into(),
                family: "gfx1100".into(),
                available: true,
                vram_gb: gpu_vram_gb,
                ..Default::default()
            });
        }
        if npu {
            snap.npu = DeviceInfo {
                name: "AMD NPU".into(),
                family: "XDNA2".into(),
                available: true,
                ..Default::default()
            };
        }
        Arc::new(snap)
    }

    #[test]
    fn npu_recipes_need_the_npu() {
        let filter = SupportFilter::new(linux_snapshot(false, 16.0, 32.0));
        assert!(filter.supported_backends(Recipe::Flm).is_empty());

        let entry = ModelEntry::new("m", Recipe::Flm, "org/model");
        let reason = filter.rejection_reason(&entry).unwrap();
        assert!(reason.contains("flm"));

        let filter = SupportFilter::new(linux_snapshot(true, 16.0, 32.0));
        assert_eq!(filter.supported_backends(Recipe::Flm), vec!["npu"]);
        assert!(filter.rejection_reason(&entry).is_none());
    }

    #[test]
    fn rocm_backend_needs_family_match() {
        let filter = SupportFilter::new(linux_snapshot(false, 16.0, 32.0));
        let backends = filter.supported_backends(Recipe::LlamaCpp);
        assert!(backends.contains(&"rocm"));
        assert!(backends.contains(&"vulkan"));
        assert!(backends.contains(&"cpu"));

        let filter = SupportFilter::new(linux_snapshot(false, 0.0, 32.0));
        let backends = filter.supported_backends(Recipe::LlamaCpp);
        assert_eq!(backends, vec!["cpu"]);
    }

    #[test]
    fn oversized_model_is_rejected_with_budget() {
        let filter = SupportFilter::new(linux_snapshot(false, 8.0, 16.0));
        let mut entry = ModelEntry::new("big", Recipe::LlamaCpp, "org/model");
        entry.size_gb = 64.0;
        let reason = filter.rejection_reason(&entry).unwrap();
        assert!(reason.contains("64.0 GB"), "reason: {reason}");

        // Budget is max(gpu pool, 0.8 * ram) = max(8, 12.8).
        assert!(reason.contains("12.8 GB"), "reason: {reason}");
    }

    #[test]
    fn macos_allows_only_llamacpp() {
        let mut snap = HardwareSnapshot {
            os: "macos".into(),
            physical_memory_gb: 32.0,
            ..Default::default()
        };
        snap.cpu.available = true;
        let filter = SupportFilter::new(Arc::new(snap));

        let gguf = ModelEntry::new("a", Recipe::LlamaCpp, "org/a");
        assert!(filter.rejection_reason(&gguf).is_none());

        let tts = ModelEntry::new("b", Recipe::Kokoro, "org/b");
        assert!(filter
            .rejection_reason(&tts)
            .unwrap()
            .contains("macOS"));
    }

    #[test]
    fn recipes_table_lists_every_recipe() {
        let filter = SupportFilter::new(linux_snapshot(true, 16.0, 32.0));
        let table = filter.recipes_table();
        for recipe in Recipe::ALL {
            assert!(table.get(recipe.tag()).is_some());
        }
    }
}
