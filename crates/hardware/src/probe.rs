//! Tolerant hardware detection.
//!
//! Detection uses filesystem probes and vendor tools (`nvidia-smi`,
//! `rocm-smi`) rather than linking GPU libraries at compile time. Every
//! device category is probed independently; a failure in one yields
//! `available: false` with an error string instead of aborting, so a
//! half-broken driver stack never takes the gateway down.

use std::path::Path;
use std::process::Command;

use serde::{Deserialize, Serialize};
use sysinfo::{MemoryRefreshKind, RefreshKind, System};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Snapshot types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One detected device. `family` is the granular identifier support rules
/// match on (`gfx1150`, `XDNA2`, `x86_64`).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DeviceInfo {
    pub name: String,
    pub family: String,
    pub available: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,
    #[serde(default)]
    pub vram_gb: f64,
    /// GTT-backed memory usable by an iGPU beyond dedicated VRAM.
    #[serde(default)]
    pub virtual_gb: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DeviceInfo {
    fn unavailable(err: impl Into<String>) -> Self {
        Self {
            available: false,
            error: Some(err.into()),
            ..Default::default()
        }
    }
}

/// The full device snapshot the support filter and `/system-info` consume.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HardwareSnapshot {
    pub os: String,
    pub cpu: DeviceInfo,
    pub integrated_gpu: DeviceInfo,
    pub discrete_gpus: Vec<DeviceInfo>,
    pub nvidia_gpus: Vec<DeviceInfo>,
    pub npu: DeviceInfo,
    pub physical_memory_gb: f64,
}

impl HardwareSnapshot {
    /// Largest single GPU memory pool in GB (dedicated + virtual),
    /// used by the size filter.
    pub fn largest_gpu_pool_gb(&self) -> f64 {
        self.discrete_gpus
            .iter()
            .chain(self.nvidia_gpus.iter())
            .chain(std::iter::once(&self.integrated_gpu))
            .filter(|d| d.available)
            .map(|d| d.vram_gb + d.virtual_gb)
            .fold(0.0, f64::max)
    }

    /// All families present on this host, for support-rule matching.
    pub fn families(&self) -> Vec<&str> {
        let mut out = Vec::new();
        for dev in std::iter::once(&self.cpu)
            .chain(std::iter::once(&self.integrated_gpu))
            .chain(self.discrete_gpus.iter())
            .chain(self.nvidia_gpus.iter())
            .chain(std::iter::once(&self.npu))
        {
            if dev.available && !dev.family.is_empty() {
                out.push(dev.family.as_str());
            }
        }
        out
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Probe
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Run the full probe. Synchronous and potentially slow (spawns vendor
/// tools), so call it from a blocking context; results are meant to be
/// cached via [`crate::cache::load_or_probe`].
pub fn probe() -> HardwareSnapshot {
    let mut sys = System::new_with_specifics(
        RefreshKind::new().with_memory(MemoryRefreshKind::everything()),
    );
    sys.refresh_memory();

    let (integrated, discrete) = guarded_pair(probe_amd_gpus, "amd gpu probe");

    let snapshot = HardwareSnapshot {
        os: std::env::consts::OS.to_string(),
        cpu: guarded(probe_cpu, "cpu probe"),
        integrated_gpu: integrated,
        discrete_gpus: discrete,
        nvidia_gpus: probe_nvidia_gpus().unwrap_or_default(),
        npu: guarded(probe_npu, "npu probe"),
        physical_memory_gb: sys.total_memory() as f64 / GIB,
    };

    tracing::info!(
        os = %snapshot.os,
        cpu = %snapshot.cpu.name,
        igpu = snapshot.integrated_gpu.available,
        dgpus = snapshot.discrete_gpus.len(),
        nvidia = snapshot.nvidia_gpus.len(),
        npu = snapshot.npu.available,
        memory_gb = snapshot.physical_memory_gb,
        "hardware probe complete"
    );
    snapshot
}

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

fn guarded(f: impl FnOnce() -> Option<DeviceInfo>, what: &str) -> DeviceInfo {
    match f() {
        Some(dev) => dev,
        None => {
            tracing::debug!(probe = what, "device not detected");
            DeviceInfo::unavailable(format!("{what}: not detected"))
        }
    }
}

fn guarded_pair(
    f: impl FnOnce() -> (Option<DeviceInfo>, Vec<DeviceInfo>),
    what: &str,
) -> (DeviceInfo, Vec<DeviceInfo>) {
    let (igpu, dgpus) = f();
    (
        igpu.unwrap_or_else(|| DeviceInfo::unavailable(format!("{what}: not detected"))),
        dgpus,
    )
}

fn probe_cpu() -> Option<DeviceInfo> {
    let mut sys = System::new_with_specifics(
        RefreshKind::new().with_cpu(sysinfo::CpuRefreshKind::everything()),
    );
    sys.refresh_cpu();
    let name = sys
        .cpus()
        .first()
        .map(|c| c.brand().trim().to_string())
        .unwrap_or_else(|| "unknown cpu".into());
    Some(DeviceInfo {
        name,
        family: std::env::consts::ARCH.to_string(),
        available: true,
        ..Default::default()
    })
}

/// AMD GPUs via `rocm-smi`; iGPU split from dGPUs by product name.
/// Families come from `rocminfo` when present (`gfx1150` style).
fn probe_amd_gpus() -> (Option<DeviceInfo>, Vec<DeviceInfo>) {
    if !Path::new("/dev/kfd").exists() {
        return (None, Vec::new());
    }

    let names = tool_lines("rocm-smi", &["--showproductname", "--csv"]);
    let vram = tool_lines("rocm-smi", &["--showmeminfo", "vram", "--csv"]);
    let families = rocminfo_families();

    let mut integrated = None;
    let mut discrete = Vec::new();

    for (idx, name_line) in names.iter().skip(1).enumerate() {
        let name = name_line
            .split(',')
            .nth(1)
            .unwrap_or(name_line)
            .trim()
            .to_string();
        let vram_gb = vram
            .get(idx + 1)
            .and_then(|l| l.split(',').nth(1))
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(|bytes| bytes as f64 / GIB)
            .unwrap_or(0.0);
        let dev = DeviceInfo {
            family: families.get(idx).cloned().unwrap_or_default(),
            available: true,
            vram_gb,
            virtual_gb: gtt_pool_gb(idx),
            name: name.clone(),
            ..Default::default()
        };
        // APU graphics report as "Radeon(TM) ... Graphics" without a
        // discrete product number.
        if name.contains("Graphics") && !name.contains("RX") && integrated.is_none() {
            integrated = Some(dev);
        } else {
            discrete.push(dev);
        }
    }

    (integrated, discrete)
}

fn probe_nvidia_gpus() -> Option<Vec<DeviceInfo>> {
    if !Path::new("/dev/nvidia0").exists() && std::env::consts::OS == "linux" {
        return None;
    }
    let lines = tool_lines(
        "nvidia-smi",
        &[
            "--query-gpu=name,memory.total,driver_version",
            "--format=csv,noheader,nounits",
        ],
    );
    let mut gpus = Vec::new();
    for line in lines {
        let parts: Vec<&str> = line.split(',').map(str::trim).collect();
        if parts.len() < 3 {
            continue;
        }
        let mib: f64 = parts[1].parse().unwrap_or(0.0);
        gpus.push(DeviceInfo {
            name: parts[0].to_string(),
            family: "cuda".to_string(),
            available: true,
            driver: Some(parts[2].to_string()),
            vram_gb: mib * 1024.0 * 1024.0 / GIB,
            ..Default::default()
        });
    }
    if gpus.is_empty() {
        None
    } else {
        Some(gpus)
    }
}

/// XDNA NPUs expose an accel device node; the driver version comes from
/// `modinfo` when the module is present.
fn probe_npu() -> Option<DeviceInfo> {
    if !Path::new("/dev/accel/accel0").exists() {
        return None;
    }
    let driver = tool_lines("modinfo", &["--field", "version", "amdxdna"])
        .into_iter()
        .next()
        .filter(|v| !v.is_empty());
    Some(DeviceInfo {
        name: "AMD NPU".to_string(),
        family: "XDNA2".to_string(),
        available: true,
        driver,
        ..Default::default()
    })
}

/// GTT pool size for a card, only counted when the operator opted in via
/// `LEMONADE_ENABLE_DGPU_GTT`.
fn gtt_pool_gb(card_index: usize) -> f64 {
    if !lmn_domain::config::env::dgpu_gtt_enabled() {
        return 0.0;
    }
    let path = format!("/sys/class/drm/card{card_index}/device/mem_info_gtt_total");
    std::fs::read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(|bytes| bytes as f64 / GIB)
        .unwrap_or(0.0)
}

fn rocminfo_families() -> Vec<String> {
    tool_lines("rocminfo", &[])
        .iter()
        .filter_map(|line| {
            let trimmed = line.trim();
            trimmed
                .strip_prefix("Name:")
                .map(str::trim)
                .filter(|n| n.starts_with("gfx"))
                .map(String::from)
        })
        .collect()
}

/// Run a vendor tool and return stdout lines; an absent or failing tool
/// just yields no lines.
fn tool_lines(cmd: &str, args: &[&str]) -> Vec<String> {
    let output = match Command::new(cmd).args(args).output() {
        Ok(out) if out.status.success() => out,
        _ => return Vec::new(),
    };
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .collect()
}
