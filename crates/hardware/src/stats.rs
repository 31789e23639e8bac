//! Live system utilization for `/system-stats`.
//!
//! Best effort: CPU and memory always come from sysinfo; GPU numbers come
//! from vendor tools and fall back to zero when the tool is missing.

use std::process::Command;

use serde::Serialize;
use sysinfo::{CpuRefreshKind, MemoryRefreshKind, RefreshKind, System};

#[derive(Debug, Clone, Copy, Serialize, Default)]
pub struct SystemStats {
    pub cpu_percent: f32,
    pub memory_gb: f64,
    pub gpu_percent: f32,
    pub vram_gb: f64,
}

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Sample current utilization. Blocking (sleeps one sysinfo interval for a
/// meaningful CPU reading and may spawn `nvidia-smi`/`rocm-smi`).
pub fn sample() -> SystemStats {
    let mut sys = System::new_with_specifics(
        RefreshKind::new()
            .with_cpu(CpuRefreshKind::everything())
            .with_memory(MemoryRefreshKind::everything()),
    );
    sys.refresh_cpu();
    std::thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
    sys.refresh_cpu();
    sys.refresh_memory();

    let (gpu_percent, vram_gb) = gpu_sample();

    SystemStats {
        cpu_percent: sys.global_cpu_info().cpu_usage(),
        memory_gb: sys.used_memory() as f64 / GIB,
        gpu_percent,
        vram_gb,
    }
}

fn gpu_sample() -> (f32, f64) {
    // NVIDIA first: one CSV line per GPU, "<util %>, <used MiB>".
    if let Some(out) = tool_stdout(
        "nvidia-smi",
        &[
            "--query-gpu=utilization.gpu,memory.used",
            "--format=csv,noheader,nounits",
        ],
    ) {
        if let Some(line) = out.lines().next() {
            let mut parts = line.split(',').map(str::trim);
            let util: f32 = parts.next().and_then(|v| v.parse().ok()).unwrap_or(0.0);
            let used_mib: f64 = parts.next().and_then(|v| v.parse().ok()).unwrap_or(0.0);
            return (util, used_mib * 1024.0 * 1024.0 / GIB);
        }
    }

    // AMD: `rocm-smi -u --csv` reports "GPU use (%)" per card.
    if let Some(out) = tool_stdout("rocm-smi", &["-u", "--showmemuse", "--csv"]) {
        let mut util = 0.0f32;
        let mut vram = 0.0f64;
        for line in out.lines().skip(1) {
            let parts: Vec<&str> = line.split(',').map(str::trim).collect();
            if let Some(u) = parts.get(1).and_then(|v| v.parse::<f32>().ok()) {
                util = util.max(u);
            }
            if let Some(bytes) = parts.get(2).and_then(|v| v.parse::<f64>().ok()) {
                vram += bytes / GIB;
            }
        }
        return (util, vram);
    }

    (0.0, 0.0)
}

fn tool_stdout(cmd: &str, args: &[&str]) -> Option<String> {
    let output = Command::new(cmd).args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_reports_cpu_and_memory() {
        let stats = sample();
        assert!(stats.memory_gb > 0.0);
        assert!(stats.cpu_percent >= 0.0);
    }
}
