//! On-disk snapshot cache.
//!
//! Probing spawns vendor tools and can take seconds, so the snapshot is
//! persisted as `hardware_info.json` keyed by application version. A cache
//! written by an older version is discarded and re-probed, and the caller's
//! cleanup hook runs so stale engine binaries can be swept in the same
//! pass.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::probe::{self, HardwareSnapshot};

#[derive(Debug, Serialize, Deserialize)]
struct CacheFile {
    version: String,
    hardware: HardwareSnapshot,
}

/// Load the cached snapshot if it matches `version`, otherwise probe,
/// persist, and run `on_invalidate` (used to remove engine binaries below
/// the supported floor version).
pub fn load_or_probe(
    cache_root: &Path,
    version: &str,
    on_invalidate: impl FnOnce(),
) -> HardwareSnapshot {
    let path = cache_root.join("hardware_info.json");

    if let Some(cached) = read_cache(&path) {
        if cached.version == version {
            tracing::debug!(path = %path.display(), "hardware snapshot loaded from cache");
            return cached.hardware;
        }
        tracing::info!(
            cached = %cached.version,
            current = %version,
            "hardware cache is from an older version, re-probing"
        );
        on_invalidate();
    }

    let hardware = probe::probe();
    if let Err(e) = write_cache(&path, version, &hardware) {
        tracing::warn!(path = %path.display(), error = %e, "failed to persist hardware cache");
    }
    hardware
}

fn read_cache(path: &Path) -> Option<CacheFile> {
    let raw = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str(&raw) {
        Ok(cache) => Some(cache),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "malformed hardware cache, ignoring");
            None
        }
    }
}

fn write_cache(path: &Path, version: &str, hardware: &HardwareSnapshot) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let cache = CacheFile {
        version: version.to_string(),
        hardware: hardware.clone(),
    };
    let json = serde_json::to_string_pretty(&cache).map_err(std::io::Error::other)?;
    std::fs::write(path, json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn probe_and_cache_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let first = load_or_probe(dir.path(), "1.0.0", || {});
        assert!(dir.path().join("hardware_info.json").exists());

        // Second call with the same version reads the cache.
        let second = load_or_probe(dir.path(), "1.0.0", || {
            panic!("cache hit must not invalidate")
        });
        assert_eq!(first.os, second.os);
    }

    #[test]
    fn version_bump_invalidates() {
        let dir = tempfile::tempdir().unwrap();
        load_or_probe(dir.path(), "1.0.0", || {});

        let invalidated = AtomicBool::new(false);
        load_or_probe(dir.path(), "2.0.0", || {
            invalidated.store(true, Ordering::SeqCst);
        });
        assert!(invalidated.load(Ordering::SeqCst));

        // Cache now carries the new version.
        let raw = std::fs::read_to_string(dir.path().join("hardware_info.json")).unwrap();
        assert!(raw.contains("2.0.0"));
    }

    #[test]
    fn malformed_cache_is_reprobed() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("hardware_info.json"), "{not json").unwrap();
        let snap = load_or_probe(dir.path(), "1.0.0", || {});
        assert!(snap.cpu.available);
    }
}
