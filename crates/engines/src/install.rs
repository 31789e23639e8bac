//! Engine binary installation.
//!
//! Binaries are located by (a) a `LEMONADE_<RECIPE>[_<BACKEND>]_BIN`
//! override, then (b) the download cache keyed by recipe and backend. A
//! cached install whose `version.txt` differs from the required version is
//! deleted and re-downloaded, so engine upgrades are a version-string bump
//! in [`release_for`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use flate2::read::GzDecoder;
use tar::Archive;

use lmn_domain::config::env;
use lmn_domain::model::Recipe;
use lmn_domain::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Release table
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Engines older than this are removed when the hardware cache detects an
/// application upgrade.
pub const ENGINE_FLOOR_VERSION: &str = "0.9.0";

#[derive(Debug, Clone, Copy)]
pub struct Release {
    pub version: &'static str,
    /// `{version}` and `{backend}` placeholders are substituted.
    pub url_template: &'static str,
    /// File name of the server binary inside the extracted tree.
    pub binary_name: &'static str,
}

/// Which engine build a (recipe, backend) pair needs.
pub fn release_for(recipe: Recipe, backend: &str) -> Release {
    match recipe {
        Recipe::LlamaCpp => Release {
            version: "b4820",
            url_template:
                "https://github.com/ggml-org/llama.cpp/releases/download/{version}/llama-{version}-bin-linux-{backend}-x64.tar.gz",
            binary_name: "llama-server",
        },
        Recipe::RyzenAiLlm => Release {
            version: "1.4.0",
            url_template:
                "https://github.com/amd/ryzen-ai-sw/releases/download/v{version}/ryzenai-llm-server-{version}-{backend}.tar.gz",
            binary_name: "ryzenai-llm-server",
        },
        Recipe::Flm => Release {
            version: "0.9.6",
            url_template:
                "https://github.com/FastFlowLM/FastFlowLM/releases/download/v{version}/flm-{version}-linux.tar.gz",
            binary_name: "flm",
        },
        Recipe::WhisperCpp => Release {
            version: "1.7.4",
            url_template:
                "https://github.com/ggml-org/whisper.cpp/releases/download/v{version}/whisper-server-{version}-{backend}.tar.gz",
            binary_name: "whisper-server",
        },
        Recipe::Kokoro => Release {
            version: "0.3.1",
            url_template:
                "https://github.com/lemonade-apps/kokoro-server/releases/download/v{version}/kokoro-server-{version}-{backend}.tar.gz",
            binary_name: "kokoro-server",
        },
        Recipe::SdCpp => Release {
            version: "0.2.0",
            url_template:
                "https://github.com/leejet/stable-diffusion.cpp/releases/download/v{version}/sd-server-{version}-{backend}.tar.gz",
            binary_name: "sd-server",
        },
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Install
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Directory an engine build installs into.
pub fn install_dir(cache_root: &Path, recipe: Recipe, backend: &str) -> PathBuf {
    cache_root.join("bin").join(recipe.tag()).join(backend)
}

/// Ensure the engine binary for `(recipe, backend)` is present at the
/// required version and return its path.
pub async fn ensure_installed(
    cache_root: &Path,
    recipe: Recipe,
    backend: &str,
    timeout: Duration,
) -> Result<PathBuf> {
    if let Some(override_path) = env::bin_override(recipe, Some(backend)) {
        tracing::debug!(recipe = %recipe, backend, path = %override_path.display(), "using engine binary override");
        return Ok(override_path);
    }

    let release = release_for(recipe, backend);
    let dir = install_dir(cache_root, recipe, backend);
    let binary = dir.join(release.binary_name);
    let version_file = dir.join("version.txt");

    let installed = std::fs::read_to_string(&version_file)
        .map(|v| v.trim().to_string())
        .unwrap_or_default();
    if installed == release.version && binary.is_file() {
        return Ok(binary);
    }
    if !installed.is_empty() {
        tracing::info!(
            recipe = %recipe,
            backend,
            installed = %installed,
            required = release.version,
            "engine version mismatch, reinstalling"
        );
        std::fs::remove_dir_all(&dir).ok();
    }
    std::fs::create_dir_all(&dir)?;

    let url = release
        .url_template
        .replace("{version}", release.version)
        .replace("{backend}", backend);
    tracing::info!(recipe = %recipe, backend, url = %url, "downloading engine");

    let archive = download_archive(&url, &dir, timeout).await?;
    extract(&archive, &dir).await?;
    std::fs::remove_file(&archive).ok();

    let binary = locate_binary(&dir, release.binary_name).ok_or_else(|| {
        Error::Engine(format!(
            "{} not found in extracted archive for {recipe}/{backend}",
            release.binary_name
        ))
    })?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o755))?;
    }
    std::fs::write(&version_file, release.version)?;
    tracing::info!(recipe = %recipe, backend, version = release.version, "engine installed");
    Ok(binary)
}

async fn download_archive(url: &str, dir: &Path, timeout: Duration) -> Result<PathBuf> {
    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(60))
        .timeout(timeout)
        .build()
        .map_err(|e| Error::Http(format!("building download client: {e}")))?;

    let resp = client
        .get(url)
        .send()
        .await
        .map_err(|e| Error::Http(format!("GET {url}: {e}")))?;
    if !resp.status().is_success() {
        return Err(Error::Http(format!("GET {url}: HTTP {}", resp.status())));
    }

    let name = url.rsplit('/').next().unwrap_or("engine.tar.gz");
    let dest = dir.join(name);
    let bytes = resp
        .bytes()
        .await
        .map_err(|e| Error::Http(format!("reading {url}: {e}")))?;
    tokio::fs::write(&dest, &bytes).await?;
    Ok(dest)
}

/// Extract a release archive. Tarballs go through flate2+tar; zip falls
/// back to the platform tool.
async fn extract(archive: &Path, dest: &Path) -> Result<()> {
    let name = archive.to_string_lossy().to_ascii_lowercase();
    if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        let archive = archive.to_path_buf();
        let dest = dest.to_path_buf();
        return tokio::task::spawn_blocking(move || -> Result<()> {
            let file = std::fs::File::open(&archive)?;
            let gz = GzDecoder::new(std::io::BufReader::new(file));
            Archive::new(gz)
                .unpack(&dest)
                .map_err(|e| Error::Engine(format!("extracting {}: {e}", archive.display())))
        })
        .await
        .map_err(|e| Error::Engine(format!("extraction task failed: {e}")))?;
    }
    if name.ends_with(".zip") {
        let status = tokio::process::Command::new("unzip")
            .arg("-o")
            .arg(archive)
            .arg("-d")
            .arg(dest)
            .status()
            .await
            .map_err(|e| Error::Engine(format!("running unzip: {e}")))?;
        if !status.success() {
            return Err(Error::Engine(format!("unzip exited with {status}")));
        }
        return Ok(());
    }
    Err(Error::Engine(format!(
        "unsupported archive format: {}",
        archive.display()
    )))
}

/// Release archives nest the binary at varying depths.
fn locate_binary(dir: &Path, name: &str) -> Option<PathBuf> {
    let direct = dir.join(name);
    if direct.is_file() {
        return Some(direct);
    }
    for entry in std::fs::read_dir(dir).ok()?.flatten() {
        let path = entry.path();
        if path.is_dir() {
            if let Some(found) = locate_binary(&path, name) {
                return Some(found);
            }
        }
    }
    None
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Upgrade cleanup
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Remove cached engine installs whose version is below the floor. Hooked
/// into hardware-cache invalidation on application upgrades.
pub fn cleanup_below_floor(cache_root: &Path, floor: &str) {
    let bin_root = cache_root.join("bin");
    let recipes = match std::fs::read_dir(&bin_root) {
        Ok(rd) => rd,
        Err(_) => return,
    };
    for recipe_dir in recipes.flatten() {
        let backends = match std::fs::read_dir(recipe_dir.path()) {
            Ok(rd) => rd,
            Err(_) => continue,
        };
        for backend_dir in backends.flatten() {
            let version_file = backend_dir.path().join("version.txt");
            let version = std::fs::read_to_string(&version_file)
                .map(|v| v.trim().to_string())
                .unwrap_or_default();
            if version.is_empty() || version_lt(&version, floor) {
                tracing::info!(
                    dir = %backend_dir.path().display(),
                    version = %version,
                    floor,
                    "removing outdated engine install"
                );
                std::fs::remove_dir_all(backend_dir.path()).ok();
            }
        }
    }
}

/// Dotted-numeric comparison; non-numeric segments compare as strings so
/// tags like `b4820` still order sensibly.
fn version_lt(a: &str, b: &str) -> bool {
    let parse = |v: &str| -> Vec<u64> {
        v.trim_start_matches(|c: char| c.is_ascii_alphabetic())
            .split('.')
            .map(|seg| seg.parse().unwrap_or(0))
            .collect()
    };
    let (va, vb) = (parse(a), parse(b));
    for i in 0..va.len().max(vb.len()) {
        let x = va.get(i).copied().unwrap_or(0);
        let y = vb.get(i).copied().unwrap_or(0);
        if x != y {
            return x < y;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_ordering() {
        assert!(version_lt("0.8.9", "0.9.0"));
        assert!(!version_lt("0.9.0", "0.9.0"));
        assert!(!version_lt("1.0.0", "0.9.9"));
        assert!(version_lt("v1.2", "v1.10"));
    }

    #[test]
    fn install_dir_is_keyed_by_recipe_and_backend() {
        let dir = install_dir(Path::new("/cache"), Recipe::LlamaCpp, "vulkan");
        assert_eq!(dir, PathBuf::from("/cache/bin/llamacpp/vulkan"));
    }

    #[test]
    fn cleanup_removes_only_old_installs() {
        let root = tempfile::tempdir().unwrap();
        let old = install_dir(root.path(), Recipe::LlamaCpp, "cpu");
        let new = install_dir(root.path(), Recipe::WhisperCpp, "cpu");
        std::fs::create_dir_all(&old).unwrap();
        std::fs::create_dir_all(&new).unwrap();
        std::fs::write(old.join("version.txt"), "0.1.0").unwrap();
        std::fs::write(new.join("version.txt"), "9.9.9").unwrap();

        cleanup_below_floor(root.path(), ENGINE_FLOOR_VERSION);
        assert!(!old.exists());
        assert!(new.exists());
    }

    #[tokio::test]
    async fn env_override_short_circuits() {
        // Safe to mutate: unique variable name per recipe.
        std::env::set_var("LEMONADE_SD_CPP_BIN", "/opt/custom/sd-server");
        let path = ensure_installed(
            Path::new("/nonexistent"),
            Recipe::SdCpp,
            "cpu",
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        assert_eq!(path, PathBuf::from("/opt/custom/sd-server"));
        std::env::remove_var("LEMONADE_SD_CPP_BIN");
    }

    #[tokio::test]
    async fn cached_version_match_skips_download() {
        let root = tempfile::tempdir().unwrap();
        let release = release_for(Recipe::LlamaCpp, "cpu");
        let dir = install_dir(root.path(), Recipe::LlamaCpp, "cpu");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("version.txt"), release.version).unwrap();
        std::fs::write(dir.join(release.binary_name), b"#!").unwrap();

        let path = ensure_installed(
            root.path(),
            Recipe::LlamaCpp,
            "cpu",
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        assert!(path.ends_with(release.binary_name));
    }
}
