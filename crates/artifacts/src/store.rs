//! The artifact store: resolve-and-download with resume.
//!
//! Transfers write to `<file>.partial` and rename into place on success,
//! so an interrupted pull leaves resumable state behind. The per-file
//! retry loop uses bounded exponential backoff; cancellation is permanent
//! and keeps partials for the next attempt.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use backoff::ExponentialBackoff;
use tokio::io::AsyncWriteExt;

use lmn_catalog::resolve::{self, PARTIAL_SUFFIX};
use lmn_domain::config::env;
use lmn_domain::model::{role, CheckpointRef, ModelEntry, ModelSource, Recipe};
use lmn_domain::{Error, Result};

use crate::hub::HubClient;
use crate::manifest::{Manifest, ManifestFile};
use crate::plan;
use crate::progress::{CancelToken, DownloadEvent, ProgressSink};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tunables
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const RETRY_INITIAL: Duration = Duration::from_secs(2);
const RETRY_CAP: Duration = Duration::from_secs(120);
const MAX_ATTEMPTS: u32 = 10;

/// A transfer averaging under 1 KB/s across this window is considered
/// stalled and the attempt is retried.
const LOW_SPEED_WINDOW: Duration = Duration::from_secs(60);
const LOW_SPEED_BYTES: u64 = 1024 * 60;

/// Progress events are throttled to roughly one per this many bytes.
const PROGRESS_STRIDE: u64 = 1024 * 1024;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct FileJob {
    url: String,
    dest: PathBuf,
    size: u64,
    label: String,
}

pub struct ArtifactStore {
    hub: HubClient,
    hub_cache: PathBuf,
    strict_variant: bool,
}

impl ArtifactStore {
    pub fn new(hub_cache: PathBuf, strict_variant: bool) -> Result<Self> {
        Ok(Self {
            hub: HubClient::new()?,
            hub_cache,
            strict_variant,
        })
    }

    /// Download everything `entry` needs. `do_not_upgrade=true` prefers
    /// whatever is already cached and skips the revision check entirely.
    pub async fn download(
        &self,
        entry: &ModelEntry,
        do_not_upgrade: bool,
        sink: &dyn ProgressSink,
        cancel: &CancelToken,
    ) -> Result<()> {
        // Local sources have nothing to transfer.
        if matches!(
            entry.source,
            Some(ModelSource::LocalPath) | Some(ModelSource::ExtraModelsDir)
        ) || matches!(entry.main_ref(), CheckpointRef::LocalPath(_))
        {
            sink.emit(DownloadEvent::Completed);
            return Ok(());
        }

        if do_not_upgrade && self.already_complete(entry) {
            tracing::debug!(model = %entry.name, "already downloaded, skipping network check");
            sink.emit(DownloadEvent::Completed);
            return Ok(());
        }

        if env::offline() {
            return Err(Error::Http(format!(
                "{} is not downloaded and LEMONADE_OFFLINE is set",
                entry.name
            )));
        }

        let (repo_id, variant) = match entry.main_ref() {
            CheckpointRef::Repo { repo_id, variant } => (repo_id, variant),
            CheckpointRef::LocalPath(_) => unreachable!("local refs handled above"),
        };

        // Metadata: current revision plus the file list, pinned via
        // refs/main so resolution sees the same snapshot.
        let info = self.hub.repo_info(&repo_id).await?;
        let revision = info.sha.clone();
        let repo_dir = resolve::repo_cache_dir(&self.hub_cache, &repo_id);
        let snapshot = repo_dir.join("snapshots").join(&revision);
        write_ref(&repo_dir, &revision)?;

        let repo_files = info.file_names();
        let sizes = self.hub.tree_sizes(&repo_id, &revision).await?;

        let mut jobs: Vec<FileJob> = Vec::new();
        for rel in plan::plan_main_files(entry, variant.as_deref(), &repo_files, self.strict_variant)? {
            jobs.push(FileJob {
                url: self.hub.file_url(&repo_id, &revision, &rel),
                dest: snapshot.join(&rel),
                size: sizes.get(&rel).copied().unwrap_or(0),
                label: rel,
            });
        }

        // Secondary roles fetch the exact named file from their own repo.
        for (role_name, reference) in &entry.checkpoints {
            if role_name == role::MAIN || role_name == role::NPU_CACHE {
                continue;
            }
            if let Some(job) = self.plan_role_job(reference, &repo_id, &revision, &snapshot).await? {
                jobs.push(job);
            }
        }

        let manifest = Manifest {
            files: jobs
                .iter()
                .map(|j| ManifestFile {
                    path: j.dest.clone(),
                    url: j.url.clone(),
                    size: j.size,
                })
                .collect(),
        };
        manifest.write(&snapshot)?;

        let total_files = jobs.len();
        for (index, job) in jobs.iter().enumerate() {
            sink.emit(DownloadEvent::FileStarted {
                file: job.label.clone(),
                file_index: index + 1,
                total_files,
            });
            self.fetch_file(job, index + 1, total_files, sink, cancel)
                .await?;
        }

        manifest.validate()?;
        Manifest::remove(&snapshot)?;
        tracing::info!(model = %entry.name, files = total_files, revision = %revision, "download complete");
        sink.emit(DownloadEvent::Completed);
        Ok(())
    }

    fn already_complete(&self, entry: &ModelEntry) -> bool {
        if entry.downloaded {
            return true;
        }
        let mut probe = entry.clone();
        resolve::resolve_entry(&mut probe, &self.hub_cache, self.strict_variant);
        probe.downloaded
    }

    async fn plan_role_job(
        &self,
        reference: &str,
        main_repo: &str,
        main_revision: &str,
        main_snapshot: &Path,
    ) -> Result<Option<FileJob>> {
        let (repo_id, file) = match CheckpointRef::parse(reference) {
            CheckpointRef::Repo {
                repo_id,
                variant: Some(v),
            } => (repo_id, v),
            // A role without an explicit file has nothing extra to fetch.
            CheckpointRef::Repo { .. } | CheckpointRef::LocalPath(_) => return Ok(None),
        };

        if repo_id == main_repo {
            return Ok(Some(FileJob {
                url: self.hub.file_url(&repo_id, main_revision, &file),
                dest: main_snapshot.join(&file),
                size: 0,
                label: file,
            }));
        }

        let info = self.hub.repo_info(&repo_id).await?;
        let repo_dir = resolve::repo_cache_dir(&self.hub_cache, &repo_id);
        let snapshot = repo_dir.join("snapshots").join(&info.sha);
        write_ref(&repo_dir, &info.sha)?;
        Ok(Some(FileJob {
            url: self.hub.file_url(&repo_id, &info.sha, &file),
            dest: snapshot.join(&file),
            size: 0,
            label: file,
        }))
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Per-file transfer
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    async fn fetch_file(
        &self,
        job: &FileJob,
        file_index: usize,
        total_files: usize,
        sink: &dyn ProgressSink,
        cancel: &CancelToken,
    ) -> Result<()> {
        if let Some(parent) = job.dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let partial = partial_path(&job.dest);

        let attempts = AtomicU32::new(0);
        let policy = ExponentialBackoff {
            initial_interval: RETRY_INITIAL,
            max_interval: RETRY_CAP,
            max_elapsed_time: None,
            ..Default::default()
        };

        backoff::future::retry(policy, || async {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt > MAX_ATTEMPTS {
                return Err(backoff::Error::permanent(Error::DownloadIncomplete(
                    format!("{}: gave up after {MAX_ATTEMPTS} attempts", job.label),
                )));
            }
            match self
                .transfer_once(job, &partial, file_index, total_files, sink, cancel)
                .await
            {
                Ok(()) => Ok(()),
                Err(e @ Error::Cancelled(_)) => Err(backoff::Error::permanent(e)),
                Err(e) => {
                    tracing::warn!(
                        file = %job.label,
                        attempt,
                        error = %e,
                        "transfer attempt failed, will retry"
                    );
                    Err(backoff::Error::transient(e))
                }
            }
        })
        .await?;

        tokio::fs::rename(&partial, &job.dest).await?;
        Ok(())
    }

    /// One streaming attempt: resume from the partial's length, append
    /// chunks, watch for stalls and cancellation.
    async fn transfer_once(
        &self,
        job: &FileJob,
        partial: &Path,
        file_index: usize,
        total_files: usize,
        sink: &dyn ProgressSink,
        cancel: &CancelToken,
    ) -> Result<()> {
        let mut offset = std::fs::metadata(partial).map(|m| m.len()).unwrap_or(0);
        let mut response = self.hub.get_file(&job.url, offset).await?;

        // A host that ignores Range answers 200 with the full body.
        if offset > 0 && response.status() == reqwest::StatusCode::OK {
            tracing::debug!(file = %job.label, "host ignored range request, restarting file");
            offset = 0;
            tokio::fs::remove_file(partial).await.ok();
        }

        let total = if job.size > 0 {
            job.size
        } else {
            offset + response.content_length().unwrap_or(0)
        };

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(partial)
            .await?;

        let mut downloaded = offset;
        let mut last_emit = 0u64;
        let mut window_start = Instant::now();
        let mut window_bytes = 0u64;

        loop {
            let chunk = match response.chunk().await {
                Ok(Some(bytes)) => bytes,
                Ok(None) => break,
                Err(e) => return Err(Error::Http(format!("{}: {e}", job.label))),
            };

            if cancel.is_cancelled() {
                // Partials stay on disk so the next pull resumes here.
                file.flush().await?;
                return Err(Error::Cancelled(format!(
                    "download of {} cancelled by client",
                    job.label
                )));
            }

            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
            window_bytes += chunk.len() as u64;

            if downloaded - last_emit >= PROGRESS_STRIDE || downloaded == total {
                last_emit = downloaded;
                sink.emit(DownloadEvent::Progress {
                    file: job.label.clone(),
                    file_index,
                    total_files,
                    bytes_downloaded: downloaded,
                    bytes_total: total,
                    percent: if total > 0 {
                        downloaded as f64 / total as f64 * 100.0
                    } else {
                        0.0
                    },
                });
            }

            if window_start.elapsed() >= LOW_SPEED_WINDOW {
                if window_bytes < LOW_SPEED_BYTES {
                    return Err(Error::Http(format!(
                        "{}: transfer stalled below 1 KB/s",
                        job.label
                    )));
                }
                window_start = Instant::now();
                window_bytes = 0;
            }
        }

        file.flush().await?;

        if job.size > 0 && downloaded < job.size {
            return Err(Error::Http(format!(
                "{}: connection closed at {downloaded}/{} bytes",
                job.label, job.size
            )));
        }
        Ok(())
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Local import fast path
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Resolve an already-uploaded directory under the hub cache without
    /// any network: find the main GGUF (smallest non-mmproj) and an
    /// optional mmproj. Returned paths are relative to the cache root, as
    /// user entries with `local_upload` source expect.
    pub fn local_import(&self, upload_rel_dir: &str) -> Result<LocalImport> {
        let dir = self.hub_cache.join(upload_rel_dir);
        let mut ggufs: Vec<String> = std::fs::read_dir(&dir)
            .map_err(|_| {
                Error::NotFound(format!("upload directory {upload_rel_dir} does not exist"))
            })?
            .flatten()
            .filter(|e| e.path().is_file())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n.to_ascii_lowercase().ends_with(".gguf"))
            .collect();
        ggufs.sort();

        let mmproj = ggufs
            .iter()
            .find(|n| n.to_ascii_lowercase().contains("mmproj"))
            .cloned();
        let main = ggufs
            .iter()
            .find(|n| !n.to_ascii_lowercase().contains("mmproj"))
            .cloned()
            .ok_or_else(|| {
                Error::InvalidRequest(format!("no gguf file found in {upload_rel_dir}"))
            })?;

        let rel = |name: &str| format!("{}/{}", upload_rel_dir.trim_end_matches('/'), name);
        Ok(LocalImport {
            main: rel(&main),
            mmproj: mmproj.map(|m| rel(&m)),
        })
    }

    pub fn hub_cache(&self) -> &Path {
        &self.hub_cache
    }
}

/// Result of the local import fast path: hub-cache-relative paths.
#[derive(Debug, Clone)]
pub struct LocalImport {
    pub main: String,
    pub mmproj: Option<String>,
}

/// Delete a model's on-disk snapshot tree (used by `/delete`).
pub fn delete_artifacts(hub_cache: &Path, entry: &ModelEntry) -> Result<()> {
    match entry.main_ref() {
        CheckpointRef::Repo { repo_id, .. } if entry.recipe != Recipe::Flm => {
            let repo_dir = resolve::repo_cache_dir(hub_cache, &repo_id);
            if repo_dir.exists() {
                std::fs::remove_dir_all(&repo_dir)?;
                tracing::info!(model = %entry.name, dir = %repo_dir.display(), "artifacts removed");
            }
            Ok(())
        }
        // Local files are never deleted out from under the user; FLM
        // checkpoints belong to the engine's own store.
        _ => Ok(()),
    }
}

fn partial_path(dest: &Path) -> PathBuf {
    let mut os = dest.as_os_str().to_owned();
    os.push(PARTIAL_SUFFIX);
    PathBuf::from(os)
}

fn write_ref(repo_dir: &Path, revision: &str) -> Result<()> {
    let refs = repo_dir.join("refs");
    std::fs::create_dir_all(&refs)?;
    std::fs::write(refs.join("main"), revision)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::{CollectSink, NullSink};

    #[tokio::test]
    async fn local_source_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path().to_path_buf(), false).unwrap();
        let mut entry = ModelEntry::new("m", Recipe::LlamaCpp, "/models/x.gguf");
        entry.source = Some(ModelSource::LocalPath);

        let sink = CollectSink::default();
        store
            .download(&entry, false, &sink, &CancelToken::new())
            .await
            .unwrap();
        assert!(matches!(
            sink.0.lock().as_slice(),
            [DownloadEvent::Completed]
        ));
    }

    #[tokio::test]
    async fn do_not_upgrade_skips_when_cached() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path().to_path_buf(), false).unwrap();
        let mut entry = ModelEntry::new("m", Recipe::LlamaCpp, "org/repo");
        entry.downloaded = true;

        // Would need the network otherwise; the cached flag short-circuits.
        store
            .download(&entry, true, &NullSink, &CancelToken::new())
            .await
            .unwrap();
    }

    #[test]
    fn partial_path_appends_suffix() {
        assert_eq!(
            partial_path(Path::new("/a/b/model.gguf")),
            PathBuf::from("/a/b/model.gguf.partial")
        );
    }

    #[test]
    fn write_ref_creates_pointer() {
        let dir = tempfile::tempdir().unwrap();
        write_ref(dir.path(), "abc123").unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("refs").join("main")).unwrap(),
            "abc123"
        );
    }

    #[test]
    fn local_import_picks_main_and_mmproj() {
        let dir = tempfile::tempdir().unwrap();
        let upload = dir.path().join("uploads").join("vision-model");
        std::fs::create_dir_all(&upload).unwrap();
        std::fs::write(upload.join("model.gguf"), b"x").unwrap();
        std::fs::write(upload.join("mmproj-f16.gguf"), b"x").unwrap();

        let store = ArtifactStore::new(dir.path().to_path_buf(), false).unwrap();
        let import = store.local_import("uploads/vision-model").unwrap();
        assert_eq!(import.main, "uploads/vision-model/model.gguf");
        assert_eq!(
            import.mmproj.as_deref(),
            Some("uploads/vision-model/mmproj-f16.gguf")
        );
    }

    #[test]
    fn local_import_without_gguf_fails() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("empty")).unwrap();
        let store = ArtifactStore::new(dir.path().to_path_buf(), false).unwrap();
        assert!(store.local_import("empty").is_err());
        assert!(store.local_import("missing").is_err());
    }

    #[test]
    fn delete_artifacts_removes_repo_dir() {
        let dir = tempfile::tempdir().unwrap();
        let entry = ModelEntry::new("m", Recipe::LlamaCpp, "org/repo:Q4");
        let repo = resolve::repo_cache_dir(dir.path(), "org/repo");
        std::fs::create_dir_all(repo.join("snapshots").join("r1")).unwrap();

        delete_artifacts(dir.path(), &entry).unwrap();
        assert!(!repo.exists());

        // Local entries are left alone.
        let mut local = ModelEntry::new("l", Recipe::LlamaCpp, "/models/x.gguf");
        local.source = Some(ModelSource::LocalPath);
        delete_artifacts(dir.path(), &local).unwrap();
    }
}
