//! Speech-recognition adapter (whisper.cpp server).
//!
//! Audio arrives at the gateway as a multipart upload, is staged to a temp
//! file, and re-posted to the engine here.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::Value;

use lmn_domain::config::EngineConfig;
use lmn_domain::model::{role, Recipe};
use lmn_domain::{Error, Result};

use crate::adapter::{ByteStream, Engine, LoadContext, Operation};
use crate::host::ProcessHost;
use crate::install;
use crate::process::{self, SpawnSpec};

const CAPS: &[Operation] = &[Operation::AudioTranscriptions];

pub struct WhisperEngine {
    cache_root: PathBuf,
    config: EngineConfig,
    default_backend: &'static str,
    host: ProcessHost,
}

impl WhisperEngine {
    pub fn new(cache_root: PathBuf, config: EngineConfig, default_backend: &'static str) -> Self {
        Self {
            cache_root,
            config,
            default_backend,
            host: ProcessHost::new(),
        }
    }

    /// On NPU backends the engine needs its precompiled cache next to the
    /// model; a pull that predates the engine version will not have one.
    fn check_npu_cache(ctx: &LoadContext, backend: &str) -> Result<()> {
        if backend != "npu" {
            return Ok(());
        }
        let cache = ctx
            .entry
            .resolved_paths
            .get(role::NPU_CACHE)
            .map(String::as_str)
            .unwrap_or_default();
        if cache.is_empty() || !Path::new(cache).exists() {
            return Err(Error::ModelLoadError(format!(
                "{}: compiled NPU cache is missing, pull the model again",
                ctx.model_name
            )));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Engine for WhisperEngine {
    fn recipe(&self) -> Recipe {
        Recipe::WhisperCpp
    }

    fn capabilities(&self) -> &'static [Operation] {
        CAPS
    }

    async fn load(&self, ctx: &LoadContext) -> Result<()> {
        let backend = ctx
            .options
            .get_str("backend")
            .unwrap_or(self.default_backend)
            .to_string();
        let binary = install::ensure_installed(
            &self.cache_root,
            Recipe::WhisperCpp,
            &backend,
            Duration::from_secs(self.config.install_timeout_sec),
        )
        .await?;

        let model_path = ctx.entry.main_path();
        if model_path.is_empty() || !Path::new(model_path).exists() {
            return Err(Error::FileNotFound(format!(
                "{}: No such file: {model_path}",
                ctx.model_name
            )));
        }
        Self::check_npu_cache(ctx, &backend)?;

        let port = process::pick_port().await?;
        let mut argv = vec![
            "--model".to_string(),
            model_path.to_string(),
            "--host".to_string(),
            "127.0.0.1".to_string(),
            "--port".to_string(),
            port.to_string(),
        ];
        if let Some(language) = ctx.options.get_str("language") {
            argv.push("--language".to_string());
            argv.push(language.to_string());
        }

        self.host
            .start(SpawnSpec {
                binary,
                args: argv,
                envs: vec![],
                port,
                health_endpoint: "/",
                ready_timeout: Duration::from_secs(self.config.load_timeout_sec),
            })
            .await
    }

    async fn unload(&self) -> Result<()> {
        self.host
            .stop(Duration::from_secs(self.config.unload_timeout_sec))
            .await;
        Ok(())
    }

    async fn forward_json(&self, op: Operation, body: Value) -> Result<Value> {
        self.host.http().await?.post_json(op.endpoint(), &body).await
    }

    async fn forward_stream(&self, op: Operation, body: Vec<u8>) -> Result<ByteStream> {
        self.host.http().await?.post_stream(op.endpoint(), body).await
    }

    async fn transcribe(
        &self,
        audio: &Path,
        fields: &HashMap<String, String>,
    ) -> Result<Value> {
        self.host
            .http()
            .await?
            .post_multipart_file("/inference", audio, fields)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lmn_domain::model::ModelEntry;
    use lmn_domain::options::RecipeOptions;

    fn ctx(npu_cache: Option<&Path>) -> LoadContext {
        let mut entry = ModelEntry::new("w", Recipe::WhisperCpp, "ggml/whisper");
        entry
            .resolved_paths
            .insert(role::MAIN.into(), "/models/ggml-base.bin".into());
        if let Some(cache) = npu_cache {
            entry
                .resolved_paths
                .insert(role::NPU_CACHE.into(), cache.to_string_lossy().into_owned());
        }
        LoadContext {
            model_name: "w".into(),
            entry,
            options: RecipeOptions::default(),
            do_not_upgrade: true,
        }
    }

    #[test]
    fn npu_backend_requires_compiled_cache() {
        let err = WhisperEngine::check_npu_cache(&ctx(None), "npu").unwrap_err();
        assert!(err.to_string().contains("pull the model again"));

        // CPU backend does not care.
        WhisperEngine::check_npu_cache(&ctx(None), "cpu").unwrap();

        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("model.npu.bin");
        std::fs::write(&cache, b"x").unwrap();
        WhisperEngine::check_npu_cache(&ctx(Some(&cache)), "npu").unwrap();
    }
}
