//! GGUF LLM adapter (llama.cpp's `llama-server`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::Value;

use lmn_domain::config::EngineConfig;
use lmn_domain::model::{role, ModelType, Recipe};
use lmn_domain::{Error, Result};

use crate::adapter::{ByteStream, Engine, LoadContext, Operation};
use crate::args;
use crate::host::ProcessHost;
use crate::install;
use crate::process::{self, SpawnSpec};

const CAPS: &[Operation] = &[
    Operation::ChatCompletion,
    Operation::Completion,
    Operation::Responses,
    Operation::Embeddings,
    Operation::Reranking,
];

/// Flags the adapter owns; custom args naming them are rejected.
const RESERVED: &[&str] = &[
    "--model",
    "-m",
    "--port",
    "--host",
    "--mmproj",
    "--embeddings",
    "--reranking",
    "--jinja",
    "--no-webui",
];

const DEFAULT_CTX_SIZE: i64 = 4096;

/// Embedding models need room for batched inputs.
const MIN_EMBEDDING_CTX: i64 = 8192;

pub struct LlamaCppEngine {
    cache_root: PathBuf,
    config: EngineConfig,
    default_backend: &'static str,
    host: ProcessHost,
}

impl LlamaCppEngine {
    pub fn new(cache_root: PathBuf, config: EngineConfig, default_backend: &'static str) -> Self {
        Self {
            cache_root,
            config,
            default_backend,
            host: ProcessHost::new(),
        }
    }

    fn build_args(&self, ctx: &LoadContext, port: u16, backend: &str) -> Result<Vec<String>> {
        let model_path = ctx.entry.main_path();
        if model_path.is_empty() || !Path::new(model_path).exists() {
            return Err(Error::FileNotFound(format!(
                "{}: No such file: {model_path}",
                ctx.model_name
            )));
        }

        let mut ctx_size = ctx
            .options
            .get_int("ctx_size")
            .unwrap_or(DEFAULT_CTX_SIZE);
        if ctx.entry.model_type == ModelType::Embedding {
            ctx_size = ctx_size.max(MIN_EMBEDDING_CTX);
        }

        let mut argv: Vec<String> = vec![
            "--model".into(),
            model_path.into(),
            "--host".into(),
            "127.0.0.1".into(),
            "--port".into(),
            port.to_string(),
            "--ctx-size".into(),
            ctx_size.to_string(),
            "--jinja".into(),
            "--no-webui".into(),
        ];

        if backend != "cpu" {
            let gpu_layers = ctx.options.get_int("gpu_layers").unwrap_or(99);
            argv.push("-ngl".into());
            argv.push(gpu_layers.to_string());
            argv.push("--context-shift".into());
        }

        if let Some(mmproj) = ctx.entry.resolved_paths.get(role::MMPROJ) {
            if !mmproj.is_empty() {
                argv.push("--mmproj".into());
                argv.push(mmproj.clone());
            }
        }

        match ctx.entry.model_type {
            ModelType::Embedding => argv.push("--embeddings".into()),
            ModelType::Reranking => argv.push("--reranking".into()),
            _ => {}
        }

        if let Some(custom) = ctx.options.get_str("custom_args") {
            argv.extend(args::parse_custom(custom, RESERVED)?);
        }
        Ok(argv)
    }
}

#[async_trait::async_trait]
impl Engine for LlamaCppEngine {
    fn recipe(&self) -> Recipe {
        Recipe::LlamaCpp
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
            Recipe::LlamaCpp,
            &backend,
            Duration::from_secs(self.config.install_timeout_sec),
        )
        .await?;

        let port = process::pick_port().await?;
        let argv = self.build_args(ctx, port, &backend)?;
        self.host
            .start(SpawnSpec {
                binary,
                args: argv,
                envs: vec![],
                port,
                health_endpoint: "/health",
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

    async fn forward_json(&self, op: Operation, mut body: Value) -> Result<Value> {
        translate_max_tokens(&mut body);
        self.host.http().await?.post_json(op.endpoint(), &body).await
    }

    async fn forward_stream(&self, op: Operation, body: Vec<u8>) -> Result<ByteStream> {
        self.host.http().await?.post_stream(op.endpoint(), body).await
    }
}

/// OpenAI's newer `max_completion_tokens` field name; llama-server speaks
/// the older `max_tokens`.
fn translate_max_tokens(body: &mut Value) {
    if let Some(max) = body.get("max_completion_tokens").cloned() {
        if let Some(obj) = body.as_object_mut() {
            obj.remove("max_completion_tokens");
            obj.entry("max_tokens").or_insert(max);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lmn_domain::model::ModelEntry;
    use lmn_domain::options::{OptionValue, RecipeOptions};

    fn ctx_with(model_file: &Path, options: RecipeOptions, model_type_label: Option<&str>) -> LoadContext {
        let mut entry = ModelEntry::new("m", Recipe::LlamaCpp, "org/repo:Q4");
        entry
            .resolved_paths
            .insert(role::MAIN.into(), model_file.to_string_lossy().into_owned());
        if let Some(label) = model_type_label {
            entry.labels.insert(label.to_string());
            entry.refresh_derived();
        }
        LoadContext {
            model_name: "m".into(),
            entry,
            options,
            do_not_upgrade: true,
        }
    }

    fn engine() -> LlamaCppEngine {
        LlamaCppEngine::new(PathBuf::from("/tmp"), EngineConfig::default(), "cpu")
    }

    #[test]
    fn args_for_cpu_backend() {
        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("m.gguf");
        std::fs::write(&model, b"x").unwrap();

        let argv = engine()
            .build_args(&ctx_with(&model, RecipeOptions::default(), None), 9001, "cpu")
            .unwrap();
        assert!(argv.contains(&"--jinja".to_string()));
        assert!(argv.contains(&"--no-webui".to_string()));
        assert!(argv.contains(&"9001".to_string()));
        assert!(!argv.contains(&"-ngl".to_string()));
        assert!(!argv.contains(&"--context-shift".to_string()));
    }

    #[test]
    fn gpu_backend_adds_layers_and_context_shift() {
        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("m.gguf");
        std::fs::write(&model, b"x").unwrap();

        let argv = engine()
            .build_args(&ctx_with(&model, RecipeOptions::default(), None), 9001, "vulkan")
            .unwrap();
        let ngl = argv.iter().position(|a| a == "-ngl").unwrap();
        assert_eq!(argv[ngl + 1], "99");
        assert!(argv.contains(&"--context-shift".to_string()));
    }

    #[test]
    fn embedding_model_bumps_ctx_and_flag() {
        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("m.gguf");
        std::fs::write(&model, b"x").unwrap();

        let mut options = RecipeOptions::default();
        options.insert("ctx_size", OptionValue::Int(2048));
        let argv = engine()
            .build_args(&ctx_with(&model, options, Some("embeddings")), 9001, "cpu")
            .unwrap();
        assert!(argv.contains(&"--embeddings".to_string()));
        let pos = argv.iter().position(|a| a == "--ctx-size").unwrap();
        assert_eq!(argv[pos + 1], "8192");
    }

    #[test]
    fn missing_model_file_is_file_not_found() {
        let err = engine()
            .build_args(
                &ctx_with(Path::new("/nope/m.gguf"), RecipeOptions::default(), None),
                9001,
                "cpu",
            )
            .unwrap_err();
        assert!(matches!(err, Error::FileNotFound(_)));
    }

    #[test]
    fn reserved_custom_arg_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("m.gguf");
        std::fs::write(&model, b"x").unwrap();

        let mut options = RecipeOptions::default();
        options.insert("custom_args", OptionValue::Str("--port 1".into()));
        let err = engine()
            .build_args(&ctx_with(&model, options, None), 9001, "cpu")
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[test]
    fn max_completion_tokens_is_translated() {
        let mut body = serde_json::json!({"model": "m", "max_completion_tokens": 64});
        translate_max_tokens(&mut body);
        assert_eq!(body["max_tokens"], 64);
        assert!(body.get("max_completion_tokens").is_none());

        // An explicit max_tokens wins.
        let mut body = serde_json::json!({"max_tokens": 10, "max_completion_tokens": 64});
        translate_max_tokens(&mut body);
        assert_eq!(body["max_tokens"], 10);
    }
}
