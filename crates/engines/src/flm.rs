//! NPU-only LLM adapter (FLM engine).
//!
//! FLM addresses models by its own checkpoint tags, so the `model` field
//! of every forwarded request is rewritten from the gateway's model name
//! to the engine-native tag. The "model invalidated by engine upgrade"
//! signal only exists as text in the engine's startup output; detection is
//! deliberately confined to this adapter.

use std::path::PathBuf;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;

use lmn_domain::config::EngineConfig;
use lmn_domain::model::Recipe;
use lmn_domain::{Error, Result};

use crate::adapter::{ByteStream, Engine, LoadContext, Operation};
use crate::host::ProcessHost;
use crate::install;
use crate::process::{self, SpawnSpec};

const CAPS: &[Operation] = &[
    Operation::ChatCompletion,
    Operation::Completion,
    Operation::Responses,
];

/// Substrings the engine prints when an upgrade orphaned its checkpoints.
const INVALIDATED_MARKERS: &[&str] = &["model invalidated", "requires re-download"];

pub struct FlmEngine {
    cache_root: PathBuf,
    config: EngineConfig,
    host: ProcessHost,
    /// Engine-native checkpoint tag, set at load.
    checkpoint: Mutex<Option<String>>,
}

impl FlmEngine {
    pub fn new(cache_root: PathBuf, config: EngineConfig) -> Self {
        Self {
            cache_root,
            config,
            host: ProcessHost::new(),
            checkpoint: Mutex::new(None),
        }
    }

    fn rewrite_model(&self, body: &mut Value) -> Result<()> {
        let tag = self
            .checkpoint
            .lock()
            .clone()
            .ok_or_else(|| Error::ModelNotLoaded("flm engine has no checkpoint".into()))?;
        if let Some(obj) = body.as_object_mut() {
            obj.insert("model".into(), Value::String(tag));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Engine for FlmEngine {
    fn recipe(&self) -> Recipe {
        Recipe::Flm
    }

    fn capabilities(&self) -> &'static [Operation] {
        CAPS
    }

    async fn load(&self, ctx: &LoadContext) -> Result<()> {
        let binary = install::ensure_installed(
            &self.cache_root,
            Recipe::Flm,
            "npu",
            Duration::from_secs(self.config.install_timeout_sec),
        )
        .await?;

        let checkpoint = ctx.entry.main_checkpoint().to_string();
        let port = process::pick_port().await?;
        let mut argv = vec![
            "serve".to_string(),
            checkpoint.clone(),
            "--port".to_string(),
            port.to_string(),
        ];
        if let Some(ctx_size) = ctx.options.get_int("ctx_size") {
            argv.push("--ctx-size".to_string());
            argv.push(ctx_size.to_string());
        }

        let result = self
            .host
            .start(SpawnSpec {
                binary,
                args: argv,
                envs: vec![],
                port,
                health_endpoint: "/health",
                ready_timeout: Duration::from_secs(self.config.load_timeout_sec),
            })
            .await;

        match result {
            Ok(()) => {
                *self.checkpoint.lock() = Some(checkpoint);
                Ok(())
            }
            Err(Error::ModelLoadError(msg)) if is_invalidated(&msg) => {
                Err(Error::ModelInvalidated(format!(
                    "{checkpoint}: the engine upgrade invalidated this checkpoint, pull it again"
                )))
            }
            Err(e) => Err(e),
        }
    }

    async fn unload(&self) -> Result<()> {
        self.host
            .stop(Duration::from_secs(self.config.unload_timeout_sec))
            .await;
        *self.checkpoint.lock() = None;
        Ok(())
    }

    async fn forward_json(&self, op: Operation, mut body: Value) -> Result<Value> {
        self.rewrite_model(&mut body)?;
        self.host.http().await?.post_json(op.endpoint(), &body).await
    }

    async fn forward_stream(&self, op: Operation, body: Vec<u8>) -> Result<ByteStream> {
        // Streamed bodies get the same rewrite; they are JSON up front
        // even when the response is SSE.
        let mut parsed: Value = serde_json::from_slice(&body)
            .map_err(|e| Error::InvalidRequest(format!("request body is not JSON: {e}")))?;
        self.rewrite_model(&mut parsed)?;
        let body = serde_json::to_vec(&parsed)?;
        self.host.http().await?.post_stream(op.endpoint(), body).await
    }
}

fn is_invalidated(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    INVALIDATED_MARKERS.iter().any(|m| lower.contains(m))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalidation_markers_match_case_insensitively() {
        assert!(is_invalidated("engine: Model Invalidated after upgrade"));
        assert!(is_invalidated("checkpoint requires re-download"));
        assert!(!is_invalidated("engine crashed"));
    }

    #[test]
    fn rewrite_requires_a_loaded_checkpoint() {
        let engine = FlmEngine::new(PathBuf::from("/tmp"), EngineConfig::default());
        let mut body = serde_json::json!({"model": "gateway-name"});
        assert!(engine.rewrite_model(&mut body).is_err());

        *engine.checkpoint.lock() = Some("llama3.2:1b".into());
        engine.rewrite_model(&mut body).unwrap();
        assert_eq!(body["model"], "llama3.2:1b");
    }
}
