//! Image-generation adapter (stable-diffusion.cpp server).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::Value;

use lmn_domain::config::EngineConfig;
use lmn_domain::model::{ImageDefaults, Recipe};
use lmn_domain::{Error, Result};

use crate::adapter::{ByteStream, Engine, LoadContext, Operation};
use crate::host::ProcessHost;
use crate::install;
use crate::process::{self, SpawnSpec};

use parking_lot::Mutex;

const CAPS: &[Operation] = &[Operation::ImageGenerations];

pub struct SdCppEngine {
    cache_root: PathBuf,
    config: EngineConfig,
    default_backend: &'static str,
    host: ProcessHost,
    /// Per-model generation defaults, captured at load.
    defaults: Mutex<ImageDefaults>,
}

impl SdCppEngine {
    pub fn new(cache_root: PathBuf, config: EngineConfig, default_backend: &'static str) -> Self {
        Self {
            cache_root,
            config,
            default_backend,
            host: ProcessHost::new(),
            defaults: Mutex::new(ImageDefaults::default()),
        }
    }
}

#[async_trait::async_trait]
impl Engine for SdCppEngine {
    fn recipe(&self) -> Recipe {
        Recipe::SdCpp
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
            Recipe::SdCpp,
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

        *self.defaults.lock() = ctx.entry.image_defaults.unwrap_or_default();

        let port = process::pick_port().await?;
        let mut argv = vec![
            "--model".to_string(),
            model_path.to_string(),
            "--port".to_string(),
            port.to_string(),
        ];
        if let Some(threads) = ctx.options.get_int("threads") {
            argv.push("--threads".to_string());
            argv.push(threads.to_string());
        }

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
        if op == Operation::ImageGenerations {
            apply_image_defaults(&mut body, &self.defaults.lock());
        }
        self.host.http().await?.post_json(op.endpoint(), &body).await
    }

    async fn forward_stream(&self, op: Operation, body: Vec<u8>) -> Result<ByteStream> {
        self.host.http().await?.post_stream(op.endpoint(), body).await
    }
}

/// Fill generation parameters the request left out from the model's
/// declared defaults.
fn apply_image_defaults(body: &mut Value, defaults: &ImageDefaults) {
    let Some(obj) = body.as_object_mut() else {
        return;
    };
    obj.entry("steps").or_insert(defaults.steps.into());
    obj.entry("cfg_scale")
        .or_insert(Value::from(defaults.cfg_scale as f64));
    obj.entry("width").or_insert(defaults.width.into());
    obj.entry("height").or_insert(defaults.height.into());
}
