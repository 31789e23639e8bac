//! Text-to-speech adapter (kokoro server).
//!
//! Speech output always goes through the streaming path: the engine sends
//! PCM (or an encoded container) progressively and the gateway relays it
//! whether or not the client asked for `stream`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::Value;

use lmn_domain::config::EngineConfig;
use lmn_domain::model::Recipe;
use lmn_domain::{Error, Result};

use crate::adapter::{ByteStream, Engine, LoadContext, Operation};
use crate::host::ProcessHost;
use crate::install;
use crate::process::{self, SpawnSpec};

const CAPS: &[Operation] = &[Operation::AudioSpeech];

pub struct KokoroEngine {
    cache_root: PathBuf,
    config: EngineConfig,
    host: ProcessHost,
}

impl KokoroEngine {
    pub fn new(cache_root: PathBuf, config: EngineConfig) -> Self {
        Self {
            cache_root,
            config,
            host: ProcessHost::new(),
        }
    }
}

#[async_trait::async_trait]
impl Engine for KokoroEngine {
    fn recipe(&self) -> Recipe {
        Recipe::Kokoro
    }

    fn capabilities(&self) -> &'static [Operation] {
        CAPS
    }

    async fn load(&self, ctx: &LoadContext) -> Result<()> {
        let binary = install::ensure_installed(
            &self.cache_root,
            Recipe::Kokoro,
            "cpu",
            Duration::from_secs(self.config.install_timeout_sec),
        )
        .await?;

        // The main checkpoint resolves to the voice index file.
        let index = ctx.entry.main_path();
        if index.is_empty() || !Path::new(index).exists() {
            return Err(Error::FileNotFound(format!(
                "{}: No such file: {index}",
                ctx.model_name
            )));
        }

        let port = process::pick_port().await?;
        let mut argv = vec![
            "--voices-index".to_string(),
            index.to_string(),
            "--port".to_string(),
            port.to_string(),
        ];
        if let Some(voice) = ctx.options.get_str("voice") {
            argv.push("--default-voice".to_string());
            argv.push(voice.to_string());
        }
        if let Some(speed) = ctx.options.get("speed").and_then(|v| v.as_float()) {
            argv.push("--speed".to_string());
            argv.push(speed.to_string());
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

    async fn forward_json(&self, op: Operation, body: Value) -> Result<Value> {
        self.host.http().await?.post_json(op.endpoint(), &body).await
    }

    async fn forward_stream(&self, op: Operation, body: Vec<u8>) -> Result<ByteStream> {
        self.host.http().await?.post_stream(op.endpoint(), body).await
    }
}
