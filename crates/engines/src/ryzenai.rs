//! NPU/hybrid LLM adapter (Ryzen AI OGA server).

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use lmn_domain::config::{env, EngineConfig};
use lmn_domain::model::Recipe;
use lmn_domain::{Error, Result};
use lmn_hardware::HardwareSnapshot;

use crate::adapter::{ByteStream, Engine, LoadContext, Operation};
use crate::host::ProcessHost;
use crate::install;
use crate::process::{self, SpawnSpec};

const CAPS: &[Operation] = &[
    Operation::ChatCompletion,
    Operation::Completion,
    Operation::Responses,
];

/// Oldest NPU driver the engine runs against.
const MIN_NPU_DRIVER: &str = "2.5.0";

pub struct RyzenAiEngine {
    cache_root: PathBuf,
    config: EngineConfig,
    snapshot: Arc<HardwareSnapshot>,
    default_backend: &'static str,
    host: ProcessHost,
}

impl RyzenAiEngine {
    pub fn new(
        cache_root: PathBuf,
        config: EngineConfig,
        snapshot: Arc<HardwareSnapshot>,
        default_backend: &'static str,
    ) -> Self {
        Self {
            cache_root,
            config,
            snapshot,
            default_backend,
            host: ProcessHost::new(),
        }
    }

    /// The engine hard-crashes on old NPU drivers; fail the install with
    /// an actionable message instead.
    fn check_driver(&self) -> Result<()> {
        if env::skip_processor_check() {
            return Ok(());
        }
        let driver = self.snapshot.npu.driver.as_deref().unwrap_or("");
        if driver.is_empty() {
            // Probe could not read the version; let the engine try.
            return Ok(());
        }
        if driver_lt(driver, MIN_NPU_DRIVER) {
            return Err(Error::Engine(format!(
                "NPU driver {driver} is older than the required {MIN_NPU_DRIVER}; \
                 update the driver or set RYZENAI_SKIP_PROCESSOR_CHECK=1 to bypass"
            )));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Engine for RyzenAiEngine {
    fn recipe(&self) -> Recipe {
        Recipe::RyzenAiLlm
    }

    fn capabilities(&self) -> &'static [Operation] {
        CAPS
    }

    async fn load(&self, ctx: &LoadContext) -> Result<()> {
        self.check_driver()?;

        let backend = ctx
            .options
            .get_str("backend")
            .unwrap_or(self.default_backend)
            .to_string();
        let binary = install::ensure_installed(
            &self.cache_root,
            Recipe::RyzenAiLlm,
            &backend,
            Duration::from_secs(self.config.install_timeout_sec),
        )
        .await?;

        let model_dir = ctx.entry.main_path();
        if model_dir.is_empty() || !Path::new(model_dir).is_dir() {
            return Err(Error::FileNotFound(format!(
                "{}: No such file: {model_dir}",
                ctx.model_name
            )));
        }

        let port = process::pick_port().await?;
        let mut argv = vec![
            "--model".to_string(),
            model_dir.to_string(),
            "--port".to_string(),
            port.to_string(),
            "--device".to_string(),
            backend,
        ];
        if let Some(ctx_size) = ctx.options.get_int("ctx_size") {
            argv.push("--ctx-size".to_string());
            argv.push(ctx_size.to_string());
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

fn driver_lt(a: &str, b: &str) -> bool {
    let parse = |v: &str| -> Vec<u64> {
        v.split('.').map(|seg| seg.parse().unwrap_or(0)).collect()
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
    use lmn_hardware::probe::DeviceInfo;

    fn engine_with_driver(driver: Option<&str>) -> RyzenAiEngine {
        let mut snapshot = HardwareSnapshot::default();
        snapshot.npu = DeviceInfo {
            name: "AMD NPU".into(),
            family: "XDNA2".into(),
            available: true,
            driver: driver.map(String::from),
            ..Default::default()
        };
        RyzenAiEngine::new(
            PathBuf::from("/tmp"),
            EngineConfig::default(),
            Arc::new(snapshot),
            "npu",
        )
    }

    #[test]
    fn old_driver_fails_with_guidance() {
        let err = engine_with_driver(Some("2.4.9")).check_driver().unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("2.4.9"));
        assert!(msg.contains("RYZENAI_SKIP_PROCESSOR_CHECK"));
    }

    #[test]
    fn new_or_unknown_driver_passes() {
        assert!(engine_with_driver(Some("2.5.0")).check_driver().is_ok());
        assert!(engine_with_driver(Some("3.0.1")).check_driver().is_ok());
        assert!(engine_with_driver(None).check_driver().is_ok());
    }

    #[test]
    fn driver_compare_is_numeric() {
        assert!(driver_lt("2.9.0", "2.10.0"));
        assert!(!driver_lt("2.10.0", "2.9.0"));
    }
}
