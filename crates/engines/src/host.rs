//! Shared subprocess slot used by every adapter.

use std::time::Duration;

use tokio::sync::Mutex;

use lmn_domain::{Error, Result};

use crate::http::EngineHttp;
use crate::process::{EngineProcess, SpawnSpec};

/// At most one running engine per adapter, behind a lock so `load`,
/// `unload`, and forwarding can share `&self`.
pub(crate) struct ProcessHost {
    state: Mutex<Option<Running>>,
}

struct Running {
    process: EngineProcess,
    http: EngineHttp,
}

impl ProcessHost {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(None),
        }
    }

    /// Spawn per `spec`, replacing (and stopping) any previous process.
    pub async fn start(&self, spec: SpawnSpec) -> Result<()> {
        let port = spec.port;
        let process = EngineProcess::spawn(spec).await?;
        let http = EngineHttp::new(port)?;
        let previous = self.state.lock().await.replace(Running { process, http });
        if let Some(previous) = previous {
            tracing::warn!("engine was already running, stopping the old process");
            previous.process.terminate(Duration::from_secs(5)).await;
        }
        Ok(())
    }

    /// Stop the process if one is running. Idempotent.
    pub async fn stop(&self, grace: Duration) {
        if let Some(running) = self.state.lock().await.take() {
            running.process.terminate(grace).await;
        }
    }

    /// Client for the running engine.
    pub async fn http(&self) -> Result<EngineHttp> {
        self.state
            .lock()
            .await
            .as_ref()
            .map(|r| r.http.clone())
            .ok_or_else(|| Error::ModelNotLoaded("engine subprocess is not running".into()))
    }
}
