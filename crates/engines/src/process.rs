//! Engine subprocess supervision: port selection, spawn, readiness
//! polling, and teardown.
//!
//! Engine stdout/stderr are drained into a bounded ring of recent lines so
//! a failed startup can report what the engine actually said.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};

use lmn_domain::{Error, Result};

use crate::http::EngineHttp;

/// Lines of engine output retained for diagnostics.
const OUTPUT_RING: usize = 200;

const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Ask the OS for a free localhost port. The listener is dropped before
/// the engine starts; the window where another process could steal the
/// port is accepted, as the engine will fail loudly if it loses the race.
pub async fn pick_port() -> Result<u16> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    Ok(listener.local_addr()?.port())
}

/// What to launch and how to know it is up.
pub struct SpawnSpec {
    pub binary: PathBuf,
    pub args: Vec<String>,
    pub envs: Vec<(String, String)>,
    pub port: u16,
    /// Path polled until it answers 2xx.
    pub health_endpoint: &'static str,
    pub ready_timeout: Duration,
}

/// A live engine subprocess.
#[derive(Debug)]
pub struct EngineProcess {
    child: Child,
    port: u16,
    output: Arc<Mutex<VecDeque<String>>>,
}

impl EngineProcess {
    /// Spawn the engine and poll its health endpoint until ready. On
    /// timeout or early exit the process is reaped and the recent output
    /// tail is folded into the error.
    pub async fn spawn(spec: SpawnSpec) -> Result<Self> {
        tracing::info!(
            binary = %spec.binary.display(),
            port = spec.port,
            "starting engine subprocess"
        );

        let mut command = Command::new(&spec.binary);
        command
            .args(&spec.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(Stdio::null())
            .kill_on_drop(true);
        for (key, value) in &spec.envs {
            command.env(key, value);
        }

        let mut child = command.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::FileNotFound(format!("{}: No such file", spec.binary.display()))
            } else {
                Error::ModelLoadError(format!("spawning {}: {e}", spec.binary.display()))
            }
        })?;

        let output = Arc::new(Mutex::new(VecDeque::new()));
        if let Some(stdout) = child.stdout.take() {
            drain_into(stdout, output.clone(), "stdout");
        }
        if let Some(stderr) = child.stderr.take() {
            drain_into(stderr, output.clone(), "stderr");
        }

        let mut process = Self {
            child,
            port: spec.port,
            output,
        };

        let http = EngineHttp::new(spec.port)?;
        let deadline = Instant::now() + spec.ready_timeout;
        loop {
            if http.is_healthy(spec.health_endpoint).await {
                tracing::info!(port = spec.port, "engine ready");
                return Ok(process);
            }
            if let Ok(Some(status)) = process.child.try_wait() {
                return Err(Error::ModelLoadError(format!(
                    "engine exited with {status} before becoming ready: {}",
                    process.output_tail()
                )));
            }
            if Instant::now() >= deadline {
                process.child.kill().await.ok();
                return Err(Error::ModelLoadError(format!(
                    "engine did not become ready within {:?}: {}",
                    spec.ready_timeout,
                    process.output_tail()
                )));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Recent engine output, newest last.
    pub fn output_tail(&self) -> String {
        let lines = self.output.lock();
        lines
            .iter()
            .rev()
            .take(20)
            .rev()
            .cloned()
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// True when any retained output line contains `marker`
    /// (case-insensitive).
    pub fn output_contains(&self, marker: &str) -> bool {
        let needle = marker.to_ascii_lowercase();
        self.output
            .lock()
            .iter()
            .any(|l| l.to_ascii_lowercase().contains(&needle))
    }

    /// Terminate and reap. Waits up to `grace` for the exit.
    pub async fn terminate(mut self, grace: Duration) {
        self.child.kill().await.ok();
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(port = self.port, %status, "engine stopped");
            }
            Ok(Err(e)) => {
                tracing::warn!(port = self.port, error = %e, "engine reap failed");
            }
            Err(_) => {
                tracing::warn!(port = self.port, "engine did not exit within grace period");
            }
        }
    }
}

fn drain_into(
    reader: impl AsyncRead + Unpin + Send + 'static,
    output: Arc<Mutex<VecDeque<String>>>,
    stream: &'static str,
) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!(target: "lmn_engines::subprocess", %stream, "{line}");
            let mut ring = output.lock();
            if ring.len() >= OUTPUT_RING {
                ring.pop_front();
            }
            ring.push_back(line);
        }
    });
}
