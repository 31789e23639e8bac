//! Shared application state passed to all API handlers.

use std::sync::Arc;

use tracing_subscriber::{reload, EnvFilter, Registry};

use lmn_artifacts::ArtifactStore;
use lmn_catalog::Catalog;
use lmn_domain::config::Config;
use lmn_hardware::{HardwareSnapshot, SupportFilter};
use lmn_scheduler::Scheduler;

/// Handle for runtime log-level changes (`POST /log-level`).
pub type LogReload = reload::Handle<EnvFilter, Registry>;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub catalog: Arc<Catalog>,
    pub scheduler: Arc<Scheduler>,
    pub artifacts: Arc<ArtifactStore>,
    pub filter: SupportFilter,
    pub snapshot: Arc<HardwareSnapshot>,
    /// SHA-256 of `LEMONADE_API_KEY`, read once at startup. `None` means
    /// auth is disabled.
    pub api_key_hash: Option<Arc<Vec<u8>>>,
    pub log_reload: LogReload,
}
