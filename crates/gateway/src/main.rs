use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use axum::http::{HeaderValue, Method};
use clap::Parser;
use sha2::{Digest, Sha256};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter};

use lmn_artifacts::ArtifactStore;
use lmn_catalog::{Catalog, CatalogPaths};
use lmn_domain::config::{env as lmn_env, Config, ConfigSeverity};
use lmn_domain::model::{ModelEntry, Recipe};
use lmn_engines::install;
use lmn_engines::EngineFactory;
use lmn_gateway::state::{AppState, LogReload};
use lmn_gateway::{api, VERSION};
use lmn_hardware::SupportFilter;
use lmn_scheduler::{AdapterFactory, Scheduler};

#[derive(Parser)]
#[command(name = "lemonade-server", version, about = "Local OpenAI-compatible inference gateway")]
struct Cli {
    /// Path to lemonade.toml. Defaults are used when absent.
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Run the gateway (default).
    Serve,
    /// Print the version and exit.
    Version,
}

/// Bridges the engines crate's factory into the scheduler's trait.
struct Factory(EngineFactory);

impl AdapterFactory for Factory {
    fn create(&self, entry: &ModelEntry) -> lmn_domain::Result<Box<dyn lmn_engines::Engine>> {
        self.0.create(entry)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Some(Command::Version) => {
            println!("lemonade-server {VERSION}");
            Ok(())
        }
        None | Some(Command::Serve) => {
            let log_reload = init_tracing();
            let config = load_config(cli.config.as_deref())?;
            run_server(Arc::new(config), log_reload).await
        }
    }
}

/// Structured JSON tracing with a reloadable filter for `POST /log-level`.
fn init_tracing() -> LogReload {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,lmn_gateway=debug"));
    let (filter_layer, handle) = reload::Layer::new(filter);
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(tracing_subscriber::fmt::layer().json())
        .init();
    handle
}

fn load_config(path: Option<&std::path::Path>) -> anyhow::Result<Config> {
    let path = path
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("lemonade.toml"));
    if !path.exists() {
        return Ok(Config::default());
    }
    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("reading {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

async fn run_server(config: Arc<Config>, log_reload: LogReload) -> anyhow::Result<()> {
    tracing::info!(version = VERSION, "lemonade starting");

    // ── Config validation ────────────────────────────────────────────
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
        anyhow::bail!(
            "config validation failed with {} error(s)",
            issues
                .iter()
                .filter(|i| i.severity == ConfigSeverity::Error)
                .count()
        );
    }

    let cache_root = config.cache_root();
    std::fs::create_dir_all(&cache_root)
        .with_context(|| format!("creating cache root {}", cache_root.display()))?;
    tracing::info!(path = %cache_root.display(), "cache root ready");

    // ── Hardware snapshot (cached across restarts) ───────────────────
    let snapshot = {
        let cache_root = cache_root.clone();
        tokio::task::spawn_blocking(move || {
            lmn_hardware::load_or_probe(&cache_root, VERSION, || {
                install::cleanup_below_floor(&cache_root, install::ENGINE_FLOOR_VERSION)
            })
        })
        .await
        .context("hardware probe panicked")?
    };
    let snapshot = Arc::new(snapshot);
    let filter = SupportFilter::new(snapshot.clone());
    tracing::info!(
        igpu = snapshot.integrated_gpu.available,
        dgpus = snapshot.discrete_gpus.len(),
        npu = snapshot.npu.available,
        memory_gb = snapshot.physical_memory_gb,
        "hardware snapshot ready"
    );

    // ── Catalog ──────────────────────────────────────────────────────
    let paths = CatalogPaths::under(&cache_root, config.paths.extra_models_dir.clone());
    let hub_cache = paths.hub_cache.clone();
    let catalog = Arc::new(
        Catalog::open(paths, filter.clone(), config.catalog.strict_variant_match)
            .context("loading model catalog")?,
    );
    tracing::info!(models = catalog.list(true).len(), "catalog ready");

    // ── Artifact store ───────────────────────────────────────────────
    let artifacts = Arc::new(
        ArtifactStore::new(hub_cache, config.catalog.strict_variant_match)
            .context("initializing artifact store")?,
    );
    if lmn_env::offline() {
        tracing::warn!("LEMONADE_OFFLINE is set, downloads are disabled");
    }
    tracing::info!("artifact store ready");

    // ── FLM checkpoint state (engine-owned) ──────────────────────────
    refresh_flm_state(&catalog, &filter, &cache_root).await;

    // ── Scheduler ────────────────────────────────────────────────────
    let factory = EngineFactory::new(cache_root.clone(), config.engine, filter.clone());
    let defaults = Recipe::ALL
        .iter()
        .map(|r| (*r, config.defaults_for(*r)))
        .collect();
    let scheduler = Arc::new(Scheduler::new(
        config.limits,
        defaults,
        Arc::new(Factory(factory)) as Arc<dyn AdapterFactory>,
    ));
    tracing::info!(
        llm = config.limits.llm,
        embedding = config.limits.embedding,
        audio = config.limits.audio,
        "scheduler ready"
    );

    // ── API key (read once, hash for constant-time comparison) ───────
    let api_key_hash = match lmn_env::api_key() {
        Some(key) => {
            tracing::info!("bearer-token auth enabled on /api, /v0, /v1");
            Some(Arc::new(Sha256::digest(key.as_bytes()).to_vec()))
        }
        None => {
            tracing::warn!("LEMONADE_API_KEY not set, auth disabled");
            None
        }
    };

    let state = AppState {
        config: config.clone(),
        catalog,
        scheduler: scheduler.clone(),
        artifacts,
        filter,
        snapshot,
        api_key_hash,
        log_reload,
    };

    // ── Router ───────────────────────────────────────────────────────
    let app = api::router(state)
        .layer(build_cors_layer(&config.server.allowed_origins))
        .layer(tower::limit::ConcurrencyLimitLayer::new(256))
        .layer(tower_http::trace::TraceLayer::new_for_http());

    // ── Bind ─────────────────────────────────────────────────────────
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    tracing::info!(addr = %addr, "lemonade listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
        })
        .await
        .context("axum server error")?;

    // Unload every engine in sequence before exiting.
    scheduler.evict_all().await;
    tracing::info!("all engines stopped, bye");
    Ok(())
}

/// The FLM engine owns its checkpoint store: ask it what is pulled, but
/// only when the binary is already installed (never download at startup).
async fn refresh_flm_state(catalog: &Catalog, filter: &SupportFilter, cache_root: &std::path::Path) {
    if filter.supported_backends(Recipe::Flm).is_empty() {
        return;
    }
    let binary = lmn_env::bin_override(Recipe::Flm, Some("npu")).or_else(|| {
        let release = install::release_for(Recipe::Flm, "npu");
        let cached = install::install_dir(cache_root, Recipe::Flm, "npu").join(release.binary_name);
        cached.is_file().then_some(cached)
    });
    let Some(binary) = binary else {
        tracing::debug!("flm engine not installed yet, skipping checkpoint refresh");
        return;
    };
    match lmn_artifacts::flm::FlmRunner::new(binary).installed().await {
        Ok(installed) => catalog.refresh_flm(&installed),
        Err(e) => tracing::warn!(error = %e, "flm checkpoint refresh failed"),
    }
}

/// CORS from the configured origins. A trailing `:*` matches any port on
/// that host; a literal `*` allows everything.
fn build_cors_layer(allowed_origins: &[String]) -> CorsLayer {
    use axum::http::header;

    if allowed_origins.len() == 1 && allowed_origins[0] == "*" {
        tracing::warn!("CORS configured with wildcard \"*\", all origins allowed");
        return CorsLayer::new()
            .allow_origin(tower_http::cors::Any)
            .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
            .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);
    }

    let mut exact: Vec<HeaderValue> = Vec::new();
    let mut wildcard_prefixes: Vec<String> = Vec::new();
    for origin in allowed_origins {
        if origin.ends_with(":*") {
            wildcard_prefixes.push(origin.trim_end_matches('*').to_owned());
        } else if let Ok(hv) = origin.parse::<HeaderValue>() {
            exact.push(hv);
        } else {
            tracing::warn!(origin = %origin, "invalid CORS origin, skipping");
        }
    }

    let allow_origin = if wildcard_prefixes.is_empty() {
        AllowOrigin::list(exact)
    } else {
        AllowOrigin::predicate(move |origin, _| {
            if exact.iter().any(|e| e.as_bytes() == origin.as_bytes()) {
                return true;
            }
            let origin_str = origin.to_str().unwrap_or("");
            // The remainder after the prefix must be digits only, so
            // "http://localhost:3000.evil.com" cannot sneak through.
            wildcard_prefixes.iter().any(|prefix| {
                origin_str
                    .strip_prefix(prefix.as_str())
                    .map(|port| !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()))
                    .unwrap_or(false)
            })
        })
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
}
