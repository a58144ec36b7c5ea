use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    middleware,
    routing::{delete, get, post},
    Router,
};
use directories::ProjectDirs;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::{
    auth::require_actor,
    handlers::{
        create_public_secret, create_secret, delete_secret, get_secret, health, list_secrets,
    },
    policy::MembershipGate,
    sharing::SharingEngine,
    store::{Store, DEFAULT_SWEEP_INTERVAL},
    AppState,
};

pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub data_dir: Option<PathBuf>,
    /// JSON file mapping organization ids to member actor ids ($HUSH_MEMBERS_FILE).
    pub members_file: Option<PathBuf>,
    /// Bearer key the upstream proxy must present on authenticated routes.
    pub upstream_key: Option<String>,
    pub sweep_interval: Duration,
    pub cors_origins: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: std::env::var("HUSH_HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: std::env::var("HUSH_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            data_dir: std::env::var("HUSH_DATA_DIR").ok().map(PathBuf::from),
            members_file: std::env::var("HUSH_MEMBERS_FILE").ok().map(PathBuf::from),
            // A broken key source is reported by `run`, which resolves again.
            upstream_key: resolve_upstream_key().ok().flatten(),
            sweep_interval: sweep_interval(
                std::env::var("HUSH_SWEEP_INTERVAL_SECS").ok().as_deref(),
            ),
            cors_origins: std::env::var("HUSH_CORS_ORIGINS").ok(),
        }
    }
}

/// Parse `HUSH_SWEEP_INTERVAL_SECS`. Zero or garbage means the default.
fn sweep_interval(raw: Option<&str>) -> Duration {
    raw.and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|&secs| secs > 0)
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_SWEEP_INTERVAL)
}

/// Read the upstream proxy key from a mounted secret file.
/// Surrounding whitespace is ignored; a blank file is a configuration error.
pub fn read_key_file(path: &Path) -> Result<String> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("read upstream key file: {}", path.display()))?;
    let key = content.trim();
    if key.is_empty() {
        anyhow::bail!("upstream key file {} holds no key", path.display());
    }
    Ok(key.to_owned())
}

/// Resolve the upstream key from `HUSH_UPSTREAM_KEY_FILE` (preferred) or
/// `HUSH_UPSTREAM_KEY`. Returns `None` when neither is set.
pub fn resolve_upstream_key() -> Result<Option<String>> {
    upstream_key_from(
        std::env::var_os("HUSH_UPSTREAM_KEY_FILE").map(PathBuf::from).as_deref(),
        std::env::var("HUSH_UPSTREAM_KEY").ok().as_deref(),
    )
}

fn upstream_key_from(file: Option<&Path>, inline: Option<&str>) -> Result<Option<String>> {
    if let Some(path) = file {
        let key = read_key_file(path)?;
        if inline.is_some() {
            tracing::warn!("both HUSH_UPSTREAM_KEY and HUSH_UPSTREAM_KEY_FILE are set; using file");
        }
        return Ok(Some(key));
    }
    match inline {
        Some("") => anyhow::bail!("HUSH_UPSTREAM_KEY must not be empty"),
        Some(key) => Ok(Some(key.to_owned())),
        None => Ok(None),
    }
}

/// Resolve the directory holding `hush.db`, creating it if needed.
/// Without an explicit directory the platform data dir is used
/// (`~/.local/share/hush/` on Linux).
pub fn resolve_data_dir(data_dir: Option<&Path>) -> Result<PathBuf> {
    let path = match data_dir {
        Some(d) => d.to_owned(),
        None => ProjectDirs::from("", "", "hush")
            .context("could not determine platform data directory")?
            .data_dir()
            .to_owned(),
    };
    std::fs::create_dir_all(&path)
        .with_context(|| format!("create data dir: {}", path.display()))?;
    Ok(path)
}

/// Build the HTTP router around an already-assembled state.
pub fn router(state: AppState, cors_origins: Option<&str>) -> Router {
    // Anonymous routes.
    let public = Router::new()
        .route("/health", get(health))
        .route("/secret-sharing/public", post(create_public_secret))
        .route("/secret-sharing/public/{id}", get(get_secret));

    // Routes acting on behalf of an organization member.
    let protected = Router::new()
        .route("/secret-sharing", get(list_secrets).post(create_secret))
        .route("/secret-sharing/{id}", delete(delete_secret))
        .layer(middleware::from_fn_with_state(state.clone(), require_actor));

    Router::new()
        .merge(public)
        .merge(protected)
        .with_state(state)
        .layer(build_cors(cors_origins))
        .layer(TraceLayer::new_for_http())
}

pub async fn run(cfg: ServerConfig) -> Result<()> {
    let data_dir = resolve_data_dir(cfg.data_dir.as_deref())?;
    info!(data_dir = %data_dir.display(), "using data directory");

    let store = Store::open(&data_dir.join("hush.db")).context("open store")?;
    store.clone().spawn_sweep(cfg.sweep_interval);

    let gate = match cfg.members_file {
        Some(ref path) => MembershipGate::load(path)
            .with_context(|| format!("load members file: {}", path.display()))?,
        None => {
            info!("no HUSH_MEMBERS_FILE configured; authenticated routes will reject every actor");
            MembershipGate::new()
        }
    };

    let upstream_key = match cfg.upstream_key {
        Some(key) => Some(key),
        None => resolve_upstream_key()?,
    };
    if upstream_key.is_none() {
        info!("no upstream key configured; actor headers are trusted as sent");
    }

    let state = AppState {
        engine: SharingEngine::new(Arc::new(store), Arc::new(gate)),
        upstream_key,
    };
    let app = router(state, cfg.cors_origins.as_deref());

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .context("invalid host/port")?;

    info!(%addr, "hush server listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("bind listener")?;

    axum::serve(listener, app).await.context("server error")
}

fn build_cors(origins: Option<&str>) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([
            http::Method::GET,
            http::Method::POST,
            http::Method::DELETE,
            http::Method::OPTIONS,
        ])
        .allow_headers(Any);

    match origins {
        Some(o) => {
            let origins: Vec<_> = o.split(',').filter_map(|s| s.trim().parse().ok()).collect();
            cors.allow_origin(origins)
        }
        None => cors.allow_origin(Any),
    }
}
