use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::{
    handlers::{create_secret, health, open_secret, sweep, upload_file},
    lifecycle::Vault,
    store::{
        crypto::{self, EncryptionKey, DEV_SECRET},
        db::DEFAULT_TOMBSTONE_RETENTION,
        Store,
    },
    AppState,
};

const SALT_FILE: &str = "burnlink.salt";

pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub data_dir: Option<PathBuf>,
    /// Base for returned links ($BURNLINK_PUBLIC_URL); defaults to localhost.
    pub public_url: Option<String>,
    /// Key material run through Argon2id ($BURNLINK_SECRET_KEY).
    pub secret_key: Option<String>,
    /// File holding the key material ($BURNLINK_SECRET_KEY_FILE). Preferred.
    pub secret_key_file: Option<PathBuf>,
    /// Direct 32-byte key as hex ($BURNLINK_ENCRYPTION_KEY). Skips derivation.
    pub encryption_key: Option<String>,
    /// Fall back to a fixed development key when nothing is configured.
    pub dev_mode: bool,
    pub sweep_interval: Duration,
    pub max_upload_bytes: usize,
    pub cors_origins: Option<String>,
    /// How long expired ids keep answering "expired" instead of "not found".
    pub tombstone_retention: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: std::env::var("BURNLINK_HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: std::env::var("BURNLINK_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            data_dir: std::env::var("BURNLINK_DATA_DIR").ok().map(PathBuf::from),
            public_url: std::env::var("BURNLINK_PUBLIC_URL").ok(),
            secret_key: std::env::var("BURNLINK_SECRET_KEY").ok(),
            secret_key_file: std::env::var("BURNLINK_SECRET_KEY_FILE")
                .ok()
                .map(PathBuf::from),
            encryption_key: std::env::var("BURNLINK_ENCRYPTION_KEY").ok(),
            dev_mode: std::env::var("BURNLINK_DEV_MODE")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
            sweep_interval: Duration::from_secs(
                std::env::var("BURNLINK_SWEEP_INTERVAL_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(60),
            ),
            max_upload_bytes: std::env::var("BURNLINK_MAX_UPLOAD_BYTES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10 * 1024 * 1024),
            cors_origins: std::env::var("BURNLINK_CORS_ORIGINS").ok(),
            tombstone_retention: std::env::var("BURNLINK_TOMBSTONE_RETENTION_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_TOMBSTONE_RETENTION),
        }
    }
}

impl ServerConfig {
    fn public_url(&self) -> String {
        self.public_url
            .clone()
            .unwrap_or_else(|| format!("http://localhost:{}", self.port))
            .trim_end_matches('/')
            .to_owned()
    }
}

/// Read key material from a file, trimming surrounding whitespace.
/// Fails if the file cannot be read or is empty after trimming.
pub fn read_key_file(path: &Path) -> Result<String> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("read key file: {}", path.display()))?;
    let key = content.trim().to_string();
    if key.is_empty() {
        anyhow::bail!("key file is empty: {}", path.display());
    }
    Ok(key)
}

/// Resolve the data directory, creating it if needed.
pub fn resolve_data_dir(data_dir: Option<&PathBuf>) -> Result<PathBuf> {
    match data_dir {
        Some(d) => {
            std::fs::create_dir_all(d).context("create data dir")?;
            Ok(d.clone())
        }
        None => crate::dirs::data_dir(),
    }
}

/// Load the Argon2 salt from the data directory, generating it on first start.
pub fn load_or_create_salt(data_dir: &Path) -> Result<[u8; 32]> {
    let salt_path = data_dir.join(SALT_FILE);
    if salt_path.exists() {
        let bytes = std::fs::read(&salt_path).context("read burnlink.salt")?;
        <[u8; 32]>::try_from(bytes.as_slice()).map_err(|_| {
            anyhow::anyhow!(
                "burnlink.salt is corrupt (expected 32 bytes, got {})",
                bytes.len()
            )
        })
    } else {
        let salt = crypto::generate_salt();
        std::fs::write(&salt_path, salt).context("write burnlink.salt")?;
        info!("generated new key derivation salt");
        Ok(salt)
    }
}

/// Pick the encryption key, in order: the direct hex override, key material
/// from file or env (Argon2id with the persisted salt), the development key
/// when dev mode is on. Anything else refuses to start.
pub fn resolve_encryption_key(cfg: &ServerConfig, data_dir: &Path) -> Result<EncryptionKey> {
    if let Some(hex) = cfg.encryption_key.as_deref() {
        if cfg.secret_key.is_some() || cfg.secret_key_file.is_some() {
            warn!("BURNLINK_ENCRYPTION_KEY is set; ignoring BURNLINK_SECRET_KEY");
        }
        return EncryptionKey::from_hex(hex.trim()).context("invalid BURNLINK_ENCRYPTION_KEY");
    }

    let secret = match (&cfg.secret_key_file, &cfg.secret_key) {
        (Some(path), env_key) => {
            if env_key.is_some() {
                warn!("both BURNLINK_SECRET_KEY and BURNLINK_SECRET_KEY_FILE are set; using file");
            }
            Zeroizing::new(read_key_file(path)?)
        }
        (None, Some(key)) => Zeroizing::new(key.clone()),
        (None, None) if cfg.dev_mode => {
            warn!("no secret key configured; using the development key, which is not safe for real secrets");
            Zeroizing::new(DEV_SECRET.to_owned())
        }
        (None, None) => anyhow::bail!(
            "BURNLINK_SECRET_KEY or BURNLINK_SECRET_KEY_FILE is required \
             (set BURNLINK_DEV_MODE=true to run with a development key)"
        ),
    };

    let salt = load_or_create_salt(data_dir)?;
    crypto::derive_key(&secret, &salt).context("derive encryption key")
}

/// All routes, without CORS or tracing layers.
pub fn router(state: AppState, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/secrets", post(create_secret))
        .route("/api/secrets/{id}", get(open_secret))
        .route("/api/files", post(upload_file))
        .route("/api/sweep", post(sweep))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .with_state(state)
}

pub async fn run(cfg: ServerConfig) -> Result<()> {
    let data_dir = resolve_data_dir(cfg.data_dir.as_ref())?;
    info!(data_dir = %data_dir.display(), "using data directory");

    let key = resolve_encryption_key(&cfg, &data_dir)?;
    let store = Store::open(&data_dir)
        .context("open store")?
        .with_tombstone_retention(cfg.tombstone_retention);
    let vault = Vault::new(store, key);

    // Catch up on anything that expired while the server was down.
    let startup = vault.clone();
    match tokio::task::spawn_blocking(move || startup.run_sweep())
        .await
        .context("startup sweep task")?
    {
        Ok(report) => info!(
            deleted = report.deleted,
            orphaned_blobs = report.orphaned_blobs,
            "startup sweep complete"
        ),
        Err(e) => warn!(error = %e, "startup sweep failed"),
    }
    vault.clone().spawn_sweep(cfg.sweep_interval);

    let state = AppState {
        vault,
        public_url: cfg.public_url(),
    };

    let app = router(state, cfg.max_upload_bytes)
        .layer(build_cors(cfg.cors_origins.as_deref()))
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .context("invalid host/port")?;

    info!(%addr, "burnlink server listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("bind listener")?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}

fn build_cors(origins: Option<&str>) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([http::Method::GET, http::Method::POST, http::Method::OPTIONS])
        .allow_headers(Any);

    match origins {
        Some(o) => {
            let origins: Vec<_> = o.split(',').filter_map(|s| s.trim().parse().ok()).collect();
            cors.allow_origin(origins)
        }
        None => cors.allow_origin(Any),
    }
}
