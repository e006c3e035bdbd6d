use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reqwest::{header, Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

// ── CLI definition ─────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "burnlink", about = "burnlink: self-destructing links", version)]
struct Cli {
    /// burnlink server URL (default: http://localhost:8080 or $BURNLINK_SERVER)
    #[arg(long, env = "BURNLINK_SERVER", default_value = "http://localhost:8080")]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the burnlink HTTP server
    Serve {
        /// Port to listen on (default: $BURNLINK_PORT or 8080)
        #[arg(long, env = "BURNLINK_PORT", default_value = "8080")]
        port: u16,
        /// Host to bind (default: $BURNLINK_HOST or 0.0.0.0)
        #[arg(long, env = "BURNLINK_HOST", default_value = "0.0.0.0")]
        host: String,
    },
    /// Create a text secret; `-` reads it from stdin
    Create {
        text: String,
        #[command(flatten)]
        limits: Limits,
    },
    /// Upload a file as a secret
    Upload {
        path: PathBuf,
        /// MIME type to record (default: application/octet-stream)
        #[arg(long)]
        mime: Option<String>,
        #[command(flatten)]
        limits: Limits,
    },
    /// Open a link (counts a view). Accepts an id or a full URL.
    Open {
        link: String,
        /// Where to write a file secret (default: its original name)
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Delete expired secrets immediately
    Sweep,
    /// Print a fresh random key for BURNLINK_ENCRYPTION_KEY
    Keygen,
}

/// Without `--ttl` or `--views` the link burns after one view.
#[derive(clap::Args)]
struct Limits {
    /// Time limit e.g. 30m, 1h, 7d
    #[arg(long)]
    ttl: Option<String>,
    /// Views allowed before the secret is destroyed
    #[arg(long)]
    views: Option<u32>,
}

impl Limits {
    /// `(ttl_seconds, max_views)` as sent to the server.
    fn resolve(&self) -> Result<(Option<u64>, Option<u32>)> {
        let ttl_seconds = self.ttl.as_deref().map(parse_duration).transpose()?;
        let max_views = match (ttl_seconds, self.views) {
            (None, None) => Some(1),
            (_, views) => views,
        };
        Ok((ttl_seconds, max_views))
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = match cli.command {
        Commands::Serve { .. } => "info",
        _ => "warn",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("BURNLINK_LOG_LEVEL")
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let client = Client::new();
    let server = cli.server.trim_end_matches('/');

    match cli.command {
        Commands::Serve { port, host } => cmd_serve(host, port).await,
        Commands::Create { text, limits } => cmd_create(&client, server, &text, &limits).await,
        Commands::Upload { path, mime, limits } => {
            cmd_upload(&client, server, &path, mime.as_deref(), &limits).await
        }
        Commands::Open { link, out } => cmd_open(&client, server, &link, out.as_deref()).await,
        Commands::Sweep => cmd_sweep(&client, server).await,
        Commands::Keygen => {
            let key = burnlink_server::store::crypto::generate_key();
            println!("{}", hex::encode(key.as_bytes()));
            Ok(())
        }
    }
}

// ── Command implementations ───────────────────────────────────────────────────

async fn cmd_serve(host: String, port: u16) -> Result<()> {
    let cfg = burnlink_server::ServerConfig {
        host,
        port,
        ..Default::default()
    };
    burnlink_server::run(cfg).await
}

#[derive(Deserialize)]
struct CreatedItem {
    url: String,
    expires_at: Option<i64>,
    max_views: Option<u32>,
}

async fn cmd_create(client: &Client, server: &str, text: &str, limits: &Limits) -> Result<()> {
    let content = if text == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("read secret from stdin")?;
        buf
    } else {
        text.to_owned()
    };

    let (ttl_seconds, max_views) = limits.resolve()?;
    let body = serde_json::json!({
        "content": content,
        "ttl_seconds": ttl_seconds,
        "max_views": max_views,
    });

    let resp = client
        .post(format!("{server}/api/secrets"))
        .json(&body)
        .send()
        .await
        .context("HTTP request failed")?;
    print_created(resp).await
}

async fn cmd_upload(
    client: &Client,
    server: &str,
    path: &Path,
    mime: Option<&str>,
    limits: &Limits,
) -> Result<()> {
    let bytes = std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let filename = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_owned();

    let (ttl_seconds, max_views) = limits.resolve()?;
    let mut query = vec![("filename", filename)];
    if let Some(ttl) = ttl_seconds {
        query.push(("ttl_seconds", ttl.to_string()));
    }
    if let Some(views) = max_views {
        query.push(("max_views", views.to_string()));
    }

    let mut req = client
        .post(format!("{server}/api/files"))
        .query(&query)
        .body(bytes);
    if let Some(mime) = mime {
        req = req.header(header::CONTENT_TYPE, mime);
    }
    let resp = req.send().await.context("HTTP request failed")?;
    print_created(resp).await
}

async fn print_created(resp: Response) -> Result<()> {
    let resp = check(resp).await?;
    let created: CreatedItem = resp.json().await.context("parse response")?;
    println!("{}", created.url);

    let ttl_info = match created.expires_at {
        Some(exp) => format!("expires at {}", format_timestamp(exp)),
        None => "no time limit".to_string(),
    };
    let views_info = match created.max_views {
        Some(1) => "burns after 1 view".to_string(),
        Some(n) => format!("burns after {n} views"),
        None => "unlimited views".to_string(),
    };
    eprintln!("{ttl_info}, {views_info}");
    Ok(())
}

async fn cmd_open(client: &Client, server: &str, link: &str, out: Option<&Path>) -> Result<()> {
    let id = link_id(link);
    let resp = client
        .get(format!("{server}/api/secrets/{id}"))
        .send()
        .await
        .context("HTTP request failed")?;
    let resp = check(resp).await?;

    // File downloads always carry a Content-Disposition; text comes back as JSON.
    let disposition = resp
        .headers()
        .get(header::CONTENT_DISPOSITION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    let remaining = resp
        .headers()
        .get("x-burnlink-views-remaining")
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);

    let Some(disposition) = disposition else {
        let json: Value = resp.json().await.context("parse response")?;
        println!("{}", json["content"].as_str().unwrap_or_default());
        if let Some(n) = json["views_remaining"].as_u64() {
            eprintln!("{n} view(s) remaining");
        }
        return Ok(());
    };

    let suggested = disposition_filename(&disposition).unwrap_or_else(|| format!("{id}.bin"));
    let path = out.map(Path::to_path_buf).unwrap_or_else(|| suggested.into());
    let bytes = resp.bytes().await.context("read file body")?;
    write_new(&path, &bytes)?;
    println!("saved {}", path.display());
    if let Some(n) = remaining {
        eprintln!("{n} view(s) remaining");
    }
    Ok(())
}

async fn cmd_sweep(client: &Client, server: &str) -> Result<()> {
    let resp = client
        .post(format!("{server}/api/sweep"))
        .send()
        .await
        .context("HTTP request failed")?;
    let resp = check(resp).await?;
    let json: Value = resp.json().await?;
    let deleted = json["deleted"].as_u64().unwrap_or(0);
    let orphans = json["orphaned_blobs"].as_u64().unwrap_or(0);
    println!("deleted {deleted} expired secret(s), {orphans} orphaned blob(s)");
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Turn a non-success response into an error carrying the server's message.
async fn check(resp: Response) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let json: Value = resp.json().await.unwrap_or_default();
    let message = json["error"].as_str().unwrap_or("");
    if status == StatusCode::NOT_FOUND && !message.is_empty() {
        anyhow::bail!("{message}");
    }
    anyhow::bail!("server returned {status}: {message}")
}

/// Parse human duration strings like "1h", "30m", "7d", "5s" into seconds.
fn parse_duration(s: &str) -> Result<u64> {
    let d: humantime::Duration = s
        .parse()
        .with_context(|| format!("invalid duration: {s}"))?;
    Ok(d.as_secs())
}

/// Formats unix milliseconds, as the server reports them.
fn format_timestamp(unix_ms: i64) -> String {
    let t = std::time::UNIX_EPOCH + std::time::Duration::from_millis(unix_ms.max(0) as u64);
    humantime::format_rfc3339_seconds(t).to_string()
}

/// Accepts a bare id or any URL ending in one.
fn link_id(link: &str) -> &str {
    let trimmed = link.trim().trim_end_matches('/');
    let without_query = trimmed.split(['?', '#']).next().unwrap_or(trimmed);
    without_query.rsplit('/').next().unwrap_or(without_query)
}

fn disposition_filename(value: &str) -> Option<String> {
    let (_, rest) = value.split_once("filename=\"")?;
    let name = rest.split('"').next()?;
    // Never let the server pick a directory.
    let base = Path::new(name).file_name()?.to_str()?;
    (!base.is_empty()).then(|| base.to_owned())
}

fn write_new(path: &Path, bytes: &[u8]) -> Result<()> {
    use std::io::Write;
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .with_context(|| format!("create {} (already exists?)", path.display()))?;
    file.write_all(bytes)
        .with_context(|| format!("write {}", path.display()))
}
