//! Anchor server binary.
//!
//! Reads `config.toml` (or the path given with `--config`) layered with
//! `ANCHOR_*` environment variables, opens the SQLite store, starts the
//! retention sweeper and serves the REST API over HTTP.
//!
//! # API key hashes
//!
//! To generate the argon2 PHC string for an `[[api_keys]]` entry:
//!
//! ```
//! cargo run -p anchor-server --bin anchor -- --hash-key
//! ```
//!
//! # Offline export verification
//!
//! ```
//! cargo run -p anchor-server --bin anchor -- --verify-export audit.json
//! ```
//!
//! Prints the recomputed verification and exits with status 1 when the
//! artifact does not verify.

use std::{path::PathBuf, sync::Arc, time::Duration};

use anchor_server::{
  config::{ServerConfig, expand_tilde},
  sweeper,
};
use anchor_store_sqlite::{SqliteStore, StoreOptions};
use anyhow::Context as _;
use argon2::{Argon2, PasswordHasher, password_hash::SaltString};
use clap::Parser;
use rand_core::OsRng;
use tokio::net::TcpListener;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about = "Anchor governance server")]
struct Cli {
  /// Path to the TOML configuration file.
  #[arg(short, long, default_value = "config.toml")]
  config: PathBuf,

  /// Print the argon2 hash for an API key entered on stdin and exit.
  #[arg(long)]
  hash_key: bool,

  /// Verify an exported audit artifact offline and exit.
  #[arg(long, value_name = "PATH")]
  verify_export: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy(),
    )
    .init();

  let cli = Cli::parse();

  if cli.hash_key {
    let key = read_key_from_stdin()?;
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
      .hash_password(key.as_bytes(), &salt)
      .map_err(|e| anyhow::anyhow!("argon2 error: {e}"))?
      .to_string();
    println!("{hash}");
    return Ok(());
  }

  if let Some(path) = cli.verify_export {
    let valid = verify_export(&path)?;
    std::process::exit(if valid { 0 } else { 1 });
  }

  let settings = config::Config::builder()
    .add_source(config::File::from(cli.config).required(false))
    .add_source(config::Environment::with_prefix("ANCHOR"))
    .build()
    .context("failed to read config file")?;

  let server_cfg: ServerConfig = settings
    .try_deserialize()
    .context("failed to deserialise ServerConfig")?;

  if server_cfg.api_keys.is_empty() && !server_cfg.allow_anonymous {
    tracing::warn!("no api_keys configured and allow_anonymous is false; every API call will be rejected");
  }

  let store_path = expand_tilde(&server_cfg.store_path);
  if let Some(parent) = store_path.parent()
    && !parent.as_os_str().is_empty()
  {
    std::fs::create_dir_all(parent)
      .with_context(|| format!("failed to create {parent:?}"))?;
  }

  let options = StoreOptions { busy_retries: server_cfg.busy_retries, ..StoreOptions::default() };
  let store = Arc::new(
    SqliteStore::open_with(&store_path, options)
      .await
      .with_context(|| format!("failed to open store at {store_path:?}"))?,
  );

  let app = anchor_server::app(Arc::clone(&store), &server_cfg)
    .context("invalid export settings in configuration")?;
  let sweep = sweeper::spawn(store, Duration::from_secs(server_cfg.purge_interval_secs.max(1)));
  let address = format!("{}:{}", server_cfg.host, server_cfg.port);

  tracing::info!(store = ?store_path, "Listening on http://{address}");
  let listener = TcpListener::bind(&address)
    .await
    .with_context(|| format!("failed to bind {address}"))?;

  axum::serve(listener, app)
    .with_graceful_shutdown(async {
      let _ = tokio::signal::ctrl_c().await;
      tracing::info!("shutting down");
    })
    .await
    .context("server error")?;

  sweep.abort();
  Ok(())
}

/// Re-verify an artifact from its bytes, print the report as JSON and return
/// whether it verified.
fn verify_export(path: &std::path::Path) -> anyhow::Result<bool> {
  let bytes = std::fs::read(path).with_context(|| format!("failed to read {path:?}"))?;
  let report = anchor_core::export::verify_artifact(&bytes, chrono::Utc::now())
    .with_context(|| format!("{path:?} is not an Anchor export"))?;
  println!("{}", serde_json::to_string_pretty(&report)?);
  Ok(report.is_valid())
}

/// Read an API key from stdin.
fn read_key_from_stdin() -> anyhow::Result<String> {
  use std::io::{self, BufRead, Write};
  print!("API key: ");
  io::stdout().flush().ok();
  let mut line = String::new();
  io::stdin().lock().read_line(&mut line)?;
  Ok(line.trim_end_matches(['\n', '\r']).to_string())
}
