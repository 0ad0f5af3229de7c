//! Server configuration, read from `config.toml` and `ANCHOR_*` variables.

use std::path::{Path, PathBuf};

use anchor_api::ExportSettings;
use chrono::TimeDelta;
use serde::Deserialize;

/// Longest accepted export TTL, ten years.
pub const MAX_EXPORT_TTL_HOURS: i64 = 87_600;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
  #[error("export_ttl_hours must be at most {MAX_EXPORT_TTL_HOURS}, got {0}")]
  ExportTtl(i64),
}

/// One accepted API key. The key itself is never stored, only its argon2
/// PHC string.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiKey {
  pub workspace: String,
  /// e.g. `$argon2id$v=19$…`
  pub key_hash:  String,
  /// Recorded as the actor on config changes made with this key.
  #[serde(default)]
  pub name:      Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
  pub host:                String,
  pub port:                u16,
  /// Public origin used in export download links.
  pub base_url:            String,
  pub store_path:          PathBuf,
  pub export_dir:          PathBuf,
  pub export_ttl_hours:    i64,
  pub verify_batch_size:   usize,
  pub purge_interval_secs: u64,
  pub busy_retries:        u32,
  pub api_keys:            Vec<ApiKey>,
  pub allow_anonymous:     bool,
}

impl Default for ServerConfig {
  fn default() -> Self {
    Self {
      host:                "127.0.0.1".into(),
      port:                8080,
      base_url:            "http://localhost:8080".into(),
      store_path:          PathBuf::from("~/.local/share/anchor/anchor.db"),
      export_dir:          PathBuf::from("~/.local/share/anchor/exports"),
      export_ttl_hours:    24,
      verify_batch_size:   anchor_core::ledger::DEFAULT_BATCH_SIZE,
      purge_interval_secs: 300,
      busy_retries:        5,
      api_keys:            Vec::new(),
      allow_anonymous:     false,
    }
  }
}

impl ServerConfig {
  /// Export settings with tildes expanded. TTLs below one hour are raised to
  /// one hour; TTLs above [`MAX_EXPORT_TTL_HOURS`] are rejected.
  pub fn export_settings(&self) -> Result<ExportSettings, ConfigError> {
    let hours = self.export_ttl_hours.max(1);
    let ttl = Some(hours)
      .filter(|h| *h <= MAX_EXPORT_TTL_HOURS)
      .and_then(TimeDelta::try_hours)
      .ok_or(ConfigError::ExportTtl(self.export_ttl_hours))?;

    let mut settings = ExportSettings::new(expand_tilde(&self.export_dir), &self.base_url);
    settings.ttl = ttl;
    settings.batch_size = self.verify_batch_size.max(1);
    Ok(settings)
  }
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
  let s = path.to_string_lossy();
  if let Some(rest) = s.strip_prefix("~/")
    && let Ok(home) = std::env::var("HOME")
  {
    return PathBuf::from(home).join(rest);
  }
  path.to_path_buf()
}

#[cfg(test)]
mod tests {
  use super::*;

  fn from_toml(toml: &str) -> ServerConfig {
    config::Config::builder()
      .add_source(config::File::from_str(toml, config::FileFormat::Toml))
      .build()
      .unwrap()
      .try_deserialize()
      .unwrap()
  }

  #[test]
  fn empty_file_gives_defaults() {
    let cfg = from_toml("");
    assert_eq!(cfg.port, 8080);
    assert_eq!(cfg.purge_interval_secs, 300);
    assert!(!cfg.allow_anonymous);
    assert!(cfg.api_keys.is_empty());
  }

  #[test]
  fn api_keys_and_overrides() {
    let cfg = from_toml(
      r#"
        port = 9000
        export_ttl_hours = 2
        verify_batch_size = 100

        [[api_keys]]
        workspace = "acme"
        key_hash  = "$argon2id$v=19$m=19456,t=2,p=1$c2FsdA$aGFzaA"
        name      = "ci"
      "#,
    );
    assert_eq!(cfg.port, 9000);
    assert_eq!(cfg.api_keys.len(), 1);
    assert_eq!(cfg.api_keys[0].workspace, "acme");
    assert_eq!(cfg.api_keys[0].name.as_deref(), Some("ci"));

    let exports = cfg.export_settings().unwrap();
    assert_eq!(exports.ttl, chrono::Duration::hours(2));
    assert_eq!(exports.batch_size, 100);
    assert_eq!(exports.base_url, "http://localhost:8080");
  }

  #[test]
  fn export_ttl_is_bounded() {
    let cfg = from_toml("export_ttl_hours = 0");
    assert_eq!(cfg.export_settings().unwrap().ttl, chrono::Duration::hours(1));

    let cfg = from_toml(&format!("export_ttl_hours = {MAX_EXPORT_TTL_HOURS}"));
    assert!(cfg.export_settings().is_ok());

    let cfg = from_toml(&format!("export_ttl_hours = {}", MAX_EXPORT_TTL_HOURS + 1));
    assert_eq!(
      cfg.export_settings().unwrap_err(),
      ConfigError::ExportTtl(MAX_EXPORT_TTL_HOURS + 1)
    );

    // Far past what chrono can represent as a duration.
    let cfg = ServerConfig { export_ttl_hours: i64::MAX, ..ServerConfig::default() };
    assert_eq!(cfg.export_settings().unwrap_err(), ConfigError::ExportTtl(i64::MAX));
  }

  #[test]
  fn tilde_expands_against_home() {
    let Ok(home) = std::env::var("HOME") else { return };
    assert_eq!(expand_tilde(Path::new("~/a/b")), PathBuf::from(home).join("a/b"));
    assert_eq!(expand_tilde(Path::new("/tmp/x")), PathBuf::from("/tmp/x"));
  }
}
