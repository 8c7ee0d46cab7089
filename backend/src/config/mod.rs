//! Environment-driven process configuration.
//!
//! Loaded once at startup: `dotenvy::dotenv().ok()` then `AppConfig::from_env()`.

use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::services::encryption::CredentialEncryption;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" => Ok(LogFormat::Pretty),
            other => Err(anyhow::anyhow!("unknown LOG_FORMAT: {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub database_url: String,
    pub encryption_key_b64: String,
    /// True if the key above was freshly generated this boot (so the caller
    /// can log it exactly once).
    pub encryption_key_generated: bool,
    pub backup_poll_interval_secs: u64,
    pub backup_worker_count: usize,
    pub search_worker_count: usize,
    pub search_cache_ttl_minutes: i64,
    pub log_format: LogFormat,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let data_dir: PathBuf = std::env::var("DATA_DIR")
            .unwrap_or_else(|_| "./data".to_string())
            .into();

        let database_url = std::env::var("DATABASE_URL").unwrap_or_else(|_| {
            format!("sqlite://{}/core.db", data_dir.display())
        });

        let (encryption_key_b64, encryption_key_generated) = match std::env::var("ENCRYPTION_KEY")
        {
            Ok(key) if !key.is_empty() => (key, false),
            _ => (CredentialEncryption::generate_key(), true),
        };

        let backup_poll_interval_secs = env_parsed("BACKUP_POLL_INTERVAL_SECS", 60)?;
        let backup_worker_count = env_parsed("BACKUP_WORKER_COUNT", 2)?;
        let search_worker_count = env_parsed("SEARCH_WORKER_COUNT", 4)?;
        let search_cache_ttl_minutes = env_parsed("SEARCH_CACHE_TTL_MINUTES", 15)?;

        let log_format = match std::env::var("LOG_FORMAT") {
            Ok(v) => v.parse().context("parsing LOG_FORMAT")?,
            Err(_) if cfg!(debug_assertions) => LogFormat::Pretty,
            Err(_) => LogFormat::Json,
        };

        Ok(Self {
            data_dir,
            database_url,
            encryption_key_b64,
            encryption_key_generated,
            backup_poll_interval_secs,
            backup_worker_count,
            search_worker_count,
            search_cache_ttl_minutes,
            log_format,
        })
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.data_dir.join("backups")
    }

    pub fn torrent_blob_dir(&self) -> PathBuf {
        self.backups_dir().join("torrents")
    }
}

fn env_parsed<T>(name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(v) => v
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid {name}: {e}")),
        Err(_) => Ok(default),
    }
}
