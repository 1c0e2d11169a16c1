//! Configuration types, read from the environment with defaults.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Default HTTP port for the API server.
pub const DEFAULT_PORT: u16 = 8080;

/// Default Notion API base URL.
pub const DEFAULT_NOTION_API_URL: &str = "https://api.notion.com";

/// Upper bound for a bonus ratio taken from the environment.
pub const MAX_BONUS_RATIO: f64 = 10.0;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub db_path: PathBuf,
    pub evidence_dir: PathBuf,
    /// Directory for rolling log files. Stderr only when unset.
    pub log_dir: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            db_path: PathBuf::from("./data/shiftcheck.db"),
            evidence_dir: PathBuf::from("./data/evidence"),
            log_dir: None,
        }
    }
}

impl ServerConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let port = match std::env::var("SHIFTCHECK_PORT") {
            Ok(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
                key: "SHIFTCHECK_PORT".into(),
                message: format!("not a port number: {raw}"),
            })?,
            Err(_) => defaults.port,
        };

        Ok(Self {
            port,
            db_path: std::env::var("SHIFTCHECK_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            evidence_dir: std::env::var("SHIFTCHECK_EVIDENCE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.evidence_dir),
            log_dir: std::env::var("SHIFTCHECK_LOG_DIR").ok().map(PathBuf::from),
        })
    }
}

/// Tunables for checklist scoring.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoringConfig {
    /// Share of the base score granted when finished within the estimate.
    pub speed_bonus_ratio: f64,
    /// Share of the base score granted when no long idle gap was observed.
    pub focus_bonus_ratio: f64,
    /// An idle gap at or above this length forfeits the focus bonus.
    pub idle_threshold: Duration,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            speed_bonus_ratio: 0.2,
            focus_bonus_ratio: 0.15,
            idle_threshold: Duration::from_secs(300), // 5 minutes
        }
    }
}

impl ScoringConfig {
    /// Build config from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            speed_bonus_ratio: parse_ratio(
                std::env::var("SHIFTCHECK_SPEED_BONUS").ok(),
                defaults.speed_bonus_ratio,
            ),
            focus_bonus_ratio: parse_ratio(
                std::env::var("SHIFTCHECK_FOCUS_BONUS").ok(),
                defaults.focus_bonus_ratio,
            ),
            idle_threshold: std::env::var("SHIFTCHECK_IDLE_THRESHOLD_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.idle_threshold),
        }
    }
}

/// Bonus ratio from a raw env value, clamped to `0..=MAX_BONUS_RATIO`.
fn parse_ratio(raw: Option<String>, default: f64) -> f64 {
    raw.and_then(|s| s.trim().parse::<f64>().ok())
        .filter(|r| r.is_finite())
        .map_or(default, |r| r.clamp(0.0, MAX_BONUS_RATIO))
}

/// Notion workspace sync configuration.
#[derive(Debug, Clone)]
pub struct NotionConfig {
    pub token: SecretString,
    pub database_id: String,
    pub api_url: String,
    /// Pull interval for the background ticker. `None` disables it.
    pub sync_interval: Option<Duration>,
}

impl NotionConfig {
    /// Build config from environment variables.
    /// Returns `None` if `NOTION_TOKEN` or `NOTION_DATABASE_ID` is not set (sync disabled).
    pub fn from_env() -> Option<Self> {
        let token = std::env::var("NOTION_TOKEN").ok()?;
        let database_id = std::env::var("NOTION_DATABASE_ID").ok()?;

        let api_url = std::env::var("NOTION_API_URL")
            .unwrap_or_else(|_| DEFAULT_NOTION_API_URL.to_string());

        let sync_interval = std::env::var("NOTION_SYNC_INTERVAL_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);

        Some(Self {
            token: SecretString::from(token),
            database_id,
            api_url,
            sync_interval,
        })
    }
}

/// Blob storage bucket for checklist evidence.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub url: String,
    pub key: SecretString,
    pub bucket: String,
}

impl StorageConfig {
    /// Returns `None` if `STORAGE_URL` is not set (local evidence only).
    pub fn from_env() -> Option<Self> {
        let url = std::env::var("STORAGE_URL").ok()?;
        let key = std::env::var("STORAGE_KEY").unwrap_or_default();
        let bucket = std::env::var("STORAGE_BUCKET").unwrap_or_else(|_| "checklist-evidence".into());
        Some(Self {
            url: url.trim_end_matches('/').to_string(),
            key: SecretString::from(key),
            bucket,
        })
    }
}
