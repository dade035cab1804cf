use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::billing::RetryPolicy;

/// Top-level `config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Where this config was loaded from. Not serialized.
    #[serde(skip)]
    pub config_path: PathBuf,
    /// Directory for the ledger database. Empty means the platform default.
    pub data_dir: PathBuf,
    pub store: StoreConfig,
    pub ledger: LedgerConfig,
    pub gateway: GatewayConfig,
    pub webhook: WebhookConfig,
    pub notify: NotifyConfig,
}

// ── Store ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Sqlite,
    /// Process-local maps; state is lost on exit.
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// Database file. Defaults to `<data_dir>/ledger.db`.
    pub path: Option<PathBuf>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Sqlite,
            path: None,
        }
    }
}

impl StoreConfig {
    pub fn db_path(&self, data_dir: &Path) -> PathBuf {
        self.path
            .clone()
            .unwrap_or_else(|| data_dir.join("ledger.db"))
    }
}

// ── Ledger ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Read-modify-write attempts before giving up on a contended account.
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Tokens charged for a `scan` action.
    pub scan_cost: u64,
    /// Tokens charged for an `ai_scan` action.
    pub ai_scan_cost: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff_ms: 10,
            max_backoff_ms: 250,
            scan_cost: 2,
            ai_scan_cost: 2,
        }
    }
}

impl LedgerConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.base_backoff_ms),
            Duration::from_millis(self.max_backoff_ms),
        )
    }
}

// ── Gateway ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// Externally reachable base URL, used in emailed links.
    pub public_url: Option<String>,
    /// Pricing page linked from insufficient-balance responses.
    pub upgrade_url: Option<String>,
    /// Consume requests per client per minute (0 = unlimited).
    pub consume_per_minute: u32,
    /// Signup requests per client per minute (0 = unlimited).
    pub signup_per_minute: u32,
    /// Token for `/api/admin/*`. Admin routes are disabled when unset.
    pub admin_token: Option<String>,
    pub request_timeout_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 3000,
            public_url: None,
            upgrade_url: None,
            consume_per_minute: 120,
            signup_per_minute: 10,
            admin_token: None,
            request_timeout_secs: 30,
        }
    }
}

impl GatewayConfig {
    /// `public_url` without a trailing slash, else the bind address.
    pub fn base_url(&self) -> String {
        match self.public_url.as_deref().map(str::trim) {
            Some(url) if !url.is_empty() => url.trim_end_matches('/').to_string(),
            _ => format!("http://{}:{}", self.host, self.port),
        }
    }

    pub fn pricing_url(&self) -> String {
        match self.upgrade_url.as_deref().map(str::trim) {
            Some(url) if !url.is_empty() => url.to_string(),
            _ => format!("{}/pricing", self.base_url()),
        }
    }
}

// ── Webhook ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    /// Shared signing secret. The webhook route rejects everything when unset.
    pub secret: Option<String>,
    pub tolerance_secs: i64,
    /// Provider price id -> package id.
    pub price_map: HashMap<String, String>,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            secret: None,
            tolerance_secs: crate::webhook::DEFAULT_TOLERANCE_SECS,
            price_map: HashMap::new(),
        }
    }
}

// ── Notify ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    /// Deliver over SMTP. When false, messages are only logged.
    pub enabled: bool,
    pub smtp_host: Option<String>,
    pub smtp_port: u16,
    pub smtp_username: Option<String>,
    pub smtp_password: Option<String>,
    pub from: String,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            smtp_host: None,
            smtp_port: 587,
            smtp_username: None,
            smtp_password: None,
            from: "Rater <noreply@localhost>".into(),
        }
    }
}
