//! Configuration: `config.toml` plus environment overrides for secrets.
//!
//! Lookup order for each value: environment variable, then config file,
//! then built-in default.

pub mod schema;

use anyhow::{bail, Context, Result};
use directories::ProjectDirs;
use std::path::{Path, PathBuf};

pub use schema::{
    Config, GatewayConfig, LedgerConfig, NotifyConfig, StoreBackend, StoreConfig, WebhookConfig,
};

const ENV_WEBHOOK_SECRET: &str = "RATER_WEBHOOK_SECRET";
const ENV_ADMIN_TOKEN: &str = "RATER_ADMIN_TOKEN";
const ENV_SMTP_PASSWORD: &str = "RATER_SMTP_PASSWORD";
const ENV_DATA_DIR: &str = "RATER_DATA_DIR";

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", "rater-ledger")
}

/// `<platform config dir>/rater-ledger/config.toml`.
pub fn default_config_path() -> Result<PathBuf> {
    project_dirs()
        .map(|dirs| dirs.config_dir().join("config.toml"))
        .context("Could not determine a config directory")
}

fn default_data_dir() -> Result<PathBuf> {
    project_dirs()
        .map(|dirs| dirs.data_dir().to_path_buf())
        .context("Could not determine a data directory")
}

impl Config {
    /// Load from `path` (or the default location). A missing file yields the
    /// defaults; an unreadable or invalid one is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => default_config_path()?,
        };

        let mut config = if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read config {}", config_path.display()))?;
            Self::from_toml(&contents)
                .with_context(|| format!("Failed to parse config {}", config_path.display()))?
        } else {
            tracing::debug!(path = %config_path.display(), "no config file, using defaults");
            Self::default()
        };
        config.config_path = config_path;

        config.apply_env_overrides();
        if config.data_dir.as_os_str().is_empty() {
            config.data_dir = default_data_dir()?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Apply overrides from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|name| std::env::var(name).ok());
    }

    /// Apply overrides from an arbitrary lookup; blank values are ignored.
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        if let Some(secret) = get(ENV_WEBHOOK_SECRET) {
            self.webhook.secret = Some(secret);
        }
        if let Some(token) = get(ENV_ADMIN_TOKEN) {
            self.gateway.admin_token = Some(token);
        }
        if let Some(password) = get(ENV_SMTP_PASSWORD) {
            self.notify.smtp_password = Some(password);
        }
        if let Some(dir) = get(ENV_DATA_DIR) {
            self.data_dir = PathBuf::from(dir);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.ledger.max_attempts == 0 {
            bail!("ledger.max_attempts must be at least 1");
        }
        if self.ledger.base_backoff_ms > self.ledger.max_backoff_ms {
            bail!(
                "ledger.base_backoff_ms ({}) exceeds ledger.max_backoff_ms ({})",
                self.ledger.base_backoff_ms,
                self.ledger.max_backoff_ms
            );
        }
        if self.ledger.scan_cost == 0 || self.ledger.ai_scan_cost == 0 {
            bail!("ledger scan costs must be greater than zero");
        }
        if self.webhook.tolerance_secs <= 0 {
            bail!("webhook.tolerance_secs must be positive");
        }
        for (price_id, package_id) in &self.webhook.price_map {
            if crate::billing::find_package(package_id).is_err() {
                bail!("webhook.price_map: price '{price_id}' maps to unknown package '{package_id}'");
            }
        }
        if self.notify.enabled && self.notify.smtp_host.as_deref().unwrap_or("").trim().is_empty() {
            bail!("notify.enabled requires notify.smtp_host");
        }
        Ok(())
    }

    /// Database file for the sqlite backend.
    pub fn db_path(&self) -> PathBuf {
        self.store.db_path(&self.data_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.gateway.port, 3000);
        assert_eq!(config.ledger.max_attempts, 5);
        assert_eq!(config.store.backend, StoreBackend::Sqlite);
        assert_eq!(config.gateway.pricing_url(), "http://127.0.0.1:3000/pricing");
    }

    #[test]
    fn parses_partial_toml() {
        let config = Config::from_toml(
            r#"
            data_dir = "/var/lib/rater"

            [store]
            backend = "memory"

            [ledger]
            scan_cost = 3

            [gateway]
            port = 8080
            public_url = "https://rater.example.com/"

            [webhook.price_map]
            price_abc = "tokens_90"
            "#,
        )
        .unwrap();
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.ledger.scan_cost, 3);
        assert_eq!(config.ledger.ai_scan_cost, 2);
        assert_eq!(config.gateway.port, 8080);
        assert_eq!(config.gateway.base_url(), "https://rater.example.com");
        assert_eq!(config.webhook.price_map["price_abc"], "tokens_90");
        assert_eq!(config.db_path(), PathBuf::from("/var/lib/rater/ledger.db"));
        config.validate().unwrap();
    }

    #[test]
    fn unknown_backend_is_rejected() {
        assert!(Config::from_toml("[store]\nbackend = \"redis\"").is_err());
    }

    #[test]
    fn env_overrides_win_and_blank_is_ignored() {
        let mut config = Config::default();
        config.webhook.secret = Some("from-file".into());
        let env: HashMap<&str, &str> = [
            ("RATER_WEBHOOK_SECRET", "whsec_env"),
            ("RATER_ADMIN_TOKEN", "   "),
            ("RATER_DATA_DIR", "/tmp/rater"),
        ]
        .into_iter()
        .collect();
        config.apply_overrides_from(|name| env.get(name).map(|v| (*v).to_string()));

        assert_eq!(config.webhook.secret.as_deref(), Some("whsec_env"));
        assert_eq!(config.gateway.admin_token, None);
        assert_eq!(config.data_dir, PathBuf::from("/tmp/rater"));
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut config = Config::default();
        config.ledger.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.ledger.base_backoff_ms = 500;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.ledger.scan_cost = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config
            .webhook
            .price_map
            .insert("price_x".into(), "tokens_9000".into());
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.notify.enabled = true;
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_reads_file_and_records_path() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(
            &path,
            format!(
                "data_dir = \"{}\"\n[gateway]\nconsume_per_minute = 7\n",
                tmp.path().display()
            ),
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.config_path, path);
        assert_eq!(config.gateway.consume_per_minute, 7);
    }

    #[test]
    fn load_missing_file_uses_defaults() {
        let tmp = TempDir::new().unwrap();
        let config = Config::load(Some(&tmp.path().join("absent.toml"))).unwrap();
        assert_eq!(config.gateway.port, 3000);
        assert!(!config.data_dir.as_os_str().is_empty());
    }
}
