//! Configuration loading: TOML file, then environment overrides.

pub mod schema;

pub use schema::{AuthConfig, ChatConfig, Config, GatewayConfig, LoggingConfig, StorageConfig};

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};

pub const ENV_JWT_SECRET: &str = "MINDHAVEN_JWT_SECRET";
pub const ENV_DATABASE_PATH: &str = "MINDHAVEN_DATABASE_PATH";
pub const ENV_DATA_DIR: &str = "MINDHAVEN_DATA_DIR";
pub const ENV_CHAT_API_KEY: &str = "MINDHAVEN_CHAT_API_KEY";
pub const ENV_CHAT_BASE_URL: &str = "MINDHAVEN_CHAT_BASE_URL";

/// One year.
pub const MAX_TOKEN_TTL_HOURS: u64 = 24 * 365;

impl Config {
    /// `<platform config dir>/mindhaven/config.toml`, or `./config.toml` when
    /// no home directory can be resolved.
    pub fn default_path() -> PathBuf {
        directories::ProjectDirs::from("", "", "mindhaven")
            .map(|dirs| dirs.config_dir().join("config.toml"))
            .unwrap_or_else(|| PathBuf::from("config.toml"))
    }

    /// Load from `path` (or the default path), falling back to defaults when
    /// the default file does not exist. An explicit path must exist.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => {
                let default = Self::default_path();
                if default.exists() {
                    Self::from_file(&default)?
                } else {
                    tracing::debug!(path = %default.display(), "no config file, using defaults");
                    Self::default()
                }
            }
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml(&raw).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Apply `MINDHAVEN_*` overrides. `lookup` is injectable for tests.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(secret) = non_empty(ENV_JWT_SECRET) {
            self.auth.jwt_secret = Some(secret);
        }
        if let Some(path) = non_empty(ENV_DATABASE_PATH) {
            self.storage.database_path = PathBuf::from(path);
        }
        if let Some(dir) = non_empty(ENV_DATA_DIR) {
            self.storage.document_dir = PathBuf::from(dir);
        }
        if let Some(key) = non_empty(ENV_CHAT_API_KEY) {
            self.chat.api_key = Some(key);
        }
        if let Some(url) = non_empty(ENV_CHAT_BASE_URL) {
            self.chat.base_url = url;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.gateway.port == 0 {
            bail!("gateway.port must be non-zero");
        }
        if self.auth.token_ttl_hours == 0 {
            bail!("auth.token_ttl_hours must be at least 1");
        }
        if self.auth.token_ttl_hours > MAX_TOKEN_TTL_HOURS {
            bail!("auth.token_ttl_hours must be at most {MAX_TOKEN_TTL_HOURS}");
        }
        if self.auth.default_role.trim().is_empty() {
            bail!("auth.default_role must not be empty");
        }
        if self.auth.password_hash_rounds == 0 {
            bail!("auth.password_hash_rounds must be non-zero");
        }
        if self.auth.public_id_attempts == 0 {
            bail!("auth.public_id_attempts must be at least 1");
        }
        if self.chat.total_timeout_secs == 0 {
            bail!("chat.total_timeout_secs must be at least 1");
        }
        // A chat reply must finish or give up before the gateway cuts the request off.
        if self.chat.total_timeout_secs >= self.gateway.request_timeout_secs {
            bail!(
                "chat.total_timeout_secs ({}) must be below gateway.request_timeout_secs ({})",
                self.chat.total_timeout_secs,
                self.gateway.request_timeout_secs
            );
        }
        if let Some(secret) = &self.auth.jwt_secret {
            if secret.len() < 16 {
                bail!("auth.jwt_secret must be at least 16 bytes");
            }
        }
        Ok(())
    }
}
