//! Configuration sections as they appear in `config.toml`.
//!
//! Every section is `#[serde(default)]`, so a file only has to mention the
//! values it overrides.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub gateway: GatewayConfig,
    pub auth: AuthConfig,
    pub storage: StorageConfig,
    pub chat: ChatConfig,
    pub logging: LoggingConfig,
}

/// `[gateway]` — HTTP listener and request limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// Maximum request body size in bytes.
    pub max_body_bytes: usize,
    pub request_timeout_secs: u64,
    /// Login attempts allowed per client per minute (0 = unlimited).
    pub login_attempts_per_minute: u32,
    /// Origins allowed by CORS. Empty means any origin.
    pub allowed_origins: Vec<String>,
    /// Key rate limits on `X-Forwarded-For` / `X-Real-IP` instead of the peer
    /// address. Only enable behind a proxy that overwrites these headers.
    pub trust_forwarded_headers: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8080,
            max_body_bytes: 65_536,
            request_timeout_secs: 60,
            login_attempts_per_minute: 10,
            allowed_origins: Vec::new(),
            trust_forwarded_headers: false,
        }
    }
}

/// `[auth]` — token signing, password hashing and registration policy.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// HS256 signing secret. Usually supplied via `MINDHAVEN_JWT_SECRET`.
    pub jwt_secret: Option<String>,
    pub token_ttl_hours: u64,
    /// Role every new account receives.
    pub default_role: String,
    /// Roles created at startup if missing.
    pub seed_roles: Vec<String>,
    /// PBKDF2-SHA256 iteration count for new hashes.
    pub password_hash_rounds: u32,
    pub password_min_length: usize,
    /// How many public identifiers to try before registration gives up.
    pub public_id_attempts: u32,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: None,
            token_ttl_hours: 24,
            default_role: "user".into(),
            seed_roles: vec!["admin".into(), "operator".into(), "user".into()],
            password_hash_rounds: 100_000,
            password_min_length: 8,
            public_id_attempts: 5,
        }
    }
}

// Hand-written so the secret never ends up in logs.
impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("jwt_secret", &self.jwt_secret.as_ref().map(|_| "<redacted>"))
            .field("token_ttl_hours", &self.token_ttl_hours)
            .field("default_role", &self.default_role)
            .field("seed_roles", &self.seed_roles)
            .field("password_hash_rounds", &self.password_hash_rounds)
            .field("password_min_length", &self.password_min_length)
            .field("public_id_attempts", &self.public_id_attempts)
            .finish()
    }
}

/// `[storage]` — relational database and document directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub database_path: PathBuf,
    pub document_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("mindhaven.db"),
            document_dir: PathBuf::from("documents"),
        }
    }
}

/// `[chat]` — OpenAI-compatible chat-completion upstream.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub temperature: f64,
    /// Per-attempt timeout.
    pub request_timeout_secs: u64,
    /// Budget for one reply, every attempt and backoff included. Must stay
    /// below `gateway.request_timeout_secs`.
    pub total_timeout_secs: u64,
    /// Retries after the first attempt, transient failures only.
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub system_prompt: String,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com".into(),
            api_key: None,
            model: "gpt-4o-mini".into(),
            temperature: 0.7,
            request_timeout_secs: 20,
            total_timeout_secs: 50,
            max_retries: 3,
            initial_backoff_ms: 500,
            system_prompt: "You are a warm, supportive listener for university students. \
                            Encourage professional help when someone may be at risk."
                .into(),
        }
    }
}

impl std::fmt::Debug for ChatConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("total_timeout_secs", &self.total_timeout_secs)
            .field("max_retries", &self.max_retries)
            .field("initial_backoff_ms", &self.initial_backoff_ms)
            .finish_non_exhaustive()
    }
}

/// `[logging]`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "mindhaven=info,tower_http=info".into(),
        }
    }
}
