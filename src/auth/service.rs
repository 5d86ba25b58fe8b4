//! Credential lifecycle: `Anonymous → Registered → Authenticated`.
//!
//! Registration stores a one-way hash and a fresh public identifier, login
//! exchanges email + password for a session token, and `authenticate` turns a
//! bearer header back into an [`Identity`] with live roles.

use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::guard::Identity;
use super::password::{dummy_verify, hash_password, verify_password};
use super::store::{AccountWithRoles, CredentialStore, NewAccount, StoreError, UniqueField};
use super::token::TokenService;
use crate::config::AuthConfig;
use crate::error::{ApiError, ApiResult};

/// Public identifiers are 8-digit numbers.
const PUBLIC_ID_MIN: i64 = 10_000_000;
const PUBLIC_ID_MAX: i64 = 99_999_999;

const MAX_USERNAME_LEN: usize = 32;
const MAX_NICKNAME_LEN: usize = 32;
const MAX_EMAIL_LEN: usize = 254;
const MAX_PASSWORD_LEN: usize = 256;
const MAX_AGE: u32 = 150;

/// Registration payload. Required fields default to empty so a missing field
/// is reported as a validation error rather than a JSON parse failure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RegisterRequest {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
    pub nickname: Option<String>,
    pub gender: Option<String>,
    pub age: Option<u32>,
    pub major: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoginRequest {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoginResponse {
    pub access_token: String,
    pub token_type: &'static str,
    pub expires_in: i64,
    pub user_id: i64,
    pub public_id: i64,
    pub username: String,
    pub nickname: Option<String>,
    pub roles: Vec<String>,
}

/// Registration and login rules taken from `[auth]`.
#[derive(Debug, Clone)]
pub struct AuthPolicy {
    pub default_role: String,
    pub password_hash_rounds: u32,
    pub password_min_length: usize,
    pub public_id_attempts: u32,
}

impl From<&AuthConfig> for AuthPolicy {
    fn from(cfg: &AuthConfig) -> Self {
        Self {
            default_role: cfg.default_role.clone(),
            password_hash_rounds: cfg.password_hash_rounds,
            password_min_length: cfg.password_min_length,
            public_id_attempts: cfg.public_id_attempts,
        }
    }
}

type PublicIdSource = Box<dyn Fn() -> i64 + Send + Sync>;

pub struct AuthService {
    store: Arc<dyn CredentialStore>,
    tokens: TokenService,
    policy: AuthPolicy,
    public_ids: PublicIdSource,
}

impl AuthService {
    pub fn new(store: Arc<dyn CredentialStore>, tokens: TokenService, policy: AuthPolicy) -> Self {
        Self {
            store,
            tokens,
            policy,
            public_ids: Box::new(random_public_id),
        }
    }

    /// Replace the public identifier generator (collision tests).
    pub fn with_public_id_source<F>(mut self, source: F) -> Self
    where
        F: Fn() -> i64 + Send + Sync + 'static,
    {
        self.public_ids = Box::new(source);
        self
    }

    pub fn store(&self) -> &Arc<dyn CredentialStore> {
        &self.store
    }

    pub fn tokens(&self) -> &TokenService {
        &self.tokens
    }

    // ── Anonymous → Registered ──────────────────────────────────────

    pub fn register(&self, req: RegisterRequest) -> ApiResult<AccountWithRoles> {
        let username = req.username.trim().to_string();
        let email = req.email.trim().to_lowercase();
        let nickname = req
            .nickname
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string);

        self.validate_registration(
            &username,
            &email,
            &req.password,
            nickname.as_deref(),
            req.age,
        )?;

        let required = [
            (UniqueField::Username, &username),
            (UniqueField::Email, &email),
        ];
        for (field, value) in required {
            if self.store.is_taken(field, value)? {
                return Err(ApiError::Conflict(format!("{field} already in use")));
            }
        }
        if let Some(nick) = &nickname {
            if self.store.is_taken(UniqueField::Nickname, nick)? {
                return Err(ApiError::Conflict("nickname already in use".into()));
            }
        }

        let password_hash = hash_password(&req.password, self.policy.password_hash_rounds)?;
        let mut new = NewAccount {
            public_id: 0,
            username,
            email,
            password_hash,
            nickname,
            gender: clean_optional(req.gender),
            age: req.age,
            major: clean_optional(req.major),
            roles: vec![self.policy.default_role.clone()],
        };

        for attempt in 1..=self.policy.public_id_attempts {
            let candidate = (self.public_ids)();
            if self.store.public_id_taken(candidate)? {
                tracing::debug!(attempt, "public identifier collision, regenerating");
                continue;
            }
            new.public_id = candidate;

            // The pre-checks above can race with a concurrent registration;
            // the UNIQUE constraints decide.
            match self.store.insert_account(&new) {
                Ok(account) => {
                    let roles = self.store.roles_for(account.id)?;
                    tracing::info!(
                        account_id = account.id,
                        public_id = account.public_id,
                        username = %account.username,
                        "account registered"
                    );
                    return Ok(AccountWithRoles { account, roles });
                }
                Err(StoreError::Duplicate(UniqueField::PublicId)) => {
                    tracing::debug!(attempt, "public identifier taken at insert, regenerating");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(ApiError::Internal(format!(
            "public identifier space exhausted after {} attempts",
            self.policy.public_id_attempts
        )))
    }

    fn validate_registration(
        &self,
        username: &str,
        email: &str,
        password: &str,
        nickname: Option<&str>,
        age: Option<u32>,
    ) -> ApiResult<()> {
        if username.is_empty() || email.is_empty() || password.is_empty() {
            return Err(ApiError::Validation(
                "username, email and password are required".into(),
            ));
        }
        if username.chars().count() > MAX_USERNAME_LEN {
            return Err(ApiError::Validation(format!(
                "username too long (max {MAX_USERNAME_LEN} characters)"
            )));
        }
        if username.chars().any(char::is_whitespace) {
            return Err(ApiError::Validation("username must not contain spaces".into()));
        }
        if !is_plausible_email(email) {
            return Err(ApiError::Validation("email address is not valid".into()));
        }
        let pw_len = password.chars().count();
        if pw_len < self.policy.password_min_length {
            return Err(ApiError::Validation(format!(
                "password must be at least {} characters",
                self.policy.password_min_length
            )));
        }
        if pw_len > MAX_PASSWORD_LEN {
            return Err(ApiError::Validation("password too long".into()));
        }
        if nickname.is_some_and(|n| n.chars().count() > MAX_NICKNAME_LEN) {
            return Err(ApiError::Validation(format!(
                "nickname too long (max {MAX_NICKNAME_LEN} characters)"
            )));
        }
        if age.is_some_and(|a| a > MAX_AGE) {
            return Err(ApiError::Validation("age is out of range".into()));
        }
        Ok(())
    }

    // ── Registered → Authenticated ──────────────────────────────────

    /// Unknown email and wrong password fail identically.
    pub fn login(&self, req: LoginRequest) -> ApiResult<LoginResponse> {
        let email = req.email.trim().to_lowercase();
        if email.is_empty() || req.password.is_empty() {
            return Err(ApiError::Validation("email and password are required".into()));
        }

        let Some(account) = self.store.find_by_email(&email)? else {
            dummy_verify(&req.password, self.policy.password_hash_rounds);
            tracing::info!("login failed: unknown email");
            return Err(ApiError::InvalidCredentials);
        };
        if !verify_password(&req.password, &account.password_hash) {
            tracing::info!(account_id = account.id, "login failed: wrong password");
            return Err(ApiError::InvalidCredentials);
        }

        let roles = self.store.roles_for(account.id)?;
        let access_token = self.tokens.issue(&account, &roles)?;
        tracing::info!(account_id = account.id, "login succeeded");

        Ok(LoginResponse {
            access_token,
            token_type: "Bearer",
            expires_in: self.tokens.ttl_secs(),
            user_id: account.id,
            public_id: account.public_id,
            username: account.username,
            nickname: account.nickname,
            roles,
        })
    }

    // ── Request guard core ──────────────────────────────────────────

    /// Resolve an `Authorization` header value into an identity with the
    /// account's current roles.
    pub fn authenticate(&self, header: Option<&str>) -> ApiResult<Identity> {
        self.authenticate_at(header, Utc::now().timestamp())
    }

    pub fn authenticate_at(&self, header: Option<&str>, now: i64) -> ApiResult<Identity> {
        let token = bearer_token(header)?;
        let claims = self.tokens.verify_at(token, now)?;
        let account_id = claims.account_id()?;

        let account = self
            .store
            .find_by_id(account_id)?
            .ok_or_else(|| {
                ApiError::AuthInvalid(format!("account {account_id} no longer exists"))
            })?;
        let roles = self.store.roles_for(account.id)?;

        Ok(Identity {
            account_id: account.id,
            public_id: account.public_id,
            username: account.username,
            nickname: account.nickname,
            email: account.email,
            roles,
            expires_at: claims.exp,
        })
    }
}

/// Extract the token from `Bearer <token>`. The scheme is case-insensitive and
/// any run of whitespace separates the two parts.
pub fn bearer_token(header: Option<&str>) -> ApiResult<&str> {
    let header = header.ok_or(ApiError::AuthMissing)?;
    let mut parts = header.split_whitespace();
    let scheme = parts.next().ok_or(ApiError::AuthMissing)?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(ApiError::AuthInvalid(format!("unsupported scheme '{scheme}'")));
    }
    let token = parts.next().ok_or(ApiError::AuthMissing)?;
    if parts.next().is_some() {
        return Err(ApiError::AuthInvalid("unexpected data after token".into()));
    }
    Ok(token)
}

fn random_public_id() -> i64 {
    rand::thread_rng().gen_range(PUBLIC_ID_MIN..=PUBLIC_ID_MAX)
}

fn clean_optional(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn is_plausible_email(email: &str) -> bool {
    if email.len() > MAX_EMAIL_LEN || email.chars().any(char::is_whitespace) {
        return false;
    }
    match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.contains('@')
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
        }
        None => false,
    }
}
