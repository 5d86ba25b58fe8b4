//! Session tokens: HS256 JWTs carrying identity and a role snapshot.
//!
//! Tokens are stateless; nothing is persisted at issue time and there is no
//! revocation list, so a token stays valid until `exp`.

use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use super::store::Account;
use crate::error::{ApiError, ApiResult};

/// Default token lifetime: 24 hours (seconds).
pub const DEFAULT_TOKEN_TTL_SECS: i64 = 24 * 3600;

/// Claims carried by every session token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClaims {
    /// Account id, string form.
    pub sub: String,
    /// Issued at (Unix seconds)
    pub iat: i64,
    /// Expiry (Unix seconds)
    pub exp: i64,
    pub username: String,
    pub nickname: Option<String>,
    pub public_id: i64,
    pub email: String,
    /// Roles at issue time. The request guard re-reads live roles instead.
    pub roles: Vec<String>,
}

impl SessionClaims {
    pub fn account_id(&self) -> ApiResult<i64> {
        self.sub
            .parse()
            .map_err(|_| ApiError::AuthInvalid(format!("non-numeric subject '{}'", self.sub)))
    }
}

struct Keys {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

/// Issues and verifies session tokens with a server-held secret.
pub struct TokenService {
    keys: Option<Keys>,
    ttl_secs: i64,
}

impl TokenService {
    /// A missing or blank secret is accepted here so the server can start;
    /// every issue/verify call then fails with a configuration error.
    pub fn new(secret: Option<&str>, ttl_secs: i64) -> Self {
        let keys = secret
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| Keys {
                encoding: EncodingKey::from_secret(s.as_bytes()),
                decoding: DecodingKey::from_secret(s.as_bytes()),
            });
        Self { keys, ttl_secs }
    }

    pub fn ttl_secs(&self) -> i64 {
        self.ttl_secs
    }

    pub fn is_configured(&self) -> bool {
        self.keys.is_some()
    }

    fn keys(&self) -> ApiResult<&Keys> {
        self.keys
            .as_ref()
            .ok_or_else(|| ApiError::Configuration("JWT signing secret is not configured".into()))
    }

    /// Issue a token for an account whose password has already been checked.
    pub fn issue(&self, account: &Account, roles: &[String]) -> ApiResult<String> {
        self.issue_at(account, roles, Utc::now().timestamp())
    }

    pub fn issue_at(&self, account: &Account, roles: &[String], now: i64) -> ApiResult<String> {
        let keys = self.keys()?;
        let exp = now
            .checked_add(self.ttl_secs)
            .ok_or_else(|| ApiError::Configuration("token lifetime overflows".into()))?;
        let claims = SessionClaims {
            sub: account.id.to_string(),
            iat: now,
            exp,
            username: account.username.clone(),
            nickname: account.nickname.clone(),
            public_id: account.public_id,
            email: account.email.clone(),
            roles: roles.to_vec(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &keys.encoding)
            .map_err(|e| ApiError::internal(format!("token encoding: {e}")))
    }

    pub fn verify(&self, token: &str) -> ApiResult<SessionClaims> {
        self.verify_at(token, Utc::now().timestamp())
    }

    /// Signature and shape are checked first; only a correctly signed token
    /// can be reported as expired.
    pub fn verify_at(&self, token: &str, now: i64) -> ApiResult<SessionClaims> {
        let keys = self.keys()?;

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);

        let data = decode::<SessionClaims>(token, &keys.decoding, &validation)
            .map_err(|e| ApiError::AuthInvalid(e.to_string()))?;

        if now >= data.claims.exp {
            return Err(ApiError::AuthExpired);
        }
        Ok(data.claims)
    }
}
