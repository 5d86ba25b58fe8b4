//! Request guard and role gate as axum middleware.
//!
//! The pipeline order is fixed: `authenticate` runs first and stores an
//! [`Identity`] in the request extensions, `require_roles` reads it, then the
//! handler runs. Handlers take `Identity` as an extractor.
//!
//! ```ignore
//! Router::new()
//!     .route("/api/admin/users", get(list_users))
//!     .route_layer(from_fn_with_state(RoleGate::new(["admin"]), require_roles))
//!     .route_layer(from_fn_with_state(auth.clone(), authenticate))
//! ```

use axum::{
    extract::{FromRequestParts, Request, State},
    http::{header, request::Parts},
    middleware::Next,
    response::Response,
};
use serde::Serialize;
use std::sync::Arc;

use super::service::AuthService;
use crate::error::{ApiError, ApiResult};

/// Per-request identity. Roles come from the store, not the token snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Identity {
    pub account_id: i64,
    pub public_id: i64,
    pub username: String,
    pub nickname: Option<String>,
    pub email: String,
    pub roles: Vec<String>,
    /// Token expiry (Unix seconds)
    pub expires_at: i64,
}

impl Identity {
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    /// An empty allow-list matches nobody.
    pub fn has_any_role(&self, allowed: &[String]) -> bool {
        allowed.iter().any(|a| self.has_role(a))
    }
}

impl<S> FromRequestParts<S> for Identity
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Identity>()
            .cloned()
            .ok_or(ApiError::AuthMissing)
    }
}

/// Validate the bearer token and attach the caller's identity.
pub async fn authenticate(
    State(auth): State<Arc<AuthService>>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let header = req
        .headers()
        .get(header::AUTHORIZATION)
        .map(|v| {
            v.to_str()
                .map_err(|_| ApiError::AuthInvalid("non-ASCII authorization header".into()))
        })
        .transpose()?;

    let identity = auth.authenticate(header)?;
    tracing::debug!(
        account_id = identity.account_id,
        roles = ?identity.roles,
        path = %req.uri().path(),
        "request authenticated"
    );
    req.extensions_mut().insert(identity);
    Ok(next.run(req).await)
}

/// Allow-list of role names for a group of routes.
#[derive(Debug, Clone)]
pub struct RoleGate {
    allowed: Arc<[String]>,
}

impl RoleGate {
    pub fn new<I, S>(roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let allowed: Vec<String> = roles.into_iter().map(Into::into).collect();
        if allowed.is_empty() {
            tracing::warn!("role gate configured with an empty allow-list; it will deny everyone");
        }
        Self {
            allowed: allowed.into(),
        }
    }

    pub fn allowed(&self) -> &[String] {
        &self.allowed
    }

    pub fn check(&self, identity: &Identity) -> ApiResult<()> {
        if identity.has_any_role(&self.allowed) {
            Ok(())
        } else {
            tracing::info!(
                account_id = identity.account_id,
                roles = ?identity.roles,
                required = ?self.allowed,
                "role gate denied request"
            );
            Err(ApiError::Forbidden {
                required: self.allowed.join(", "),
            })
        }
    }
}

/// Must be layered inside [`authenticate`].
pub async fn require_roles(
    State(gate): State<RoleGate>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let identity = req
        .extensions()
        .get::<Identity>()
        .ok_or(ApiError::AuthMissing)?;
    gate.check(identity)?;
    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::service::{AuthPolicy, LoginRequest, RegisterRequest};
    use crate::auth::store::{CredentialStore, SqliteCredentialStore};
    use crate::auth::token::{TokenService, DEFAULT_TOKEN_TTL_SECS};
    use axum::{body::Body, http::StatusCode, middleware::from_fn_with_state, routing::get, Router};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn identity(roles: &[&str]) -> Identity {
        Identity {
            account_id: 1,
            public_id: 12_345_678,
            username: "alice".into(),
            nickname: None,
            email: "a@x.com".into(),
            roles: roles.iter().map(|r| r.to_string()).collect(),
            expires_at: 0,
        }
    }

    #[test]
    fn gate_allows_on_intersection() {
        let gate = RoleGate::new(["admin", "operator"]);
        assert!(gate.check(&identity(&["user", "operator"])).is_ok());
        assert!(matches!(
            gate.check(&identity(&["user"])),
            Err(ApiError::Forbidden { .. })
        ));
    }

    #[test]
    fn zero_roles_always_denied() {
        assert!(RoleGate::new(["admin"]).check(&identity(&[])).is_err());
        assert!(RoleGate::new(Vec::<String>::new())
            .check(&identity(&[]))
            .is_err());
    }

    #[test]
    fn empty_allow_list_is_not_allow_all() {
        let gate = RoleGate::new(Vec::<String>::new());
        assert!(gate.check(&identity(&["admin", "user"])).is_err());
    }

    fn app() -> (Arc<AuthService>, Router) {
        let store = SqliteCredentialStore::open_in_memory().unwrap();
        for role in ["admin", "user"] {
            store.ensure_role(role).unwrap();
        }
        let auth = Arc::new(AuthService::new(
            Arc::new(store),
            TokenService::new(Some("guard-test-secret-0123"), DEFAULT_TOKEN_TTL_SECS),
            AuthPolicy {
                default_role: "user".into(),
                password_hash_rounds: 1_000,
                password_min_length: 8,
                public_id_attempts: 3,
            },
        ));

        async fn whoami(identity: Identity) -> String {
            identity.username
        }

        let admin = Router::new()
            .route("/admin", get(whoami))
            .route_layer(from_fn_with_state(RoleGate::new(["admin"]), require_roles));
        let router = Router::new()
            .route("/me", get(whoami))
            .merge(admin)
            .route_layer(from_fn_with_state(Arc::clone(&auth), authenticate));
        (auth, router)
    }

    async fn call(router: &Router, path: &str, token: Option<&str>) -> (StatusCode, String) {
        let mut req = axum::http::Request::builder().uri(path);
        if let Some(t) = token {
            req = req.header(header::AUTHORIZATION, format!("Bearer {t}"));
        }
        let resp = router
            .clone()
            .oneshot(req.body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8_lossy(&body).into_owned())
    }

    #[tokio::test]
    async fn pipeline_authenticates_then_authorizes() {
        let (auth, router) = app();
        let registered = auth
            .register(RegisterRequest {
                username: "alice".into(),
                email: "a@x.com".into(),
                password: "secret123".into(),
                ..Default::default()
            })
            .unwrap();
        let token = auth
            .login(LoginRequest {
                email: "a@x.com".into(),
                password: "secret123".into(),
            })
            .unwrap()
            .access_token;

        let (status, body) = call(&router, "/me", None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(body.contains("auth_missing"));

        let (status, body) = call(&router, "/me", Some(&token)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "alice");

        let (status, body) = call(&router, "/admin", Some(&token)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert!(body.contains("forbidden"));

        auth.store()
            .assign_role(registered.account.id, "admin")
            .unwrap();
        let (status, _) = call(&router, "/admin", Some(&token)).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn identity_extractor_without_guard_is_unauthorized() {
        async fn whoami(identity: Identity) -> String {
            identity.username
        }
        let router = Router::new().route("/me", get(whoami));
        let (status, _) = call(&router, "/me", None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }
}
