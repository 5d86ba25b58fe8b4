//! Axum HTTP gateway: public auth endpoints, guarded user endpoints and
//! role-gated admin endpoints.
//!
//! Layering (outermost first): error envelope, timeout, body limit, CORS,
//! trace, then per route group `authenticate` and `require_roles`. Requests
//! that match no route get the same JSON error envelope as handler errors.

use anyhow::{Context, Result};
use axum::{
    extract::{
        rejection::JsonRejection, rejection::PathRejection, ConnectInfo, FromRequestParts, Path,
        State,
    },
    http::{header, request::Parts, HeaderMap, HeaderValue, Method, StatusCode, Uri},
    middleware::{from_fn_with_state, map_response},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::auth::{
    authenticate, require_roles, AuthPolicy, AuthService, CredentialStore, Identity,
    LoginRequest, LoginResponse, RegisterRequest, RoleGate, SqliteCredentialStore, TokenService,
};
use crate::chat::{build_messages, ChatProvider, ChatRequest, OpenAiCompatibleProvider};
use crate::config::{Config, GatewayConfig};
use crate::diary::{DiaryEntry, DiaryService, FileDocumentStore, NewDiaryEntry, SqliteDiaryIndex};
use crate::error::{ApiError, ApiResult};

/// Sliding window used by the login rate limiter.
pub const RATE_LIMIT_WINDOW_SECS: u64 = 60;

/// How often the rate limiter sweeps stale client entries from its map.
const RATE_LIMITER_SWEEP_INTERVAL_SECS: u64 = 300;

/// Roles that may read the account list.
pub const ACCOUNT_READER_ROLES: [&str; 2] = ["admin", "operator"];

/// Roles that may change role memberships.
pub const ROLE_MANAGER_ROLES: [&str; 1] = ["admin"];

// ── Rate limiting ───────────────────────────────────────────────

#[derive(Debug)]
pub struct SlidingWindowRateLimiter {
    limit_per_window: u32,
    window: Duration,
    requests: Mutex<(HashMap<String, Vec<Instant>>, Instant)>,
}

impl SlidingWindowRateLimiter {
    pub fn new(limit_per_window: u32, window: Duration) -> Self {
        Self {
            limit_per_window,
            window,
            requests: Mutex::new((HashMap::new(), Instant::now())),
        }
    }

    /// Record an attempt for `key`. When over the limit, returns how long
    /// until the oldest attempt leaves the window. A limit of 0 disables it.
    pub fn check(&self, key: &str) -> Result<(), Duration> {
        if self.limit_per_window == 0 {
            return Ok(());
        }

        let now = Instant::now();
        let cutoff = now.checked_sub(self.window).unwrap_or(now);

        let mut guard = self.requests.lock();
        let (requests, last_sweep) = &mut *guard;

        if last_sweep.elapsed() >= Duration::from_secs(RATE_LIMITER_SWEEP_INTERVAL_SECS) {
            requests.retain(|_, timestamps| {
                timestamps.retain(|t| *t > cutoff);
                !timestamps.is_empty()
            });
            *last_sweep = now;
        }

        let entry = requests.entry(key.to_owned()).or_default();
        entry.retain(|instant| *instant > cutoff);

        if entry.len() >= self.limit_per_window as usize {
            let oldest = entry.first().copied().unwrap_or(now);
            return Err(self.window.saturating_sub(now.duration_since(oldest)));
        }

        entry.push(now);
        Ok(())
    }
}

fn forwarded_client(headers: &HeaderMap) -> Option<String> {
    for header_name in ["X-Forwarded-For", "X-Real-IP"] {
        if let Some(value) = headers.get(header_name).and_then(|v| v.to_str().ok()) {
            let first = value.split(',').next().unwrap_or("").trim();
            if !first.is_empty() {
                return Some(first.to_owned());
            }
        }
    }
    None
}

/// Forwarded headers are client-controlled unless a proxy rewrites them, so
/// they only count when `trust_forwarded` is set.
fn client_key(headers: &HeaderMap, peer: Option<IpAddr>, trust_forwarded: bool) -> String {
    if trust_forwarded {
        if let Some(forwarded) = forwarded_client(headers) {
            return forwarded;
        }
    }
    match peer {
        Some(ip) => ip.to_string(),
        None => "unknown".into(),
    }
}

/// Rate-limit key of the caller: the peer IP, or the proxy-reported client
/// when `gateway.trust_forwarded_headers` is on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientKey(pub String);

impl FromRequestParts<AppState> for ClientKey {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip());
        if peer.is_none() && !state.trust_forwarded_headers {
            tracing::warn!("no peer address on request; rate limiting under a shared key");
        }
        Ok(Self(client_key(
            &parts.headers,
            peer,
            state.trust_forwarded_headers,
        )))
    }
}

// ── State ───────────────────────────────────────────────────────

/// Shared state for all axum handlers
#[derive(Clone)]
pub struct AppState {
    pub auth: Arc<AuthService>,
    pub chat: Arc<dyn ChatProvider>,
    pub system_prompt: Arc<str>,
    pub diary: Arc<DiaryService>,
    pub login_limiter: Arc<SlidingWindowRateLimiter>,
    /// See [`GatewayConfig::trust_forwarded_headers`].
    pub trust_forwarded_headers: bool,
}

impl AppState {
    pub fn store(&self) -> &Arc<dyn CredentialStore> {
        self.auth.store()
    }

    /// Open the stores named in `config` and wire up the services.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let db_path = &config.storage.database_path;
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let store = SqliteCredentialStore::open(db_path)
            .with_context(|| format!("Failed to open credential store {}", db_path.display()))?;
        seed_roles(&store, &config.auth.seed_roles, &config.auth.default_role)?;

        let ttl_secs = i64::try_from(config.auth.token_ttl_hours.saturating_mul(3600))
            .context("auth.token_ttl_hours is too large")?;
        let tokens = TokenService::new(config.auth.jwt_secret.as_deref(), ttl_secs);
        if !tokens.is_configured() {
            tracing::warn!(
                "no JWT secret configured (set {} or auth.jwt_secret); login will fail",
                crate::config::ENV_JWT_SECRET
            );
        }
        let auth = AuthService::new(Arc::new(store), tokens, AuthPolicy::from(&config.auth));

        let documents = FileDocumentStore::open(&config.storage.document_dir).await?;
        let index = SqliteDiaryIndex::open(db_path)?;
        let diary = DiaryService::new(Arc::new(documents), Arc::new(index));

        if config.chat.api_key.is_none() {
            tracing::warn!("no chat API key configured; /api/chat will return 500");
        }
        let chat = OpenAiCompatibleProvider::from_config(&config.chat)?;

        Ok(Self {
            auth: Arc::new(auth),
            chat: Arc::new(chat),
            system_prompt: config.chat.system_prompt.as_str().into(),
            diary: Arc::new(diary),
            login_limiter: Arc::new(SlidingWindowRateLimiter::new(
                config.gateway.login_attempts_per_minute,
                Duration::from_secs(RATE_LIMIT_WINDOW_SECS),
            )),
            trust_forwarded_headers: config.gateway.trust_forwarded_headers,
        })
    }
}

/// Make sure every configured role exists before the first registration.
pub fn seed_roles(store: &dyn CredentialStore, roles: &[String], default_role: &str) -> Result<()> {
    for role in roles.iter().map(String::as_str).chain([default_role]) {
        store
            .ensure_role(role)
            .with_context(|| format!("Failed to seed role '{role}'"))?;
    }
    Ok(())
}

// ── Router ──────────────────────────────────────────────────────

pub fn build_router(state: AppState, cfg: &GatewayConfig) -> Result<Router> {
    let admin_read = Router::new()
        .route("/api/admin/users", get(handle_admin_list_users))
        .route_layer(from_fn_with_state(
            RoleGate::new(ACCOUNT_READER_ROLES),
            require_roles,
        ));

    let admin_write = Router::new()
        .route("/api/admin/users/{id}/roles", post(handle_admin_grant_role))
        .route(
            "/api/admin/users/{id}/roles/{role}",
            axum::routing::delete(handle_admin_revoke_role),
        )
        .route_layer(from_fn_with_state(
            RoleGate::new(ROLE_MANAGER_ROLES),
            require_roles,
        ));

    let protected = Router::new()
        .route("/api/auth/me", get(handle_me))
        .route("/api/chat", post(handle_chat))
        .route("/api/diary", post(handle_diary_create).get(handle_diary_list))
        .merge(admin_read)
        .merge(admin_write)
        .route_layer(from_fn_with_state(Arc::clone(&state.auth), authenticate));

    let app = Router::new()
        .route("/health", get(handle_health))
        .route("/api/auth/register", post(handle_register))
        .route("/api/auth/login", post(handle_login))
        .merge(protected)
        .fallback(handle_not_found)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(&cfg.allowed_origins)?)
        .layer(RequestBodyLimitLayer::new(cfg.max_body_bytes))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(cfg.request_timeout_secs),
        ))
        .layer(map_response(envelope_bare_errors));

    Ok(app)
}

/// Wrap error statuses produced by the router or tower layers (wrong method,
/// body limit, timeout) in the JSON envelope, keeping their headers.
async fn envelope_bare_errors(response: Response) -> Response {
    let is_json = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/json"));
    if is_json {
        return response;
    }
    let Some(err) = ApiError::from_bare_status(response.status()) else {
        return response;
    };

    let (parts, _) = response.into_parts();
    let mut enveloped = err.into_response();
    for (name, value) in &parts.headers {
        if name != header::CONTENT_TYPE && name != header::CONTENT_LENGTH {
            enveloped.headers_mut().append(name.clone(), value.clone());
        }
    }
    enveloped
}

fn cors_layer(origins: &[String]) -> Result<CorsLayer> {
    let allow_origin = if origins.is_empty() {
        AllowOrigin::from(Any)
    } else {
        let parsed = origins
            .iter()
            .map(|o| HeaderValue::from_str(o).with_context(|| format!("invalid CORS origin '{o}'")))
            .collect::<Result<Vec<_>>>()?;
        AllowOrigin::list(parsed)
    };

    Ok(CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
        .max_age(Duration::from_secs(3600)))
}

/// Run the HTTP gateway until Ctrl-C / SIGTERM.
pub async fn run_gateway(config: Config) -> Result<()> {
    let state = AppState::from_config(&config).await?;
    let app = build_router(state, &config.gateway)?;

    let addr = format!("{}:{}", config.gateway.host, config.gateway.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    tracing::info!(addr = %listener.local_addr()?, "gateway listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    tracing::info!("gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for Ctrl-C: {e}");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => tracing::error!("failed to listen for SIGTERM: {e}"),
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// AXUM HANDLERS
// ══════════════════════════════════════════════════════════════════════════════

fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> ApiResult<T> {
    body.map(|Json(v)| v).map_err(|e| {
        if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
            ApiError::PayloadTooLarge
        } else {
            ApiError::Validation(e.body_text())
        }
    })
}

/// Password hashing is CPU-bound; keep it off the async workers.
async fn blocking<T, F>(f: F) -> ApiResult<T>
where
    F: FnOnce() -> ApiResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(ApiError::internal)?
}

async fn handle_not_found(uri: Uri) -> ApiError {
    ApiError::NotFound(format!("No route for {}", uri.path()))
}

/// GET /health
async fn handle_health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub user_id: i64,
    pub public_id: i64,
    pub username: String,
    pub nickname: Option<String>,
    pub roles: Vec<String>,
}

/// POST /api/auth/register
async fn handle_register(
    State(state): State<AppState>,
    body: Result<Json<RegisterRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<RegisterResponse>)> {
    let req = json_body(body)?;
    let auth = Arc::clone(&state.auth);
    let created = blocking(move || auth.register(req)).await?;

    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse {
            user_id: created.account.id,
            public_id: created.account.public_id,
            username: created.account.username,
            nickname: created.account.nickname,
            roles: created.roles,
        }),
    ))
}

/// POST /api/auth/login
async fn handle_login(
    State(state): State<AppState>,
    ClientKey(client): ClientKey,
    body: Result<Json<LoginRequest>, JsonRejection>,
) -> ApiResult<Json<LoginResponse>> {
    if let Err(wait) = state.login_limiter.check(&client) {
        tracing::warn!(%client, "login rate limit exceeded");
        return Err(ApiError::RateLimited {
            retry_after_secs: wait.as_secs().max(1),
        });
    }

    let req = json_body(body)?;
    let auth = Arc::clone(&state.auth);
    let resp = blocking(move || auth.login(req)).await?;
    Ok(Json(resp))
}

/// GET /api/auth/me
async fn handle_me(identity: Identity) -> Json<Identity> {
    Json(identity)
}

#[derive(Debug, Serialize)]
pub struct AccountSummary {
    pub user_id: i64,
    pub public_id: i64,
    pub username: String,
    pub email: String,
    pub nickname: Option<String>,
    pub roles: Vec<String>,
    pub created_at: i64,
}

/// GET /api/admin/users
async fn handle_admin_list_users(
    State(state): State<AppState>,
) -> ApiResult<Json<Vec<AccountSummary>>> {
    let accounts = state.store().list_accounts()?;
    Ok(Json(
        accounts
            .into_iter()
            .map(|a| AccountSummary {
                user_id: a.account.id,
                public_id: a.account.public_id,
                username: a.account.username,
                email: a.account.email,
                nickname: a.account.nickname,
                roles: a.roles,
                created_at: a.account.created_at,
            })
            .collect(),
    ))
}

#[derive(Debug, Deserialize)]
pub struct RoleChange {
    #[serde(default)]
    pub role: String,
}

#[derive(Debug, Serialize)]
pub struct RoleChangeResponse {
    pub user_id: i64,
    pub role: String,
    /// Whether the membership actually changed.
    pub changed: bool,
    pub roles: Vec<String>,
}

/// POST /api/admin/users/{id}/roles
async fn handle_admin_grant_role(
    State(state): State<AppState>,
    actor: Identity,
    path: Result<Path<i64>, PathRejection>,
    body: Result<Json<RoleChange>, JsonRejection>,
) -> ApiResult<Json<RoleChangeResponse>> {
    let Path(user_id) = path.map_err(|e| ApiError::Validation(e.body_text()))?;
    let role = json_body(body)?.role.trim().to_string();
    if role.is_empty() {
        return Err(ApiError::Validation("role is required".into()));
    }

    let changed = state.store().assign_role(user_id, &role)?;
    tracing::info!(actor = actor.account_id, user_id, %role, changed, "admin granted role");
    Ok(Json(RoleChangeResponse {
        user_id,
        roles: state.store().roles_for(user_id)?,
        role,
        changed,
    }))
}

/// DELETE /api/admin/users/{id}/roles/{role}
async fn handle_admin_revoke_role(
    State(state): State<AppState>,
    actor: Identity,
    path: Result<Path<(i64, String)>, PathRejection>,
) -> ApiResult<Json<RoleChangeResponse>> {
    let Path((user_id, role)) = path.map_err(|e| ApiError::Validation(e.body_text()))?;

    let changed = state.store().revoke_role(user_id, &role)?;
    tracing::info!(actor = actor.account_id, user_id, %role, changed, "admin revoked role");
    Ok(Json(RoleChangeResponse {
        user_id,
        roles: state.store().roles_for(user_id)?,
        role,
        changed,
    }))
}

#[derive(Debug, Serialize)]
pub struct ChatReply {
    pub reply: String,
}

/// POST /api/chat
async fn handle_chat(
    State(state): State<AppState>,
    identity: Identity,
    body: Result<Json<ChatRequest>, JsonRejection>,
) -> ApiResult<Json<ChatReply>> {
    let req = json_body(body)?;
    let messages = build_messages(&state.system_prompt, &req)?;

    let started = Instant::now();
    let reply = state.chat.complete(&messages).await?;
    tracing::info!(
        account_id = identity.account_id,
        provider = state.chat.name(),
        turns = messages.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "chat reply generated"
    );
    Ok(Json(ChatReply { reply }))
}

/// POST /api/diary
async fn handle_diary_create(
    State(state): State<AppState>,
    identity: Identity,
    body: Result<Json<NewDiaryEntry>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<DiaryEntry>)> {
    let entry = json_body(body)?;
    let created = state.diary.create_entry(identity.account_id, entry).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// GET /api/diary
async fn handle_diary_list(
    State(state): State<AppState>,
    identity: Identity,
) -> ApiResult<Json<Vec<DiaryEntry>>> {
    Ok(Json(state.diary.list_entries(identity.account_id).await?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_state_is_clone() {
        fn assert_clone<T: Clone>() {}
        assert_clone::<AppState>();
    }

    #[test]
    fn rate_limiter_blocks_after_limit() {
        let limiter = SlidingWindowRateLimiter::new(2, Duration::from_secs(60));
        assert!(limiter.check("127.0.0.1").is_ok());
        assert!(limiter.check("127.0.0.1").is_ok());
        let wait = limiter.check("127.0.0.1").unwrap_err();
        assert!(wait <= Duration::from_secs(60));
        assert!(limiter.check("10.0.0.1").is_ok());
    }

    #[test]
    fn rate_limiter_sweep_removes_stale_entries() {
        let limiter = SlidingWindowRateLimiter::new(10, Duration::from_secs(60));
        assert!(limiter.check("ip-1").is_ok());
        assert!(limiter.check("ip-2").is_ok());
        assert!(limiter.check("ip-3").is_ok());

        {
            let mut guard = limiter.requests.lock();
            guard.1 = Instant::now()
                .checked_sub(Duration::from_secs(RATE_LIMITER_SWEEP_INTERVAL_SECS + 1))
                .unwrap();
            guard.0.get_mut("ip-2").unwrap().clear();
            guard.0.get_mut("ip-3").unwrap().clear();
        }

        assert!(limiter.check("ip-1").is_ok());

        let guard = limiter.requests.lock();
        assert_eq!(guard.0.len(), 1, "stale entries should have been swept");
        assert!(guard.0.contains_key("ip-1"));
    }

    #[test]
    fn rate_limiter_zero_limit_always_allows() {
        let limiter = SlidingWindowRateLimiter::new(0, Duration::from_secs(60));
        for _ in 0..100 {
            assert!(limiter.check("any-key").is_ok());
        }
    }

    #[test]
    fn trusted_proxy_headers_pick_first_forwarded_address() {
        let peer = Some(IpAddr::from([192, 0, 2, 1]));
        let mut headers = HeaderMap::new();
        assert_eq!(client_key(&headers, peer, true), "192.0.2.1");
        assert_eq!(client_key(&headers, None, true), "unknown");

        headers.insert("X-Real-IP", HeaderValue::from_static("10.1.1.1"));
        assert_eq!(client_key(&headers, peer, true), "10.1.1.1");

        headers.insert(
            "X-Forwarded-For",
            HeaderValue::from_static("203.0.113.9, 10.0.0.2"),
        );
        assert_eq!(client_key(&headers, peer, true), "203.0.113.9");
    }

    #[test]
    fn untrusted_forwarded_headers_are_ignored() {
        let mut headers = HeaderMap::new();
        headers.insert("X-Forwarded-For", HeaderValue::from_static("203.0.113.9"));
        let peer = Some(IpAddr::from([192, 0, 2, 1]));
        assert_eq!(client_key(&headers, peer, false), "192.0.2.1");
    }

    #[test]
    fn cors_rejects_malformed_origin() {
        assert!(cors_layer(&[]).is_ok());
        assert!(cors_layer(&["https://app.example.com".into()]).is_ok());
        assert!(cors_layer(&["bad\norigin".into()]).is_err());
    }

    #[test]
    fn seeding_includes_default_role() {
        let store = SqliteCredentialStore::open_in_memory().unwrap();
        seed_roles(&store, &["admin".into()], "member").unwrap();
        let id = store
            .insert_account(&crate::auth::NewAccount {
                public_id: 12_345_678,
                username: "bob".into(),
                email: "b@x.com".into(),
                password_hash: "x".into(),
                nickname: None,
                gender: None,
                age: None,
                major: None,
                roles: vec!["member".into(), "admin".into()],
            })
            .unwrap()
            .id;
        assert_eq!(store.roles_for(id).unwrap(), vec!["admin", "member"]);
    }
}
