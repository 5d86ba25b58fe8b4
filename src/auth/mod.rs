//! Account authentication and access control.
//!
//! Provides:
//! - Credential store: accounts, roles, role assignments (SQLite)
//! - Password hashing (PBKDF2-SHA256, PHC strings)
//! - Session tokens (HS256 JWT, 24h default lifetime, no server-side state)
//! - Request guard and role gate middleware for axum
//!
//! ## Design Decisions
//! - Tokens carry a role snapshot for clients, but the guard always re-reads
//!   roles from the store, so grants and revocations apply to live tokens.
//! - Uniqueness is enforced by database constraints, not application locks.
//! - There is no logout/revocation list; a token lives until it expires.

pub mod guard;
pub mod password;
pub mod service;
pub mod store;
pub mod token;

pub use guard::{authenticate, require_roles, Identity, RoleGate};
pub use service::{AuthPolicy, AuthService, LoginRequest, LoginResponse, RegisterRequest};
pub use store::{
    Account, AccountWithRoles, CredentialStore, NewAccount, SqliteCredentialStore, StoreError,
    UniqueField,
};
pub use token::{SessionClaims, TokenService};
