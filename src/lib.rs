//! MindHaven: authentication and access-control gateway for a student
//! mental-health community.
//!
//! Accounts register and log in over HTTP, receive a signed session token,
//! and reach member-only features (AI listener chat, private diary) and
//! role-gated admin endpoints through the request guard in [`auth::guard`].

pub mod auth;
pub mod chat;
pub mod config;
pub mod diary;
pub mod error;
pub mod gateway;

pub use config::Config;
pub use error::{ApiError, ApiResult};
