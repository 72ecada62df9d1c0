//! # Gardisto (login and session security gate)
//!
//! `gardisto` protects a multi-role web backend (students, faculty advisors and
//! admins) against credential stuffing, brute force and session/CSRF forgery.
//!
//! ## Components
//!
//! - **Token bucket:** per-key rate limiting (login by IP, registration, forgot-password).
//! - **Attempt tracker:** sliding-window failure counter that locks an identifier out.
//! - **Bounded store:** capacity and idle-TTL bounded map shared by the in-memory components.
//! - **Refresh tokens:** opaque, database-backed session tokens, one per (email, role).
//! - **CSRF binder:** anti-forgery value bound 1:1 to a refresh-token session.
//! - **Access tokens:** short-lived `PASETO` v4.local tokens carrying identity and role.
//!
//! ## Request gate
//!
//! Every login runs a fixed pipeline: IP bucket, account lockout, external credential
//! verification, then session issuance. Any stage may reject, and every stage fails
//! closed: an internal fault in a check is a rejection, never a bypass.
//!
//! Credential verification itself (OAuth introspection, user directory lookups) is
//! consumed through traits so the gate only sees success or failure.

pub mod api;
pub mod cli;
pub mod security;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);
