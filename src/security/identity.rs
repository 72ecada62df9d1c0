//! External credential verification and user-directory lookups.
//!
//! Both are collaborators outside the gate: only their success or failure feeds the
//! login pipeline.

use super::access::Role;
use crate::APP_USER_AGENT;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use sqlx::{PgPool, Row};
use std::time::Duration;
use tracing::{debug, Instrument};
use url::Url;

pub const DEFAULT_INTROSPECTION_URL: &str = "https://oauth2.googleapis.com/tokeninfo";

/// What the identity provider vouches for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerifiedIdentity {
    pub email: String,
    pub email_verified: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("credential rejected")]
    Rejected,
    #[error("identity provider unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn verify(&self, role: Role, credential: &str)
        -> Result<VerifiedIdentity, IdentityError>;
}

/// Verifies OAuth ID tokens against a `tokeninfo`-style introspection endpoint.
#[derive(Clone, Debug)]
pub struct IntrospectionVerifier {
    client: Client,
    url: Url,
    audience: Option<String>,
}

#[derive(Deserialize)]
struct IntrospectionResponse {
    email: Option<String>,
    #[serde(default)]
    email_verified: Flag,
    aud: Option<String>,
}

// Providers send `email_verified` either as a JSON bool or as "true"/"false".
#[derive(Deserialize, Default)]
#[serde(untagged)]
enum Flag {
    Bool(bool),
    Text(String),
    #[default]
    Missing,
}

impl Flag {
    fn is_set(&self) -> bool {
        match self {
            Self::Bool(value) => *value,
            Self::Text(value) => value.eq_ignore_ascii_case("true"),
            Self::Missing => false,
        }
    }
}

impl IntrospectionVerifier {
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(url: Url, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .user_agent(APP_USER_AGENT)
            .timeout(timeout)
            .build()
            .context("failed to build introspection client")?;
        Ok(Self {
            client,
            url,
            audience: None,
        })
    }

    /// Require the token's `aud` to match the OAuth client id.
    #[must_use]
    pub fn with_audience(mut self, audience: Option<String>) -> Self {
        self.audience = audience.filter(|value| !value.is_empty());
        self
    }
}

#[async_trait]
impl IdentityVerifier for IntrospectionVerifier {
    async fn verify(
        &self,
        _role: Role,
        credential: &str,
    ) -> Result<VerifiedIdentity, IdentityError> {
        let span = tracing::info_span!("identity.introspect", http.url = %self.url);
        let response = self
            .client
            .get(self.url.clone())
            .query(&[("id_token", credential)])
            .send()
            .instrument(span)
            .await
            .map_err(|err| IdentityError::Unavailable(err.to_string()))?;

        let status = response.status();
        if status.is_client_error() {
            debug!("Identity provider rejected credential: {status}");
            return Err(IdentityError::Rejected);
        }
        if status != StatusCode::OK {
            return Err(IdentityError::Unavailable(format!(
                "unexpected status {status}"
            )));
        }

        let body: IntrospectionResponse = response
            .json()
            .await
            .map_err(|err| IdentityError::Unavailable(err.to_string()))?;

        if let Some(expected) = &self.audience {
            if body.aud.as_deref() != Some(expected.as_str()) {
                debug!("Identity token audience mismatch");
                return Err(IdentityError::Rejected);
            }
        }

        let email = body
            .email
            .filter(|email| !email.trim().is_empty())
            .ok_or(IdentityError::Rejected)?;

        Ok(VerifiedIdentity {
            email,
            email_verified: body.email_verified.is_set(),
        })
    }
}

/// A directory hit; admins have no role-scoped id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub role_scoped_id: Option<String>,
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Find the account for `email` under `role`; `email` is already normalized.
    async fn find_role_scoped_id(&self, email: &str, role: Role)
        -> Result<Option<DirectoryEntry>>;
}

/// Reads the `student`, `fa` and `admin` tables of the application database.
#[derive(Clone, Debug)]
pub struct PgUserDirectory {
    pool: PgPool,
}

impl PgUserDirectory {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserDirectory for PgUserDirectory {
    async fn find_role_scoped_id(
        &self,
        email: &str,
        role: Role,
    ) -> Result<Option<DirectoryEntry>> {
        let query = match role {
            Role::Student => "SELECT sid::text AS scoped_id FROM student WHERE lower(emailid) = $1",
            Role::Fa => "SELECT faid::text AS scoped_id FROM fa WHERE lower(emailid) = $1",
            Role::Admin => "SELECT NULL::text AS scoped_id FROM admin WHERE lower(email) = $1",
        };
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            role = role.as_str()
        );
        let row = sqlx::query(query)
            .bind(email)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .with_context(|| format!("failed to look up {role} account"))?;

        row.map(|row| {
            Ok(DirectoryEntry {
                role_scoped_id: row.try_get("scoped_id")?,
            })
        })
        .transpose()
    }
}
