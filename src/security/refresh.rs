//! Durable refresh tokens.
//!
//! Flow Overview:
//! 1) `create` mints 64 random bytes, stores their SHA-256 hash and replaces any earlier
//!    token for the same (email, role).
//! 2) `verify` looks the hash up; an expired row is deleted on sight and reads as absent.
//! 3) `invalidate` deletes by value on logout; a background sweeper purges expired rows.
//!
//! The token itself is not rotated on refresh, so a captured token stays usable until it
//! expires or its owner logs in again.

use super::access::Role;
use super::utils::{generate_token, hash_token};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use std::{collections::HashMap, fmt, sync::Arc, time::Duration};
use tokio::{
    sync::Mutex,
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tracing::{error, info, Instrument};
use uuid::Uuid;

pub const REFRESH_TOKEN_BYTES: usize = 64;
pub const DEFAULT_REFRESH_TOKEN_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);
pub const SCHEMA_SQL: &str = include_str!("../../db/sql/01_refresh_tokens.sql");

/// Who a refresh token belongs to.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SessionOwner {
    pub email: String,
    pub role: Role,
}

impl SessionOwner {
    #[must_use]
    pub fn new(email: impl Into<String>, role: Role) -> Self {
        Self {
            email: email.into(),
            role,
        }
    }
}

/// Where a login came from, recorded alongside the token.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClientContext {
    pub ip: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Clone)]
pub struct RefreshToken {
    pub id: Uuid,
    pub value: String,
    pub owner: SessionOwner,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub source_ip: Option<String>,
    pub user_agent: Option<String>,
}

impl fmt::Debug for RefreshToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefreshToken")
            .field("id", &self.id)
            .field("value", &"[REDACTED]")
            .field("owner", &self.owner)
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .field("source_ip", &self.source_ip)
            .field("user_agent", &self.user_agent)
            .finish()
    }
}

#[async_trait]
pub trait RefreshTokenStore: Send + Sync {
    /// Issue a new token for `owner`, deleting every earlier token for the same pair.
    async fn create(&self, owner: &SessionOwner, client: &ClientContext) -> Result<RefreshToken>;

    /// Resolve a presented token. Unknown and expired tokens yield `None`.
    async fn verify(&self, token: &str) -> Result<Option<RefreshToken>>;

    async fn invalidate(&self, token: &str) -> Result<()>;

    /// Delete every expired token, returning how many were removed.
    async fn purge_expired(&self) -> Result<u64>;
}

#[derive(Clone, Debug)]
pub struct PgRefreshTokenStore {
    pool: PgPool,
    ttl: Duration,
}

impl PgRefreshTokenStore {
    #[must_use]
    pub fn new(pool: PgPool, ttl: Duration) -> Self {
        Self { pool, ttl }
    }

    /// Create the `refresh_tokens` table if it does not exist.
    ///
    /// # Errors
    /// Returns an error if the DDL fails.
    pub async fn ensure_schema(&self) -> Result<()> {
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "CREATE TABLE"
        );
        sqlx::raw_sql(SCHEMA_SQL)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to apply refresh_tokens schema")?;
        Ok(())
    }

    fn ttl_seconds(&self) -> Result<i64> {
        i64::try_from(self.ttl.as_secs()).context("refresh token ttl out of range")
    }
}

#[async_trait]
impl RefreshTokenStore for PgRefreshTokenStore {
    async fn create(&self, owner: &SessionOwner, client: &ClientContext) -> Result<RefreshToken> {
        let value = generate_token(REFRESH_TOKEN_BYTES)?;
        let token_hash = hash_token(&value);

        // Upsert on the owner key: replaces the previous token in one statement.
        let query = r"
            INSERT INTO refresh_tokens
                (token_hash, user_email, user_role, issued_at, expires_at, ip_address, user_agent)
            VALUES ($1, $2, $3, NOW(), NOW() + ($4::bigint * INTERVAL '1 second'), $5, $6)
            ON CONFLICT (user_email, user_role) DO UPDATE SET
                id = gen_random_uuid(),
                token_hash = EXCLUDED.token_hash,
                issued_at = EXCLUDED.issued_at,
                expires_at = EXCLUDED.expires_at,
                ip_address = EXCLUDED.ip_address,
                user_agent = EXCLUDED.user_agent
            RETURNING id, issued_at, expires_at
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT"
        );
        let row = sqlx::query(query)
            .bind(token_hash)
            .bind(&owner.email)
            .bind(owner.role.as_str())
            .bind(self.ttl_seconds()?)
            .bind(client.ip.as_deref())
            .bind(client.user_agent.as_deref())
            .fetch_one(&self.pool)
            .instrument(span)
            .await
            .context("failed to store refresh token")?;

        Ok(RefreshToken {
            id: row.try_get("id")?,
            value,
            owner: owner.clone(),
            issued_at: row.try_get("issued_at")?,
            expires_at: row.try_get("expires_at")?,
            source_ip: client.ip.clone(),
            user_agent: client.user_agent.clone(),
        })
    }

    async fn verify(&self, token: &str) -> Result<Option<RefreshToken>> {
        let token_hash = hash_token(token);
        let query = r"
            SELECT id, user_email, user_role, issued_at, expires_at, ip_address, user_agent,
                   expires_at <= NOW() AS expired
            FROM refresh_tokens
            WHERE token_hash = $1
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT"
        );
        let Some(row) = sqlx::query(query)
            .bind(&token_hash)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to look up refresh token")?
        else {
            return Ok(None);
        };

        if row.try_get::<bool, _>("expired")? {
            self.invalidate(token).await?;
            return Ok(None);
        }

        let role: String = row.try_get("user_role")?;
        Ok(Some(RefreshToken {
            id: row.try_get("id")?,
            value: token.to_string(),
            owner: SessionOwner {
                email: row.try_get("user_email")?,
                role: role.parse().context("unexpected role in refresh_tokens")?,
            },
            issued_at: row.try_get("issued_at")?,
            expires_at: row.try_get("expires_at")?,
            source_ip: row.try_get("ip_address")?,
            user_agent: row.try_get("user_agent")?,
        }))
    }

    async fn invalidate(&self, token: &str) -> Result<()> {
        let query = "DELETE FROM refresh_tokens WHERE token_hash = $1";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "DELETE"
        );
        sqlx::query(query)
            .bind(hash_token(token))
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to delete refresh token")?;
        Ok(())
    }

    async fn purge_expired(&self) -> Result<u64> {
        let query = "DELETE FROM refresh_tokens WHERE expires_at <= NOW()";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "DELETE"
        );
        let result = sqlx::query(query)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to purge expired refresh tokens")?;
        Ok(result.rows_affected())
    }
}

/// Process-local store for tests and single-node development.
///
/// Tokens are lost on restart, which forces every user to log in again.
#[derive(Debug)]
pub struct MemoryRefreshTokenStore {
    ttl: Duration,
    tokens: Mutex<HashMap<Vec<u8>, RefreshToken>>,
}

impl MemoryRefreshTokenStore {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            tokens: Mutex::new(HashMap::new()),
        }
    }

    pub async fn len(&self) -> usize {
        self.tokens.lock().await.len()
    }
}

#[async_trait]
impl RefreshTokenStore for MemoryRefreshTokenStore {
    async fn create(&self, owner: &SessionOwner, client: &ClientContext) -> Result<RefreshToken> {
        let value = generate_token(REFRESH_TOKEN_BYTES)?;
        let issued_at = Utc::now();
        let ttl = chrono::Duration::from_std(self.ttl).context("refresh token ttl out of range")?;
        let token = RefreshToken {
            id: Uuid::new_v4(),
            value: value.clone(),
            owner: owner.clone(),
            issued_at,
            expires_at: issued_at + ttl,
            source_ip: client.ip.clone(),
            user_agent: client.user_agent.clone(),
        };

        let mut tokens = self.tokens.lock().await;
        tokens.retain(|_, existing| existing.owner != *owner);
        tokens.insert(hash_token(&value), token.clone());
        Ok(token)
    }

    async fn verify(&self, token: &str) -> Result<Option<RefreshToken>> {
        let token_hash = hash_token(token);
        let mut tokens = self.tokens.lock().await;
        let Some(record) = tokens.get(&token_hash) else {
            return Ok(None);
        };
        if record.expires_at <= Utc::now() {
            tokens.remove(&token_hash);
            return Ok(None);
        }
        Ok(Some(record.clone()))
    }

    async fn invalidate(&self, token: &str) -> Result<()> {
        self.tokens.lock().await.remove(&hash_token(token));
        Ok(())
    }

    async fn purge_expired(&self) -> Result<u64> {
        let now = Utc::now();
        let mut tokens = self.tokens.lock().await;
        let before = tokens.len();
        tokens.retain(|_, record| record.expires_at > now);
        Ok(u64::try_from(before - tokens.len()).unwrap_or(u64::MAX))
    }
}

/// Periodically delete expired refresh tokens until the handle is aborted.
pub fn spawn_expiry_sweeper(store: Arc<dyn RefreshTokenStore>, every: Duration) -> JoinHandle<()> {
    let every = every.max(Duration::from_secs(1));
    tokio::spawn(async move {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            match store.purge_expired().await {
                Ok(0) => {}
                Ok(purged) => info!(purged, "purged expired refresh tokens"),
                Err(err) => error!("Failed to purge expired refresh tokens: {err:#}"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn student(email: &str) -> SessionOwner {
        SessionOwner::new(email, Role::Student)
    }

    fn client() -> ClientContext {
        ClientContext {
            ip: Some("10.0.0.1".to_string()),
            user_agent: Some("test-agent".to_string()),
        }
    }

    #[tokio::test]
    async fn create_then_verify() -> Result<()> {
        let store = MemoryRefreshTokenStore::new(DEFAULT_REFRESH_TOKEN_TTL);
        let token = store.create(&student("a@b.com"), &client()).await?;
        assert!(token.value.len() >= 86);

        let verified = store.verify(&token.value).await?;
        let verified = verified.context("token should verify")?;
        assert_eq!(verified.owner, student("a@b.com"));
        assert_eq!(verified.source_ip.as_deref(), Some("10.0.0.1"));
        assert_eq!(verified.expires_at - verified.issued_at, chrono::Duration::days(7));
        Ok(())
    }

    #[tokio::test]
    async fn create_replaces_tokens_for_same_owner_only() -> Result<()> {
        let store = MemoryRefreshTokenStore::new(DEFAULT_REFRESH_TOKEN_TTL);
        let first = store.create(&student("a@b.com"), &client()).await?;
        let as_fa = store
            .create(&SessionOwner::new("a@b.com", Role::Fa), &client())
            .await?;
        let second = store.create(&student("a@b.com"), &client()).await?;

        assert!(store.verify(&first.value).await?.is_none());
        assert!(store.verify(&second.value).await?.is_some());
        assert!(store.verify(&as_fa.value).await?.is_some());
        assert_eq!(store.len().await, 2);
        Ok(())
    }

    #[tokio::test]
    async fn expired_tokens_are_deleted_on_verify() -> Result<()> {
        let store = MemoryRefreshTokenStore::new(Duration::ZERO);
        let token = store.create(&student("a@b.com"), &client()).await?;

        assert!(store.verify(&token.value).await?.is_none());
        assert_eq!(store.len().await, 0);
        Ok(())
    }

    #[tokio::test]
    async fn invalidate_and_purge() -> Result<()> {
        let store = MemoryRefreshTokenStore::new(DEFAULT_REFRESH_TOKEN_TTL);
        let token = store.create(&student("a@b.com"), &client()).await?;
        store.invalidate(&token.value).await?;
        assert!(store.verify(&token.value).await?.is_none());

        let expiring = MemoryRefreshTokenStore::new(Duration::ZERO);
        expiring.create(&student("a@b.com"), &client()).await?;
        expiring.create(&student("b@b.com"), &client()).await?;
        assert_eq!(expiring.purge_expired().await?, 2);
        Ok(())
    }

    #[test]
    fn debug_redacts_value() {
        let token = RefreshToken {
            id: Uuid::nil(),
            value: "secret-value".to_string(),
            owner: student("a@b.com"),
            issued_at: Utc::now(),
            expires_at: Utc::now(),
            source_ip: None,
            user_agent: None,
        };
        assert!(!format!("{token:?}").contains("secret-value"));
    }
}
