//! Anti-forgery tokens bound 1:1 to a refresh-token session.
//!
//! Entries are keyed by a hash of the session id, so raw refresh tokens are never
//! held in memory past the request that presented them.

use super::store::{BoundedStore, StoreLimits};
use super::utils::{constant_time_eq, generate_token, hash_token};
use anyhow::Result;
use base64ct::{Base64UrlUnpadded, Encoding};
use std::sync::Arc;
use std::time::Duration;
use tokio::{task::JoinHandle, time::Instant};

pub const CSRF_TOKEN_BYTES: usize = 32;
pub const DEFAULT_CSRF_TOKEN_TTL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug)]
struct CsrfEntry {
    value: String,
    expires_at: Instant,
}

#[derive(Debug)]
pub struct CsrfBinder {
    ttl: Duration,
    store: Arc<BoundedStore<CsrfEntry>>,
}

impl CsrfBinder {
    #[must_use]
    pub fn new(ttl: Duration, limits: StoreLimits) -> Self {
        Self {
            ttl,
            store: Arc::new(BoundedStore::new("csrf", limits.with_min_idle_ttl(ttl))),
        }
    }

    /// Issue a fresh token for `session_id`, replacing any earlier one.
    ///
    /// # Errors
    /// Returns an error if the random source fails.
    pub fn generate(&self, session_id: &str) -> Result<String> {
        let value = generate_token(CSRF_TOKEN_BYTES)?;
        self.store.insert(
            &session_key(session_id),
            CsrfEntry {
                value: value.clone(),
                expires_at: Instant::now() + self.ttl,
            },
        );
        Ok(value)
    }

    /// True only when both values are present and `supplied` is the latest token issued
    /// for `session_id`.
    #[must_use]
    pub fn validate(&self, session_id: Option<&str>, supplied: Option<&str>) -> bool {
        let session_id = session_id.filter(|value| !value.is_empty());
        let supplied = supplied.filter(|value| !value.is_empty());
        let (Some(session_id), Some(supplied)) = (session_id, supplied) else {
            return false;
        };

        let now = Instant::now();
        self.store
            .read(&session_key(session_id), |entry| {
                entry.expires_at > now && constant_time_eq(&entry.value, supplied)
            })
            .unwrap_or(false)
    }

    /// Whether `session_id` has an unexpired token, whatever its value.
    #[must_use]
    pub fn is_bound(&self, session_id: &str) -> bool {
        if session_id.is_empty() {
            return false;
        }
        let now = Instant::now();
        self.store
            .read(&session_key(session_id), |entry| entry.expires_at > now)
            .unwrap_or(false)
    }

    pub fn invalidate(&self, session_id: &str) {
        self.store.remove(&session_key(session_id));
    }

    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn spawn_sweeper(&self, every: Duration) -> JoinHandle<()> {
        self.store.spawn_sweeper(every)
    }
}

fn session_key(session_id: &str) -> String {
    Base64UrlUnpadded::encode_string(&hash_token(session_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::advance;

    const SESSION: &str = "refresh-token-value";

    fn binder() -> CsrfBinder {
        CsrfBinder::new(Duration::from_secs(600), StoreLimits::default())
    }

    #[tokio::test(start_paused = true)]
    async fn validates_latest_token_only() -> anyhow::Result<()> {
        let binder = binder();
        let first = binder.generate(SESSION)?;
        assert!(binder.validate(Some(SESSION), Some(&first)));

        let second = binder.generate(SESSION)?;
        assert_ne!(first, second);
        assert!(!binder.validate(Some(SESSION), Some(&first)));
        assert!(binder.validate(Some(SESSION), Some(&second)));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn missing_session_always_fails() -> anyhow::Result<()> {
        let binder = binder();
        let token = binder.generate(SESSION)?;
        assert!(!binder.validate(None, Some(&token)));
        assert!(!binder.validate(Some(""), Some(&token)));
        assert!(!binder.validate(None, None));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn missing_or_wrong_header_fails() -> anyhow::Result<()> {
        let binder = binder();
        let token = binder.generate(SESSION)?;
        assert!(!binder.validate(Some(SESSION), None));
        assert!(!binder.validate(Some(SESSION), Some("")));
        assert!(!binder.validate(Some(SESSION), Some("forged")));
        assert!(!binder.validate(Some("other-session"), Some(&token)));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn binding_tracks_generate_invalidate_and_expiry() -> anyhow::Result<()> {
        let binder = binder();
        assert!(!binder.is_bound(SESSION));
        assert!(!binder.is_bound(""));

        binder.generate(SESSION)?;
        assert!(binder.is_bound(SESSION));
        binder.invalidate(SESSION);
        assert!(!binder.is_bound(SESSION));

        binder.generate(SESSION)?;
        advance(Duration::from_secs(601)).await;
        assert!(!binder.is_bound(SESSION));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_session_fails() {
        assert!(!binder().validate(Some(SESSION), Some("anything")));
    }

    #[tokio::test(start_paused = true)]
    async fn invalidate_and_expiry_reject() -> anyhow::Result<()> {
        let binder = binder();
        let token = binder.generate(SESSION)?;
        binder.invalidate(SESSION);
        assert!(!binder.validate(Some(SESSION), Some(&token)));

        let token = binder.generate(SESSION)?;
        advance(Duration::from_secs(601)).await;
        assert!(!binder.validate(Some(SESSION), Some(&token)));
        Ok(())
    }
}
