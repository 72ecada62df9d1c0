//! Password-reset hand-off and response-timing obfuscation.
//!
//! The gate only decides whether a reset request may proceed. Producing and mailing the
//! reset link belongs to a `PasswordResetSender`; `LogPasswordResetSender` is the local
//! dev default and just logs the request.

use anyhow::Result;
use async_trait::async_trait;
use rand::Rng;
use std::time::Duration;
use tokio::time::sleep;
use tracing::info;

/// Identical reply for every accepted or silently dropped reset request.
pub const RESET_REQUESTED_MESSAGE: &str =
    "If an account exists with that email, a password reset link has been sent.";

#[async_trait]
pub trait PasswordResetSender: Send + Sync {
    /// Start a reset for `email`. Unknown emails must succeed silently.
    async fn request_reset(&self, email: &str) -> Result<()>;
}

#[derive(Clone, Debug)]
pub struct LogPasswordResetSender;

#[async_trait]
impl PasswordResetSender for LogPasswordResetSender {
    async fn request_reset(&self, email: &str) -> Result<()> {
        info!(email = %email, "password reset requested");
        Ok(())
    }
}

/// Randomized, non-blocking delay that masks whether an email exists.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ObfuscationDelay {
    base: Duration,
    jitter: Duration,
}

impl ObfuscationDelay {
    #[must_use]
    pub const fn new(base: Duration, jitter: Duration) -> Self {
        Self { base, jitter }
    }

    #[must_use]
    pub const fn none() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO)
    }

    /// Pick the delay for one response: `base` plus up to `jitter`.
    #[must_use]
    pub fn sample(&self) -> Duration {
        let jitter_ms = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        if jitter_ms == 0 {
            return self.base;
        }
        self.base + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }

    /// Sleep on the timer wheel; the worker thread stays free.
    pub async fn wait(&self) {
        let delay = self.sample();
        if !delay.is_zero() {
            sleep(delay).await;
        }
    }
}

impl Default for ObfuscationDelay {
    fn default() -> Self {
        Self::new(Duration::from_millis(150), Duration::from_millis(100))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_delay_stays_in_range() {
        let delay = ObfuscationDelay::default();
        for _ in 0..100 {
            let sample = delay.sample();
            assert!(sample >= Duration::from_millis(150));
            assert!(sample <= Duration::from_millis(250));
        }
    }

    #[test]
    fn none_is_zero() {
        assert_eq!(ObfuscationDelay::none().sample(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_uses_the_timer() {
        let delay = ObfuscationDelay::new(Duration::from_secs(5), Duration::ZERO);
        let started = tokio::time::Instant::now();
        delay.wait().await;
        assert!(started.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test]
    async fn log_sender_accepts_any_email() {
        assert!(LogPasswordResetSender
            .request_reset("unknown@example.com")
            .await
            .is_ok());
    }
}
