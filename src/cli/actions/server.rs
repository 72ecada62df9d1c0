use crate::{
    api::{self, HttpConfig},
    cli::telemetry,
    security::{identity::IntrospectionVerifier, AccessTokenCodec, GateConfig},
};
use anyhow::{Context, Result};
use secrecy::SecretString;
use std::{fmt, sync::Arc, time::Duration};
use tracing::{info, warn};
use url::Url;

pub struct Args {
    pub port: u16,
    pub dsn: String,
    pub http: HttpConfig,
    pub gate: GateConfig,
    pub access_token_secret: Option<SecretString>,
    pub access_token_ttl: Duration,
    pub identity_url: Url,
    pub identity_audience: Option<String>,
}

impl fmt::Debug for Args {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Args")
            .field("port", &self.port)
            .field("dsn", &redact_dsn(&self.dsn))
            .field("http", &self.http)
            .field("gate", &self.gate)
            .field("access_token_secret_set", &self.access_token_secret.is_some())
            .field("access_token_ttl", &self.access_token_ttl)
            .field("identity_url", &self.identity_url.as_str())
            .field("identity_audience", &self.identity_audience)
            .finish()
    }
}

/// Execute the server action.
/// # Errors
/// Returns an error if the access-token key is invalid or the server fails to start.
pub async fn execute(args: Args) -> Result<()> {
    log_startup_args(&args);

    let access = match &args.access_token_secret {
        Some(secret) => AccessTokenCodec::from_base64(secret, args.access_token_ttl)
            .context("Invalid access token secret")?,
        None => {
            warn!("No access token secret configured; using a random key, sessions will not survive a restart");
            AccessTokenCodec::random(args.access_token_ttl)
                .context("Failed to generate access token key")?
        }
    };

    let identity = IntrospectionVerifier::new(args.identity_url, args.gate.verify_timeout())?
        .with_audience(args.identity_audience);

    let result = api::new(
        args.port,
        &args.dsn,
        args.http,
        args.gate,
        access,
        Arc::new(identity),
    )
    .await;

    telemetry::shutdown_tracer();

    result
}

fn log_startup_args(args: &Args) {
    let login = args.gate.login_by_ip();
    let lockout = args.gate.login_lockout();
    let entries = [
        ("listen", format!("tcp:{}", args.port)),
        ("dsn", redact_dsn(&args.dsn)),
        ("frontend", args.http.frontend_base_url().to_string()),
        ("cookie_secure", args.http.cookie_secure().to_string()),
        (
            "trust_proxy_headers",
            args.http.trust_proxy_headers().to_string(),
        ),
        ("identity_url", args.identity_url.to_string()),
        (
            "login_by_ip",
            format!("{}/{}s", login.capacity, login.interval.as_secs()),
        ),
        (
            "lockout",
            format!(
                "{} failures in {}s -> {}s",
                lockout.threshold,
                lockout.window.as_secs(),
                lockout.lockout.as_secs()
            ),
        ),
    ];

    let max_key_len = entries.iter().map(|(key, _)| key.len()).max().unwrap_or(0);
    let mut message = format!(
        "{} {} - {}\n\nStartup configuration:",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        short_commit(crate::GIT_COMMIT_HASH)
    );
    for (key, value) in entries {
        let padding = " ".repeat(max_key_len.saturating_sub(key.len()));
        let _ = fmt::Write::write_fmt(&mut message, format_args!("\n  {key}:{padding} {value}"));
    }
    info!("{message}");
}

fn redact_dsn(dsn: &str) -> String {
    match Url::parse(dsn) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("REDACTED"));
            }
            parsed.to_string()
        }
        Err(_) => "invalid-dsn".to_string(),
    }
}

fn short_commit(hash: &str) -> &str {
    let trimmed = hash.trim();
    trimmed.get(..7).unwrap_or(trimmed)
}
