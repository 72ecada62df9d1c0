//! Request gate: runs the security pipeline for logins, refreshes, logouts and every
//! protected request, and turns each outcome into one [`GateError`] decision.
//!
//! Login order is fixed: IP bucket, account lockout, external credential verification,
//! then session issuance. The first rejecting stage ends the pipeline; later stages are
//! never called. Internal faults are rejections too.

use super::access::{AccessTokenClaims, AccessTokenCodec, Role};
use super::attempts::{AttemptTracker, LockoutPolicy};
use super::bucket::{RateLimitPolicy, TokenBucket};
use super::csrf::{CsrfBinder, DEFAULT_CSRF_TOKEN_TTL};
use super::identity::{DirectoryEntry, IdentityError, IdentityVerifier, UserDirectory};
use super::recovery::{ObfuscationDelay, PasswordResetSender};
use super::refresh::{
    spawn_expiry_sweeper, ClientContext, RefreshTokenStore, SessionOwner,
    DEFAULT_REFRESH_TOKEN_TTL,
};
use super::store::StoreLimits;
use super::utils::{normalize_email, valid_email};
use secrecy::{ExposeSecret, SecretString};
use std::{fmt, sync::Arc, time::Duration};
use tokio::{task::JoinHandle, time::timeout};
use tracing::{debug, error, info, instrument, warn};
use ulid::Ulid;

/// Bucket key for requests whose client address cannot be resolved.
pub const UNKNOWN_CLIENT: &str = "unknown";

/// Paths that do not need an access token.
pub const PUBLIC_PATHS: &[&str] = &[
    "/api/auth/login-student",
    "/api/auth/login-fa",
    "/api/auth/refresh",
    "/api/auth/logout",
    "/api/auth/register",
    "/admin/login",
    "/admin/refresh",
    "/admin/logout",
    "/admin/register",
    "/admin/forgot-password",
    "/admin/reset-password",
    "/health",
    "/swagger-ui",
    "/api-docs",
];

/// Paths skipped by the generic CSRF check. Refresh and logout are listed because they
/// validate CSRF themselves against the refresh-token cookie.
pub const CSRF_EXEMPT_PATHS: &[&str] = &[
    "/api/auth/login-student",
    "/api/auth/login-fa",
    "/api/auth/refresh",
    "/api/auth/logout",
    "/api/auth/register",
    "/admin/login",
    "/admin/refresh",
    "/admin/logout",
    "/admin/register",
    "/admin/forgot-password",
    "/admin/reset-password",
];

/// Paths rate limited with the registration policy.
pub const REGISTRATION_PATHS: &[&str] = &["/api/auth/register", "/admin/register"];

const ROLE_PREFIXES: &[(&str, Role)] = &[
    ("/api/student", Role::Student),
    ("/api/fa", Role::Fa),
    ("/api/admin", Role::Admin),
    ("/admin", Role::Admin),
];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GateError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("rate limited: {remaining_seconds}s remaining")]
    RateLimited { remaining_seconds: u64 },
    #[error("account locked: {remaining_seconds}s remaining")]
    Locked { remaining_seconds: u64 },
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("authentication required")]
    Unauthenticated,
    #[error("refresh token missing or expired")]
    SessionExpired,
    #[error("CSRF validation failed")]
    Csrf,
    #[error("access denied")]
    Forbidden,
    #[error("internal error (correlation id {correlation_id})")]
    Internal { correlation_id: Ulid },
}

impl GateError {
    /// Log `err` under a fresh correlation id and hide it from the client.
    pub fn internal(context: &str, err: impl Into<anyhow::Error>) -> Self {
        let correlation_id = Ulid::new();
        let err = err.into();
        error!(%correlation_id, "{context}: {err:#}");
        Self::Internal { correlation_id }
    }
}

#[derive(Clone, Debug)]
pub struct GateConfig {
    login_by_ip: RateLimitPolicy,
    registration_by_ip: RateLimitPolicy,
    forgot_password_by_ip: RateLimitPolicy,
    forgot_password_by_email: RateLimitPolicy,
    login_lockout: LockoutPolicy,
    limiter_limits: StoreLimits,
    csrf_limits: StoreLimits,
    csrf_token_ttl: Duration,
    refresh_token_ttl: Duration,
    verify_timeout: Duration,
    response_delay: ObfuscationDelay,
}

impl GateConfig {
    #[must_use]
    pub fn new() -> Self {
        Self {
            login_by_ip: RateLimitPolicy::LOGIN_BY_IP,
            registration_by_ip: RateLimitPolicy::REGISTRATION_BY_IP,
            forgot_password_by_ip: RateLimitPolicy::FORGOT_PASSWORD_BY_IP,
            forgot_password_by_email: RateLimitPolicy::FORGOT_PASSWORD_BY_EMAIL,
            login_lockout: LockoutPolicy::LOGIN,
            limiter_limits: StoreLimits::default(),
            csrf_limits: StoreLimits::new(100_000, DEFAULT_CSRF_TOKEN_TTL),
            csrf_token_ttl: DEFAULT_CSRF_TOKEN_TTL,
            refresh_token_ttl: DEFAULT_REFRESH_TOKEN_TTL,
            verify_timeout: Duration::from_secs(5),
            response_delay: ObfuscationDelay::default(),
        }
    }

    #[must_use]
    pub fn with_login_by_ip(mut self, policy: RateLimitPolicy) -> Self {
        self.login_by_ip = policy;
        self
    }

    #[must_use]
    pub fn with_registration_by_ip(mut self, policy: RateLimitPolicy) -> Self {
        self.registration_by_ip = policy;
        self
    }

    #[must_use]
    pub fn with_forgot_password_by_ip(mut self, policy: RateLimitPolicy) -> Self {
        self.forgot_password_by_ip = policy;
        self
    }

    #[must_use]
    pub fn with_forgot_password_by_email(mut self, policy: RateLimitPolicy) -> Self {
        self.forgot_password_by_email = policy;
        self
    }

    #[must_use]
    pub fn with_login_lockout(mut self, policy: LockoutPolicy) -> Self {
        self.login_lockout = policy;
        self
    }

    #[must_use]
    pub fn with_limiter_limits(mut self, limits: StoreLimits) -> Self {
        self.limiter_limits = limits;
        self
    }

    #[must_use]
    pub fn with_csrf_limits(mut self, limits: StoreLimits) -> Self {
        self.csrf_limits = limits;
        self
    }

    /// Lifetime of a CSRF token; every refresh issues a new one.
    #[must_use]
    pub fn with_csrf_token_ttl(mut self, ttl: Duration) -> Self {
        self.csrf_token_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_refresh_token_ttl(mut self, ttl: Duration) -> Self {
        self.refresh_token_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_verify_timeout(mut self, verify_timeout: Duration) -> Self {
        self.verify_timeout = verify_timeout;
        self
    }

    #[must_use]
    pub fn with_response_delay(mut self, delay: ObfuscationDelay) -> Self {
        self.response_delay = delay;
        self
    }

    #[must_use]
    pub fn login_by_ip(&self) -> RateLimitPolicy {
        self.login_by_ip
    }

    #[must_use]
    pub fn login_lockout(&self) -> LockoutPolicy {
        self.login_lockout
    }

    #[must_use]
    pub fn refresh_token_ttl(&self) -> Duration {
        self.refresh_token_ttl
    }

    #[must_use]
    pub fn csrf_token_ttl(&self) -> Duration {
        self.csrf_token_ttl
    }

    #[must_use]
    pub fn verify_timeout(&self) -> Duration {
        self.verify_timeout
    }
}

impl Default for GateConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Services the gate consumes but does not own.
#[derive(Clone)]
pub struct Collaborators {
    pub refresh_tokens: Arc<dyn RefreshTokenStore>,
    pub identity: Arc<dyn IdentityVerifier>,
    pub directory: Arc<dyn UserDirectory>,
    pub reset_sender: Arc<dyn PasswordResetSender>,
}

pub struct LoginRequest {
    pub role: Role,
    pub email: String,
    pub credential: SecretString,
    pub client: ClientContext,
}

/// Tokens handed back after a login or refresh.
#[derive(Clone)]
pub struct IssuedSession {
    pub access_token: String,
    /// Only set on login; refresh keeps the existing refresh token.
    pub refresh_token: Option<String>,
    pub csrf_token: String,
    pub email: String,
    pub role: Role,
    pub role_scoped_id: Option<String>,
}

impl fmt::Debug for IssuedSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedSession")
            .field("email", &self.email)
            .field("role", &self.role)
            .field("role_scoped_id", &self.role_scoped_id)
            .finish_non_exhaustive()
    }
}

/// Credentials presented with a request to a protected path.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProtectedRequest<'a> {
    pub method: &'a str,
    pub path: &'a str,
    pub access_token: Option<&'a str>,
    /// The refresh-token cookie; it doubles as the CSRF session id.
    pub session_id: Option<&'a str>,
    pub csrf_token: Option<&'a str>,
}

/// Background sweepers owned by a running gate.
#[derive(Debug)]
pub struct GateTasks {
    handles: Vec<JoinHandle<()>>,
}

impl GateTasks {
    pub fn shutdown(self) {
        for handle in self.handles {
            handle.abort();
        }
        debug!("gate sweepers stopped");
    }
}

enum VerifyFailure {
    // Counts toward the lockout.
    Rejected(&'static str),
    // Provider down or too slow; rejected without counting.
    Unavailable(String),
    Internal(anyhow::Error),
}

pub struct Gate {
    config: GateConfig,
    login_by_ip: TokenBucket,
    registration_by_ip: TokenBucket,
    forgot_password_by_ip: TokenBucket,
    forgot_password_by_email: TokenBucket,
    login_lockouts: AttemptTracker,
    csrf: CsrfBinder,
    access: AccessTokenCodec,
    services: Collaborators,
}

impl fmt::Debug for Gate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gate")
            .field("config", &self.config)
            .field("access", &self.access)
            .finish_non_exhaustive()
    }
}

impl Gate {
    #[must_use]
    pub fn new(config: GateConfig, access: AccessTokenCodec, services: Collaborators) -> Self {
        let limits = config.limiter_limits;
        Self {
            login_by_ip: TokenBucket::new("login_by_ip", config.login_by_ip, limits),
            registration_by_ip: TokenBucket::new(
                "registration_by_ip",
                config.registration_by_ip,
                limits,
            ),
            forgot_password_by_ip: TokenBucket::new(
                "forgot_password_by_ip",
                config.forgot_password_by_ip,
                limits,
            ),
            forgot_password_by_email: TokenBucket::new(
                "forgot_password_by_email",
                config.forgot_password_by_email,
                limits,
            ),
            login_lockouts: AttemptTracker::new("login_lockouts", config.login_lockout, limits),
            csrf: CsrfBinder::new(config.csrf_token_ttl, config.csrf_limits),
            access,
            services,
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    #[must_use]
    pub fn access_token_ttl(&self) -> Duration {
        self.access.ttl()
    }

    /// Start the sweepers that keep the in-memory stores and the refresh-token table small.
    #[must_use]
    pub fn spawn_sweepers(&self, every: Duration) -> GateTasks {
        let handles = vec![
            self.login_by_ip.spawn_sweeper(every),
            self.registration_by_ip.spawn_sweeper(every),
            self.forgot_password_by_ip.spawn_sweeper(every),
            self.forgot_password_by_email.spawn_sweeper(every),
            self.login_lockouts.spawn_sweeper(every),
            self.csrf.spawn_sweeper(every),
            spawn_expiry_sweeper(self.services.refresh_tokens.clone(), every),
        ];
        GateTasks { handles }
    }

    /// Authenticate a login attempt and issue a new session.
    ///
    /// # Errors
    /// Returns the first stage that rejects the attempt.
    #[instrument(skip_all, fields(role = %request.role))]
    pub async fn login(&self, request: LoginRequest) -> Result<IssuedSession, GateError> {
        check_bucket(&self.login_by_ip, client_key(request.client.ip.as_deref()))?;

        let email = normalize_email(&request.email);
        let credential = request.credential.expose_secret().trim();
        if !valid_email(&email) || credential.is_empty() {
            return Err(GateError::BadRequest(
                "A valid email and credential are required".to_string(),
            ));
        }

        let remaining_seconds = self.login_lockouts.remaining_lockout_seconds(&email);
        if remaining_seconds > 0 {
            warn!(email = %email, remaining_seconds, "login attempt on locked account");
            return Err(GateError::Locked { remaining_seconds });
        }

        let entry = match self.verify_credentials(request.role, &email, credential).await {
            Ok(entry) => entry,
            Err(VerifyFailure::Rejected(reason)) => {
                let outcome = self.login_lockouts.record_failure(&email);
                if let Some(locked_for) = outcome.locked_for {
                    warn!(
                        email = %email,
                        failures = outcome.failures,
                        lockout_seconds = locked_for.as_secs(),
                        "account locked after repeated failures"
                    );
                } else {
                    info!(email = %email, failures = outcome.failures, reason, "login failed");
                }
                self.config.response_delay.wait().await;
                return Err(GateError::InvalidCredentials);
            }
            Err(VerifyFailure::Unavailable(reason)) => {
                warn!(email = %email, "credential verification unavailable: {reason}");
                self.config.response_delay.wait().await;
                return Err(GateError::InvalidCredentials);
            }
            Err(VerifyFailure::Internal(err)) => {
                return Err(GateError::internal("login directory lookup failed", err));
            }
        };

        self.login_lockouts.record_success(&email);

        let owner = SessionOwner::new(email, request.role);
        let refresh = self
            .services
            .refresh_tokens
            .create(&owner, &request.client)
            .await
            .map_err(|err| GateError::internal("failed to create refresh token", err))?;

        let mut session = self.issue(&owner, entry.role_scoped_id, &refresh.value)?;
        session.refresh_token = Some(refresh.value);
        info!(email = %owner.email, "login succeeded");
        Ok(session)
    }

    /// Mint a new access token and CSRF token from a refresh-token cookie.
    ///
    /// # Errors
    /// `SessionExpired` without a usable refresh token, `Csrf` when the header does not
    /// match the token bound to that session.
    #[instrument(skip_all)]
    pub async fn refresh(
        &self,
        refresh_token: Option<&str>,
        csrf_token: Option<&str>,
    ) -> Result<IssuedSession, GateError> {
        let token = refresh_token
            .filter(|value| !value.is_empty())
            .ok_or(GateError::SessionExpired)?;

        // The CSRF binding is process-local; without one the session cannot be resumed.
        if !self.csrf.is_bound(token) {
            warn!("refresh for a session without a CSRF binding");
            return Err(GateError::SessionExpired);
        }
        if !self.csrf.validate(Some(token), csrf_token) {
            warn!("CSRF validation failed on refresh");
            return Err(GateError::Csrf);
        }

        let record = match self.services.refresh_tokens.verify(token).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                self.csrf.invalidate(token);
                warn!("refresh with unknown or expired token");
                return Err(GateError::SessionExpired);
            }
            Err(err) => return Err(GateError::internal("failed to verify refresh token", err)),
        };

        let entry = match self
            .services
            .directory
            .find_role_scoped_id(&record.owner.email, record.owner.role)
            .await
        {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                warn!(email = %record.owner.email, "refresh for account no longer in directory");
                self.end_session(token).await?;
                return Err(GateError::SessionExpired);
            }
            Err(err) => return Err(GateError::internal("refresh directory lookup failed", err)),
        };

        self.issue(&record.owner, entry.role_scoped_id, token)
    }

    /// Check the access token, role and (for state-changing methods) CSRF of a request.
    ///
    /// # Errors
    /// `Unauthenticated`, `Forbidden` or `Csrf`, in that order of precedence.
    pub fn authorize(&self, request: &ProtectedRequest<'_>) -> Result<AccessTokenClaims, GateError> {
        let token = request
            .access_token
            .filter(|value| !value.is_empty())
            .ok_or(GateError::Unauthenticated)?;
        let claims = self.access.verify(token).map_err(|err| {
            debug!("access token rejected: {err}");
            GateError::Unauthenticated
        })?;

        if let Some(required) = required_role(request.path) {
            if claims.role != required {
                warn!(email = %claims.sub, role = %claims.role, path = request.path, "role not allowed");
                return Err(GateError::Forbidden);
            }
        }

        if is_state_changing(request.method)
            && !is_csrf_exempt(request.path)
            && !self.csrf.validate(request.session_id, request.csrf_token)
        {
            warn!(email = %claims.sub, path = request.path, "CSRF validation failed");
            return Err(GateError::Csrf);
        }

        Ok(claims)
    }

    /// End the session bound to `refresh_token`. A missing cookie is already logged out.
    ///
    /// # Errors
    /// `Csrf` when a session is present but the header does not match it.
    #[instrument(skip_all)]
    pub async fn logout(
        &self,
        refresh_token: Option<&str>,
        csrf_token: Option<&str>,
    ) -> Result<(), GateError> {
        let Some(token) = refresh_token.filter(|value| !value.is_empty()) else {
            return Ok(());
        };
        if !self.csrf.validate(Some(token), csrf_token) {
            warn!("CSRF validation failed on logout");
            return Err(GateError::Csrf);
        }
        self.end_session(token).await
    }

    /// # Errors
    /// `RateLimited` when the client exhausted the registration bucket.
    pub fn check_registration(&self, ip: Option<&str>) -> Result<(), GateError> {
        check_bucket(&self.registration_by_ip, client_key(ip))
    }

    /// Gate a password-reset request. An exhausted per-email bucket is silent: the
    /// caller answers exactly as if the request went through.
    ///
    /// # Errors
    /// `RateLimited` on the per-IP bucket, `BadRequest` on a malformed email.
    #[instrument(skip_all)]
    pub async fn forgot_password(&self, ip: Option<&str>, email: &str) -> Result<(), GateError> {
        check_bucket(&self.forgot_password_by_ip, client_key(ip))?;

        let email = normalize_email(email);
        if !valid_email(&email) {
            return Err(GateError::BadRequest("A valid email is required".to_string()));
        }

        let decision = self.forgot_password_by_email.consume(&email, 1);
        self.config.response_delay.wait().await;
        if !decision.allowed() {
            warn!(email = %email, "password reset limit reached, request dropped");
            return Ok(());
        }

        self.services
            .reset_sender
            .request_reset(&email)
            .await
            .map_err(|err| GateError::internal("failed to hand off password reset", err))
    }

    /// Whether `email` is currently locked out of login.
    #[must_use]
    pub fn lockout_remaining_seconds(&self, email: &str) -> u64 {
        self.login_lockouts
            .remaining_lockout_seconds(&normalize_email(email))
    }

    async fn verify_credentials(
        &self,
        role: Role,
        email: &str,
        credential: &str,
    ) -> Result<DirectoryEntry, VerifyFailure> {
        let verified = match timeout(
            self.config.verify_timeout,
            self.services.identity.verify(role, credential),
        )
        .await
        {
            Ok(Ok(verified)) => verified,
            Ok(Err(IdentityError::Rejected)) => {
                return Err(VerifyFailure::Rejected("credential rejected"))
            }
            Ok(Err(IdentityError::Unavailable(reason))) => {
                return Err(VerifyFailure::Unavailable(reason))
            }
            Err(_) => return Err(VerifyFailure::Unavailable("verification timed out".to_string())),
        };

        if !verified.email_verified {
            return Err(VerifyFailure::Rejected("email not verified"));
        }
        if normalize_email(&verified.email) != email {
            return Err(VerifyFailure::Rejected("email mismatch"));
        }

        match self.services.directory.find_role_scoped_id(email, role).await {
            Ok(Some(entry)) if role.has_scoped_id() == entry.role_scoped_id.is_some() => Ok(entry),
            Ok(Some(_)) => Err(VerifyFailure::Internal(anyhow::anyhow!(
                "directory entry for {role} has an inconsistent role-scoped id"
            ))),
            Ok(None) => Err(VerifyFailure::Rejected("unknown account")),
            Err(err) => Err(VerifyFailure::Internal(err)),
        }
    }

    fn issue(
        &self,
        owner: &SessionOwner,
        role_scoped_id: Option<String>,
        session_id: &str,
    ) -> Result<IssuedSession, GateError> {
        let access_token = self
            .access
            .issue(&owner.email, owner.role, role_scoped_id.as_deref())
            .map_err(|err| GateError::internal("failed to issue access token", err))?;
        let csrf_token = self
            .csrf
            .generate(session_id)
            .map_err(|err| GateError::internal("failed to generate CSRF token", err))?;

        Ok(IssuedSession {
            access_token,
            refresh_token: None,
            csrf_token,
            email: owner.email.clone(),
            role: owner.role,
            role_scoped_id,
        })
    }

    async fn end_session(&self, token: &str) -> Result<(), GateError> {
        self.csrf.invalidate(token);
        self.services
            .refresh_tokens
            .invalidate(token)
            .await
            .map_err(|err| GateError::internal("failed to invalidate refresh token", err))
    }
}

fn check_bucket(bucket: &TokenBucket, key: &str) -> Result<(), GateError> {
    let decision = bucket.consume(key, 1);
    if decision.allowed() {
        return Ok(());
    }
    let remaining_seconds = decision.wait_seconds();
    warn!(limiter = bucket.name(), key, remaining_seconds, "rate limit exceeded");
    Err(GateError::RateLimited { remaining_seconds })
}

fn client_key(ip: Option<&str>) -> &str {
    ip.map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or(UNKNOWN_CLIENT)
}

fn matches_prefix(path: &str, prefix: &str) -> bool {
    path.strip_prefix(prefix)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
}

#[must_use]
pub fn is_public_path(path: &str) -> bool {
    PUBLIC_PATHS.iter().any(|prefix| matches_prefix(path, prefix))
}

#[must_use]
pub fn is_csrf_exempt(path: &str) -> bool {
    CSRF_EXEMPT_PATHS
        .iter()
        .any(|prefix| matches_prefix(path, prefix))
}

#[must_use]
pub fn is_registration_path(path: &str) -> bool {
    REGISTRATION_PATHS
        .iter()
        .any(|prefix| matches_prefix(path, prefix))
}

#[must_use]
pub fn required_role(path: &str) -> Option<Role> {
    ROLE_PREFIXES
        .iter()
        .find(|(prefix, _)| matches_prefix(path, prefix))
        .map(|(_, role)| *role)
}

#[must_use]
pub fn is_state_changing(method: &str) -> bool {
    matches!(method, "POST" | "PUT" | "PATCH" | "DELETE")
}
