use crate::security::Gate;
use sqlx::PgPool;
use std::sync::Arc;

pub const DEFAULT_FRONTEND_BASE_URL: &str = "http://localhost:5173";

/// Transport settings shared by the handlers and the gate middleware.
#[derive(Clone, Debug)]
pub struct HttpConfig {
    frontend_base_url: String,
    cookie_secure: bool,
    trust_proxy_headers: bool,
}

impl HttpConfig {
    #[must_use]
    pub fn new(frontend_base_url: impl Into<String>) -> Self {
        Self {
            frontend_base_url: frontend_base_url.into(),
            cookie_secure: true,
            trust_proxy_headers: false,
        }
    }

    #[must_use]
    pub fn with_cookie_secure(mut self, secure: bool) -> Self {
        self.cookie_secure = secure;
        self
    }

    #[must_use]
    pub fn with_trust_proxy_headers(mut self, trust: bool) -> Self {
        self.trust_proxy_headers = trust;
        self
    }

    #[must_use]
    pub fn frontend_base_url(&self) -> &str {
        &self.frontend_base_url
    }

    #[must_use]
    pub fn cookie_secure(&self) -> bool {
        self.cookie_secure
    }

    #[must_use]
    pub fn trust_proxy_headers(&self) -> bool {
        self.trust_proxy_headers
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self::new(DEFAULT_FRONTEND_BASE_URL)
    }
}

#[derive(Clone, Debug)]
pub struct AppState {
    gate: Arc<Gate>,
    http: HttpConfig,
    pool: Option<PgPool>,
}

impl AppState {
    #[must_use]
    pub fn new(gate: Arc<Gate>, http: HttpConfig) -> Self {
        Self {
            gate,
            http,
            pool: None,
        }
    }

    /// Attach the database pool probed by `/health`.
    #[must_use]
    pub fn with_pool(mut self, pool: PgPool) -> Self {
        self.pool = Some(pool);
        self
    }

    #[must_use]
    pub fn gate(&self) -> &Gate {
        &self.gate
    }

    #[must_use]
    pub fn http(&self) -> &HttpConfig {
        &self.http
    }

    #[must_use]
    pub fn pool(&self) -> Option<&PgPool> {
        self.pool.as_ref()
    }
}
