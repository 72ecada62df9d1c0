//! HTTP surface: the gate's own endpoints plus the middleware that guards every other route.

use crate::security::{
    identity::{IdentityVerifier, PgUserDirectory},
    recovery::LogPasswordResetSender,
    refresh::PgRefreshTokenStore,
    AccessTokenCodec, Collaborators, Gate, GateConfig,
};
use anyhow::{anyhow, Context, Result};
use axum::{
    body::Body,
    extract::{Extension, MatchedPath},
    http::{
        header::{
            AUTHORIZATION, CACHE_CONTROL, CONTENT_TYPE, REFERRER_POLICY, X_CONTENT_TYPE_OPTIONS,
            X_FRAME_OPTIONS,
        },
        HeaderName, HeaderValue, Method, Request,
    },
    middleware::from_fn,
    routing::{get, post},
    Router,
};
use sqlx::postgres::PgPoolOptions;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    request_id::PropagateRequestIdLayer,
    set_header::{SetRequestHeaderLayer, SetResponseHeaderLayer},
    trace::TraceLayer,
};
use tracing::{error, info, info_span, Span};
use ulid::Ulid;
use url::Url;
use utoipa_swagger_ui::SwaggerUi;

pub mod client;
pub mod cookies;
mod error;
pub mod handlers;
pub mod middleware;
mod openapi;
mod state;

pub use openapi::openapi;
pub use state::{AppState, HttpConfig, DEFAULT_FRONTEND_BASE_URL};

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Build the application router.
///
/// `business` carries the application's own routes; they sit behind the gate middleware
/// together with the login, refresh, logout and recovery endpoints.
pub fn router(state: AppState, business: Router) -> Result<Router> {
    let frontend_origin = frontend_origin(state.http().frontend_base_url())?;
    let cors = CorsLayer::new()
        .allow_headers([
            CONTENT_TYPE,
            AUTHORIZATION,
            HeaderName::from_static(cookies::CSRF_HEADER),
        ])
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
        ])
        .expose_headers([HeaderName::from_static(cookies::CSRF_HEADER)])
        .allow_origin(AllowOrigin::exact(frontend_origin))
        .allow_credentials(true);

    let app = Router::new()
        .route("/health", get(handlers::health::health))
        .route("/api/auth/login-student", post(handlers::auth::login_student))
        .route("/api/auth/login-fa", post(handlers::auth::login_fa))
        .route("/admin/login", post(handlers::auth::admin_login))
        .route("/api/auth/refresh", post(handlers::auth::refresh))
        .route("/admin/refresh", post(handlers::auth::admin_refresh))
        .route("/api/auth/logout", post(handlers::auth::logout))
        .route("/admin/logout", post(handlers::auth::admin_logout))
        .route(
            "/admin/forgot-password",
            post(handlers::recovery::forgot_password),
        )
        .route("/api/auth/me", get(handlers::me::me))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", openapi()))
        .merge(business)
        .layer(from_fn(middleware::gate_requests))
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestHeaderLayer::if_not_present(
                    HeaderName::from_static("x-request-id"),
                    |_req: &_| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
                ))
                .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                    "x-request-id",
                )))
                .layer(TraceLayer::new_for_http().make_span_with(make_span))
                .layer(cors)
                .layer(SetResponseHeaderLayer::overriding(
                    X_CONTENT_TYPE_OPTIONS,
                    HeaderValue::from_static("nosniff"),
                ))
                .layer(SetResponseHeaderLayer::overriding(
                    X_FRAME_OPTIONS,
                    HeaderValue::from_static("DENY"),
                ))
                .layer(SetResponseHeaderLayer::overriding(
                    REFERRER_POLICY,
                    HeaderValue::from_static("no-referrer"),
                ))
                .layer(SetResponseHeaderLayer::if_not_present(
                    CACHE_CONTROL,
                    HeaderValue::from_static("no-cache, no-store, must-revalidate"),
                ))
                .layer(Extension(state)),
        );

    Ok(app)
}

/// Start the server
/// # Errors
/// Return error if the database is unreachable, the schema cannot be applied or the
/// listener fails
pub async fn new(
    port: u16,
    dsn: &str,
    http: HttpConfig,
    gate_config: GateConfig,
    access: AccessTokenCodec,
    identity: Arc<dyn IdentityVerifier>,
) -> Result<()> {
    let pool = PgPoolOptions::new()
        .min_connections(1)
        .max_connections(5)
        .max_lifetime(Duration::from_secs(60 * 2))
        .test_before_acquire(true)
        .connect(dsn)
        .await
        .context("Failed to connect to database")?;

    let refresh_tokens =
        PgRefreshTokenStore::new(pool.clone(), gate_config.refresh_token_ttl());
    refresh_tokens.ensure_schema().await?;

    let services = Collaborators {
        refresh_tokens: Arc::new(refresh_tokens),
        identity,
        directory: Arc::new(PgUserDirectory::new(pool.clone())),
        reset_sender: Arc::new(LogPasswordResetSender),
    };
    let gate = Arc::new(Gate::new(gate_config, access, services));
    let tasks = gate.spawn_sweepers(SWEEP_INTERVAL);

    let state = AppState::new(gate, http).with_pool(pool);
    let app = router(state, Router::new())?;

    let listener = TcpListener::bind(format!("::0:{port}")).await?;

    info!("Listening on [::]:{}", port);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {err}");
        }
        info!("Gracefully shutdown");
    })
    .await?;

    tasks.shutdown();

    Ok(())
}

fn make_span(request: &Request<Body>) -> Span {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|val| val.to_str().ok())
        .unwrap_or("none");
    let matched_path = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| request.uri().path(), MatchedPath::as_str);

    info_span!(
        "http.request",
        http.method = %request.method(),
        http.route = matched_path,
        request_id
    )
}

fn frontend_origin(frontend_base_url: &str) -> Result<HeaderValue> {
    let parsed = Url::parse(frontend_base_url)
        .with_context(|| format!("Invalid frontend base URL: {frontend_base_url}"))?;
    let host = parsed.host_str().ok_or_else(|| {
        anyhow!("Frontend base URL must include a valid host: {frontend_base_url}")
    })?;
    let port = parsed
        .port()
        .map_or_else(String::new, |port| format!(":{port}"));
    let origin = format!("{}://{}{}", parsed.scheme(), host, port);
    HeaderValue::from_str(&origin).context("Failed to build frontend origin header")
}
