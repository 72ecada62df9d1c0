//! Login, refresh and logout.
//!
//! Tokens never travel in response bodies: the access and refresh tokens are set as
//! `HttpOnly` cookies and the CSRF token is returned in the `X-CSRF-Token` header.

use super::MessageResponse;
use crate::{
    api::{
        client::client_context,
        cookies::{
            clear_cookie, csrf_token, refresh_token, session_cookie, ACCESS_TOKEN_COOKIE,
            CSRF_HEADER, REFRESH_TOKEN_COOKIE,
        },
        state::AppState,
    },
    security::{
        gate::{IssuedSession, LoginRequest},
        GateError, Role,
    },
};
use axum::{
    extract::{rejection::JsonRejection, ConnectInfo, Extension},
    http::{header::SET_COOKIE, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use utoipa::ToSchema;

#[derive(Deserialize, ToSchema)]
pub struct LoginBody {
    pub email: String,
    /// Token issued by the identity provider (for example a Google ID token).
    pub credential: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SessionResponse {
    pub email: String,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role_scoped_id: Option<String>,
}

#[utoipa::path(
    post,
    path = "/api/auth/login-student",
    request_body = LoginBody,
    responses(
        (status = 200, description = "Session cookies set, CSRF token in X-CSRF-Token", body = SessionResponse),
        (status = 400, description = "Missing or malformed email or credential"),
        (status = 401, description = "Invalid credentials"),
        (status = 429, description = "Rate limited or account locked"),
    ),
    tag = "auth"
)]
pub async fn login_student(
    headers: HeaderMap,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    Extension(state): Extension<AppState>,
    payload: Result<Json<LoginBody>, JsonRejection>,
) -> Response {
    login(Role::Student, &headers, connect_info, &state, payload).await
}

#[utoipa::path(
    post,
    path = "/api/auth/login-fa",
    request_body = LoginBody,
    responses(
        (status = 200, description = "Session cookies set, CSRF token in X-CSRF-Token", body = SessionResponse),
        (status = 400, description = "Missing or malformed email or credential"),
        (status = 401, description = "Invalid credentials"),
        (status = 429, description = "Rate limited or account locked"),
    ),
    tag = "auth"
)]
pub async fn login_fa(
    headers: HeaderMap,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    Extension(state): Extension<AppState>,
    payload: Result<Json<LoginBody>, JsonRejection>,
) -> Response {
    login(Role::Fa, &headers, connect_info, &state, payload).await
}

#[utoipa::path(
    post,
    path = "/admin/login",
    request_body = LoginBody,
    responses(
        (status = 200, description = "Session cookies set, CSRF token in X-CSRF-Token", body = SessionResponse),
        (status = 400, description = "Missing or malformed email or credential"),
        (status = 401, description = "Invalid credentials"),
        (status = 429, description = "Rate limited or account locked"),
    ),
    tag = "auth"
)]
pub async fn admin_login(
    headers: HeaderMap,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    Extension(state): Extension<AppState>,
    payload: Result<Json<LoginBody>, JsonRejection>,
) -> Response {
    login(Role::Admin, &headers, connect_info, &state, payload).await
}

#[utoipa::path(
    post,
    path = "/api/auth/refresh",
    responses(
        (status = 200, description = "New access token cookie and CSRF token", body = SessionResponse),
        (status = 401, description = "Refresh token missing, unknown or expired"),
        (status = 403, description = "CSRF validation failed"),
    ),
    tag = "auth"
)]
pub async fn refresh(headers: HeaderMap, Extension(state): Extension<AppState>) -> Response {
    refresh_session(&headers, &state).await
}

#[utoipa::path(
    post,
    path = "/admin/refresh",
    responses(
        (status = 200, description = "New access token cookie and CSRF token", body = SessionResponse),
        (status = 401, description = "Refresh token missing, unknown or expired"),
        (status = 403, description = "CSRF validation failed"),
    ),
    tag = "auth"
)]
pub async fn admin_refresh(headers: HeaderMap, Extension(state): Extension<AppState>) -> Response {
    refresh_session(&headers, &state).await
}

#[utoipa::path(
    post,
    path = "/api/auth/logout",
    responses(
        (status = 200, description = "Session ended and cookies cleared", body = MessageResponse),
        (status = 403, description = "CSRF validation failed"),
    ),
    tag = "auth"
)]
pub async fn logout(headers: HeaderMap, Extension(state): Extension<AppState>) -> Response {
    end_session(&headers, &state).await
}

#[utoipa::path(
    post,
    path = "/admin/logout",
    responses(
        (status = 200, description = "Session ended and cookies cleared", body = MessageResponse),
        (status = 403, description = "CSRF validation failed"),
    ),
    tag = "auth"
)]
pub async fn admin_logout(headers: HeaderMap, Extension(state): Extension<AppState>) -> Response {
    end_session(&headers, &state).await
}

async fn login(
    role: Role,
    headers: &HeaderMap,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    state: &AppState,
    payload: Result<Json<LoginBody>, JsonRejection>,
) -> Response {
    // A malformed body still goes through the IP bucket before being rejected.
    let (email, credential) = payload
        .map(|Json(body)| (body.email, body.credential))
        .unwrap_or_default();

    let request = LoginRequest {
        role,
        email,
        credential: SecretString::from(credential),
        client: client_context(
            headers,
            connect_info.map(|ConnectInfo(addr)| addr),
            state.http().trust_proxy_headers(),
        ),
    };

    match state.gate().login(request).await {
        Ok(session) => session_response(state, session),
        Err(err) => err.into_response(),
    }
}

async fn refresh_session(headers: &HeaderMap, state: &AppState) -> Response {
    let refresh = refresh_token(headers);
    let csrf = csrf_token(headers);
    match state
        .gate()
        .refresh(refresh.as_deref(), csrf.as_deref())
        .await
    {
        Ok(session) => session_response(state, session),
        Err(err) => err.into_response(),
    }
}

async fn end_session(headers: &HeaderMap, state: &AppState) -> Response {
    let refresh = refresh_token(headers);
    let csrf = csrf_token(headers);
    if let Err(err) = state.gate().logout(refresh.as_deref(), csrf.as_deref()).await {
        return err.into_response();
    }

    // Cookies are cleared even when there was no session to end.
    let secure = state.http().cookie_secure();
    let mut response_headers = HeaderMap::new();
    for name in [ACCESS_TOKEN_COOKIE, REFRESH_TOKEN_COOKIE] {
        match clear_cookie(name, secure) {
            Ok(cookie) => {
                response_headers.append(SET_COOKIE, cookie);
            }
            Err(err) => return GateError::internal("failed to build cookie", err).into_response(),
        }
    }
    (
        StatusCode::OK,
        response_headers,
        Json(MessageResponse::new("Logged out successfully")),
    )
        .into_response()
}

fn session_response(state: &AppState, session: IssuedSession) -> Response {
    match session_headers(state, &session) {
        Ok(headers) => (
            StatusCode::OK,
            headers,
            Json(SessionResponse {
                email: session.email,
                role: session.role,
                role_scoped_id: session.role_scoped_id,
            }),
        )
            .into_response(),
        Err(err) => GateError::internal("failed to build session headers", err).into_response(),
    }
}

fn session_headers(state: &AppState, session: &IssuedSession) -> anyhow::Result<HeaderMap> {
    let secure = state.http().cookie_secure();
    let mut headers = HeaderMap::new();
    headers.append(
        SET_COOKIE,
        session_cookie(
            ACCESS_TOKEN_COOKIE,
            &session.access_token,
            state.gate().access_token_ttl(),
            secure,
        )?,
    );
    if let Some(refresh) = &session.refresh_token {
        headers.append(
            SET_COOKIE,
            session_cookie(
                REFRESH_TOKEN_COOKIE,
                refresh,
                state.gate().config().refresh_token_ttl(),
                secure,
            )?,
        );
    }
    headers.insert(CSRF_HEADER, HeaderValue::from_str(&session.csrf_token)?);
    Ok(headers)
}
