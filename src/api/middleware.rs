//! Adapter that runs every request through the gate before it reaches a handler.

use super::{
    client::client_ip,
    cookies::{access_token, csrf_token, refresh_token},
    state::AppState,
};
use crate::security::gate::{is_public_path, is_registration_path, ProtectedRequest};
use axum::{
    extract::{ConnectInfo, Extension, Request},
    http::Method,
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::net::SocketAddr;

/// Registration is rate limited per client; public paths then pass through, and all other
/// paths need a valid access token, the right role and (for writes) a CSRF token.
/// Verified claims are handed to the handler as a request extension.
pub async fn gate_requests(
    Extension(state): Extension<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let method = request.method().clone();
    if method == Method::OPTIONS {
        return next.run(request).await;
    }
    let path = request.uri().path().to_string();

    if method == Method::POST && is_registration_path(&path) {
        let peer = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);
        let ip = client_ip(request.headers(), peer, state.http().trust_proxy_headers());
        if let Err(err) = state.gate().check_registration(ip.as_deref()) {
            return err.into_response();
        }
    }

    if is_public_path(&path) {
        return next.run(request).await;
    }

    let headers = request.headers();
    let access = access_token(headers);
    let session = refresh_token(headers);
    let csrf = csrf_token(headers);

    let claims = match state.gate().authorize(&ProtectedRequest {
        method: method.as_str(),
        path: &path,
        access_token: access.as_deref(),
        session_id: session.as_deref(),
        csrf_token: csrf.as_deref(),
    }) {
        Ok(claims) => claims,
        Err(err) => return err.into_response(),
    };

    request.extensions_mut().insert(claims);
    next.run(request).await
}
