use super::MessageResponse;
use crate::{
    api::{client::client_ip, state::AppState},
    security::recovery::RESET_REQUESTED_MESSAGE,
};
use axum::{
    extract::{rejection::JsonRejection, ConnectInfo, Extension},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde::Deserialize;
use std::net::SocketAddr;
use utoipa::ToSchema;

#[derive(Debug, Deserialize, ToSchema)]
pub struct ForgotPasswordRequest {
    pub email: String,
}

#[utoipa::path(
    post,
    path = "/admin/forgot-password",
    request_body = ForgotPasswordRequest,
    responses(
        (status = 200, description = "Same reply whether or not the account exists", body = MessageResponse),
        (status = 400, description = "Malformed email"),
        (status = 429, description = "Too many reset requests from this client"),
    ),
    tag = "auth"
)]
pub async fn forgot_password(
    headers: HeaderMap,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    Extension(state): Extension<AppState>,
    payload: Result<Json<ForgotPasswordRequest>, JsonRejection>,
) -> Response {
    let ip = client_ip(
        &headers,
        connect_info.map(|ConnectInfo(addr)| addr),
        state.http().trust_proxy_headers(),
    );
    let email = payload.map(|Json(body)| body.email).unwrap_or_default();

    match state.gate().forgot_password(ip.as_deref(), &email).await {
        Ok(()) => (
            StatusCode::OK,
            Json(MessageResponse::new(RESET_REQUESTED_MESSAGE)),
        )
            .into_response(),
        Err(err) => err.into_response(),
    }
}
