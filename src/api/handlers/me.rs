use super::auth::SessionResponse;
use crate::security::AccessTokenClaims;
use axum::{extract::Extension, response::Json};

#[utoipa::path(
    get,
    path = "/api/auth/me",
    responses(
        (status = 200, description = "Identity carried by the access token", body = SessionResponse),
        (status = 401, description = "Missing, expired or tampered access token"),
    ),
    tag = "auth"
)]
pub async fn me(Extension(claims): Extension<AccessTokenClaims>) -> Json<SessionResponse> {
    Json(SessionResponse {
        email: claims.sub,
        role: claims.role,
        role_scoped_id: claims.rid,
    })
}
