//! Session cookies and the CSRF header.

use axum::http::{
    header::{InvalidHeaderValue, AUTHORIZATION, COOKIE},
    HeaderMap, HeaderValue,
};
use std::time::Duration;

pub const ACCESS_TOKEN_COOKIE: &str = "accessToken";
pub const REFRESH_TOKEN_COOKIE: &str = "refreshToken";
pub const CSRF_HEADER: &str = "x-csrf-token";

/// Build an `HttpOnly`, `SameSite=Strict` cookie scoped to the whole site.
pub fn session_cookie(
    name: &str,
    value: &str,
    max_age: Duration,
    secure: bool,
) -> Result<HeaderValue, InvalidHeaderValue> {
    let mut cookie = format!(
        "{name}={value}; Path=/; HttpOnly; SameSite=Strict; Max-Age={}",
        max_age.as_secs()
    );
    if secure {
        cookie.push_str("; Secure");
    }
    HeaderValue::from_str(&cookie)
}

pub fn clear_cookie(name: &str, secure: bool) -> Result<HeaderValue, InvalidHeaderValue> {
    session_cookie(name, "", Duration::ZERO, secure)
}

#[must_use]
pub fn read_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|header| header.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| key.trim() == name)
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[must_use]
pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let trimmed = value.trim();
    let token = trimmed
        .strip_prefix("Bearer ")
        .or_else(|| trimmed.strip_prefix("bearer "))?
        .trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

/// The access token from its cookie, or from `Authorization: Bearer` for API clients.
#[must_use]
pub fn access_token(headers: &HeaderMap) -> Option<String> {
    read_cookie(headers, ACCESS_TOKEN_COOKIE).or_else(|| bearer_token(headers))
}

#[must_use]
pub fn refresh_token(headers: &HeaderMap) -> Option<String> {
    read_cookie(headers, REFRESH_TOKEN_COOKIE)
}

#[must_use]
pub fn csrf_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(CSRF_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cookie_attributes() {
        let cookie = session_cookie(ACCESS_TOKEN_COOKIE, "abc", Duration::from_secs(600), true)
            .map(|value| value.to_str().unwrap_or_default().to_string())
            .unwrap_or_default();
        assert_eq!(
            cookie,
            "accessToken=abc; Path=/; HttpOnly; SameSite=Strict; Max-Age=600; Secure"
        );

        let cleared = clear_cookie(REFRESH_TOKEN_COOKIE, false)
            .map(|value| value.to_str().unwrap_or_default().to_string())
            .unwrap_or_default();
        assert_eq!(
            cleared,
            "refreshToken=; Path=/; HttpOnly; SameSite=Strict; Max-Age=0"
        );
    }

    #[test]
    fn reads_named_cookie_among_others() {
        let mut headers = HeaderMap::new();
        headers.insert(
            COOKIE,
            HeaderValue::from_static("theme=dark; refreshToken=r-1; accessToken=a-1"),
        );
        assert_eq!(refresh_token(&headers).as_deref(), Some("r-1"));
        assert_eq!(access_token(&headers).as_deref(), Some("a-1"));
        assert_eq!(read_cookie(&headers, "missing"), None);
    }

    #[test]
    fn access_token_falls_back_to_bearer() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer v4.local.xyz"));
        assert_eq!(access_token(&headers).as_deref(), Some("v4.local.xyz"));

        headers.insert(COOKIE, HeaderValue::from_static("accessToken=from-cookie"));
        assert_eq!(access_token(&headers).as_deref(), Some("from-cookie"));
    }

    #[test]
    fn empty_values_are_absent() {
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_static("refreshToken="));
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer   "));
        headers.insert(CSRF_HEADER, HeaderValue::from_static(" "));
        assert_eq!(refresh_token(&headers), None);
        assert_eq!(bearer_token(&headers), None);
        assert_eq!(csrf_token(&headers), None);
    }
}
