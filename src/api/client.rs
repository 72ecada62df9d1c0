//! Client address resolution for rate limiting and refresh-token audit fields.

use crate::security::refresh::ClientContext;
use axum::http::{header::USER_AGENT, HeaderMap};
use std::net::SocketAddr;

/// `X-Real-IP`, then the first `X-Forwarded-For` hop, then the socket peer. Proxy headers
/// are only read when the service sits behind a trusted reverse proxy.
#[must_use]
pub fn client_ip(
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
    trust_proxy_headers: bool,
) -> Option<String> {
    if trust_proxy_headers {
        let real_ip = header_str(headers, "x-real-ip");
        if real_ip.is_some() {
            return real_ip;
        }
        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .map(str::trim)
            .filter(|value| !value.is_empty());
        if let Some(forwarded) = forwarded {
            return Some(forwarded.to_string());
        }
    }
    peer.map(|addr| addr.ip().to_string())
}

#[must_use]
pub fn client_context(
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
    trust_proxy_headers: bool,
) -> ClientContext {
    ClientContext {
        ip: client_ip(headers, peer, trust_proxy_headers),
        user_agent: header_str(headers, USER_AGENT.as_str()),
    }
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn peer() -> Option<SocketAddr> {
        "192.0.2.10:51000".parse().ok()
    }

    #[test]
    fn real_ip_wins() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("1.2.3.4, 5.6.7.8"));
        headers.insert("x-real-ip", HeaderValue::from_static("9.9.9.9"));
        assert_eq!(client_ip(&headers, peer(), true).as_deref(), Some("9.9.9.9"));
    }

    #[test]
    fn first_forwarded_hop() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static(" 1.2.3.4 , 5.6.7.8"));
        assert_eq!(client_ip(&headers, peer(), true).as_deref(), Some("1.2.3.4"));
    }

    #[test]
    fn untrusted_headers_use_peer() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("9.9.9.9"));
        assert_eq!(client_ip(&headers, peer(), false).as_deref(), Some("192.0.2.10"));
        assert_eq!(client_ip(&HeaderMap::new(), None, true), None);
    }

    #[test]
    fn context_carries_user_agent() {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static("curl/8.0"));
        let context = client_context(&headers, peer(), true);
        assert_eq!(context.user_agent.as_deref(), Some("curl/8.0"));
        assert_eq!(context.ip.as_deref(), Some("192.0.2.10"));
    }
}
