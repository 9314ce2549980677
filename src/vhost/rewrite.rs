//! Request rewriting, applied after routing and before forwarding.
//!
//! # Responsibilities
//! - Enforce Basic-Auth before any work connection is consumed
//! - Apply configured header set rules, overriding client values
//! - Rewrite the Host header when configured
//! - Record the public peer in X-Forwarded-For
//!
//! # Design Decisions
//! - A rejected request never reaches the backend; the 401 short-circuits
//!   in the vhost handler
//! - Rewriting happens exactly once per request; response bytes pass
//!   through unmodified

use std::net::IpAddr;

use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::request::Parts;
use axum::http::uri::Uri;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use thiserror::Error;

use crate::config::ProxyConfig;

/// Basic-Auth enforcement failed; the caller answers 401 with a challenge.
#[derive(Debug, Error)]
#[error("basic auth challenge failed")]
pub struct AuthChallengeFailed;

/// Headers that are connection-scoped and must not travel to the backend.
const HOP_BY_HOP: &[HeaderName] = &[
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Check the request against the proxy's Basic-Auth settings.
///
/// A proxy with no credentials configured accepts everything. Otherwise the
/// `Authorization` header must decode to exactly `user:password`.
pub fn check_basic_auth(config: &ProxyConfig, headers: &HeaderMap) -> Result<(), AuthChallengeFailed> {
    let Some(user) = config.http_user.as_deref() else {
        return Ok(());
    };
    let password = config.http_password.as_deref().unwrap_or("");

    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Basic "))
        .and_then(|b64| BASE64.decode(b64.trim()).ok())
        .and_then(|raw| String::from_utf8(raw).ok());

    match presented {
        Some(credentials) if credentials == format!("{user}:{password}") => Ok(()),
        _ => Err(AuthChallengeFailed),
    }
}

/// Rewrite request parts in place for forwarding to the backend.
pub fn apply(parts: &mut Parts, config: &ProxyConfig, peer: IpAddr, original_host: &str) {
    for name in HOP_BY_HOP {
        parts.headers.remove(name);
    }
    // The forwarder re-frames the body itself.
    parts.headers.remove(header::CONTENT_LENGTH);

    let host = config.host_rewrite.as_deref().unwrap_or(original_host);
    if let Ok(value) = HeaderValue::try_from(host) {
        parts.headers.insert(header::HOST, value);
    }

    for (name, value) in &config.headers {
        match (
            HeaderName::try_from(name.as_str()),
            HeaderValue::try_from(value.as_str()),
        ) {
            (Ok(name), Ok(value)) => {
                parts.headers.insert(name, value);
            }
            _ => {
                tracing::warn!(proxy = %config.name, header = %name, "invalid header rule skipped");
            }
        }
    }

    append_forwarded_for(&mut parts.headers, peer);

    // Forward in origin-form; the Host header carries the authority.
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    parts.uri = path_and_query
        .parse::<Uri>()
        .unwrap_or_else(|_| Uri::from_static("/"));
}

fn append_forwarded_for(headers: &mut HeaderMap, peer: IpAddr) {
    let value = match headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        Some(existing) => format!("{existing}, {peer}"),
        None => peer.to_string(),
    };
    if let Ok(value) = HeaderValue::try_from(value) {
        headers.insert("x-forwarded-for", value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProxyKind;

    fn auth_config() -> ProxyConfig {
        let mut config = ProxyConfig::new("test", ProxyKind::Http);
        config.http_user = Some("test".into());
        config.http_password = Some("test".into());
        config
    }

    fn header_map(auth: Option<&str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(value) = auth {
            headers.insert(header::AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        }
        headers
    }

    fn basic(user: &str, password: &str) -> String {
        format!("Basic {}", BASE64.encode(format!("{user}:{password}")))
    }

    #[test]
    fn test_missing_authorization_rejected() {
        assert!(check_basic_auth(&auth_config(), &header_map(None)).is_err());
    }

    #[test]
    fn test_wrong_password_rejected() {
        let headers = header_map(Some(&basic("test", "invalid")));
        assert!(check_basic_auth(&auth_config(), &headers).is_err());
    }

    #[test]
    fn test_correct_credentials_accepted() {
        let headers = header_map(Some(&basic("test", "test")));
        assert!(check_basic_auth(&auth_config(), &headers).is_ok());
    }

    #[test]
    fn test_no_auth_configured_accepts_all() {
        let config = ProxyConfig::new("open", ProxyKind::Http);
        assert!(check_basic_auth(&config, &header_map(None)).is_ok());
    }

    #[test]
    fn test_header_rule_overrides_client_value() {
        let mut config = ProxyConfig::new("test", ProxyKind::Http);
        config
            .headers
            .insert("X-From-Where".to_string(), "burrow".to_string());

        let request = axum::http::Request::builder()
            .uri("http://normal.example.com/echo?q=1")
            .header("X-From-Where", "spoofed-by-client")
            .body(())
            .unwrap();
        let (mut parts, ()) = request.into_parts();

        apply(&mut parts, &config, "198.51.100.7".parse().unwrap(), "normal.example.com");

        assert_eq!(parts.headers.get("x-from-where").unwrap(), "burrow");
        assert_eq!(parts.headers.get("x-forwarded-for").unwrap(), "198.51.100.7");
        assert_eq!(parts.uri.to_string(), "/echo?q=1");
        assert_eq!(parts.headers.get(header::HOST).unwrap(), "normal.example.com");
    }

    #[test]
    fn test_host_rewrite_replaces_host() {
        let mut config = ProxyConfig::new("test", ProxyKind::Http);
        config.host_rewrite = Some("internal.backend".to_string());

        let request = axum::http::Request::builder()
            .uri("http://normal.example.com/")
            .body(())
            .unwrap();
        let (mut parts, ()) = request.into_parts();

        apply(&mut parts, &config, "198.51.100.7".parse().unwrap(), "normal.example.com");
        assert_eq!(parts.headers.get(header::HOST).unwrap(), "internal.backend");
    }
}
