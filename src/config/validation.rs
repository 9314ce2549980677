//! Configuration validation.
//!
//! # Responsibilities
//! - Reject malformed server/client configs before services start
//! - Validate individual proxy configs, both at load time (client) and at
//!   registration time (server, against `NewProxy` messages)
//!
//! # Design Decisions
//! - Collect every problem instead of stopping at the first
//! - The same per-proxy rules run on both ends of the control channel

use thiserror::Error;

use crate::config::schema::{ClientConfig, ProxyConfig, ProxyKind, ServerConfig};

/// A single validation problem.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("proxy name must not be empty")]
    EmptyProxyName,

    #[error("proxy {name}: kind {kind} is not supported by this server")]
    UnsupportedKind { name: String, kind: ProxyKind },

    #[error("proxy {name}: {kind} proxies need custom_domains or a subdomain")]
    MissingDomains { name: String, kind: ProxyKind },

    #[error("proxy {name}: location {location:?} must start with '/'")]
    BadLocation { name: String, location: String },

    #[error("proxy {name}: domain {domain:?} is not a valid hostname")]
    BadDomain { name: String, domain: String },

    #[error("proxy {name}: subdomain {subdomain:?} must be a single label")]
    BadSubdomain { name: String, subdomain: String },

    #[error("proxy {name}: local_addr must not be empty")]
    MissingLocalAddr { name: String },

    #[error("address {addr:?} is not a valid socket address")]
    BadAddress { addr: String },

    #[error("heartbeat interval must be non-zero")]
    ZeroHeartbeatInterval,
}

/// Validate a server configuration.
pub fn validate_server_config(config: &ServerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    check_addr(&config.bind_addr, &mut errors);
    if let Some(addr) = &config.vhost_http_addr {
        check_addr(addr, &mut errors);
    }
    if let Some(addr) = &config.vhost_https_addr {
        check_addr(addr, &mut errors);
    }
    if config.heartbeat.interval_secs == 0 {
        errors.push(ValidationError::ZeroHeartbeatInterval);
    }

    if errors.is_empty() { Ok(()) } else { Err(errors) }
}

/// Validate a client configuration, including every configured proxy.
pub fn validate_client_config(config: &ClientConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.heartbeat.interval_secs == 0 {
        errors.push(ValidationError::ZeroHeartbeatInterval);
    }
    for proxy in &config.proxies {
        if proxy.local_addr.is_empty() {
            errors.push(ValidationError::MissingLocalAddr {
                name: proxy.name.clone(),
            });
        }
        if let Err(mut errs) = validate_proxy(proxy) {
            errors.append(&mut errs);
        }
    }

    if errors.is_empty() { Ok(()) } else { Err(errors) }
}

/// Validate one proxy config. Run by the client at load time and by the
/// server against every incoming registration.
pub fn validate_proxy(proxy: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if proxy.name.is_empty() {
        errors.push(ValidationError::EmptyProxyName);
    }

    // Datagram relay is not part of the addressed scope.
    if proxy.kind == ProxyKind::Udp {
        errors.push(ValidationError::UnsupportedKind {
            name: proxy.name.clone(),
            kind: proxy.kind,
        });
    }

    if proxy.kind.is_vhost() && proxy.custom_domains.is_empty() && proxy.subdomain.is_none() {
        errors.push(ValidationError::MissingDomains {
            name: proxy.name.clone(),
            kind: proxy.kind,
        });
    }

    for domain in &proxy.custom_domains {
        let bare = domain.strip_prefix("*.").unwrap_or(domain);
        if bare.is_empty() || !bare.split('.').all(is_hostname_label) {
            errors.push(ValidationError::BadDomain {
                name: proxy.name.clone(),
                domain: domain.clone(),
            });
        }
    }

    if let Some(subdomain) = &proxy.subdomain {
        if !is_hostname_label(subdomain) {
            errors.push(ValidationError::BadSubdomain {
                name: proxy.name.clone(),
                subdomain: subdomain.clone(),
            });
        }
    }

    for location in &proxy.locations {
        if !location.starts_with('/') {
            errors.push(ValidationError::BadLocation {
                name: proxy.name.clone(),
                location: location.clone(),
            });
        }
    }

    if errors.is_empty() { Ok(()) } else { Err(errors) }
}

fn check_addr(addr: &str, errors: &mut Vec<ValidationError>) {
    if addr.parse::<std::net::SocketAddr>().is_err() {
        errors.push(ValidationError::BadAddress {
            addr: addr.to_string(),
        });
    }
}

fn is_hostname_label(label: &str) -> bool {
    !label.is_empty()
        && label.len() <= 63
        && label
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
        && !label.starts_with('-')
        && !label.ends_with('-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vhost_proxy_needs_domains() {
        let proxy = ProxyConfig::new("web", ProxyKind::Http);
        let errs = validate_proxy(&proxy).unwrap_err();
        assert!(errs
            .iter()
            .any(|e| matches!(e, ValidationError::MissingDomains { .. })));
    }

    #[test]
    fn test_wildcard_domains_accepted() {
        let mut proxy = ProxyConfig::new("web", ProxyKind::Http);
        proxy.custom_domains = vec!["*.example.com".into()];
        assert!(validate_proxy(&proxy).is_ok());
    }

    #[test]
    fn test_udp_rejected() {
        let mut proxy = ProxyConfig::new("dns", ProxyKind::Udp);
        proxy.remote_port = 5353;
        let errs = validate_proxy(&proxy).unwrap_err();
        assert!(errs
            .iter()
            .any(|e| matches!(e, ValidationError::UnsupportedKind { .. })));
    }

    #[test]
    fn test_location_must_be_absolute() {
        let mut proxy = ProxyConfig::new("web", ProxyKind::Http);
        proxy.custom_domains = vec!["example.com".into()];
        proxy.locations = vec!["api".into()];
        let errs = validate_proxy(&proxy).unwrap_err();
        assert_eq!(
            errs,
            vec![ValidationError::BadLocation {
                name: "web".into(),
                location: "api".into(),
            }]
        );
    }
}
