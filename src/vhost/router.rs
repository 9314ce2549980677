//! Virtual-host route resolution.
//!
//! # Responsibilities
//! - Resolve an inbound (host, path) to a registered proxy
//! - Exact domain match first, then wildcard suffix match
//! - Within a domain, longest matching location prefix wins; ties go to
//!   the most recent registration
//!
//! # Design Decisions
//! - Host matching is case-insensitive, path matching case-sensitive
//! - The index is an immutable snapshot rebuilt on registration churn, so
//!   lookups never block and never observe a partial update
//! - An entry with no explicit locations matches prefix "/" (catch-all,
//!   lowest priority by length)
//! - Explicit NoRouteFound rather than silent default

use std::collections::HashMap;

use thiserror::Error;

use crate::config::{ProxyConfig, ProxyKind};

/// Routing miss; the vhost listener answers 404 without touching a backend.
#[derive(Debug, Error)]
#[error("no route found for {host}{path}")]
pub struct NoRouteFound {
    pub host: String,
    pub path: String,
}

/// One (domain, location) → proxy binding.
#[derive(Debug, Clone)]
pub struct RouteBinding {
    /// Registry name of the proxy this binding routes to.
    pub proxy_name: String,
    /// Path prefix served by this binding.
    pub location: String,
    /// Registration sequence number; higher wins ties.
    pub seq: u64,
}

/// Immutable routing snapshot, rebuilt by the registry on churn.
#[derive(Debug, Default)]
pub struct VhostIndex {
    http: HashMap<String, Vec<RouteBinding>>,
    https: HashMap<String, Vec<RouteBinding>>,
}

impl VhostIndex {
    /// Add every binding a proxy config contributes under `domain`.
    pub fn insert(&mut self, kind: ProxyKind, domain: String, config: &ProxyConfig, seq: u64) {
        let table = match kind {
            ProxyKind::Http => &mut self.http,
            ProxyKind::Https => &mut self.https,
            _ => return,
        };
        let bindings = table.entry(domain).or_default();
        if config.locations.is_empty() {
            bindings.push(RouteBinding {
                proxy_name: config.name.clone(),
                location: "/".to_string(),
                seq,
            });
        } else {
            for location in &config.locations {
                bindings.push(RouteBinding {
                    proxy_name: config.name.clone(),
                    location: location.clone(),
                    seq,
                });
            }
        }
    }

    /// Resolve an HTTP request to a proxy name.
    pub fn resolve_http(&self, host: &str, path: &str) -> Result<&RouteBinding, NoRouteFound> {
        resolve(&self.http, host, path)
    }

    /// Resolve an HTTPS connection (SNI host) to a proxy name.
    pub fn resolve_https(&self, host: &str) -> Result<&RouteBinding, NoRouteFound> {
        resolve(&self.https, host, "/")
    }
}

fn resolve<'a>(
    table: &'a HashMap<String, Vec<RouteBinding>>,
    host: &str,
    path: &str,
) -> Result<&'a RouteBinding, NoRouteFound> {
    let host = normalize_host(host);

    let candidates = table
        .get(host.as_str())
        .or_else(|| wildcard_candidates(&host).find_map(|w| table.get(w.as_str())));

    candidates
        .and_then(|bindings| best_binding(bindings, path))
        .ok_or_else(|| NoRouteFound {
            host: host.clone(),
            path: path.to_string(),
        })
}

/// Longest matching location prefix; ties broken by registration recency.
fn best_binding<'a>(bindings: &'a [RouteBinding], path: &str) -> Option<&'a RouteBinding> {
    bindings
        .iter()
        .filter(|b| path.starts_with(b.location.as_str()))
        .max_by_key(|b| (b.location.len(), b.seq))
}

/// Lowercase the host and strip any port suffix. IPv6 literals pass
/// through untouched.
pub fn normalize_host(host: &str) -> String {
    let bare = match host.rsplit_once(':') {
        Some((h, port))
            if !h.is_empty() && !h.contains(':') && port.chars().all(|c| c.is_ascii_digit()) =>
        {
            h
        }
        _ => host,
    };
    bare.trim_end_matches('.').to_ascii_lowercase()
}

/// Successively generalize `a.b.example.com` to `*.b.example.com`,
/// `*.example.com`, `*.com`.
fn wildcard_candidates(host: &str) -> impl Iterator<Item = String> + '_ {
    let labels: Vec<&str> = host.split('.').collect();
    let count = labels.len();
    (1..count).map(move |i| format!("*.{}", labels[i..].join(".")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index_with(entries: &[(&str, &[&str], u64)]) -> VhostIndex {
        // (name, locations, seq) all under one domain.
        let mut index = VhostIndex::default();
        for (name, locations, seq) in entries {
            let mut config = ProxyConfig::new(*name, ProxyKind::Http);
            config.locations = locations.iter().map(|l| l.to_string()).collect();
            index.insert(ProxyKind::Http, "normal.example.com".to_string(), &config, *seq);
        }
        index
    }

    #[test]
    fn test_longest_prefix_wins() {
        let index = index_with(&[("foo", &["/", "/foo"], 1), ("bar", &["/bar"], 2)]);

        let pick = |path: &str| {
            index
                .resolve_http("normal.example.com", path)
                .unwrap()
                .proxy_name
                .clone()
        };
        assert_eq!(pick("/foo"), "foo");
        assert_eq!(pick("/bar"), "bar");
        // No explicit match: falls through to foo's "/" catch-all.
        assert_eq!(pick("/other"), "foo");
    }

    #[test]
    fn test_disjoint_locations_never_cross() {
        let index = index_with(&[("a", &["/a"], 1), ("b", &["/b"], 2)]);
        assert_eq!(
            index
                .resolve_http("normal.example.com", "/a/deep/path")
                .unwrap()
                .proxy_name,
            "a"
        );
        assert_eq!(
            index
                .resolve_http("normal.example.com", "/b")
                .unwrap()
                .proxy_name,
            "b"
        );
        assert!(index.resolve_http("normal.example.com", "/c").is_err());
    }

    #[test]
    fn test_tie_goes_to_most_recent_registration() {
        let index = index_with(&[("old", &["/app"], 1), ("new", &["/app"], 7)]);
        assert_eq!(
            index
                .resolve_http("normal.example.com", "/app")
                .unwrap()
                .proxy_name,
            "new"
        );
    }

    #[test]
    fn test_empty_locations_is_catch_all() {
        let index = index_with(&[("everything", &[], 1)]);
        assert_eq!(
            index
                .resolve_http("normal.example.com", "/any/path/at/all")
                .unwrap()
                .proxy_name,
            "everything"
        );
    }

    #[test]
    fn test_exact_domain_beats_wildcard() {
        let mut index = VhostIndex::default();
        let wild = ProxyConfig::new("wild", ProxyKind::Http);
        index.insert(ProxyKind::Http, "*.example.com".to_string(), &wild, 1);
        let exact = ProxyConfig::new("exact", ProxyKind::Http);
        index.insert(ProxyKind::Http, "app.example.com".to_string(), &exact, 2);

        assert_eq!(
            index.resolve_http("app.example.com", "/").unwrap().proxy_name,
            "exact"
        );
        assert_eq!(
            index.resolve_http("other.example.com", "/").unwrap().proxy_name,
            "wild"
        );
        assert_eq!(
            index
                .resolve_http("deep.sub.example.com", "/")
                .unwrap()
                .proxy_name,
            "wild"
        );
    }

    #[test]
    fn test_host_is_case_insensitive_and_port_stripped() {
        let index = index_with(&[("web", &["/"], 1)]);
        assert!(index.resolve_http("Normal.Example.COM:8080", "/").is_ok());
    }

    #[test]
    fn test_miss_is_an_error() {
        let index = index_with(&[("web", &["/"], 1)]);
        let err = index.resolve_http("unknown.example.org", "/").unwrap_err();
        assert_eq!(err.host, "unknown.example.org");
    }
}
