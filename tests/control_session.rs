//! End-to-end control-channel tests: authentication, name conflicts, and
//! session teardown.

mod common;

use std::time::Duration;

use burrow::config::{ProxyConfig, ProxyKind};
use common::*;

fn domain_proxy(name: &str, domain: &str) -> ProxyConfig {
    let mut proxy = ProxyConfig::new(name, ProxyKind::Http);
    proxy.local_addr = "127.0.0.1:1".to_string(); // never dialed in these tests
    proxy.custom_domains = vec![domain.to_string()];
    proxy
}

#[tokio::test]
async fn test_bad_token_creates_no_session() {
    let server = start_server_with(|config| {
        config.auth_token = Some("right-token".to_string());
    })
    .await;

    let _client = start_client_unchecked(
        &server,
        Some("wrong-token"),
        vec![domain_proxy("web", "a.example.com")],
    );

    // Give the rejected login ample time, then confirm nothing registered.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(server.registry.is_empty());
}

#[tokio::test]
async fn test_correct_token_logs_in() {
    let server = start_server_with(|config| {
        config.auth_token = Some("right-token".to_string());
    })
    .await;

    let _client = start_client_unchecked(
        &server,
        Some("right-token"),
        vec![domain_proxy("web", "a.example.com")],
    );
    assert!(wait_for_proxies(&server.registry, 1).await);
}

#[tokio::test]
async fn test_cross_session_name_conflict_rejected() {
    let server = start_server().await;

    let _first = start_client(&server, vec![domain_proxy("web", "a.example.com")]).await;
    let owner = server.registry.lookup_by_name("web").unwrap().session_id;

    // A second session claiming the same name must be rejected, while the
    // first session's registration keeps routing.
    let _second = start_client_unchecked(&server, None, vec![domain_proxy("web", "b.example.com")]);
    tokio::time::sleep(Duration::from_millis(500)).await;

    let entry = server.registry.lookup_by_name("web").unwrap();
    assert_eq!(entry.session_id, owner);
    assert_eq!(server.registry.len(), 1);
    assert!(server.registry.lookup_http("a.example.com", "/").is_ok());
    assert!(server.registry.lookup_http("b.example.com", "/").is_err());
}

#[tokio::test]
async fn test_client_shutdown_releases_registrations() {
    let server = start_server().await;

    let client = start_client(
        &server,
        vec![
            domain_proxy("one", "a.example.com"),
            domain_proxy("two", "b.example.com"),
        ],
    )
    .await;
    assert_eq!(server.registry.len(), 2);

    // Drop the client's connection; the server must release everything.
    client.trigger();
    assert!(
        wait_for_proxies(&server.registry, 0).await,
        "registrations survived session teardown"
    );
}
