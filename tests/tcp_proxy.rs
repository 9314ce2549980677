//! End-to-end tcp proxy test: raw bytes through a registered `tcp` proxy.

mod common;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use burrow::config::{ProxyConfig, ProxyKind};
use common::*;

#[tokio::test]
async fn test_tcp_proxy_echoes_bytes() {
    let server = start_server_with(|config| {
        config.vhost_http_addr = None;
    })
    .await;
    let backend = start_echo_backend().await;

    let mut proxy = ProxyConfig::new("echo", ProxyKind::Tcp);
    proxy.local_addr = backend.to_string();
    proxy.remote_port = 0; // server picks
    let _client = start_client(&server, vec![proxy]).await;

    // The session recorded the real bound port in the registry.
    let entry = server.registry.lookup_by_name("echo").unwrap();
    let port = entry.config.remote_port;
    assert_ne!(port, 0);

    let mut public = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    for round in 0..3 {
        let payload = format!("round {round}: payload through the tunnel");
        public.write_all(payload.as_bytes()).await.unwrap();
        let mut echoed = vec![0u8; payload.len()];
        public.read_exact(&mut echoed).await.unwrap();
        assert_eq!(echoed, payload.as_bytes());
    }
}

#[tokio::test]
async fn test_concurrent_tcp_connections_do_not_mix() {
    let server = start_server_with(|config| {
        config.vhost_http_addr = None;
        config.pool.reserve_size = 2;
    })
    .await;
    let backend = start_echo_backend().await;

    let mut proxy = ProxyConfig::new("echo", ProxyKind::Tcp);
    proxy.local_addr = backend.to_string();
    let _client = start_client(&server, vec![proxy]).await;

    let port = server
        .registry
        .lookup_by_name("echo")
        .unwrap()
        .config
        .remote_port;

    let mut tasks = Vec::new();
    for i in 0u32..8 {
        tasks.push(tokio::spawn(async move {
            let mut conn = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
            let payload = format!("connection {i} says hello");
            conn.write_all(payload.as_bytes()).await.unwrap();
            let mut echoed = vec![0u8; payload.len()];
            conn.read_exact(&mut echoed).await.unwrap();
            assert_eq!(echoed, payload.as_bytes(), "bytes crossed streams");
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
}
