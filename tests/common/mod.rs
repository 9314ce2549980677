//! Shared harness for integration tests: in-process tunnel server + client
//! over real sockets, plus mock backends with hit counters.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use burrow::client::TunnelClient;
use burrow::config::{ClientConfig, ProxyConfig, ServerConfig};
use burrow::lifecycle::Shutdown;
use burrow::registry::ProxyRegistry;
use burrow::server::TunnelServer;

/// A running tunnel server bound to loopback ports.
pub struct TestServer {
    pub control_addr: SocketAddr,
    pub vhost_addr: Option<SocketAddr>,
    pub registry: Arc<ProxyRegistry>,
    shutdown: Shutdown,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}

/// Start a server with HTTP vhosting on a random port.
pub async fn start_server() -> TestServer {
    start_server_with(|_| {}).await
}

/// Start a server after applying `adjust` to a test-friendly base config.
pub async fn start_server_with(adjust: impl FnOnce(&mut ServerConfig)) -> TestServer {
    let mut config = ServerConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        vhost_http_addr: Some("127.0.0.1:0".to_string()),
        ..Default::default()
    };
    // Keep waits short so failure cases don't stall the suite.
    config.pool.take_timeout_secs = 3;
    adjust(&mut config);

    let server = TunnelServer::bind(config).await.expect("server bind failed");
    let control_addr = server.control_addr().unwrap();
    let vhost_addr = server.vhost_http_addr();
    let registry = server.registry();

    let shutdown = Shutdown::new();
    let rx = shutdown.subscribe();
    tokio::spawn(async move {
        let _ = server.run(rx).await;
    });

    TestServer {
        control_addr,
        vhost_addr,
        registry,
        shutdown,
    }
}

/// Start a client registering `proxies`, and wait until the server has
/// them all. Returns the client's shutdown handle.
pub async fn start_client(server: &TestServer, proxies: Vec<ProxyConfig>) -> Shutdown {
    let expected = server.registry.len() + proxies.len();
    let shutdown = start_client_unchecked(server, None, proxies);
    assert!(
        wait_for_proxies(&server.registry, expected).await,
        "proxies never appeared in the registry"
    );
    shutdown
}

/// Start a client without waiting for registration. `token` overrides the
/// login token.
pub fn start_client_unchecked(
    server: &TestServer,
    token: Option<&str>,
    proxies: Vec<ProxyConfig>,
) -> Shutdown {
    let config = ClientConfig {
        server_addr: server.control_addr.to_string(),
        auth_token: token.map(str::to_string),
        proxies,
        ..Default::default()
    };
    let shutdown = Shutdown::new();
    let rx = shutdown.subscribe();
    let client = TunnelClient::new(config);
    tokio::spawn(async move {
        let _ = client.run(rx).await;
    });
    shutdown
}

/// Poll until the registry holds `expected` proxies. False on timeout.
pub async fn wait_for_proxies(registry: &ProxyRegistry, expected: usize) -> bool {
    for _ in 0..500 {
        if registry.len() == expected {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// A mock HTTP backend counting the requests it actually received.
pub struct MockBackend {
    pub addr: SocketAddr,
    pub hits: Arc<AtomicU32>,
}

impl MockBackend {
    pub fn hit_count(&self) -> u32 {
        self.hits.load(Ordering::SeqCst)
    }
}

/// Start a mock backend answering 200 with a fixed body.
pub async fn start_http_backend(body: &'static str) -> MockBackend {
    start_http_backend_with(move |_| (200, body.to_string())).await
}

/// Start a mock backend computing (status, body) from the request head.
/// The handler sees the raw request up to the end of the headers.
pub async fn start_http_backend_with<F>(handler: F) -> MockBackend
where
    F: Fn(&str) -> (u16, String) + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicU32::new(0));
    let handler = Arc::new(handler);

    let task_hits = hits.clone();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            let hits = task_hits.clone();
            let handler = handler.clone();
            tokio::spawn(async move {
                let Some(head) = read_request_head(&mut socket).await else {
                    return;
                };
                hits.fetch_add(1, Ordering::SeqCst);
                let (status, body) = handler(&head);
                let status_text = match status {
                    200 => "200 OK",
                    404 => "404 Not Found",
                    500 => "500 Internal Server Error",
                    _ => "200 OK",
                };
                let response = format!(
                    "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status_text,
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    MockBackend { addr, hits }
}

/// Read until the blank line ending the request head.
async fn read_request_head(socket: &mut tokio::net::TcpStream) -> Option<String> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            return String::from_utf8(buf[..pos].to_vec()).ok();
        }
        if buf.len() > 64 * 1024 {
            return None;
        }
    }
}

/// Extract a header value from a raw request head.
pub fn header_value(head: &str, name: &str) -> Option<String> {
    head.lines().skip(1).find_map(|line| {
        let (key, value) = line.split_once(':')?;
        if key.trim().eq_ignore_ascii_case(name) {
            Some(value.trim().to_string())
        } else {
            None
        }
    })
}

/// Start a raw TCP echo backend.
pub async fn start_echo_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let (mut reader, mut writer) = socket.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    addr
}

/// An HTTP client that neither pools nor proxies, so each request takes a
/// fresh public connection.
pub fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(0)
        .no_proxy()
        .build()
        .unwrap()
}
