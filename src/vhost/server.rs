//! Shared vhost HTTP listener.
//!
//! # Responsibilities
//! - Accept public HTTP traffic on the shared vhost port
//! - Route each request by Host + path through the registry snapshot
//! - Enforce Basic-Auth and apply rewrites before forwarding
//! - Forward over a pooled work connection and stream the response back
//!
//! # Status mapping
//! - routing miss → 404, backend never contacted
//! - auth challenge failed → 401 + WWW-Authenticate, no stream consumed
//! - pool timeout → 504
//! - session gone / upstream failure → 502

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{header, Request, StatusCode},
    response::{IntoResponse, Response},
    routing::any,
    Router,
};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::trace::TraceLayer;

use crate::observability::metrics;
use crate::pool::{PoolError, WorkConn};
use crate::registry::ProxyRegistry;
use crate::vhost::rewrite;
use crate::vhost::router::normalize_host;

/// State injected into the vhost handler.
#[derive(Clone)]
pub struct VhostState {
    pub registry: Arc<ProxyRegistry>,
    pub take_timeout: Duration,
}

/// The shared-port HTTP frontend.
pub struct VhostServer {
    router: Router,
}

impl VhostServer {
    pub fn new(registry: Arc<ProxyRegistry>, take_timeout: Duration) -> Self {
        let state = VhostState {
            registry,
            take_timeout,
        };
        let router = Router::new()
            .route("/", any(vhost_handler))
            .route("/{*path}", any(vhost_handler))
            .with_state(state)
            .layer(TraceLayer::new_for_http());
        Self { router }
    }

    /// Serve until the shutdown signal fires.
    pub async fn run(
        self,
        listener: TcpListener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "vhost HTTP listener started");

        let app = self
            .router
            .into_make_service_with_connect_info::<SocketAddr>();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
            })
            .await?;

        tracing::info!(address = %addr, "vhost HTTP listener stopped");
        Ok(())
    }
}

/// Route, rewrite, and forward one public request.
async fn vhost_handler(
    State(state): State<VhostState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request<Body>,
) -> Response {
    let started = Instant::now();
    let method = request.method().to_string();
    let path = request.uri().path().to_string();

    let Some(host) = request_host(&request) else {
        metrics::record_vhost_request(&method, 404, "none", started);
        return (StatusCode::NOT_FOUND, "no host in request").into_response();
    };

    let entry = match state.registry.lookup_http(&host, &path) {
        Ok(entry) => entry,
        Err(miss) => {
            tracing::debug!(host = %miss.host, path = %miss.path, "no route for request");
            metrics::record_vhost_request(&method, 404, "none", started);
            return (StatusCode::NOT_FOUND, "no route found").into_response();
        }
    };

    if rewrite::check_basic_auth(&entry.config, request.headers()).is_err() {
        tracing::debug!(proxy = %entry.name, "basic auth challenge failed");
        metrics::record_vhost_request(&method, 401, &entry.name, started);
        return (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, "Basic realm=\"restricted\"")],
            "",
        )
            .into_response();
    }

    let conn = match entry.pool.take(state.take_timeout).await {
        Ok(conn) => conn,
        Err(PoolError::Timeout) => {
            tracing::warn!(proxy = %entry.name, "timed out waiting for a work connection");
            metrics::record_vhost_request(&method, 504, &entry.name, started);
            return (StatusCode::GATEWAY_TIMEOUT, "no work connection available").into_response();
        }
        Err(PoolError::Closed) => {
            metrics::record_vhost_request(&method, 502, &entry.name, started);
            return (StatusCode::BAD_GATEWAY, "proxy session is gone").into_response();
        }
    };

    let (mut parts, body) = request.into_parts();
    rewrite::apply(&mut parts, &entry.config, peer.ip(), &host);
    let outbound = Request::from_parts(parts, body);

    match forward(conn, outbound).await {
        Ok(response) => {
            metrics::record_vhost_request(&method, response.status().as_u16(), &entry.name, started);
            response.map(Body::new).into_response()
        }
        Err(e) => {
            tracing::warn!(proxy = %entry.name, error = %e, "forwarding failed");
            metrics::record_vhost_request(&method, 502, &entry.name, started);
            (StatusCode::BAD_GATEWAY, "upstream request failed").into_response()
        }
    }
}

/// Send the request over the work connection and hand back the streaming
/// response. The connection task drives the exchange until the response
/// body completes, then the logical stream drops.
async fn forward(
    conn: WorkConn,
    request: Request<Body>,
) -> Result<Response<hyper::body::Incoming>, hyper::Error> {
    let stream_id = conn.id();
    let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(conn)).await?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::debug!(stream = stream_id, error = %e, "work connection ended with error");
        }
    });
    sender.send_request(request).await
}

/// The vhost host of a request: Host header first, then URI authority.
fn request_host(request: &Request<Body>) -> Option<String> {
    let raw = request
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| request.uri().authority().map(|a| a.as_str()))?;
    Some(normalize_host(raw))
}
