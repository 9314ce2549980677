//! Tunnel server service.
//!
//! # Responsibilities
//! - Accept client control connections: handshake → multiplexer → session
//! - Run the shared vhost HTTP listener and the HTTPS (SNI passthrough)
//!   listener
//! - Host per-proxy `tcp` listeners (spawned by sessions, see [`tcp`])
//!
//! # Design Decisions
//! - All shared state (registry, config) travels in an explicit
//!   `SessionContext`; nothing is process-global, so independent servers
//!   coexist in one test process
//! - Listeners are bound in `bind()` and reported before `run()`, so
//!   callers (and tests) can bind port 0 and read the real addresses

pub mod tcp;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::timeout;

use crate::codec::{server_handshake, FrameDecoder};
use crate::config::ServerConfig;
use crate::control::{Session, SessionContext};
use crate::mux::{Multiplexer, MuxConfig, Side};
use crate::registry::ProxyRegistry;
use crate::vhost::sni;
use crate::vhost::VhostServer;

/// Errors raised while starting or running the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("bind {addr} failed: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The public-facing tunnel server.
pub struct TunnelServer {
    config: Arc<ServerConfig>,
    registry: Arc<ProxyRegistry>,
    control_listener: TcpListener,
    vhost_http_listener: Option<TcpListener>,
    vhost_https_listener: Option<TcpListener>,
}

impl TunnelServer {
    /// Bind every configured listener. Addresses are readable before
    /// [`TunnelServer::run`], which matters when binding port 0.
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        let registry = Arc::new(ProxyRegistry::new(config.subdomain_host.clone()));

        let control_listener = bind(&config.bind_addr).await?;
        let vhost_http_listener = match &config.vhost_http_addr {
            Some(addr) => Some(bind(addr).await?),
            None => None,
        };
        let vhost_https_listener = match &config.vhost_https_addr {
            Some(addr) => Some(bind(addr).await?),
            None => None,
        };

        Ok(Self {
            config: Arc::new(config),
            registry,
            control_listener,
            vhost_http_listener,
            vhost_https_listener,
        })
    }

    pub fn registry(&self) -> Arc<ProxyRegistry> {
        self.registry.clone()
    }

    /// Address of the control listener.
    pub fn control_addr(&self) -> std::io::Result<SocketAddr> {
        self.control_listener.local_addr()
    }

    /// Address of the vhost HTTP listener, when enabled.
    pub fn vhost_http_addr(&self) -> Option<SocketAddr> {
        self.vhost_http_listener
            .as_ref()
            .and_then(|l| l.local_addr().ok())
    }

    /// Address of the vhost HTTPS listener, when enabled.
    pub fn vhost_https_addr(&self) -> Option<SocketAddr> {
        self.vhost_https_listener
            .as_ref()
            .and_then(|l| l.local_addr().ok())
    }

    /// Serve until the shutdown signal fires.
    pub async fn run(self, shutdown: broadcast::Receiver<()>) -> Result<(), ServerError> {
        let TunnelServer {
            config,
            registry,
            control_listener,
            vhost_http_listener,
            vhost_https_listener,
        } = self;

        let take_timeout = Duration::from_secs(config.pool.take_timeout_secs);
        if let Some(listener) = vhost_http_listener {
            let vhost = VhostServer::new(registry.clone(), take_timeout);
            let shutdown = shutdown.resubscribe();
            tokio::spawn(async move {
                if let Err(e) = vhost.run(listener, shutdown).await {
                    tracing::error!(error = %e, "vhost HTTP listener failed");
                }
            });
        }
        if let Some(listener) = vhost_https_listener {
            let registry = registry.clone();
            let shutdown = shutdown.resubscribe();
            tokio::spawn(run_https_vhost(listener, registry, take_timeout, shutdown));
        }

        let ctx = Arc::new(SessionContext {
            registry,
            config: config.clone(),
        });
        let addr = control_listener.local_addr()?;
        tracing::info!(address = %addr, "control listener started");

        let mut shutdown = shutdown;
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                accepted = control_listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            tracing::debug!(peer = %peer, "client connected");
                            let ctx = ctx.clone();
                            let shutdown = shutdown.resubscribe();
                            tokio::spawn(handle_connection(stream, peer, ctx, shutdown));
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "control accept failed");
                        }
                    }
                }
            }
        }

        tracing::info!("control listener stopped");
        Ok(())
    }
}

async fn bind(addr: &str) -> Result<TcpListener, ServerError> {
    TcpListener::bind(addr).await.map_err(|source| ServerError::Bind {
        addr: addr.to_string(),
        source,
    })
}

/// Handshake, multiplex, and run one client session to completion.
async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    ctx: Arc<SessionContext>,
    shutdown: broadcast::Receiver<()>,
) {
    let _ = stream.set_nodelay(true);
    let transport = ctx.config.transport.clone();
    let auth_deadline = Duration::from_secs(transport.auth_deadline_secs);

    let mut decoder = FrameDecoder::new(transport.max_frame_bytes);
    let negotiated = match timeout(
        auth_deadline,
        server_handshake(&mut stream, &mut decoder, transport.initial_window_bytes),
    )
    .await
    {
        Ok(Ok(negotiated)) => negotiated,
        Ok(Err(e)) => {
            tracing::debug!(peer = %peer, error = %e, "handshake failed");
            return;
        }
        Err(_) => {
            tracing::debug!(peer = %peer, "handshake timed out");
            return;
        }
    };

    let mux = Multiplexer::spawn(
        stream,
        decoder,
        Side::Server,
        MuxConfig::new(&transport, negotiated.peer_window),
    );
    let session = Session::new(ctx);
    if let Err(e) = session.run(mux, shutdown).await {
        tracing::debug!(peer = %peer, reason = %e, "connection finished");
    }
}

/// Accept loop for the HTTPS vhost port: peek the ClientHello, route by
/// SNI, splice the TLS bytes through unmodified.
async fn run_https_vhost(
    listener: TcpListener,
    registry: Arc<ProxyRegistry>,
    take_timeout: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let addr = listener.local_addr().ok();
    tracing::info!(address = ?addr, "vhost HTTPS listener started");

    loop {
        let accepted = tokio::select! {
            _ = shutdown.recv() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                let registry = registry.clone();
                tokio::spawn(async move {
                    if let Err(e) = splice_https_conn(stream, &registry, take_timeout).await {
                        tracing::debug!(peer = %peer, error = %e, "https passthrough failed");
                    }
                });
            }
            Err(e) => tracing::warn!(error = %e, "https accept failed"),
        }
    }
    tracing::info!(address = ?addr, "vhost HTTPS listener stopped");
}

async fn splice_https_conn(
    mut public: TcpStream,
    registry: &ProxyRegistry,
    take_timeout: Duration,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Buffer until the ClientHello is complete enough to carry the SNI.
    let mut buffered = BytesMut::with_capacity(4096);
    let host = loop {
        match sni::extract_sni(&buffered)? {
            Some(Some(host)) => break host,
            Some(None) => return Err("client hello carries no sni".into()),
            None => {
                let n = public.read_buf(&mut buffered).await?;
                if n == 0 {
                    return Err("connection closed before client hello".into());
                }
            }
        }
    };

    let entry = registry.lookup_https(&host)?;
    let mut conn = entry.pool.take(take_timeout).await?;

    // Replay the peeked bytes, then splice.
    use tokio::io::AsyncWriteExt;
    conn.write_all(&buffered).await?;
    tokio::io::copy_bidirectional(&mut public, &mut conn).await?;
    Ok(())
}
