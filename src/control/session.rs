//! Server-side session driver.
//!
//! One task per authenticated client connection. Owns the control stream,
//! answers heartbeats, applies registrations against the registry, relays
//! work-connection requests from the pools, and takes incoming work
//! connections off the multiplexer.
//!
//! Teardown (heartbeat timeout, protocol violation, or connection loss)
//! deregisters every proxy the session owns; nothing persists across
//! sessions.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use uuid::Uuid;

use crate::codec::{FramingError, MessageStream};
use crate::config::{validate_proxy, ProxyConfig, ProxyKind, ServerConfig};
use crate::control::machine::{Role, StateMachine, TransitionError};
use crate::msg::{
    CloseProxy, Login, LoginResp, Message, NewProxy, NewProxyResp, Pong, ReqWorkConn,
};
use crate::mux::{LogicalStream, Multiplexer};
use crate::observability::metrics;
use crate::pool::{WorkConn, WorkConnPool};
use crate::registry::{ProxyRegistry, RegistryEntry};
use crate::server::tcp::serve_tcp_proxy;

/// Deadline for a work connection to present its preamble.
const PREAMBLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors that end a session.
#[derive(Debug, Error)]
pub enum ControlError {
    /// Login rejected; no session was created.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// The client missed too many heartbeats.
    #[error("heartbeat timed out")]
    HeartbeatTimeout,

    /// The peer closed the control channel.
    #[error("control channel closed")]
    Closed,

    #[error("control protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error(transparent)]
    Framing(#[from] FramingError),
}

/// Server-wide dependencies shared by every session.
pub struct SessionContext {
    pub registry: Arc<ProxyRegistry>,
    pub config: Arc<ServerConfig>,
}

/// One client session on the server.
pub struct Session {
    id: Uuid,
    machine: StateMachine,
    ctx: Arc<SessionContext>,
    /// Pools push proxy names here; the session turns them into
    /// `ReqWorkConn` messages on the control stream.
    workconn_req_tx: mpsc::UnboundedSender<String>,
    workconn_req_rx: Option<mpsc::UnboundedReceiver<String>>,
    /// Listener tasks for this session's `tcp` proxies, by proxy name.
    tcp_listeners: HashMap<String, JoinHandle<()>>,
    last_heartbeat: Instant,
}

impl Session {
    pub fn new(ctx: Arc<SessionContext>) -> Self {
        let (workconn_req_tx, workconn_req_rx) = mpsc::unbounded_channel();
        Self {
            id: Uuid::new_v4(),
            machine: StateMachine::new(Role::Server),
            ctx,
            workconn_req_tx,
            workconn_req_rx: Some(workconn_req_rx),
            tcp_listeners: HashMap::new(),
            last_heartbeat: Instant::now(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Drive the session over its multiplexer until it ends, then tear
    /// everything down.
    pub async fn run(
        mut self,
        mut mux: Multiplexer,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), ControlError> {
        let auth_deadline = Duration::from_secs(self.ctx.config.transport.auth_deadline_secs);

        // The first stream the client opens is the control stream.
        let control = match timeout(auth_deadline, mux.accept()).await {
            Ok(Some(stream)) => stream,
            Ok(None) => return Err(ControlError::Closed),
            Err(_) => {
                return Err(ControlError::Authentication(
                    "no control stream before deadline".to_string(),
                ))
            }
        };
        self.machine.control_opened()?;

        let mut msgs = MessageStream::new(control, self.ctx.config.transport.max_frame_bytes);
        self.login_exchange(&mut msgs, auth_deadline).await?;

        metrics::record_session_opened();
        let result = self.active_loop(&mut msgs, &mut mux, &mut shutdown).await;
        self.teardown();
        metrics::record_session_closed();
        match &result {
            Ok(()) => tracing::info!(session = %self.id, "session closed"),
            Err(e) => tracing::info!(session = %self.id, reason = %e, "session ended"),
        }
        result
    }

    async fn login_exchange(
        &mut self,
        msgs: &mut MessageStream<LogicalStream>,
        auth_deadline: Duration,
    ) -> Result<(), ControlError> {
        let msg = match timeout(auth_deadline, msgs.recv()).await {
            Err(_) => {
                self.machine.login_rejected()?;
                return Err(ControlError::Authentication(
                    "no login before deadline".to_string(),
                ));
            }
            Ok(result) => match result? {
                Some(msg) => msg,
                None => return Err(ControlError::Closed),
            },
        };
        self.machine.guard_inbound(&msg)?;
        let Message::Login(login) = msg else {
            unreachable!("guard admits only login while authenticating");
        };

        match self.authenticate(&login) {
            Ok(()) => {
                self.machine.login_accepted()?;
                self.last_heartbeat = Instant::now();
                msgs.send(&Message::LoginResp(LoginResp {
                    session_id: Some(self.id),
                    error: None,
                }))
                .await?;
                tracing::info!(
                    session = %self.id,
                    client_version = %login.version,
                    "session opened"
                );
                Ok(())
            }
            Err(reason) => {
                // Best effort: tell the client why before hanging up.
                let _ = msgs
                    .send(&Message::LoginResp(LoginResp {
                        session_id: None,
                        error: Some(reason.clone()),
                    }))
                    .await;
                self.machine.login_rejected()?;
                tracing::warn!(reason = %reason, "login rejected");
                Err(ControlError::Authentication(reason))
            }
        }
    }

    fn authenticate(&self, login: &Login) -> Result<(), String> {
        match &self.ctx.config.auth_token {
            None => Ok(()),
            Some(expected) if login.token.as_deref() == Some(expected.as_str()) => Ok(()),
            Some(_) => Err("invalid token".to_string()),
        }
    }

    async fn active_loop(
        &mut self,
        msgs: &mut MessageStream<LogicalStream>,
        mux: &mut Multiplexer,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<(), ControlError> {
        let heartbeat = &self.ctx.config.heartbeat;
        let interval = Duration::from_secs(heartbeat.interval_secs);
        let deadline = interval * heartbeat.miss_threshold;
        let mut watchdog = tokio::time::interval(interval);
        watchdog.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let mut req_rx = self
            .workconn_req_rx
            .take()
            .expect("active loop entered twice");

        loop {
            tokio::select! {
                result = msgs.recv() => {
                    let msg = match result? {
                        Some(msg) => msg,
                        None => return Ok(()),
                    };
                    self.machine.guard_inbound(&msg)?;
                    match msg {
                        Message::Ping(_) => {
                            self.last_heartbeat = Instant::now();
                            msgs.send(&Message::Pong(Pong {})).await?;
                        }
                        Message::Pong(_) => {
                            self.last_heartbeat = Instant::now();
                        }
                        Message::NewProxy(NewProxy { proxy }) => {
                            self.handle_new_proxy(msgs, proxy).await?;
                        }
                        Message::CloseProxy(CloseProxy { name }) => {
                            self.handle_close_proxy(&name);
                        }
                        other => {
                            return Err(ControlError::Protocol(format!(
                                "unhandled message {}",
                                other.name()
                            )));
                        }
                    }
                }
                incoming = mux.accept() => {
                    match incoming {
                        Some(stream) => {
                            tokio::spawn(intake_work_conn(
                                stream,
                                self.ctx.registry.clone(),
                                self.id,
                                self.ctx.config.transport.max_frame_bytes,
                            ));
                        }
                        None => return Ok(()),
                    }
                }
                Some(proxy_name) = req_rx.recv() => {
                    msgs.send(&Message::ReqWorkConn(ReqWorkConn { proxy_name })).await?;
                }
                _ = watchdog.tick() => {
                    if self.last_heartbeat.elapsed() > deadline {
                        return Err(ControlError::HeartbeatTimeout);
                    }
                }
                _ = shutdown.recv() => return Ok(()),
            }
        }
    }

    async fn handle_new_proxy(
        &mut self,
        msgs: &mut MessageStream<LogicalStream>,
        proxy: ProxyConfig,
    ) -> Result<(), ControlError> {
        let name = proxy.name.clone();
        let resp = match self.register_proxy(proxy).await {
            Ok(remote_addr) => NewProxyResp {
                name,
                error: None,
                remote_addr,
            },
            Err(reason) => {
                tracing::warn!(session = %self.id, proxy = %name, reason = %reason, "registration rejected");
                NewProxyResp {
                    name,
                    error: Some(reason),
                    remote_addr: None,
                }
            }
        };
        msgs.send(&Message::NewProxyResp(resp)).await?;
        Ok(())
    }

    /// Validate, bind (for `tcp`), register, and prime the pool. Returns
    /// the public address for `tcp` proxies.
    async fn register_proxy(&mut self, proxy: ProxyConfig) -> Result<Option<String>, String> {
        validate_proxy(&proxy).map_err(|errs| {
            errs.iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        })?;
        if proxy.subdomain.is_some() && self.ctx.registry.subdomain_host().is_empty() {
            return Err("subdomain registration is disabled on this server".to_string());
        }

        // Bind before touching the registry so a failed bind leaves no
        // half-registered state.
        let mut proxy = proxy;
        let listener = if proxy.kind == ProxyKind::Tcp {
            let listener = TcpListener::bind(("0.0.0.0", proxy.remote_port))
                .await
                .map_err(|e| format!("bind port {} failed: {e}", proxy.remote_port))?;
            // Record the real port when the config asked for 0.
            if let Ok(addr) = listener.local_addr() {
                proxy.remote_port = addr.port();
            }
            Some(listener)
        } else {
            None
        };

        let name = proxy.name.clone();
        let pool = Arc::new(WorkConnPool::new(
            name.clone(),
            self.ctx.config.pool.reserve_size,
            self.workconn_req_tx.clone(),
        ));
        let (entry, replaced) = self
            .ctx
            .registry
            .register(proxy, self.id, pool.clone())
            .map_err(|e| e.to_string())?;
        if let Some(old) = replaced {
            self.release_entry(&old);
        }

        let remote_addr = match listener {
            Some(listener) => {
                let addr = listener.local_addr().map_err(|e| e.to_string())?;
                let take_timeout = Duration::from_secs(self.ctx.config.pool.take_timeout_secs);
                let handle = tokio::spawn(serve_tcp_proxy(listener, entry.clone(), take_timeout));
                self.tcp_listeners.insert(name.clone(), handle);
                Some(addr.to_string())
            }
            None => None,
        };

        pool.prime();
        metrics::record_proxy_registered(&entry.config.kind.to_string());
        Ok(remote_addr)
    }

    fn handle_close_proxy(&mut self, name: &str) {
        if let Some(entry) = self.ctx.registry.deregister(name, self.id) {
            self.release_entry(&entry);
        }
        // Unknown name or foreign owner: idempotent, not an error.
    }

    fn release_entry(&mut self, entry: &RegistryEntry) {
        entry.pool.close();
        if let Some(handle) = self.tcp_listeners.remove(&entry.name) {
            handle.abort();
        }
    }

    fn teardown(&mut self) {
        self.machine.begin_close();
        let removed = self.ctx.registry.deregister_session(self.id);
        for entry in &removed {
            entry.pool.close();
        }
        for (_, handle) in self.tcp_listeners.drain() {
            handle.abort();
        }
        self.machine.finish_close();
    }
}

/// Consume a work connection's preamble and hand it to the right pool.
async fn intake_work_conn(
    stream: LogicalStream,
    registry: Arc<ProxyRegistry>,
    session_id: Uuid,
    max_frame: usize,
) {
    let stream_id = stream.id();
    let mut msgs = MessageStream::new(stream, max_frame);
    let preamble = match timeout(PREAMBLE_TIMEOUT, msgs.recv()).await {
        Ok(Ok(Some(Message::NewWorkConn(preamble)))) => preamble,
        Ok(Ok(Some(other))) => {
            tracing::debug!(stream = stream_id, got = other.name(), "work connection sent a non-preamble message");
            return;
        }
        Ok(Ok(None)) | Ok(Err(_)) | Err(_) => {
            tracing::debug!(stream = stream_id, "work connection closed before preamble");
            return;
        }
    };

    if preamble.session_id != session_id {
        tracing::warn!(
            stream = stream_id,
            claimed = %preamble.session_id,
            "work connection claimed a foreign session"
        );
        return;
    }
    let Some(entry) = registry.lookup_by_name(&preamble.proxy_name) else {
        tracing::debug!(stream = stream_id, proxy = %preamble.proxy_name, "work connection for unknown proxy");
        return;
    };
    if entry.session_id != session_id {
        tracing::warn!(stream = stream_id, proxy = %preamble.proxy_name, "work connection for foreign proxy");
        return;
    }

    let (stream, leftover) = msgs.into_parts();
    entry.pool.put(WorkConn::new(stream, leftover));
    tracing::trace!(stream = stream_id, proxy = %entry.name, "work connection pooled");
}
