//! Tunnel client service.
//!
//! # Responsibilities
//! - Connect out to the server: handshake → multiplexer → control stream
//! - Login, register every configured proxy, keep the session alive with
//!   heartbeats
//! - Answer `ReqWorkConn` by opening a logical stream, writing the
//!   preamble, and splicing it to the local backend
//! - Reconnect with jittered exponential backoff; every proxy is
//!   re-registered from scratch, since the server persists nothing
//!
//! # Design Decisions
//! - Authentication rejection is fatal (no retry loop against a wrong
//!   token); everything else reconnects
//! - The client pings; two consecutive unanswered pings abandon the
//!   session

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::time::timeout;
use uuid::Uuid;

use crate::codec::{client_handshake, FrameDecoder, FramingError, MessageStream};
use crate::config::{ClientConfig, ProxyConfig};
use crate::control::{Role, StateMachine, TransitionError};
use crate::msg::{Login, Message, NewProxy, NewWorkConn, Ping};
use crate::mux::{Multiplexer, MuxConfig, MuxError, MuxHandle, Side};
use crate::pool::WorkConn;

/// Errors that end a client session (and, for authentication, the whole
/// client).
#[derive(Debug, Error)]
pub enum ClientError {
    /// The server rejected our login. Not retried.
    #[error("authentication rejected: {0}")]
    Authentication(String),

    #[error("connect failed: {0}")]
    Connect(std::io::Error),

    #[error("server closed the control channel")]
    ControlClosed,

    #[error("heartbeat timed out")]
    HeartbeatTimeout,

    #[error("control protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Framing(#[from] FramingError),

    #[error(transparent)]
    Mux(#[from] MuxError),

    #[error(transparent)]
    Transition(#[from] TransitionError),
}

/// The outbound-only tunnel client.
pub struct TunnelClient {
    config: Arc<ClientConfig>,
    proxies: Arc<HashMap<String, ProxyConfig>>,
}

impl TunnelClient {
    pub fn new(config: ClientConfig) -> Self {
        let proxies = config
            .proxies
            .iter()
            .map(|p| (p.name.clone(), p.clone()))
            .collect();
        Self {
            config: Arc::new(config),
            proxies: Arc::new(proxies),
        }
    }

    /// Run until shutdown, reconnecting across session failures.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) -> Result<(), ClientError> {
        let mut attempt: u32 = 0;
        loop {
            let mut logged_in = false;
            let outcome = tokio::select! {
                _ = shutdown.recv() => return Ok(()),
                outcome = self.run_session(&mut logged_in) => outcome,
            };
            match outcome {
                Err(ClientError::Authentication(reason)) => {
                    tracing::error!(reason = %reason, "login rejected; giving up");
                    return Err(ClientError::Authentication(reason));
                }
                Err(e) => tracing::warn!(error = %e, "session ended"),
                Ok(()) => tracing::info!("session closed by server"),
            }

            if logged_in {
                attempt = 0;
            }
            attempt = attempt.saturating_add(1);
            let delay = reconnect_backoff(
                attempt,
                self.config.reconnect.base_delay_ms,
                self.config.reconnect.max_delay_ms,
            );
            tracing::info!(delay_ms = delay.as_millis() as u64, "reconnecting");
            tokio::select! {
                _ = shutdown.recv() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// One connect-login-serve cycle. Sets `logged_in` once the server
    /// accepts us, which resets the caller's backoff.
    async fn run_session(&self, logged_in: &mut bool) -> Result<(), ClientError> {
        let transport = &self.config.transport;
        let auth_deadline = Duration::from_secs(transport.auth_deadline_secs);

        let mut stream = TcpStream::connect(&self.config.server_addr)
            .await
            .map_err(ClientError::Connect)?;
        let _ = stream.set_nodelay(true);

        let mut decoder = FrameDecoder::new(transport.max_frame_bytes);
        let negotiated = client_handshake(
            &mut stream,
            &mut decoder,
            transport.initial_window_bytes,
        )
        .await?;

        let mux = Multiplexer::spawn(
            stream,
            decoder,
            Side::Client,
            MuxConfig::new(transport, negotiated.peer_window),
        );
        let handle = mux.handle();

        let mut machine = StateMachine::new(Role::Client);
        let control = handle.open_stream()?;
        machine.control_opened()?;
        let mut msgs = MessageStream::new(control, transport.max_frame_bytes);

        msgs.send(&Message::Login(Login {
            version: env!("CARGO_PKG_VERSION").to_string(),
            hostname: None,
            token: self.config.auth_token.clone(),
        }))
        .await?;

        let resp = match timeout(auth_deadline, msgs.recv()).await {
            Err(_) => return Err(ClientError::Protocol("login response timed out".into())),
            Ok(result) => match result? {
                Some(msg) => {
                    machine.guard_inbound(&msg)?;
                    match msg {
                        Message::LoginResp(resp) => resp,
                        _ => unreachable!("guard admits only login_resp while authenticating"),
                    }
                }
                None => return Err(ClientError::ControlClosed),
            },
        };

        let session_id = match (resp.session_id, resp.error) {
            (Some(session_id), None) => session_id,
            (_, Some(reason)) => {
                machine.login_rejected()?;
                return Err(ClientError::Authentication(reason));
            }
            (None, None) => {
                return Err(ClientError::Protocol(
                    "login response carried neither session nor error".into(),
                ))
            }
        };
        machine.login_accepted()?;
        *logged_in = true;
        tracing::info!(session = %session_id, server = %self.config.server_addr, "logged in");

        for proxy in self.config.proxies.iter() {
            msgs.send(&Message::NewProxy(NewProxy {
                proxy: proxy.clone(),
            }))
            .await?;
        }

        self.serve(&machine, &mut msgs, &handle, session_id).await
    }

    /// The steady-state loop: heartbeats out, server messages in.
    async fn serve(
        &self,
        machine: &StateMachine,
        msgs: &mut MessageStream<crate::mux::LogicalStream>,
        handle: &MuxHandle,
        session_id: Uuid,
    ) -> Result<(), ClientError> {
        let heartbeat = &self.config.heartbeat;
        let mut ping = tokio::time::interval(Duration::from_secs(heartbeat.interval_secs));
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut unanswered: u32 = 0;

        loop {
            tokio::select! {
                result = msgs.recv() => {
                    let msg = match result? {
                        Some(msg) => msg,
                        None => return Err(ClientError::ControlClosed),
                    };
                    machine.guard_inbound(&msg)?;
                    match msg {
                        Message::Pong(_) => {
                            unanswered = unanswered.saturating_sub(1);
                        }
                        Message::Ping(_) => {
                            msgs.send(&Message::Pong(crate::msg::Pong {})).await?;
                        }
                        Message::NewProxyResp(resp) => match resp.error {
                            Some(reason) => tracing::error!(
                                proxy = %resp.name,
                                reason = %reason,
                                "proxy registration rejected"
                            ),
                            None => tracing::info!(
                                proxy = %resp.name,
                                remote_addr = resp.remote_addr.as_deref().unwrap_or("-"),
                                "proxy registered"
                            ),
                        },
                        Message::ReqWorkConn(req) => {
                            match self.proxies.get(&req.proxy_name) {
                                Some(proxy) => {
                                    tokio::spawn(open_work_conn(
                                        handle.clone(),
                                        session_id,
                                        proxy.clone(),
                                        self.config.transport.max_frame_bytes,
                                    ));
                                }
                                None => tracing::warn!(
                                    proxy = %req.proxy_name,
                                    "work connection requested for unknown proxy"
                                ),
                            }
                        }
                        other => {
                            return Err(ClientError::Protocol(format!(
                                "unhandled message {}",
                                other.name()
                            )))
                        }
                    }
                }
                _ = ping.tick() => {
                    if unanswered >= heartbeat.miss_threshold {
                        return Err(ClientError::HeartbeatTimeout);
                    }
                    msgs.send(&Message::Ping(Ping {})).await?;
                    unanswered += 1;
                }
            }
        }
    }
}

/// Open one work connection: logical stream + preamble + local splice.
async fn open_work_conn(
    handle: MuxHandle,
    session_id: Uuid,
    proxy: ProxyConfig,
    max_frame: usize,
) {
    let result = async {
        let stream = handle.open_stream()?;
        // Dial the backend before the preamble: a dead backend then drops
        // the stream without ever entering the server's pool.
        let local = TcpStream::connect(&proxy.local_addr)
            .await
            .map_err(ClientError::Connect)?;

        let mut msgs = MessageStream::new(stream, max_frame);
        msgs.send(&Message::NewWorkConn(NewWorkConn {
            session_id,
            proxy_name: proxy.name.clone(),
        }))
        .await?;
        let (stream, leftover) = msgs.into_parts();
        Ok::<_, ClientError>((WorkConn::new(stream, leftover), local))
    }
    .await;

    let (mut work, mut local) = match result {
        Ok(pair) => pair,
        Err(e) => {
            tracing::warn!(proxy = %proxy.name, error = %e, "work connection setup failed");
            return;
        }
    };

    match tokio::io::copy_bidirectional(&mut work, &mut local).await {
        Ok((from_public, to_public)) => tracing::debug!(
            proxy = %proxy.name,
            from_public,
            to_public,
            "work connection finished"
        ),
        Err(e) => tracing::debug!(proxy = %proxy.name, error = %e, "work connection ended with error"),
    }
}

/// Exponential backoff with jitter for reconnect attempts.
fn reconnect_backoff(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    if attempt == 0 {
        return Duration::from_millis(0);
    }

    let exponential_base = 2u64.saturating_pow(attempt.saturating_sub(1).min(16));
    let capped_delay = base_ms.saturating_mul(exponential_base).min(max_ms);

    // Jitter up to 10% of the delay keeps reconnect storms apart.
    let jitter_range = capped_delay / 10;
    let jitter = if jitter_range > 0 {
        fastrand::u64(0..jitter_range)
    } else {
        0
    };

    Duration::from_millis(capped_delay + jitter)
}
