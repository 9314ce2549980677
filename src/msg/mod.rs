//! Control-channel message types.
//!
//! Messages travel over a logical stream as a one-byte type tag, a u32
//! big-endian length, and a JSON body (see [`crate::codec::message`]). Tags
//! are stable protocol constants; renaming a Rust field is a wire change
//! only if its serde name changes.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::codec::FramingError;
use crate::config::ProxyConfig;

/// Message type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgKind {
    Login = 0x01,
    LoginResp = 0x02,
    NewProxy = 0x03,
    NewProxyResp = 0x04,
    CloseProxy = 0x05,
    Ping = 0x06,
    Pong = 0x07,
    ReqWorkConn = 0x08,
    NewWorkConn = 0x09,
}

impl MsgKind {
    pub fn from_u8(byte: u8) -> Result<Self, FramingError> {
        match byte {
            0x01 => Ok(MsgKind::Login),
            0x02 => Ok(MsgKind::LoginResp),
            0x03 => Ok(MsgKind::NewProxy),
            0x04 => Ok(MsgKind::NewProxyResp),
            0x05 => Ok(MsgKind::CloseProxy),
            0x06 => Ok(MsgKind::Ping),
            0x07 => Ok(MsgKind::Pong),
            0x08 => Ok(MsgKind::ReqWorkConn),
            0x09 => Ok(MsgKind::NewWorkConn),
            other => Err(FramingError::UnknownKind(other)),
        }
    }
}

/// First message on the control stream; opens a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Login {
    /// Client build version, for diagnostics.
    pub version: String,
    /// Client hostname, for diagnostics.
    pub hostname: Option<String>,
    /// Shared token; must match the server's configured token.
    pub token: Option<String>,
}

/// Server's answer to [`Login`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginResp {
    /// Assigned session id on success.
    pub session_id: Option<Uuid>,
    /// Rejection reason; `None` means accepted.
    pub error: Option<String>,
}

/// Register (or same-session replace) a proxy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewProxy {
    pub proxy: ProxyConfig,
}

/// Server's answer to [`NewProxy`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewProxyResp {
    pub name: String,
    /// Rejection reason; `None` means registered.
    pub error: Option<String>,
    /// Public address for `tcp` proxies, once bound.
    pub remote_addr: Option<String>,
}

/// Deregister a proxy. Idempotent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseProxy {
    pub name: String,
}

/// Heartbeat. Sent by the client, answered with [`Pong`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ping {}

/// Heartbeat answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pong {}

/// Server asks the client to open a work connection for a proxy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReqWorkConn {
    pub proxy_name: String,
}

/// Preamble written by the client as the first message on a fresh work
/// connection, binding it to a session and proxy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewWorkConn {
    pub session_id: Uuid,
    pub proxy_name: String,
}

/// Any control-channel message.
#[derive(Debug, Clone)]
pub enum Message {
    Login(Login),
    LoginResp(LoginResp),
    NewProxy(NewProxy),
    NewProxyResp(NewProxyResp),
    CloseProxy(CloseProxy),
    Ping(Ping),
    Pong(Pong),
    ReqWorkConn(ReqWorkConn),
    NewWorkConn(NewWorkConn),
}

impl Message {
    /// The wire tag for this message.
    pub fn kind(&self) -> MsgKind {
        match self {
            Message::Login(_) => MsgKind::Login,
            Message::LoginResp(_) => MsgKind::LoginResp,
            Message::NewProxy(_) => MsgKind::NewProxy,
            Message::NewProxyResp(_) => MsgKind::NewProxyResp,
            Message::CloseProxy(_) => MsgKind::CloseProxy,
            Message::Ping(_) => MsgKind::Ping,
            Message::Pong(_) => MsgKind::Pong,
            Message::ReqWorkConn(_) => MsgKind::ReqWorkConn,
            Message::NewWorkConn(_) => MsgKind::NewWorkConn,
        }
    }

    /// Short name for logs and guard errors.
    pub fn name(&self) -> &'static str {
        match self {
            Message::Login(_) => "login",
            Message::LoginResp(_) => "login_resp",
            Message::NewProxy(_) => "new_proxy",
            Message::NewProxyResp(_) => "new_proxy_resp",
            Message::CloseProxy(_) => "close_proxy",
            Message::Ping(_) => "ping",
            Message::Pong(_) => "pong",
            Message::ReqWorkConn(_) => "req_work_conn",
            Message::NewWorkConn(_) => "new_work_conn",
        }
    }

    /// Serialize the JSON body.
    pub fn encode_payload(&self) -> Result<Vec<u8>, FramingError> {
        let result = match self {
            Message::Login(m) => serde_json::to_vec(m),
            Message::LoginResp(m) => serde_json::to_vec(m),
            Message::NewProxy(m) => serde_json::to_vec(m),
            Message::NewProxyResp(m) => serde_json::to_vec(m),
            Message::CloseProxy(m) => serde_json::to_vec(m),
            Message::Ping(m) => serde_json::to_vec(m),
            Message::Pong(m) => serde_json::to_vec(m),
            Message::ReqWorkConn(m) => serde_json::to_vec(m),
            Message::NewWorkConn(m) => serde_json::to_vec(m),
        };
        result.map_err(|e| FramingError::Malformed {
            what: "message payload",
            detail: e.to_string(),
        })
    }

    /// Deserialize a message from its tag and JSON body.
    pub fn decode(kind: u8, payload: &[u8]) -> Result<Message, FramingError> {
        fn parse<'a, T: Deserialize<'a>>(payload: &'a [u8]) -> Result<T, FramingError> {
            serde_json::from_slice(payload).map_err(|e| FramingError::Malformed {
                what: "message payload",
                detail: e.to_string(),
            })
        }

        Ok(match MsgKind::from_u8(kind)? {
            MsgKind::Login => Message::Login(parse(payload)?),
            MsgKind::LoginResp => Message::LoginResp(parse(payload)?),
            MsgKind::NewProxy => Message::NewProxy(parse(payload)?),
            MsgKind::NewProxyResp => Message::NewProxyResp(parse(payload)?),
            MsgKind::CloseProxy => Message::CloseProxy(parse(payload)?),
            MsgKind::Ping => Message::Ping(parse(payload)?),
            MsgKind::Pong => Message::Pong(parse(payload)?),
            MsgKind::ReqWorkConn => Message::ReqWorkConn(parse(payload)?),
            MsgKind::NewWorkConn => Message::NewWorkConn(parse(payload)?),
        })
    }
}
