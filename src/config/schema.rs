//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the tunnel
//! server and client. All types derive Serde traits for deserialization from
//! config files; the core consumes them as already-parsed values.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Root configuration for the tunnel server (`burrowd`).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Control listener bind address (e.g., "0.0.0.0:7000").
    pub bind_addr: String,

    /// Shared vhost HTTP listener address. `None` disables HTTP vhosting.
    pub vhost_http_addr: Option<String>,

    /// Shared vhost HTTPS listener address (SNI passthrough). `None` disables it.
    pub vhost_https_addr: Option<String>,

    /// Base domain under which `subdomain` registrations are materialized,
    /// e.g. "tunnel.example.com" turns subdomain "api" into
    /// "api.tunnel.example.com". Empty disables subdomain registrations.
    pub subdomain_host: String,

    /// Shared token clients must present at login. `None` accepts any client.
    pub auth_token: Option<String>,

    /// Heartbeat settings.
    pub heartbeat: HeartbeatConfig,

    /// Work-connection pool settings.
    pub pool: PoolConfig,

    /// Transport (framing/multiplexing) settings.
    pub transport: TransportConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:7000".to_string(),
            vhost_http_addr: None,
            vhost_https_addr: None,
            subdomain_host: String::new(),
            auth_token: None,
            heartbeat: HeartbeatConfig::default(),
            pool: PoolConfig::default(),
            transport: TransportConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

/// Root configuration for the tunnel client (`burrow`).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server control address to connect to (e.g., "tunnel.example.com:7000").
    pub server_addr: String,

    /// Shared token presented at login.
    pub auth_token: Option<String>,

    /// Heartbeat settings. The client pings; the server answers.
    pub heartbeat: HeartbeatConfig,

    /// Reconnect backoff settings.
    pub reconnect: ReconnectConfig,

    /// Transport (framing/multiplexing) settings.
    pub transport: TransportConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// Proxies to register after login.
    pub proxies: Vec<ProxyConfig>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:7000".to_string(),
            auth_token: None,
            heartbeat: HeartbeatConfig::default(),
            reconnect: ReconnectConfig::default(),
            transport: TransportConfig::default(),
            observability: ObservabilityConfig::default(),
            proxies: Vec::new(),
        }
    }
}

/// The kind of service a proxy exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyKind {
    Http,
    Https,
    Tcp,
    Udp,
    Stcp,
    Xtcp,
}

impl ProxyKind {
    /// Whether this kind is routed by the shared vhost listeners.
    pub fn is_vhost(self) -> bool {
        matches!(self, ProxyKind::Http | ProxyKind::Https)
    }
}

impl std::fmt::Display for ProxyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProxyKind::Http => "http",
            ProxyKind::Https => "https",
            ProxyKind::Tcp => "tcp",
            ProxyKind::Udp => "udp",
            ProxyKind::Stcp => "stcp",
            ProxyKind::Xtcp => "xtcp",
        };
        f.write_str(s)
    }
}

/// One registered mapping from a public-facing rule to a local backend.
///
/// `name` is unique per session; the server additionally enforces global
/// uniqueness across sessions at registration time.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxyConfig {
    /// Proxy name, unique within the registry at any instant.
    pub name: String,

    /// Service kind.
    pub kind: ProxyKind,

    /// Local backend address the client forwards to (e.g., "127.0.0.1:8080").
    #[serde(default)]
    pub local_addr: String,

    /// Public port for `tcp` proxies. 0 lets the server pick.
    #[serde(default)]
    pub remote_port: u16,

    /// Exact or wildcard ("*.example.com") hostnames routed to this proxy.
    #[serde(default)]
    pub custom_domains: Vec<String>,

    /// Subdomain under the server's `subdomain_host`.
    #[serde(default)]
    pub subdomain: Option<String>,

    /// Ordered path prefixes this proxy serves. Empty means catch-all "/".
    #[serde(default)]
    pub locations: Vec<String>,

    /// Basic-Auth user required on forwarded requests.
    #[serde(default)]
    pub http_user: Option<String>,

    /// Basic-Auth password required on forwarded requests.
    #[serde(default)]
    pub http_password: Option<String>,

    /// Headers set on every forwarded request, overriding client values.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    /// Replacement value for the Host header before forwarding.
    #[serde(default)]
    pub host_rewrite: Option<String>,
}

impl ProxyConfig {
    /// A minimal config of the given name and kind; callers fill in the rest.
    pub fn new(name: impl Into<String>, kind: ProxyKind) -> Self {
        Self {
            name: name.into(),
            kind,
            local_addr: String::new(),
            remote_port: 0,
            custom_domains: Vec::new(),
            subdomain: None,
            locations: Vec::new(),
            http_user: None,
            http_password: None,
            headers: BTreeMap::new(),
            host_rewrite: None,
        }
    }

    /// Whether Basic-Auth enforcement is configured.
    pub fn requires_auth(&self) -> bool {
        self.http_user.is_some()
    }
}

/// Heartbeat configuration, shared by server watchdog and client pinger.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Interval between client pings in seconds.
    pub interval_secs: u64,

    /// Consecutive missed heartbeats before the session is torn down.
    pub miss_threshold: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_secs: 10,
            miss_threshold: 2,
        }
    }
}

/// Reconnect backoff for the client.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Base delay for exponential backoff in milliseconds.
    pub base_delay_ms: u64,

    /// Maximum delay for exponential backoff in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 500,
            max_delay_ms: 15_000,
        }
    }
}

/// Work-connection pool configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Pre-opened work connections kept in reserve per proxy.
    pub reserve_size: usize,

    /// How long a public connection waits for a work connection, in seconds.
    pub take_timeout_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            reserve_size: 1,
            take_timeout_secs: 10,
        }
    }
}

/// Framing and multiplexing limits.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Maximum accepted frame payload in bytes.
    pub max_frame_bytes: usize,

    /// Per-stream receive window advertised to the peer, in bytes.
    pub initial_window_bytes: u32,

    /// Deadline for the login exchange after connect, in seconds.
    pub auth_deadline_secs: u64,

    /// How long a half-closed stream lingers before forced removal, in seconds.
    pub linger_secs: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: 1024 * 1024,
            initial_window_bytes: 256 * 1024,
            auth_deadline_secs: 10,
            linger_secs: 10,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable the Prometheus metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_addr: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_addr: "127.0.0.1:9090".to_string(),
        }
    }
}
