//! burrow: a reverse tunnel for exposing NAT-hidden services.
//!
//! An outbound-only [`client::TunnelClient`] registers local services with
//! a public [`server::TunnelServer`] over one long-lived connection; the
//! server accepts public traffic and forwards it back through the tunnel.
//!
//! # Architecture Overview
//!
//! ```text
//!                ┌──────────────────────── SERVER ───────────────────────┐
//!  public        │  ┌─────────┐   ┌─────────┐   ┌──────────┐   ┌──────┐  │
//!  HTTP ─────────┼─▶│  vhost  │──▶│ registry│──▶│ rewrite  │──▶│ pool │──┼──┐
//!                │  │ listener│   │ (router)│   │          │   │      │  │  │
//!  public        │  └─────────┘   └─────────┘   └──────────┘   └──┬───┘  │  │
//!  TCP ──────────┼──────────────────────────────────────────────▶│      │  │
//!                │  ┌─────────┐   ┌─────────┐   ┌──────────┐     │      │  │
//!  control ──────┼─▶│ codec / │──▶│ control │──▶│ registry │◀────┘      │  │
//!  connection    │  │handshake│   │ session │   │          │            │  │
//!                │  └─────────┘   └─────────┘   └──────────┘            │  │
//!                └──────────────────────│───────────────────────────────┘  │
//!                                       │ multiplexed logical streams      │
//!                ┌──────────────────────▼── CLIENT ──────────────────────┐ │
//!                │  ┌─────────┐   ┌──────────────┐   ┌───────────────┐   │ │
//!                │  │ control │──▶│ work conns   │──▶│ local backends│◀──┼─┘
//!                │  │  loop   │   │ (+ preamble) │   │  (tcp splice) │   │
//!                │  └─────────┘   └──────────────┘   └───────────────┘   │
//!                └───────────────────────────────────────────────────────┘
//! ```

// Core subsystems
pub mod codec;
pub mod config;
pub mod control;
pub mod msg;
pub mod mux;

// Traffic management
pub mod pool;
pub mod registry;
pub mod vhost;

// Services
pub mod client;
pub mod server;

// Cross-cutting concerns
pub mod lifecycle;
pub mod observability;

pub use client::TunnelClient;
pub use config::{ClientConfig, ProxyConfig, ProxyKind, ServerConfig};
pub use lifecycle::Shutdown;
pub use server::TunnelServer;
