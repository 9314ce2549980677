//! Configuration subsystem.
//!
//! Schemas are plain serde types with `#[serde(default)]` throughout, so a
//! partial TOML file (or a `Default::default()` in tests) always yields a
//! runnable config. Validation is a separate pass that collects every
//! problem; the loader runs it before handing configs to the services.

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_client_config, load_server_config, ConfigError};
pub use schema::{
    ClientConfig, HeartbeatConfig, ObservabilityConfig, PoolConfig, ProxyConfig, ProxyKind,
    ReconnectConfig, ServerConfig, TransportConfig,
};
pub use validation::{validate_client_config, validate_proxy, validate_server_config, ValidationError};
