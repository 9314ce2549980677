//! Virtual-host routing subsystem.
//!
//! # Data Flow
//! ```text
//! Public request (host, path, headers)
//!     → server.rs (shared-port listener)
//!     → router.rs (exact domain → wildcard; longest location prefix)
//!     → rewrite.rs (Basic-Auth gate, header rules, Host rewrite)
//!     → pool (work connection) → backend, response streamed back verbatim
//!
//! HTTPS passthrough:
//!     ClientHello → sni.rs (server_name peek) → router → raw splice
//! ```

pub mod rewrite;
pub mod router;
pub mod server;
pub mod sni;

pub use rewrite::AuthChallengeFailed;
pub use router::{NoRouteFound, RouteBinding, VhostIndex};
pub use server::{VhostServer, VhostState};
