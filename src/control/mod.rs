//! Control channel.
//!
//! The explicit state machine lives in [`machine`]; the server-side session
//! driver in [`session`]. The client's half of the protocol is driven by
//! [`crate::client`], against the same machine with [`machine::Role::Client`].

pub mod machine;
pub mod session;

pub use machine::{Role, SessionState, StateMachine, TransitionError};
pub use session::{ControlError, Session, SessionContext};
