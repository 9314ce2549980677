//! Control-channel state machine.
//!
//! Transitions are driven by the session drivers but guarded here, so an
//! illegal (state, message) pair is rejected in one place instead of by
//! scattered branching. Both ends run the same machine with their own
//! role; the legal inbound set differs per role.

use thiserror::Error;

use crate::msg::Message;

/// Session lifecycle.
///
/// `Connecting → Authenticating → Active → Closing → Closed`; rejection at
/// login jumps straight to `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Authenticating,
    Active,
    Closing,
    Closed,
}

/// Which end of the control channel this machine runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

/// An illegal transition or message for the current state.
#[derive(Debug, Error)]
#[error("{what} not permitted in state {state:?}")]
pub struct TransitionError {
    pub state: SessionState,
    pub what: &'static str,
}

/// Guarded control-channel state.
#[derive(Debug)]
pub struct StateMachine {
    role: Role,
    state: SessionState,
}

impl StateMachine {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            state: SessionState::Connecting,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// The control stream is established; the login exchange may begin.
    pub fn control_opened(&mut self) -> Result<(), TransitionError> {
        self.step(SessionState::Connecting, SessionState::Authenticating, "control stream")
    }

    /// Login accepted; the session is live.
    pub fn login_accepted(&mut self) -> Result<(), TransitionError> {
        self.step(SessionState::Authenticating, SessionState::Active, "login acceptance")
    }

    /// Login rejected; terminal for this connection.
    pub fn login_rejected(&mut self) -> Result<(), TransitionError> {
        self.step(SessionState::Authenticating, SessionState::Closed, "login rejection")
    }

    /// Begin teardown. Legal from any live state; idempotent.
    pub fn begin_close(&mut self) {
        if !matches!(self.state, SessionState::Closed) {
            self.state = SessionState::Closing;
        }
    }

    /// Teardown finished. Terminal.
    pub fn finish_close(&mut self) {
        self.state = SessionState::Closed;
    }

    /// Central legality check for an inbound message.
    pub fn guard_inbound(&self, msg: &Message) -> Result<(), TransitionError> {
        // Heartbeats are legal in both directions while active; the rest
        // is role-specific.
        let legal = match (self.role, self.state) {
            (Role::Server, SessionState::Authenticating) => matches!(msg, Message::Login(_)),
            (Role::Server, SessionState::Active) => matches!(
                msg,
                Message::Ping(_)
                    | Message::Pong(_)
                    | Message::NewProxy(_)
                    | Message::CloseProxy(_)
            ),
            (Role::Client, SessionState::Authenticating) => matches!(msg, Message::LoginResp(_)),
            (Role::Client, SessionState::Active) => matches!(
                msg,
                Message::Ping(_)
                    | Message::Pong(_)
                    | Message::NewProxyResp(_)
                    | Message::ReqWorkConn(_)
            ),
            _ => false,
        };
        if legal {
            Ok(())
        } else {
            Err(TransitionError {
                state: self.state,
                what: msg.name(),
            })
        }
    }

    fn step(
        &mut self,
        from: SessionState,
        to: SessionState,
        what: &'static str,
    ) -> Result<(), TransitionError> {
        if self.state != from {
            return Err(TransitionError {
                state: self.state,
                what,
            });
        }
        self.state = to;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProxyConfig, ProxyKind};
    use crate::msg::{NewProxy, Ping};

    fn new_proxy_msg() -> Message {
        Message::NewProxy(NewProxy {
            proxy: ProxyConfig::new("web", ProxyKind::Http),
        })
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut machine = StateMachine::new(Role::Server);
        assert_eq!(machine.state(), SessionState::Connecting);
        machine.control_opened().unwrap();
        assert_eq!(machine.state(), SessionState::Authenticating);
        machine.login_accepted().unwrap();
        assert_eq!(machine.state(), SessionState::Active);
        machine.begin_close();
        assert_eq!(machine.state(), SessionState::Closing);
        machine.finish_close();
        assert_eq!(machine.state(), SessionState::Closed);
    }

    #[test]
    fn test_new_proxy_before_login_rejected() {
        let mut machine = StateMachine::new(Role::Server);
        machine.control_opened().unwrap();
        let err = machine.guard_inbound(&new_proxy_msg()).unwrap_err();
        assert_eq!(err.state, SessionState::Authenticating);
    }

    #[test]
    fn test_ping_requires_active() {
        let mut machine = StateMachine::new(Role::Server);
        machine.control_opened().unwrap();
        assert!(machine.guard_inbound(&Message::Ping(Ping {})).is_err());
        machine.login_accepted().unwrap();
        assert!(machine.guard_inbound(&Message::Ping(Ping {})).is_ok());
    }

    #[test]
    fn test_rejection_is_terminal() {
        let mut machine = StateMachine::new(Role::Server);
        machine.control_opened().unwrap();
        machine.login_rejected().unwrap();
        assert_eq!(machine.state(), SessionState::Closed);
        assert!(machine.guard_inbound(&new_proxy_msg()).is_err());
        assert!(machine.login_accepted().is_err());
    }

    #[test]
    fn test_double_login_acceptance_rejected() {
        let mut machine = StateMachine::new(Role::Server);
        machine.control_opened().unwrap();
        machine.login_accepted().unwrap();
        assert!(machine.login_accepted().is_err());
    }
}
