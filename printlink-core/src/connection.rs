//! Connection state machine shared by every transport.
//! Closed -> Connecting -> Authenticating -> Connected -> Busy -> Connected -> Closed.

use std::fmt;

/// Sub-state while authenticating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthPending {
    /// Handshake sent, waiting for the device's answer.
    AwaitingResponse,
    /// Device wants the user to confirm on its touchscreen.
    AwaitingConfirmation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Connecting,
    Authenticating(AuthPending),
    Connected,
    Busy,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Closed => write!(f, "closed"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Authenticating(AuthPending::AwaitingResponse) => {
                write!(f, "authenticating")
            }
            ConnectionState::Authenticating(AuthPending::AwaitingConfirmation) => {
                write!(f, "waiting for confirmation")
            }
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Busy => write!(f, "busy"),
        }
    }
}

/// What the host must do to satisfy an accepted write request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteDecision {
    /// Open the transport first; transfer once connected.
    Connect,
    /// Already connected; transfer now.
    Transfer,
    /// A connection attempt is under way; transfer once it completes.
    AwaitConnection,
}

/// Exactly one state at a time, plus whether an accepted write is waiting for the connection.
#[derive(Debug, Clone)]
pub struct ConnectionMachine {
    state: ConnectionState,
    write_pending: bool,
}

impl ConnectionMachine {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Closed,
            write_pending: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn write_pending(&self) -> bool {
        self.write_pending
    }

    /// Accept or reject a write. A second write while one is pending or in flight is `Busy`.
    pub fn request_write(&mut self) -> Result<WriteDecision, StateError> {
        if self.state == ConnectionState::Busy || self.write_pending {
            return Err(StateError::Busy);
        }
        self.write_pending = true;
        Ok(match self.state {
            ConnectionState::Closed => WriteDecision::Connect,
            ConnectionState::Connected => WriteDecision::Transfer,
            _ => WriteDecision::AwaitConnection,
        })
    }

    /// Closed -> Connecting.
    pub fn connect(&mut self) -> Result<(), StateError> {
        self.transition("connect", |s| {
            matches!(s, ConnectionState::Closed).then_some(ConnectionState::Connecting)
        })
    }

    /// Connecting -> Authenticating.
    pub fn transport_ready(&mut self) -> Result<(), StateError> {
        self.transition("transport ready", |s| {
            matches!(s, ConnectionState::Connecting)
                .then_some(ConnectionState::Authenticating(AuthPending::AwaitingResponse))
        })
    }

    /// Authenticating -> Authenticating(AwaitingConfirmation).
    pub fn confirmation_required(&mut self) -> Result<(), StateError> {
        self.transition("confirmation required", |s| {
            matches!(s, ConnectionState::Authenticating(_))
                .then_some(ConnectionState::Authenticating(AuthPending::AwaitingConfirmation))
        })
    }

    /// Authenticating -> Connected.
    pub fn authenticated(&mut self) -> Result<(), StateError> {
        self.transition("authenticated", |s| {
            matches!(s, ConnectionState::Authenticating(_)).then_some(ConnectionState::Connected)
        })
    }

    /// Connected -> Busy. Consumes the pending write.
    pub fn begin_transfer(&mut self) -> Result<(), StateError> {
        self.transition("begin transfer", |s| {
            matches!(s, ConnectionState::Connected).then_some(ConnectionState::Busy)
        })?;
        self.write_pending = false;
        Ok(())
    }

    /// Busy -> Connected, whether the transfer succeeded or failed.
    pub fn transfer_finished(&mut self) -> Result<(), StateError> {
        self.transition("transfer finished", |s| {
            matches!(s, ConnectionState::Busy).then_some(ConnectionState::Connected)
        })
    }

    /// Any -> Closed. Drops a pending write so the next connect starts clean.
    pub fn close(&mut self) {
        self.state = ConnectionState::Closed;
        self.write_pending = false;
    }

    fn transition(
        &mut self,
        event: &'static str,
        next: impl FnOnce(ConnectionState) -> Option<ConnectionState>,
    ) -> Result<(), StateError> {
        match next(self.state) {
            Some(state) => {
                self.state = state;
                Ok(())
            }
            None => Err(StateError::InvalidTransition {
                from: self.state,
                event,
            }),
        }
    }
}

impl Default for ConnectionMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum StateError {
    #[error("device busy")]
    Busy,
    #[error("cannot {event} while {from}")]
    InvalidTransition {
        from: ConnectionState,
        event: &'static str,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connected() -> ConnectionMachine {
        let mut m = ConnectionMachine::new();
        m.connect().unwrap();
        m.transport_ready().unwrap();
        m.authenticated().unwrap();
        m
    }

    #[test]
    fn full_lifecycle() {
        let mut m = ConnectionMachine::new();
        assert_eq!(m.request_write(), Ok(WriteDecision::Connect));
        m.connect().unwrap();
        assert_eq!(m.state(), ConnectionState::Connecting);
        m.transport_ready().unwrap();
        m.confirmation_required().unwrap();
        assert_eq!(
            m.state(),
            ConnectionState::Authenticating(AuthPending::AwaitingConfirmation)
        );
        m.authenticated().unwrap();
        m.begin_transfer().unwrap();
        assert_eq!(m.state(), ConnectionState::Busy);
        assert!(!m.write_pending());
        m.transfer_finished().unwrap();
        assert_eq!(m.state(), ConnectionState::Connected);
        m.close();
        assert_eq!(m.state(), ConnectionState::Closed);
    }

    #[test]
    fn write_while_busy_is_rejected() {
        let mut m = connected();
        assert_eq!(m.request_write(), Ok(WriteDecision::Transfer));
        m.begin_transfer().unwrap();
        assert_eq!(m.request_write(), Err(StateError::Busy));
        assert_eq!(m.state(), ConnectionState::Busy);
        assert!(!m.write_pending());
    }

    #[test]
    fn second_pending_write_is_rejected() {
        let mut m = ConnectionMachine::new();
        assert_eq!(m.request_write(), Ok(WriteDecision::Connect));
        m.connect().unwrap();
        assert_eq!(m.request_write(), Err(StateError::Busy));
    }

    #[test]
    fn write_during_manual_connect_waits() {
        let mut m = ConnectionMachine::new();
        m.connect().unwrap();
        assert_eq!(m.request_write(), Ok(WriteDecision::AwaitConnection));
    }

    #[test]
    fn invalid_transitions() {
        let mut m = ConnectionMachine::new();
        assert!(matches!(
            m.begin_transfer(),
            Err(StateError::InvalidTransition { .. })
        ));
        assert!(m.authenticated().is_err());
        m.connect().unwrap();
        assert!(m.connect().is_err());
    }

    #[test]
    fn close_resets_pending_write() {
        let mut m = ConnectionMachine::new();
        m.request_write().unwrap();
        m.connect().unwrap();
        m.close();
        assert!(!m.write_pending());
        assert_eq!(m.request_write(), Ok(WriteDecision::Connect));
    }
}
