//! Connection lifecycle for the stream transport.
//!
//! The supervisor is a plain state machine: it performs no I/O and owns no
//! timers. The stream driver feeds it socket events and acts on the
//! decisions it returns.

use crate::config::ReconnectPolicy;
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Closing,
    WaitingToReconnect,
    Terminated,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Closing => "closing",
            ConnectionState::WaitingToReconnect => "waiting to reconnect",
            ConnectionState::Terminated => "terminated",
        })
    }
}

/// What to do after the socket has closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseAction {
    /// Wait for the delay, then connect again.
    Reconnect(Duration),
    Terminate,
}

#[derive(Debug, Clone)]
pub struct Supervisor {
    state: ConnectionState,
    attempts: u32,
    errors: u64,
    policy: ReconnectPolicy,
    wait: Duration,
    ended: bool,
}

impl Supervisor {
    /// A new supervisor starts out `Connecting`.
    pub fn new(policy: ReconnectPolicy, wait: Duration) -> Self {
        Supervisor {
            state: ConnectionState::Connecting,
            attempts: 0,
            errors: 0,
            policy,
            wait,
            ended: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Reconnection attempts made since the last successful connect.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Socket errors observed over the supervisor's lifetime.
    pub fn errors(&self) -> u64 {
        self.errors
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    pub fn on_connected(&mut self) {
        if self.state == ConnectionState::Connecting && !self.ended {
            self.state = ConnectionState::Connected;
            self.attempts = 0;
        }
    }

    /// A socket error while connecting or connected. The close that follows
    /// decides whether to reconnect.
    pub fn on_error(&mut self) {
        self.errors = self.errors.saturating_add(1);
    }

    /// The idle timeout elapsed. Returns `true` if the connection should be
    /// closed.
    pub fn on_timeout(&mut self) -> bool {
        if self.state == ConnectionState::Connected {
            self.state = ConnectionState::Closing;
            true
        } else {
            false
        }
    }

    pub fn on_close(&mut self) -> CloseAction {
        if self.ended || self.state == ConnectionState::Terminated {
            self.state = ConnectionState::Terminated;
            return CloseAction::Terminate;
        }

        if self.policy.allows(self.attempts) {
            self.attempts = self.attempts.saturating_add(1);
            self.state = ConnectionState::WaitingToReconnect;
            CloseAction::Reconnect(self.wait)
        } else {
            self.state = ConnectionState::Terminated;
            CloseAction::Terminate
        }
    }

    /// The reconnect delay elapsed. Returns `true` if a connection attempt
    /// should be made.
    pub fn on_reconnect_due(&mut self) -> bool {
        if self.state == ConnectionState::WaitingToReconnect && !self.ended {
            self.state = ConnectionState::Connecting;
            true
        } else {
            false
        }
    }

    /// Explicit shutdown. Any later close terminates the supervisor instead of
    /// scheduling a reconnect.
    pub fn end(&mut self) {
        self.ended = true;

        match self.state {
            ConnectionState::Terminated => {}
            // Nothing is open, so there's nothing left to close
            ConnectionState::WaitingToReconnect => self.state = ConnectionState::Terminated,
            _ => self.state = ConnectionState::Closing,
        }
    }
}
