//! Host-driven session state: at most one session, `Idle → Listening | Connecting → Active → Idle`.
//! The host reports socket outcomes; the core decides which are still relevant.

use crate::protocol::{PeerDevice, Role};

/// Generation of one connection attempt. A stale id (from an attempt that was
/// already torn down) is ignored by every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Listening,
    Connecting,
    Active { role: Role, peer: PeerDevice },
}

impl SessionState {
    pub fn is_idle(&self) -> bool {
        matches!(self, SessionState::Idle)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, SessionState::Active { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionStateError {
    #[error("a connection is already {0}")]
    Busy(&'static str),
    #[error("session is no longer current")]
    Stale,
    #[error("cannot establish from {0}")]
    InvalidTransition(&'static str),
}

/// Single-session state machine.
#[derive(Debug)]
pub struct SessionCore {
    state: SessionState,
    current: u64,
    teardowns: u64,
}

impl SessionCore {
    pub fn new() -> Self {
        Self {
            state: SessionState::Idle,
            current: 0,
            teardowns: 0,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Number of sessions torn down so far.
    pub fn teardowns(&self) -> u64 {
        self.teardowns
    }

    fn busy(&self) -> Result<(), SessionStateError> {
        match self.state {
            SessionState::Idle => Ok(()),
            SessionState::Listening => Err(SessionStateError::Busy("listening")),
            SessionState::Connecting => Err(SessionStateError::Busy("connecting")),
            SessionState::Active { .. } => Err(SessionStateError::Busy("active")),
        }
    }

    fn next_id(&mut self) -> SessionId {
        self.current += 1;
        SessionId(self.current)
    }

    /// Server path: open the listening endpoint. Rejected unless Idle.
    pub fn begin_listen(&mut self) -> Result<SessionId, SessionStateError> {
        self.busy()?;
        self.state = SessionState::Listening;
        Ok(self.next_id())
    }

    /// Client path: open the outbound channel. Rejected unless Idle.
    pub fn begin_connect(&mut self) -> Result<SessionId, SessionStateError> {
        self.busy()?;
        self.state = SessionState::Connecting;
        Ok(self.next_id())
    }

    fn is_current(&self, id: SessionId) -> bool {
        id.0 == self.current && !self.state.is_idle()
    }

    /// Handshake completed. Returns the role the session runs in.
    pub fn on_established(
        &mut self,
        id: SessionId,
        peer: PeerDevice,
    ) -> Result<Role, SessionStateError> {
        if !self.is_current(id) {
            return Err(SessionStateError::Stale);
        }
        let role = match self.state {
            SessionState::Listening => Role::Server,
            SessionState::Connecting => Role::Client,
            SessionState::Active { .. } => return Err(SessionStateError::InvalidTransition("active")),
            SessionState::Idle => return Err(SessionStateError::InvalidTransition("idle")),
        };
        self.state = SessionState::Active { role, peer };
        Ok(role)
    }

    /// Tear down `id` if it is still the current session. Returns the state it
    /// left, or `None` when there was nothing to tear down.
    pub fn close(&mut self, id: SessionId) -> Option<SessionState> {
        if !self.is_current(id) {
            return None;
        }
        self.teardowns += 1;
        Some(std::mem::replace(&mut self.state, SessionState::Idle))
    }

    /// Tear down whatever session exists. No-op from Idle.
    pub fn close_current(&mut self) -> Option<SessionState> {
        self.close(SessionId(self.current))
    }

    pub fn current_id(&self) -> Option<SessionId> {
        if self.state.is_idle() {
            None
        } else {
            Some(SessionId(self.current))
        }
    }
}

impl Default for SessionCore {
    fn default() -> Self {
        Self::new()
    }
}
