//! Connection-state machine.
//!
//! Interrupt-versus-completion is inherently racy, so the state lives in an
//! atomic cell and every transition is a compare-and-swap along a defined
//! edge. Whichever side wins the CAS owns the follow-up; the loser observes
//! the refusal and backs off. No boolean cancelled flag anywhere.

use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Busy = 3,
    Interrupting = 4,
}

impl ConnectionState {
    /// Defined edges:
    /// Disconnected → Connecting → Connected → Busy → Connected,
    /// Busy → Interrupting → Connected | Disconnected,
    /// and any state → Disconnected on fatal error or teardown.
    pub fn can_transition(self, to: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, to) {
            (_, Disconnected) => self != Disconnected,
            (Disconnected, Connecting) => true,
            (Connecting, Connected) => true,
            (Connected, Busy) => true,
            (Busy, Connected) => true,
            (Busy, Interrupting) => true,
            (Interrupting, Connected) => true,
            _ => false,
        }
    }

    /// Whether a query is currently in flight (Busy or settling an interrupt).
    pub fn is_active(self) -> bool {
        matches!(self, ConnectionState::Busy | ConnectionState::Interrupting)
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Busy,
            4 => ConnectionState::Interrupting,
            _ => ConnectionState::Disconnected,
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Busy => "busy",
            ConnectionState::Interrupting => "interrupting",
        };
        f.write_str(name)
    }
}

/// Lock-free holder for a session's connection state.
#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub fn new(state: ConnectionState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn load(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Attempt the `from → to` edge. Fails if the edge is undefined or the
    /// current state is no longer `from` (someone else won the race).
    pub fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        if !from.can_transition(to) {
            return false;
        }
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Unconditional drop to Disconnected (fatal error, teardown).
    pub fn force_disconnected(&self) {
        self.0
            .store(ConnectionState::Disconnected as u8, Ordering::Release);
    }
}
