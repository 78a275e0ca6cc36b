//! Per-client session lifecycle.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Where a client session is in its lifecycle.
///
/// ```text
/// Connected → Handshaking → Resolving → Authenticating → QuotaCheck
///     → Spawning → Active → Closing → Closed
/// ```
///
/// Every state before `Closing` may also jump straight to `Closing` on failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Connected,
    Handshaking,
    Resolving,
    Authenticating,
    QuotaCheck,
    Spawning,
    Active,
    Closing,
    Closed,
}

impl SessionState {
    /// Returns true if `next` is a legal successor of this state.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;

        match (self, next) {
            (Closed, _) => false,
            (Closing, Closed) => true,
            (Closing, _) => false,
            (_, Closing) => true,
            (Connected, Handshaking)
            | (Handshaking, Resolving)
            | (Resolving, Authenticating)
            | (Authenticating, QuotaCheck)
            | (QuotaCheck, Spawning)
            | (Spawning, Active) => true,
            _ => false,
        }
    }

    /// Sessions in these states count against the worker quota.
    pub fn is_admitted(self) -> bool {
        matches!(self, SessionState::Spawning | SessionState::Active)
    }

    /// True before the worker has taken over the connection.
    pub fn is_pending(self) -> bool {
        matches!(
            self,
            SessionState::Connected
                | SessionState::Handshaking
                | SessionState::Resolving
                | SessionState::Authenticating
                | SessionState::QuotaCheck
                | SessionState::Spawning
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Connected => "connected",
            SessionState::Handshaking => "handshaking",
            SessionState::Resolving => "resolving",
            SessionState::Authenticating => "authenticating",
            SessionState::QuotaCheck => "quota_check",
            SessionState::Spawning => "spawning",
            SessionState::Active => "active",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
