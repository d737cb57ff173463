//! WebSocket close codes used by the relay.

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CloseCode {
    Normal,
    GoingAway,
    AuthFailed,
    InvalidHandshake,
    MissingSessionId,
    MissingMachineId,
    ConnectionLimitExceeded,
    DuplicateConnection,
}

impl CloseCode {
    pub fn code(self) -> u16 {
        match self {
            Self::Normal => 1000,
            Self::GoingAway => 1001,
            Self::AuthFailed => 4001,
            Self::InvalidHandshake => 4002,
            Self::MissingSessionId => 4003,
            Self::MissingMachineId => 4004,
            Self::ConnectionLimitExceeded => 4005,
            Self::DuplicateConnection => 4006,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            1000 => Some(Self::Normal),
            1001 => Some(Self::GoingAway),
            4001 => Some(Self::AuthFailed),
            4002 => Some(Self::InvalidHandshake),
            4003 => Some(Self::MissingSessionId),
            4004 => Some(Self::MissingMachineId),
            4005 => Some(Self::ConnectionLimitExceeded),
            4006 => Some(Self::DuplicateConnection),
            _ => None,
        }
    }

    /// Human-readable close reason sent with the frame.
    pub fn reason(self) -> &'static str {
        match self {
            Self::Normal => "normal closure",
            Self::GoingAway => "server going away",
            Self::AuthFailed => "authentication failed",
            Self::InvalidHandshake => "invalid handshake",
            Self::MissingSessionId => "session id required",
            Self::MissingMachineId => "machine id required",
            Self::ConnectionLimitExceeded => "connection limit exceeded",
            Self::DuplicateConnection => "replaced by a newer connection",
        }
    }
}
