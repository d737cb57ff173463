//! Broadcast filters selecting which live connections receive a message.

use serde::{Deserialize, Serialize};

use crate::connection::{ClientType, ConnectionMetadata};
use crate::ids::{ConnectionId, MachineId, SessionId};

/// Exactly one rule per broadcast call.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum MessageFilter {
    All,
    UserScopedOnly,
    Session {
        #[serde(rename = "sessionId")]
        session_id: SessionId,
    },
    Machine {
        #[serde(rename = "machineId")]
        machine_id: MachineId,
    },
    Exclude {
        #[serde(rename = "connectionId")]
        connection_id: ConnectionId,
    },
}

impl MessageFilter {
    /// Whether `meta` is selected by this filter.
    pub fn matches(&self, meta: &ConnectionMetadata) -> bool {
        match self {
            Self::All => true,
            Self::UserScopedOnly => meta.client_type() == ClientType::UserScoped,
            Self::Session { session_id } => meta.session_id() == Some(session_id),
            Self::Machine { machine_id } => meta.machine_id() == Some(machine_id),
            Self::Exclude { connection_id } => &meta.connection_id != connection_id,
        }
    }

    /// Short label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::All => "all",
            Self::UserScopedOnly => "user-scoped-only",
            Self::Session { .. } => "session",
            Self::Machine { .. } => "machine",
            Self::Exclude { .. } => "exclude",
        }
    }
}
