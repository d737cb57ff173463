//! Connection scope classification and per-socket metadata.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::ids::{AccountId, ConnectionId, MachineId, SessionId};

/// Scope classification of a WebSocket connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClientType {
    UserScoped,
    SessionScoped,
    MachineScoped,
}

impl ClientType {
    pub const ALL: [ClientType; 3] = [Self::UserScoped, Self::SessionScoped, Self::MachineScoped];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::UserScoped => "user-scoped",
            Self::SessionScoped => "session-scoped",
            Self::MachineScoped => "machine-scoped",
        }
    }
}

impl fmt::Display for ClientType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("unknown client type: {0}")]
pub struct UnknownClientType(pub String);

impl FromStr for ClientType {
    type Err = UnknownClientType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user-scoped" => Ok(Self::UserScoped),
            "session-scoped" => Ok(Self::SessionScoped),
            "machine-scoped" => Ok(Self::MachineScoped),
            other => Err(UnknownClientType(other.to_owned())),
        }
    }
}

/// Scope of a connection together with the identifier it is bound to.
///
/// Carrying the id inside the variant makes an inconsistent
/// `clientType`/`sessionId`/`machineId` combination unrepresentable.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionScope {
    User,
    Session(SessionId),
    Machine(MachineId),
}

impl ConnectionScope {
    pub fn client_type(&self) -> ClientType {
        match self {
            Self::User => ClientType::UserScoped,
            Self::Session(_) => ClientType::SessionScoped,
            Self::Machine(_) => ClientType::MachineScoped,
        }
    }

    pub fn session_id(&self) -> Option<&SessionId> {
        match self {
            Self::Session(id) => Some(id),
            _ => None,
        }
    }

    pub fn machine_id(&self) -> Option<&MachineId> {
        match self {
            Self::Machine(id) => Some(id),
            _ => None,
        }
    }
}

/// Reasons a flat `{clientType, sessionId?, machineId?}` triple is rejected.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ScopeError {
    #[error("session-scoped connection requires a session id")]
    MissingSessionId,
    #[error("machine-scoped connection requires a machine id")]
    MissingMachineId,
    #[error("{client_type} connection must not carry a {field}")]
    UnexpectedField {
        client_type: ClientType,
        field: &'static str,
    },
}

impl ConnectionScope {
    /// Build a scope from the flat wire representation.
    ///
    /// Empty identifiers count as missing. Identifiers that do not belong to
    /// the given client type are rejected.
    pub fn from_parts(
        client_type: ClientType,
        session_id: Option<SessionId>,
        machine_id: Option<MachineId>,
    ) -> Result<Self, ScopeError> {
        let session_id = session_id.filter(|s| !s.is_empty());
        let machine_id = machine_id.filter(|m| !m.is_empty());
        match client_type {
            ClientType::UserScoped => {
                if session_id.is_some() {
                    return Err(ScopeError::UnexpectedField {
                        client_type,
                        field: "sessionId",
                    });
                }
                if machine_id.is_some() {
                    return Err(ScopeError::UnexpectedField {
                        client_type,
                        field: "machineId",
                    });
                }
                Ok(Self::User)
            }
            ClientType::SessionScoped => {
                if machine_id.is_some() {
                    return Err(ScopeError::UnexpectedField {
                        client_type,
                        field: "machineId",
                    });
                }
                session_id
                    .map(Self::Session)
                    .ok_or(ScopeError::MissingSessionId)
            }
            ClientType::MachineScoped => {
                if session_id.is_some() {
                    return Err(ScopeError::UnexpectedField {
                        client_type,
                        field: "sessionId",
                    });
                }
                machine_id
                    .map(Self::Machine)
                    .ok_or(ScopeError::MissingMachineId)
            }
        }
    }
}

/// Metadata for one live socket.
///
/// Timestamps are Unix epoch milliseconds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "MetadataWire", into = "MetadataWire")]
pub struct ConnectionMetadata {
    pub connection_id: ConnectionId,
    pub account_id: AccountId,
    pub scope: ConnectionScope,
    pub connected_at: i64,
    pub last_activity_at: i64,
}

impl ConnectionMetadata {
    pub fn new(
        connection_id: ConnectionId,
        account_id: AccountId,
        scope: ConnectionScope,
        now_ms: i64,
    ) -> Self {
        Self {
            connection_id,
            account_id,
            scope,
            connected_at: now_ms,
            last_activity_at: now_ms,
        }
    }

    pub fn client_type(&self) -> ClientType {
        self.scope.client_type()
    }

    pub fn session_id(&self) -> Option<&SessionId> {
        self.scope.session_id()
    }

    pub fn machine_id(&self) -> Option<&MachineId> {
        self.scope.machine_id()
    }

    /// Refresh the activity timestamp. Never moves it backwards.
    pub fn touch(&mut self, now_ms: i64) {
        self.last_activity_at = self.last_activity_at.max(now_ms);
    }

    /// Milliseconds since the last inbound frame.
    pub fn idle_for_ms(&self, now_ms: i64) -> i64 {
        now_ms.saturating_sub(self.last_activity_at).max(0)
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MetadataWire {
    connection_id: ConnectionId,
    account_id: AccountId,
    client_type: ClientType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    session_id: Option<SessionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    machine_id: Option<MachineId>,
    connected_at: i64,
    last_activity_at: i64,
}

impl TryFrom<MetadataWire> for ConnectionMetadata {
    type Error = ScopeError;

    fn try_from(wire: MetadataWire) -> Result<Self, Self::Error> {
        let scope = ConnectionScope::from_parts(wire.client_type, wire.session_id, wire.machine_id)?;
        Ok(Self {
            connection_id: wire.connection_id,
            account_id: wire.account_id,
            scope,
            connected_at: wire.connected_at,
            last_activity_at: wire.last_activity_at,
        })
    }
}

impl From<ConnectionMetadata> for MetadataWire {
    fn from(meta: ConnectionMetadata) -> Self {
        let client_type = meta.client_type();
        let (session_id, machine_id) = match meta.scope {
            ConnectionScope::User => (None, None),
            ConnectionScope::Session(s) => (Some(s), None),
            ConnectionScope::Machine(m) => (None, Some(m)),
        };
        Self {
            connection_id: meta.connection_id,
            account_id: meta.account_id,
            client_type,
            session_id,
            machine_id,
            connected_at: meta.connected_at,
            last_activity_at: meta.last_activity_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn session_meta() -> ConnectionMetadata {
        ConnectionMetadata::new(
            ConnectionId::from_raw("conn_1"),
            AccountId::from_raw("acct_1"),
            ConnectionScope::Session(SessionId::from_raw("sess_1")),
            1_000,
        )
    }

    #[test]
    fn client_type_parses_wire_names() {
        assert_eq!("user-scoped".parse::<ClientType>().unwrap(), ClientType::UserScoped);
        assert_eq!("session-scoped".parse::<ClientType>().unwrap(), ClientType::SessionScoped);
        assert_eq!("machine-scoped".parse::<ClientType>().unwrap(), ClientType::MachineScoped);
        assert!("admin".parse::<ClientType>().is_err());
    }

    #[test]
    fn client_type_serde_matches_display() {
        for ct in ClientType::ALL {
            let json = serde_json::to_string(&ct).unwrap();
            assert_eq!(json, format!("\"{ct}\""));
        }
    }

    #[test]
    fn session_scope_requires_session_id() {
        let err = ConnectionScope::from_parts(ClientType::SessionScoped, None, None).unwrap_err();
        assert_eq!(err, ScopeError::MissingSessionId);
    }

    #[test]
    fn empty_session_id_counts_as_missing() {
        let err = ConnectionScope::from_parts(
            ClientType::SessionScoped,
            Some(SessionId::from_raw("")),
            None,
        )
        .unwrap_err();
        assert_eq!(err, ScopeError::MissingSessionId);
    }

    #[test]
    fn machine_scope_requires_machine_id() {
        let err = ConnectionScope::from_parts(ClientType::MachineScoped, None, None).unwrap_err();
        assert_eq!(err, ScopeError::MissingMachineId);
    }

    #[test]
    fn user_scope_rejects_stray_ids() {
        let err = ConnectionScope::from_parts(
            ClientType::UserScoped,
            Some(SessionId::from_raw("s")),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, ScopeError::UnexpectedField { field: "sessionId", .. }));
    }

    #[test]
    fn metadata_serializes_flat() {
        let value = serde_json::to_value(session_meta()).unwrap();
        assert_eq!(
            value,
            json!({
                "connectionId": "conn_1",
                "accountId": "acct_1",
                "clientType": "session-scoped",
                "sessionId": "sess_1",
                "connectedAt": 1000,
                "lastActivityAt": 1000,
            })
        );
    }

    #[test]
    fn inconsistent_metadata_fails_to_deserialize() {
        let raw = json!({
            "connectionId": "conn_1",
            "accountId": "acct_1",
            "clientType": "machine-scoped",
            "connectedAt": 1,
            "lastActivityAt": 1,
        });
        assert!(serde_json::from_value::<ConnectionMetadata>(raw).is_err());
    }

    #[test]
    fn touch_never_moves_backwards() {
        let mut meta = session_meta();
        meta.touch(5_000);
        assert_eq!(meta.last_activity_at, 5_000);
        meta.touch(4_000);
        assert_eq!(meta.last_activity_at, 5_000);
        assert_eq!(meta.idle_for_ms(6_500), 1_500);
    }

    #[test]
    fn accessors_follow_scope() {
        let meta = session_meta();
        assert_eq!(meta.client_type(), ClientType::SessionScoped);
        assert_eq!(meta.session_id().map(SessionId::as_str), Some("sess_1"));
        assert!(meta.machine_id().is_none());
    }
}
