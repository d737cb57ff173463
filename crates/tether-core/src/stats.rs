use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::connection::{ClientType, ConnectionMetadata};

/// Snapshot returned by `GET /stats`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStats {
    pub total_connections: usize,
    pub by_client_type: HashMap<ClientType, usize>,
    pub active_sessions: usize,
    pub active_machines: usize,
    /// `connectedAt` of the longest-lived connection, if any.
    pub oldest_connection_at: Option<i64>,
}

impl ConnectionStats {
    pub fn from_connections<'a>(connections: impl IntoIterator<Item = &'a ConnectionMetadata>) -> Self {
        let mut by_client_type: HashMap<ClientType, usize> =
            ClientType::ALL.iter().map(|ct| (*ct, 0)).collect();
        let mut sessions = std::collections::HashSet::new();
        let mut machines = std::collections::HashSet::new();
        let mut total = 0;
        let mut oldest: Option<i64> = None;

        for meta in connections {
            total += 1;
            *by_client_type.entry(meta.client_type()).or_default() += 1;
            if let Some(s) = meta.session_id() {
                let _ = sessions.insert(s.clone());
            }
            if let Some(m) = meta.machine_id() {
                let _ = machines.insert(m.clone());
            }
            oldest = Some(oldest.map_or(meta.connected_at, |o| o.min(meta.connected_at)));
        }

        Self {
            total_connections: total,
            by_client_type,
            active_sessions: sessions.len(),
            active_machines: machines.len(),
            oldest_connection_at: oldest,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionScope;
    use crate::ids::{AccountId, ConnectionId, MachineId, SessionId};

    fn meta(scope: ConnectionScope, at: i64) -> ConnectionMetadata {
        ConnectionMetadata::new(ConnectionId::new(), AccountId::from_raw("a"), scope, at)
    }

    #[test]
    fn empty_registry() {
        let stats = ConnectionStats::from_connections(std::iter::empty());
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.by_client_type[&ClientType::UserScoped], 0);
        assert!(stats.oldest_connection_at.is_none());
    }

    #[test]
    fn counts_distinct_ids() {
        let conns = vec![
            meta(ConnectionScope::User, 50),
            meta(ConnectionScope::Session(SessionId::from_raw("s1")), 20),
            meta(ConnectionScope::Session(SessionId::from_raw("s1")), 30),
            meta(ConnectionScope::Session(SessionId::from_raw("s2")), 40),
            meta(ConnectionScope::Machine(MachineId::from_raw("m1")), 60),
        ];
        let stats = ConnectionStats::from_connections(&conns);
        assert_eq!(stats.total_connections, 5);
        assert_eq!(stats.by_client_type[&ClientType::SessionScoped], 3);
        assert_eq!(stats.by_client_type[&ClientType::MachineScoped], 1);
        assert_eq!(stats.active_sessions, 2);
        assert_eq!(stats.active_machines, 1);
        assert_eq!(stats.oldest_connection_at, Some(20));
    }

    #[test]
    fn serializes_camel_case_with_kebab_keys() {
        let stats = ConnectionStats::from_connections(std::iter::empty());
        let value = serde_json::to_value(&stats).unwrap();
        assert_eq!(value["totalConnections"], 0);
        assert_eq!(value["byClientType"]["machine-scoped"], 0);
        assert!(value["oldestConnectionAt"].is_null());
    }
}
