//! Per-account connection manager.
//!
//! Every operation takes the manager's lock, so registry access for one
//! account is serialized no matter how many tasks touch it.
//!
//! The host keeps its own list of socket handles. Each handle carries a JSON
//! attachment of its connection metadata; after [`ConnectionManager::hibernate`]
//! the in-memory registry is gone and the next operation rebuilds it from
//! those attachments without touching the open sockets.

use std::sync::Arc;

use parking_lot::Mutex;
use tether_core::close::CloseCode;
use tether_core::connection::{ConnectionMetadata, ConnectionScope};
use tether_core::envelope::WebSocketMessage;
use tether_core::filter::MessageFilter;
use tether_core::ids::{AccountId, ConnectionId};
use tether_core::stats::ConnectionStats;
use tether_telemetry::MetricsRecorder;
use tracing::{debug, info, warn};

use crate::registry::{ConnectionEntry, ConnectionRegistry, Frame, SocketHandle};
use crate::router;

#[derive(Clone, Copy, Debug)]
pub struct ManagerLimits {
    pub max_connections: usize,
    pub idle_timeout_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AcceptError {
    #[error("account already has {limit} live connections")]
    ConnectionLimitExceeded { limit: usize },
}

impl AcceptError {
    pub fn close_code(&self) -> CloseCode {
        match self {
            Self::ConnectionLimitExceeded { .. } => CloseCode::ConnectionLimitExceeded,
        }
    }
}

#[derive(Default)]
struct ManagerState {
    /// Host-held sockets. Outlives the registry.
    sockets: Vec<SocketHandle>,
    registry: Option<ConnectionRegistry>,
}

impl ManagerState {
    /// Registry and host list, rebuilding the registry first if needed.
    /// Also returns how many host sockets were discarded by the rebuild.
    fn live(&mut self) -> (&mut ConnectionRegistry, &mut Vec<SocketHandle>, usize) {
        let mut discarded = 0;
        if self.registry.is_none() {
            let (registry, dead) = ConnectionRegistry::restore(&self.sockets);
            self.sockets
                .retain(|s| !dead.iter().any(|d| d.same_socket(s)));
            // An open socket with an unreadable attachment can't be tracked.
            for socket in &dead {
                socket.close(CloseCode::GoingAway);
            }
            discarded = dead.len();
            self.registry = Some(registry);
        }
        let Self { sockets, registry } = self;
        (registry.get_or_insert_with(ConnectionRegistry::new), sockets, discarded)
    }
}

/// Drop `socket` from the host list. True if it was there.
fn forget(sockets: &mut Vec<SocketHandle>, socket: &SocketHandle) -> bool {
    let before = sockets.len();
    sockets.retain(|s| !s.same_socket(socket));
    sockets.len() != before
}

pub struct ConnectionManager {
    account_id: AccountId,
    limits: ManagerLimits,
    metrics: Arc<MetricsRecorder>,
    state: Mutex<ManagerState>,
}

impl ConnectionManager {
    pub fn new(account_id: AccountId, limits: ManagerLimits, metrics: Arc<MetricsRecorder>) -> Self {
        Self {
            account_id,
            limits,
            metrics,
            state: Mutex::new(ManagerState::default()),
        }
    }

    pub fn account_id(&self) -> &AccountId {
        &self.account_id
    }

    fn gone(&self, count: usize) {
        if count > 0 {
            self.metrics
                .gauge_add("connections_active", &[], -(count as f64));
        }
    }

    /// Register a freshly upgraded socket and greet it with `connected`.
    ///
    /// A machine-scoped socket replaces any live socket with the same
    /// machine id. Over the cap, the new socket is closed with 4005.
    pub fn accept(
        &self,
        scope: ConnectionScope,
        socket: SocketHandle,
        now_ms: i64,
    ) -> Result<ConnectionMetadata, AcceptError> {
        let mut state = self.state.lock();
        let (registry, sockets, discarded) = state.live();
        self.gone(discarded);

        if let Some(machine_id) = scope.machine_id() {
            let previous = registry
                .find_machine(machine_id)
                .map(|e| e.meta.connection_id.clone());
            if let Some(old) = previous.and_then(|id| registry.remove(&id)) {
                info!(
                    account_id = %self.account_id,
                    connection_id = %old.meta.connection_id,
                    machine_id = %machine_id,
                    "replacing duplicate machine connection"
                );
                old.socket.close(CloseCode::DuplicateConnection);
                if forget(sockets, &old.socket) {
                    self.gone(1);
                }
            }
        }

        if registry.len() >= self.limits.max_connections {
            warn!(
                account_id = %self.account_id,
                limit = self.limits.max_connections,
                "connection limit exceeded"
            );
            self.metrics
                .counter_inc("connections_rejected_total", &[("reason", "limit")], 1);
            socket.close(CloseCode::ConnectionLimitExceeded);
            return Err(AcceptError::ConnectionLimitExceeded {
                limit: self.limits.max_connections,
            });
        }

        let meta = ConnectionMetadata::new(ConnectionId::new(), self.account_id.clone(), scope, now_ms);
        if let Ok(raw) = serde_json::to_string(&meta) {
            socket.set_attachment(raw);
        }
        match WebSocketMessage::connected(&meta).to_json() {
            Ok(text) => {
                if let Err(e) = socket.send(Frame::Text(text)) {
                    warn!(connection_id = %meta.connection_id, error = %e, "failed to queue connected envelope");
                }
            }
            Err(e) => warn!(error = %e, "failed to encode connected envelope"),
        }

        registry.insert(ConnectionEntry {
            meta: meta.clone(),
            socket: socket.clone(),
        });
        sockets.push(socket);

        self.metrics.counter_inc("connections_accepted_total", &[], 1);
        self.metrics.gauge_add("connections_active", &[], 1.0);
        info!(
            account_id = %self.account_id,
            connection_id = %meta.connection_id,
            client_type = %meta.client_type(),
            connections = registry.len(),
            "connection accepted"
        );
        Ok(meta)
    }

    /// Remove a socket whose tasks have ended.
    pub fn disconnect(&self, connection_id: &ConnectionId, socket: &SocketHandle) {
        let mut state = self.state.lock();
        let (registry, sockets, discarded) = state.live();
        self.gone(discarded);
        let _ = registry.remove(connection_id);
        if forget(sockets, socket) {
            self.gone(1);
            debug!(account_id = %self.account_id, connection_id = %connection_id, "connection closed");
        }
    }

    /// Record inbound activity.
    pub fn touch(&self, connection_id: &ConnectionId, now_ms: i64) -> bool {
        let mut state = self.state.lock();
        let (registry, _, discarded) = state.live();
        self.gone(discarded);
        registry.touch(connection_id, now_ms)
    }

    /// Fan `frame` out to every connection matching `filter`. Returns the
    /// number of sockets actually written to.
    pub fn broadcast(&self, frame: Frame, filter: &MessageFilter) -> usize {
        let mut state = self.state.lock();
        let (registry, sockets, discarded) = state.live();
        self.gone(discarded);

        let delivery = router::deliver(registry, filter, &frame);
        let evicted = delivery
            .evicted
            .iter()
            .filter(|e| forget(sockets, &e.socket))
            .count();
        self.gone(evicted);

        self.metrics
            .counter_inc("broadcast_delivered_total", &[], delivery.delivered as u64);
        self.metrics
            .histogram_observe("broadcast_fanout", &[], delivery.targeted as f64);
        delivery.delivered
    }

    /// Relay a client frame to every other connection of the account.
    pub fn relay(&self, from: &ConnectionId, frame: Frame) -> usize {
        self.metrics.counter_inc("frames_relayed_total", &[], 1);
        self.broadcast(
            frame,
            &MessageFilter::Exclude {
                connection_id: from.clone(),
            },
        )
    }

    /// Close connections idle for at least the configured timeout with 1000.
    pub fn close_idle(&self, now_ms: i64) -> usize {
        let mut state = self.state.lock();
        let (registry, sockets, discarded) = state.live();
        self.gone(discarded);

        let idle = registry.idle_ids(now_ms, self.limits.idle_timeout_ms);
        let mut closed = 0;
        for id in idle {
            if let Some(entry) = registry.remove(&id) {
                info!(
                    account_id = %self.account_id,
                    connection_id = %id,
                    idle_ms = entry.meta.idle_for_ms(now_ms),
                    "closing idle connection"
                );
                entry.socket.close(CloseCode::Normal);
                if forget(sockets, &entry.socket) {
                    self.gone(1);
                }
                closed += 1;
            }
        }
        if closed > 0 {
            self.metrics
                .counter_inc("connections_idle_closed_total", &[], closed as u64);
        }
        closed
    }

    /// Close every socket with `code` and clear all state.
    pub fn close_all(&self, code: CloseCode) -> usize {
        let mut state = self.state.lock();
        let (registry, sockets, discarded) = state.live();
        self.gone(discarded);
        let count = sockets.len();
        for socket in sockets.drain(..) {
            socket.close(code);
        }
        *registry = ConnectionRegistry::new();
        self.gone(count);
        count
    }

    pub fn stats(&self) -> ConnectionStats {
        let mut state = self.state.lock();
        let (registry, _, discarded) = state.live();
        self.gone(discarded);
        registry.stats()
    }

    pub fn connection_count(&self) -> usize {
        let mut state = self.state.lock();
        let (registry, _, discarded) = state.live();
        self.gone(discarded);
        registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().sockets.is_empty()
    }

    /// Drop the in-memory registry, keeping sockets and their attachments,
    /// if every connection has been silent for `quiet_ms`. Returns true when
    /// the registry was dropped by this call.
    pub fn hibernate_if_quiet(&self, now_ms: i64, quiet_ms: i64) -> bool {
        let mut state = self.state.lock();
        let quiet = state
            .registry
            .as_ref()
            .is_some_and(|r| !r.is_empty() && r.iter().all(|e| e.meta.idle_for_ms(now_ms) >= quiet_ms));
        if !quiet {
            return false;
        }
        if let Some(registry) = state.registry.take() {
            registry.persist_attachments();
            debug!(
                account_id = %self.account_id,
                connections = registry.len(),
                "quiet manager hibernated"
            );
        }
        true
    }

    pub fn is_hibernating(&self) -> bool {
        self.state.lock().registry.is_none()
    }
}
