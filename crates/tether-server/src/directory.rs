use std::sync::Arc;

use dashmap::DashMap;
use tether_core::close::CloseCode;
use tether_core::connection::{ConnectionMetadata, ConnectionScope};
use tether_core::ids::AccountId;
use tether_telemetry::MetricsRecorder;

use crate::manager::{AcceptError, ConnectionManager, ManagerLimits};
use crate::registry::SocketHandle;

/// One [`ConnectionManager`] per account, created on first connection.
pub struct AccountDirectory {
    managers: DashMap<AccountId, Arc<ConnectionManager>>,
    limits: ManagerLimits,
    metrics: Arc<MetricsRecorder>,
}

impl AccountDirectory {
    pub fn new(limits: ManagerLimits, metrics: Arc<MetricsRecorder>) -> Self {
        Self {
            managers: DashMap::new(),
            limits,
            metrics,
        }
    }

    /// Accept a socket into its account's manager.
    ///
    /// Runs under the directory entry lock so a concurrent prune cannot drop
    /// the manager between lookup and registration.
    pub fn accept(
        &self,
        account_id: &AccountId,
        scope: ConnectionScope,
        socket: SocketHandle,
        now_ms: i64,
    ) -> Result<(Arc<ConnectionManager>, ConnectionMetadata), AcceptError> {
        let entry = self
            .managers
            .entry(account_id.clone())
            .or_insert_with(|| {
                Arc::new(ConnectionManager::new(
                    account_id.clone(),
                    self.limits,
                    Arc::clone(&self.metrics),
                ))
            });
        let manager = Arc::clone(entry.value());
        let meta = manager.accept(scope, socket, now_ms)?;
        drop(entry);
        Ok((manager, meta))
    }

    pub fn get(&self, account_id: &AccountId) -> Option<Arc<ConnectionManager>> {
        self.managers.get(account_id).map(|m| Arc::clone(m.value()))
    }

    pub fn account_count(&self) -> usize {
        self.managers.len()
    }

    pub fn total_connections(&self) -> usize {
        self.snapshot().iter().map(|m| m.connection_count()).sum()
    }

    /// Close idle sockets everywhere and drop managers left with none.
    pub fn close_idle(&self, now_ms: i64) -> usize {
        let closed = self.snapshot().iter().map(|m| m.close_idle(now_ms)).sum();
        self.managers.retain(|_, m| !m.is_empty());
        closed
    }

    pub fn close_all(&self, code: CloseCode) -> usize {
        let closed = self.snapshot().iter().map(|m| m.close_all(code)).sum();
        self.managers.clear();
        closed
    }

    /// Hibernate every manager whose connections were all silent for
    /// `quiet_ms`. Their registries are rebuilt on the next frame.
    pub fn hibernate_quiet(&self, now_ms: i64, quiet_ms: i64) -> usize {
        self.snapshot()
            .iter()
            .filter(|m| m.hibernate_if_quiet(now_ms, quiet_ms))
            .count()
    }

    /// Clone the managers out so no shard lock is held while they run.
    fn snapshot(&self) -> Vec<Arc<ConnectionManager>> {
        self.managers.iter().map(|m| Arc::clone(m.value())).collect()
    }
}
