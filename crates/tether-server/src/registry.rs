//! Live connection table for one account, plus the handle used to write to
//! each socket.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tether_core::close::CloseCode;
use tether_core::connection::ConnectionMetadata;
use tether_core::ids::{ConnectionId, MachineId};
use tether_core::stats::ConnectionStats;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Outbound unit handed to a socket's writer task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
    Close(CloseCode),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("socket is closed")]
    Closed,
    #[error("socket send queue is full")]
    Full,
}

/// Write side of one accepted socket.
///
/// Clones share the same channel and the same attachment slot, so the copy
/// held by the host socket list and the copy in the registry stay in sync.
#[derive(Clone, Debug)]
pub struct SocketHandle {
    tx: mpsc::Sender<Frame>,
    cancel: CancellationToken,
    attachment: Arc<Mutex<Option<String>>>,
}

impl SocketHandle {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(capacity);
        let handle = Self {
            tx,
            cancel: CancellationToken::new(),
            attachment: Arc::new(Mutex::new(None)),
        };
        (handle, rx)
    }

    /// Queue a frame without waiting. Never blocks the caller.
    pub fn send(&self, frame: Frame) -> Result<(), SendError> {
        self.tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::Full,
            mpsc::error::TrySendError::Closed(_) => SendError::Closed,
        })
    }

    /// Ask the writer to close with `code`. If the queue is wedged the socket
    /// is torn down through its cancellation token instead.
    pub fn close(&self, code: CloseCode) {
        if self.send(Frame::Close(code)).is_err() {
            self.cancel.cancel();
        }
    }

    pub fn is_open(&self) -> bool {
        !self.tx.is_closed() && !self.cancel.is_cancelled()
    }

    pub fn same_socket(&self, other: &Self) -> bool {
        self.tx.same_channel(&other.tx)
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn attachment(&self) -> Option<String> {
        self.attachment.lock().clone()
    }

    pub fn set_attachment(&self, value: String) {
        *self.attachment.lock() = Some(value);
    }
}

#[derive(Clone, Debug)]
pub struct ConnectionEntry {
    pub meta: ConnectionMetadata,
    pub socket: SocketHandle,
}

/// Connections of one account, in accept order.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    entries: Vec<ConnectionEntry>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from host-held sockets using their attachments.
    ///
    /// Returns the registry and the sockets that could not be restored
    /// (closed channel or unreadable attachment).
    pub fn restore(sockets: &[SocketHandle]) -> (Self, Vec<SocketHandle>) {
        let mut registry = Self::new();
        let mut discarded = Vec::new();
        for socket in sockets {
            let meta = socket
                .attachment()
                .filter(|_| socket.is_open())
                .and_then(|raw| serde_json::from_str::<ConnectionMetadata>(&raw).ok());
            match meta {
                Some(meta) => registry.insert(ConnectionEntry {
                    meta,
                    socket: socket.clone(),
                }),
                None => discarded.push(socket.clone()),
            }
        }
        (registry, discarded)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert, replacing any entry with the same connection id in place.
    pub fn insert(&mut self, entry: ConnectionEntry) {
        match self
            .entries
            .iter_mut()
            .find(|e| e.meta.connection_id == entry.meta.connection_id)
        {
            Some(slot) => *slot = entry,
            None => self.entries.push(entry),
        }
    }

    pub fn remove(&mut self, id: &ConnectionId) -> Option<ConnectionEntry> {
        let idx = self.entries.iter().position(|e| &e.meta.connection_id == id)?;
        Some(self.entries.remove(idx))
    }

    pub fn get(&self, id: &ConnectionId) -> Option<&ConnectionEntry> {
        self.entries.iter().find(|e| &e.meta.connection_id == id)
    }

    /// Refresh `lastActivityAt`. Returns false for unknown ids.
    pub fn touch(&mut self, id: &ConnectionId, now_ms: i64) -> bool {
        match self.entries.iter_mut().find(|e| &e.meta.connection_id == id) {
            Some(entry) => {
                entry.meta.touch(now_ms);
                true
            }
            None => false,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConnectionEntry> {
        self.entries.iter()
    }

    pub fn find_machine(&self, machine_id: &MachineId) -> Option<&ConnectionEntry> {
        self.entries
            .iter()
            .find(|e| e.meta.machine_id() == Some(machine_id))
    }

    /// Connections whose last inbound frame is at least `timeout_ms` old.
    pub fn idle_ids(&self, now_ms: i64, timeout_ms: i64) -> Vec<ConnectionId> {
        self.entries
            .iter()
            .filter(|e| e.meta.idle_for_ms(now_ms) >= timeout_ms)
            .map(|e| e.meta.connection_id.clone())
            .collect()
    }

    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats::from_connections(self.entries.iter().map(|e| &e.meta))
    }

    /// Serialize each entry's current metadata onto its socket handle.
    pub fn persist_attachments(&self) {
        for entry in &self.entries {
            if let Ok(raw) = serde_json::to_string(&entry.meta) {
                entry.socket.set_attachment(raw);
            }
        }
    }
}
