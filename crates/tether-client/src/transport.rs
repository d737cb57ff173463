//! Transports the outgoing queue hands messages to.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Serialize;
use tether_crypto::{CryptoError, KEY_LEN};
use tokio::sync::mpsc;
use zeroize::Zeroizing;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The link is down. The message is kept and retried after `enable()`.
    #[error("transport disconnected: {0}")]
    Disconnected(String),
    /// The message itself cannot be sent and is dropped.
    #[error("message rejected: {0}")]
    Rejected(String),
}

impl TransportError {
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Disconnected(_) => "disconnected",
            Self::Rejected(_) => "rejected",
        }
    }

    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::Disconnected(_))
    }
}

/// Synchronous hand-off of one message to the wire.
///
/// Implementations must not block on the network; timeouts and retries live
/// below this layer.
pub trait Transport<M>: Send + Sync {
    fn send(&self, message: &M) -> Result<(), TransportError>;
}

impl<M, F> Transport<M> for F
where
    F: Fn(&M) -> Result<(), TransportError> + Send + Sync,
{
    fn send(&self, message: &M) -> Result<(), TransportError> {
        self(message)
    }
}

/// Pushes clones of each message into a bounded channel drained by a socket
/// writer task.
pub struct ChannelTransport<M> {
    tx: mpsc::Sender<M>,
}

impl<M> ChannelTransport<M> {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<M>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

impl<M: Clone + Send> Transport<M> for ChannelTransport<M> {
    fn send(&self, message: &M) -> Result<(), TransportError> {
        self.tx.try_send(message.clone()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                TransportError::Disconnected("writer is not keeping up".into())
            }
            mpsc::error::TrySendError::Closed(_) => {
                TransportError::Disconnected("channel closed".into())
            }
        })
    }
}

/// Seals each message before passing it on.
///
/// The message is serialised to JSON, encrypted into a v0 bundle and handed
/// to the inner transport as standard base64.
pub struct EncryptingTransport<T> {
    inner: T,
    key: Zeroizing<[u8; KEY_LEN]>,
}

impl<T> EncryptingTransport<T> {
    pub fn new(inner: T, key: &[u8]) -> Result<Self, CryptoError> {
        let key: [u8; KEY_LEN] = key.try_into().map_err(|_| CryptoError::InvalidKey)?;
        Ok(Self {
            inner,
            key: Zeroizing::new(key),
        })
    }
}

impl<M, T> Transport<M> for EncryptingTransport<T>
where
    M: Serialize,
    T: Transport<String>,
{
    fn send(&self, message: &M) -> Result<(), TransportError> {
        let plaintext = serde_json::to_vec(message).map_err(|e| TransportError::Rejected(e.to_string()))?;
        let bundle = tether_crypto::encrypt(&plaintext, self.key.as_slice())
            .map_err(|e| TransportError::Rejected(e.to_string()))?;
        self.inner.send(&STANDARD.encode(bundle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::{json, Value};
    use std::sync::Arc;

    #[test]
    fn closures_are_transports() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let transport = move |m: &u32| -> Result<(), TransportError> {
            sink.lock().push(*m);
            Ok(())
        };
        transport.send(&7).unwrap();
        assert_eq!(*seen.lock(), vec![7]);
    }

    #[test]
    fn channel_full_and_closed_are_disconnects() {
        let (transport, mut rx) = ChannelTransport::<u8>::new(1);
        transport.send(&1).unwrap();
        assert!(transport.send(&2).unwrap_err().is_disconnect());
        assert_eq!(rx.try_recv().unwrap(), 1);
        drop(rx);
        assert_eq!(
            transport.send(&3).unwrap_err(),
            TransportError::Disconnected("channel closed".into())
        );
    }

    #[test]
    fn encrypting_transport_emits_decryptable_bundles() {
        let key = [9u8; KEY_LEN];
        let (inner, mut rx) = ChannelTransport::<String>::new(4);
        let transport = EncryptingTransport::new(inner, &key).unwrap();

        let message = json!({"type": "update", "payload": {"n": 1}, "timestamp": 5});
        transport.send(&message).unwrap();

        let encoded = rx.try_recv().unwrap();
        let bundle = STANDARD.decode(encoded).unwrap();
        assert_eq!(bundle[0], 0x00);
        let plaintext = tether_crypto::decrypt(&bundle, &key).unwrap();
        let decoded: Value = serde_json::from_slice(&plaintext).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn encrypting_transport_rejects_short_keys() {
        let (inner, _rx) = ChannelTransport::<String>::new(1);
        assert!(matches!(
            EncryptingTransport::new(inner, &[0u8; 16]),
            Err(CryptoError::InvalidKey)
        ));
    }

    #[test]
    fn inner_disconnect_passes_through() {
        let inner = |_: &String| -> Result<(), TransportError> {
            Err(TransportError::Disconnected("offline".into()))
        };
        let transport = EncryptingTransport::new(inner, &[1u8; KEY_LEN]).unwrap();
        assert!(transport.send(&json!({"type": "update"})).unwrap_err().is_disconnect());
    }
}
