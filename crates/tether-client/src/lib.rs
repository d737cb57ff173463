//! # tether-client
//!
//! Sender side of the relay: an ordered outgoing queue that holds messages
//! back until their delay elapses or the tool call they depend on is
//! released, and survives transport drops without losing or reordering
//! anything.

pub mod queue;
pub mod transport;

pub use queue::{EnqueueOptions, OutgoingMessageQueue, QueueEvent, QueueMessage};
pub use transport::{ChannelTransport, EncryptingTransport, Transport, TransportError};
