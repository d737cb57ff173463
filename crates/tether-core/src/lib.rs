//! # tether-core
//!
//! Types shared by the relay server and its clients: branded identifiers,
//! connection scopes and metadata, the `WebSocketMessage` envelope, broadcast
//! filters, close codes and connection statistics.

pub mod close;
pub mod connection;
pub mod envelope;
pub mod filter;
pub mod ids;
pub mod stats;

pub use close::CloseCode;
pub use connection::{ClientType, ConnectionMetadata, ConnectionScope, ScopeError};
pub use envelope::{ConnectedPayload, EnvelopeError, ErrorPayload, MessageType, WebSocketMessage};
pub use filter::MessageFilter;
pub use stats::ConnectionStats;
