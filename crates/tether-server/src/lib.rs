//! # tether-server
//!
//! Account-scoped WebSocket relay. Clients authenticate at the handshake,
//! are grouped under their account, and every frame they send is fanned out
//! to the account's other live sockets. A small HTTP control surface
//! (`/health`, `/stats`, `/broadcast`, `/metrics`) sits next to the socket
//! endpoint.

pub mod auth;
pub mod config;
pub mod directory;
pub mod handshake;
pub mod manager;
pub mod registry;
pub mod router;
pub mod server;
pub mod shutdown;
pub mod socket;

pub use auth::{verifier_from_config, AuthError, TokenVerifier, VerifiedToken};
pub use config::{load_config, AuthConfig, ConfigError, ServerConfig};
pub use directory::AccountDirectory;
pub use manager::{AcceptError, ConnectionManager, ManagerLimits};
pub use server::{build_router, start, AppState, BroadcastRequest, BroadcastResponse, ServerHandle};

/// Wall clock in Unix epoch milliseconds.
pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
