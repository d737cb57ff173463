//! WebSocket handshake validation.
//!
//! Checks run in a fixed order so clients always see the most basic problem
//! first: token present, client type known, token valid, scope id present.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use tether_core::close::CloseCode;
use tether_core::connection::{ClientType, ConnectionScope, ScopeError};
use tether_core::ids::{AccountId, MachineId, SessionId};

use crate::auth::{AuthError, TokenVerifier};

/// Query string of `GET /websocket`.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeQuery {
    pub token: Option<String>,
    pub client_type: Option<String>,
    pub session_id: Option<String>,
    pub machine_id: Option<String>,
}

/// JSON body of every non-2xx response.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

pub(crate) fn error_response(status: StatusCode, code: &str, message: impl Into<String>) -> Response {
    let body = ErrorBody {
        code: code.to_owned(),
        message: message.into(),
    };
    (status, Json(body)).into_response()
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandshakeError {
    #[error("WebSocket upgrade required")]
    UpgradeRequired,
    #[error("Missing authentication token")]
    MissingToken,
    #[error("Invalid client type: {0:?}")]
    InvalidClientType(Option<String>),
    #[error("Authentication failed: {0}")]
    AuthFailed(AuthError),
    #[error("Session ID is required for session-scoped connections")]
    MissingSessionId,
    #[error("Machine ID is required for machine-scoped connections")]
    MissingMachineId,
}

impl HandshakeError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::UpgradeRequired => StatusCode::UPGRADE_REQUIRED,
            Self::AuthFailed(_) => StatusCode::UNAUTHORIZED,
            Self::MissingToken
            | Self::InvalidClientType(_)
            | Self::MissingSessionId
            | Self::MissingMachineId => StatusCode::BAD_REQUEST,
        }
    }

    /// Close code used when the rejection happens after the upgrade.
    pub fn close_code(&self) -> Option<CloseCode> {
        match self {
            Self::UpgradeRequired => None,
            Self::MissingToken | Self::InvalidClientType(_) => Some(CloseCode::InvalidHandshake),
            Self::AuthFailed(_) => Some(CloseCode::AuthFailed),
            Self::MissingSessionId => Some(CloseCode::MissingSessionId),
            Self::MissingMachineId => Some(CloseCode::MissingMachineId),
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::UpgradeRequired => "UPGRADE_REQUIRED",
            Self::MissingToken | Self::InvalidClientType(_) => "INVALID_HANDSHAKE",
            Self::AuthFailed(_) => "AUTH_FAILED",
            Self::MissingSessionId => "MISSING_SESSION_ID",
            Self::MissingMachineId => "MISSING_MACHINE_ID",
        }
    }
}

impl IntoResponse for HandshakeError {
    fn into_response(self) -> Response {
        error_response(self.status(), self.error_code(), self.to_string())
    }
}

impl From<ScopeError> for HandshakeError {
    fn from(err: ScopeError) -> Self {
        match err {
            ScopeError::MissingSessionId => Self::MissingSessionId,
            ScopeError::MissingMachineId => Self::MissingMachineId,
            ScopeError::UnexpectedField { client_type, .. } => {
                Self::InvalidClientType(Some(client_type.to_string()))
            }
        }
    }
}

/// A handshake that passed every check.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AcceptedHandshake {
    pub account_id: AccountId,
    pub scope: ConnectionScope,
}

fn non_empty(value: Option<&String>) -> Option<&str> {
    value.map(String::as_str).filter(|s| !s.is_empty())
}

/// Validate `query` and verify its token.
///
/// Only the identifier relevant to the client type is read; a stray
/// `machineId` on a session-scoped connection is ignored.
pub async fn authenticate(
    query: &HandshakeQuery,
    verifier: &dyn TokenVerifier,
) -> Result<AcceptedHandshake, HandshakeError> {
    let token = non_empty(query.token.as_ref()).ok_or(HandshakeError::MissingToken)?;
    let client_type: ClientType = non_empty(query.client_type.as_ref())
        .and_then(|raw| raw.parse().ok())
        .ok_or_else(|| HandshakeError::InvalidClientType(query.client_type.clone()))?;

    let verified = verifier
        .verify(token)
        .await
        .map_err(HandshakeError::AuthFailed)?;

    let session_id = match client_type {
        ClientType::SessionScoped => non_empty(query.session_id.as_ref()).map(SessionId::from_raw),
        _ => None,
    };
    let machine_id = match client_type {
        ClientType::MachineScoped => non_empty(query.machine_id.as_ref()).map(MachineId::from_raw),
        _ => None,
    };
    let scope = ConnectionScope::from_parts(client_type, session_id, machine_id)?;

    Ok(AcceptedHandshake {
        account_id: verified.account_id,
        scope,
    })
}
