//! `WebSocketMessage` envelope exchanged over every relay socket.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::connection::{ClientType, ConnectionMetadata};
use crate::ids::{AccountId, ConnectionId, MachineId, MessageId, SessionId};

/// Closed set of envelope types.
///
/// Control types are produced and consumed by the relay itself; application
/// types carry payloads the relay never inspects.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageType {
    Connected,
    Error,
    Ping,
    Pong,
    System,
    Message,
    Update,
    Ephemeral,
    RpcRequest,
    RpcResponse,
}

impl MessageType {
    pub fn is_control(self) -> bool {
        matches!(
            self,
            Self::Connected | Self::Error | Self::Ping | Self::Pong | Self::System
        )
    }

    pub fn is_application(self) -> bool {
        !self.is_control()
    }
}

/// Wire envelope.
///
/// `error` and `connected` envelopes always carry their typed payload;
/// frames without one fail to deserialize.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "EnvelopeWire")]
pub struct WebSocketMessage {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<MessageId>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EnvelopeWire {
    #[serde(rename = "type")]
    message_type: MessageType,
    #[serde(default)]
    payload: Option<Value>,
    timestamp: i64,
    #[serde(default)]
    message_id: Option<MessageId>,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum EnvelopeError {
    #[error("{0:?} envelope requires a payload")]
    MissingPayload(MessageType),
    #[error("{message_type:?} envelope has a malformed payload: {reason}")]
    InvalidPayload {
        message_type: MessageType,
        reason: String,
    },
}

fn check_payload<T: serde::de::DeserializeOwned>(
    message_type: MessageType,
    payload: Option<&Value>,
) -> Result<(), EnvelopeError> {
    let payload = payload.ok_or(EnvelopeError::MissingPayload(message_type))?;
    T::deserialize(payload)
        .map(|_| ())
        .map_err(|e| EnvelopeError::InvalidPayload {
            message_type,
            reason: e.to_string(),
        })
}

impl TryFrom<EnvelopeWire> for WebSocketMessage {
    type Error = EnvelopeError;

    fn try_from(wire: EnvelopeWire) -> Result<Self, Self::Error> {
        match wire.message_type {
            MessageType::Error => check_payload::<ErrorPayload>(wire.message_type, wire.payload.as_ref())?,
            MessageType::Connected => {
                check_payload::<ConnectedPayload>(wire.message_type, wire.payload.as_ref())?
            }
            _ => {}
        }
        Ok(Self {
            message_type: wire.message_type,
            payload: wire.payload,
            timestamp: wire.timestamp,
            message_id: wire.message_id,
        })
    }
}

/// Payload of an `error` envelope.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

/// Payload of a `connected` envelope.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedPayload {
    pub connection_id: ConnectionId,
    pub user_id: AccountId,
    pub client_type: ClientType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_id: Option<MachineId>,
}

impl ErrorPayload {
    fn to_value(&self) -> Value {
        let mut map = Map::new();
        let _ = map.insert("code".into(), self.code.as_str().into());
        let _ = map.insert("message".into(), self.message.as_str().into());
        Value::Object(map)
    }
}

impl ConnectedPayload {
    fn to_value(&self) -> Value {
        let mut map = Map::new();
        let _ = map.insert("connectionId".into(), self.connection_id.as_str().into());
        let _ = map.insert("userId".into(), self.user_id.as_str().into());
        let _ = map.insert("clientType".into(), self.client_type.as_str().into());
        if let Some(id) = &self.session_id {
            let _ = map.insert("sessionId".into(), id.as_str().into());
        }
        if let Some(id) = &self.machine_id {
            let _ = map.insert("machineId".into(), id.as_str().into());
        }
        Value::Object(map)
    }
}

impl From<&ConnectionMetadata> for ConnectedPayload {
    fn from(meta: &ConnectionMetadata) -> Self {
        Self {
            connection_id: meta.connection_id.clone(),
            user_id: meta.account_id.clone(),
            client_type: meta.client_type(),
            session_id: meta.session_id().cloned(),
            machine_id: meta.machine_id().cloned(),
        }
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl WebSocketMessage {
    pub fn new(message_type: MessageType, payload: Option<Value>) -> Self {
        Self {
            message_type,
            payload,
            timestamp: now_ms(),
            message_id: None,
        }
    }

    pub fn with_message_id(mut self, id: MessageId) -> Self {
        self.message_id = Some(id);
        self
    }

    /// `connected` envelope announcing the identity assigned at handshake.
    pub fn connected(meta: &ConnectionMetadata) -> Self {
        let payload = ConnectedPayload::from(meta).to_value();
        Self::new(MessageType::Connected, Some(payload))
    }

    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        let payload = ErrorPayload {
            code: code.into(),
            message: message.into(),
        };
        Self::new(MessageType::Error, Some(payload.to_value()))
    }

    /// `pong` answering a `ping`, echoing its correlation id.
    pub fn pong_for(ping: &Self) -> Self {
        Self {
            message_type: MessageType::Pong,
            payload: None,
            timestamp: now_ms(),
            message_id: ping.message_id.clone(),
        }
    }

    pub fn error_payload(&self) -> Option<ErrorPayload> {
        if self.message_type != MessageType::Error {
            return None;
        }
        self.payload
            .clone()
            .and_then(|p| serde_json::from_value(p).ok())
    }

    pub fn connected_payload(&self) -> Option<ConnectedPayload> {
        if self.message_type != MessageType::Connected {
            return None;
        }
        self.payload
            .clone()
            .and_then(|p| serde_json::from_value(p).ok())
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
