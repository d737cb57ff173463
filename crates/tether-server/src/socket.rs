//! Per-socket reader/writer tasks.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tether_core::close::CloseCode;
use tether_core::envelope::{MessageType, WebSocketMessage};
use tether_core::ids::ConnectionId;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::directory::AccountDirectory;
use crate::handshake::AcceptedHandshake;
use crate::manager::ConnectionManager;
use crate::now_ms;
use crate::registry::{Frame, SocketHandle};

#[derive(Clone, Copy, Debug)]
pub struct SocketSettings {
    pub heartbeat_interval: Duration,
    pub max_send_queue: usize,
}

/// What to do with one inbound text frame.
#[derive(Debug, PartialEq)]
pub(crate) enum Inbound {
    /// Answer the sender only.
    Reply(WebSocketMessage),
    /// Forward the original text to the rest of the account.
    Relay,
    Ignore,
}

pub(crate) fn classify_text(text: &str) -> Inbound {
    match serde_json::from_str::<WebSocketMessage>(text) {
        Err(e) => Inbound::Reply(WebSocketMessage::error(
            "INVALID_MESSAGE",
            format!("malformed envelope: {e}"),
        )),
        Ok(msg) if msg.message_type == MessageType::Ping => Inbound::Reply(WebSocketMessage::pong_for(&msg)),
        Ok(msg) if msg.message_type.is_application() => Inbound::Relay,
        Ok(_) => Inbound::Ignore,
    }
}

fn close_frame(code: CloseCode) -> WsMessage {
    WsMessage::Close(Some(CloseFrame {
        code: code.code(),
        reason: code.reason().into(),
    }))
}

/// Drive an upgraded socket until either side goes away.
pub async fn serve_socket(
    socket: WebSocket,
    accepted: AcceptedHandshake,
    directory: Arc<AccountDirectory>,
    settings: SocketSettings,
) {
    let (sink, stream) = socket.split();
    let (handle, rx) = SocketHandle::new(settings.max_send_queue);
    let mut writer = tokio::spawn(write_loop(
        sink,
        rx,
        handle.cancellation(),
        settings.heartbeat_interval,
    ));

    let (manager, meta) = match directory.accept(&accepted.account_id, accepted.scope, handle.clone(), now_ms()) {
        Ok(pair) => pair,
        Err(e) => {
            info!(account_id = %accepted.account_id, error = %e, "connection refused after upgrade");
            // The close frame is already queued; let the writer flush it.
            let _ = writer.await;
            return;
        }
    };
    let connection_id = meta.connection_id.clone();

    tokio::select! {
        _ = &mut writer => {}
        _ = read_loop(stream, &connection_id, &handle, &manager) => {}
    }

    manager.disconnect(&connection_id, &handle);
    writer.abort();
    debug!(connection_id = %connection_id, "socket tasks finished");
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, WsMessage>,
    mut rx: mpsc::Receiver<Frame>,
    cancel: CancellationToken,
    heartbeat: Duration,
) {
    let mut ping = tokio::time::interval(heartbeat);
    let _ = ping.tick().await; // consume first immediate tick

    loop {
        tokio::select! {
            frame = rx.recv() => {
                let message = match frame {
                    Some(Frame::Text(text)) => WsMessage::Text(text.into()),
                    Some(Frame::Binary(bytes)) => WsMessage::Binary(bytes),
                    Some(Frame::Close(code)) => {
                        let _ = sink.send(close_frame(code)).await;
                        break;
                    }
                    None => break,
                };
                if sink.send(message).await.is_err() {
                    break;
                }
            }
            _ = ping.tick() => {
                if sink.send(WsMessage::Ping(bytes::Bytes::new())).await.is_err() {
                    break;
                }
                trace!("sent ping");
            }
            _ = cancel.cancelled() => {
                let _ = sink.send(close_frame(CloseCode::GoingAway)).await;
                break;
            }
        }
    }
    let _ = sink.close().await;
}

async fn read_loop(
    mut stream: SplitStream<WebSocket>,
    connection_id: &ConnectionId,
    handle: &SocketHandle,
    manager: &ConnectionManager,
) {
    while let Some(Ok(msg)) = stream.next().await {
        let _ = manager.touch(connection_id, now_ms());
        match msg {
            WsMessage::Text(text) => match classify_text(text.as_str()) {
                Inbound::Reply(reply) => {
                    if let Ok(json) = reply.to_json() {
                        let _ = handle.send(Frame::Text(json));
                    }
                }
                Inbound::Relay => {
                    let delivered = manager.relay(connection_id, Frame::Text(text.as_str().to_owned()));
                    trace!(connection_id = %connection_id, delivered, "relayed text frame");
                }
                Inbound::Ignore => {
                    debug!(connection_id = %connection_id, "ignoring client control envelope");
                }
            },
            WsMessage::Binary(bytes) => {
                let delivered = manager.relay(connection_id, Frame::Binary(bytes));
                trace!(connection_id = %connection_id, delivered, "relayed binary frame");
            }
            WsMessage::Close(_) => break,
            // axum answers pings; both just count as activity
            WsMessage::Ping(_) | WsMessage::Pong(_) => {}
        }
    }
}
