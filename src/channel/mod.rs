// Realtime event channel
// Typed inbound events, the outbound emission helpers, and a transport
// seam so the socket implementation can be swapped out in tests.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use log::{debug, info, warn};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::api::chat::MessageDto;
use crate::error::Result;
use crate::models::Message;

pub mod ws;

pub use ws::WsTransport;

/// Events the server pushes over the channel, one per wire event name.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    MessageReceived(Message),
    MessageDelivered { message_id: String },
    MessageRead { message_id: String },
    TypingStarted { conversation_id: String, user_id: String },
    TypingStopped { conversation_id: String, user_id: String },
    UserOnline { user_id: String },
    UserOffline { user_id: String },
    ConversationUpdated { conversation_id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// One text frame on the wire: `{"event": <name>, "data": <payload>}`.
#[derive(Debug, Deserialize)]
struct Envelope {
    event: String,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TypingPayload {
    conversation_id: String,
    user_id: String,
}

/// Decode one inbound frame. Unrecognized event names decode to `None` so
/// new server events never break an older client; a malformed payload for a
/// known event is a schema error the caller is expected to log and drop.
pub fn parse_frame(text: &str) -> Result<Option<ChannelEvent>> {
    let Envelope { event, data } = serde_json::from_str(text)?;
    let parsed = match event.as_str() {
        "message:received" => {
            let dto: MessageDto = serde_json::from_value(data)?;
            ChannelEvent::MessageReceived(dto.into_model()?)
        }
        "message:delivered" => ChannelEvent::MessageDelivered {
            message_id: serde_json::from_value(data)?,
        },
        "message:read" => ChannelEvent::MessageRead {
            message_id: serde_json::from_value(data)?,
        },
        "typing:start" => {
            let payload: TypingPayload = serde_json::from_value(data)?;
            ChannelEvent::TypingStarted {
                conversation_id: payload.conversation_id,
                user_id: payload.user_id,
            }
        }
        "typing:stop" => {
            let payload: TypingPayload = serde_json::from_value(data)?;
            ChannelEvent::TypingStopped {
                conversation_id: payload.conversation_id,
                user_id: payload.user_id,
            }
        }
        "user:online" => ChannelEvent::UserOnline {
            user_id: serde_json::from_value(data)?,
        },
        "user:offline" => ChannelEvent::UserOffline {
            user_id: serde_json::from_value(data)?,
        },
        "conversation:updated" => ChannelEvent::ConversationUpdated {
            conversation_id: serde_json::from_value(data)?,
        },
        other => {
            debug!("Ignoring unrecognized channel event '{}'", other);
            return Ok(None);
        }
    };
    Ok(Some(parsed))
}

pub(crate) fn encode_frame(event: &str, data: Value) -> String {
    json!({ "event": event, "data": data }).to_string()
}

/// A live socket as seen by the channel wrapper: serialized frames go into
/// `outbound`, raw frames come out of `inbound`. Dropping `outbound` is the
/// signal for the transport to close the socket.
pub struct SocketHandle {
    pub outbound: mpsc::Sender<String>,
    pub inbound: mpsc::Receiver<String>,
}

/// Connection seam. The production implementation is [`WsTransport`]; tests
/// substitute an in-memory pair.
#[async_trait]
pub trait SocketTransport: Send + Sync {
    async fn connect(&self, token: &str) -> Result<SocketHandle>;
}

struct ChannelInner {
    state: ConnectionState,
    outbound: Option<mpsc::Sender<String>>,
}

/// Lifecycle wrapper around a [`SocketTransport`]: idempotent connect and
/// disconnect, a connection state query, and fire-and-forget emission that
/// degrades to a logged no-op while disconnected.
pub struct RealtimeChannel {
    transport: Arc<dyn SocketTransport>,
    inner: Mutex<ChannelInner>,
}

impl RealtimeChannel {
    pub fn new(transport: Arc<dyn SocketTransport>) -> Self {
        RealtimeChannel {
            transport,
            inner: Mutex::new(ChannelInner {
                state: ConnectionState::Disconnected,
                outbound: None,
            }),
        }
    }

    /// Connect and hand back the inbound frame receiver. Returns `Ok(None)`
    /// when already connected or connecting, so calling twice never spawns
    /// a second subscription. A disconnect issued while the dial is in
    /// flight wins: the late connection is dropped and `Ok(None)` returned.
    pub async fn connect(&self, token: &str) -> Result<Option<mpsc::Receiver<String>>> {
        {
            let mut inner = self.inner.lock().unwrap();
            match inner.state {
                ConnectionState::Connected | ConnectionState::Connecting => {
                    debug!("Realtime channel already connected; ignoring connect");
                    return Ok(None);
                }
                ConnectionState::Disconnected => inner.state = ConnectionState::Connecting,
            }
        }

        match self.transport.connect(token).await {
            Ok(handle) => {
                let mut inner = self.inner.lock().unwrap();
                if inner.state != ConnectionState::Connecting {
                    // A disconnect landed while the dial was in flight.
                    // Dropping the handle closes the fresh socket.
                    debug!("Dial finished after disconnect; dropping the connection");
                    return Ok(None);
                }
                inner.state = ConnectionState::Connected;
                inner.outbound = Some(handle.outbound);
                info!("Realtime channel connected");
                Ok(Some(handle.inbound))
            }
            Err(e) => {
                let mut inner = self.inner.lock().unwrap();
                // Only reset a state this dial still owns.
                if inner.state == ConnectionState::Connecting {
                    inner.state = ConnectionState::Disconnected;
                }
                Err(e)
            }
        }
    }

    /// Tear the connection down. Calling this when never connected is a
    /// no-op, not an error.
    pub fn disconnect(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.outbound.is_none() && inner.state == ConnectionState::Disconnected {
            return;
        }
        inner.state = ConnectionState::Disconnected;
        // Dropping the sender closes the transport's write pump, which shuts
        // the socket down.
        inner.outbound = None;
        info!("Realtime channel disconnected");
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.lock().unwrap().state
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    /// Best-effort emission. Message delivery degrades to REST-only while
    /// the channel is down, so a dropped frame is logged and forgotten.
    pub fn emit(&self, event: &str, data: Value) {
        let sender = self.inner.lock().unwrap().outbound.clone();
        match sender {
            Some(tx) => {
                if let Err(e) = tx.try_send(encode_frame(event, data)) {
                    match e {
                        TrySendError::Full(_) => {
                            warn!("Dropping '{}' emission: outbound queue full", event)
                        }
                        TrySendError::Closed(_) => {
                            warn!("Dropping '{}' emission: socket closed", event)
                        }
                    }
                }
            }
            None => debug!("Not connected; dropping '{}' emission", event),
        }
    }

    pub fn join_conversation(&self, conversation_id: &str) {
        self.emit("conversation:join", json!({ "conversationId": conversation_id }));
    }

    pub fn leave_conversation(&self, conversation_id: &str) {
        self.emit("conversation:leave", json!({ "conversationId": conversation_id }));
    }

    /// Low-latency copy of a send; the REST call remains the authoritative
    /// persistence path.
    pub fn send_message(&self, conversation_id: &str, content: &str, client_key: &str) {
        self.emit(
            "message:send",
            json!({
                "conversationId": conversation_id,
                "content": content,
                "clientKey": client_key,
            }),
        );
    }

    pub fn start_typing(&self, conversation_id: &str) {
        self.emit("typing:start", json!({ "conversationId": conversation_id }));
    }

    pub fn stop_typing(&self, conversation_id: &str) {
        self.emit("typing:stop", json!({ "conversationId": conversation_id }));
    }

    pub fn mark_read(&self, conversation_id: &str, message_id: &str) {
        self.emit(
            "message:read",
            json!({ "conversationId": conversation_id, "messageId": message_id }),
        );
    }
}
