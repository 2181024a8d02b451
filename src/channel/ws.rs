// WebSocket transport for the realtime channel
// Owns the socket lifecycle: dial, read/write pumps, and the capped
// reconnect loop. The store only ever sees the two frame queues.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use super::{SocketHandle, SocketTransport};
use crate::error::{ChatError, Result};

const MAX_RECONNECT_ATTEMPTS: u32 = 5;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, WsMessage>;
type WsReader = SplitStream<WsStream>;

/// Production [`SocketTransport`] backed by tokio-tungstenite.
pub struct WsTransport {
    base_url: String,
}

impl WsTransport {
    /// `base_url` may be the http(s) API base; the scheme is rewritten to
    /// ws(s) when dialing.
    pub fn new(base_url: impl Into<String>) -> Self {
        WsTransport {
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn socket_url(&self, token: &str) -> Result<String> {
        let base = if self.base_url.starts_with("https://") {
            self.base_url.replacen("https://", "wss://", 1)
        } else if self.base_url.starts_with("http://") {
            self.base_url.replacen("http://", "ws://", 1)
        } else if self.base_url.starts_with("ws://") || self.base_url.starts_with("wss://") {
            self.base_url.clone()
        } else {
            return Err(ChatError::Channel(format!(
                "socket url must start with http(s):// or ws(s)://, got '{}'",
                self.base_url
            )));
        };
        Ok(format!("{}/ws?token={}", base, token))
    }
}

#[async_trait]
impl SocketTransport for WsTransport {
    async fn connect(&self, token: &str) -> Result<SocketHandle> {
        let url = self.socket_url(token)?;
        let (stream, _) = connect_async(&url)
            .await
            .map_err(|e| ChatError::Channel(format!("could not connect socket: {}", e)))?;
        debug!("Socket connected to {}", self.base_url);

        let (outbound_tx, outbound_rx) = mpsc::channel(64);
        let (inbound_tx, inbound_rx) = mpsc::channel(64);
        tokio::spawn(run_socket(url, stream, outbound_rx, inbound_tx));

        Ok(SocketHandle {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}

enum PumpEnd {
    /// The outbound sender was dropped: a deliberate local disconnect.
    LocalClose,
    /// The inbound receiver was dropped: nobody is listening anymore.
    StoreGone,
    /// The socket errored or was closed by the peer.
    ConnectionLost,
}

async fn run_socket(
    url: String,
    stream: WsStream,
    mut outbound: mpsc::Receiver<String>,
    inbound: mpsc::Sender<String>,
) {
    let mut current = stream;
    loop {
        let (mut sink, mut reader) = current.split();
        match pump(&mut sink, &mut reader, &mut outbound, &inbound).await {
            PumpEnd::LocalClose => {
                let _ = sink.close().await;
                debug!("Socket closed on client request");
                return;
            }
            PumpEnd::StoreGone => return,
            PumpEnd::ConnectionLost => {}
        }

        match redial(&url).await {
            Some(stream) => current = stream,
            None => {
                error!(
                    "Realtime channel gave up after {} reconnect attempts",
                    MAX_RECONNECT_ATTEMPTS
                );
                // Dropping `inbound` is how the store learns the channel
                // is gone for good.
                return;
            }
        }
    }
}

async fn pump(
    sink: &mut WsSink,
    reader: &mut WsReader,
    outbound: &mut mpsc::Receiver<String>,
    inbound: &mpsc::Sender<String>,
) -> PumpEnd {
    loop {
        tokio::select! {
            frame = outbound.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = sink.send(WsMessage::Text(frame.into())).await {
                        warn!("Failed to write to socket: {}", e);
                        return PumpEnd::ConnectionLost;
                    }
                }
                None => return PumpEnd::LocalClose,
            },
            incoming = reader.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => {
                    if inbound.send(text.to_string()).await.is_err() {
                        return PumpEnd::StoreGone;
                    }
                }
                Some(Ok(WsMessage::Close(_))) | None => {
                    info!("Socket closed by the server");
                    return PumpEnd::ConnectionLost;
                }
                Some(Ok(_)) => {} // ping/pong/binary are not part of the protocol
                Some(Err(e)) => {
                    warn!("Socket receive failed: {}", e);
                    return PumpEnd::ConnectionLost;
                }
            },
        }
    }
}

async fn redial(url: &str) -> Option<WsStream> {
    for attempt in 1..=MAX_RECONNECT_ATTEMPTS {
        // Exponential backoff with jitter to prevent thundering herd
        let backoff_base = 1000 * 2u64.pow(attempt);
        let jitter = rand::random::<u64>() % 500;
        let backoff = Duration::from_millis(backoff_base + jitter);

        info!(
            "Reconnecting realtime channel in {:?} (attempt {}/{})",
            backoff, attempt, MAX_RECONNECT_ATTEMPTS
        );
        tokio::time::sleep(backoff).await;

        match connect_async(url).await {
            Ok((stream, _)) => {
                info!("Realtime channel reconnected");
                return Some(stream);
            }
            Err(e) => warn!("Reconnect attempt {} failed: {}", attempt, e),
        }
    }
    None
}
