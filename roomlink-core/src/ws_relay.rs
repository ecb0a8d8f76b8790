//! WebSocket relay client
//!
//! Relay messages travel as JSON text frames. Frames that do not decode as a
//! [`RelayMessage`] are logged and skipped so a relay speaking a newer
//! dialect does not stall the coordinator.

use crate::signaling::{RelayMessage, SignalingTransport};
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket relay errors
#[derive(Error, Debug)]
pub enum WsRelayError {
    /// Connection or frame-level failure
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Message could not be encoded
    #[error("Encoding error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Signaling transport over a WebSocket relay
pub struct WsRelayTransport {
    sink: Mutex<SplitSink<WsStream, Message>>,
    stream: Mutex<SplitStream<WsStream>>,
}

impl WsRelayTransport {
    /// Connect to a relay at `url` (`ws://` or `wss://`)
    ///
    /// # Errors
    ///
    /// Returns error if the WebSocket handshake fails
    #[tracing::instrument]
    pub async fn connect(url: &str) -> Result<Self, WsRelayError> {
        let (socket, _) = connect_async(url).await?;
        let (sink, stream) = socket.split();
        tracing::info!("Connected to relay");
        Ok(Self {
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
        })
    }
}

#[async_trait]
impl SignalingTransport for WsRelayTransport {
    type Error = WsRelayError;

    async fn send_message(&self, message: RelayMessage) -> Result<(), WsRelayError> {
        let json = serde_json::to_string(&message)?;
        self.sink.lock().await.send(Message::Text(json)).await?;
        Ok(())
    }

    async fn receive_message(&self) -> Result<Option<RelayMessage>, WsRelayError> {
        let mut stream = self.stream.lock().await;
        loop {
            let frame = match stream.next().await {
                Some(frame) => frame?,
                None => return Ok(None),
            };
            let decoded = match frame {
                Message::Text(text) => serde_json::from_str::<RelayMessage>(&text),
                Message::Binary(bytes) => serde_json::from_slice::<RelayMessage>(&bytes),
                Message::Close(_) => {
                    tracing::debug!("Relay sent close frame");
                    return Ok(None);
                }
                _ => continue,
            };
            match decoded {
                Ok(message) => return Ok(Some(message)),
                Err(e) => tracing::warn!(error = %e, "Skipping undecodable relay frame"),
            }
        }
    }

    async fn close(&self) -> Result<(), WsRelayError> {
        self.sink.lock().await.close().await?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::identity::PeerId;
    use crate::types::{PeerStatus, RosterEntry};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_round_trip_through_local_relay() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let relay = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();

            let joined = match ws.next().await.unwrap().unwrap() {
                Message::Text(text) => text,
                other => panic!("unexpected frame {other:?}"),
            };

            ws.send(Message::Text("{\"event\":\"not-a-thing\"}".to_string()))
                .await
                .unwrap();
            let roster = RelayMessage::ExistingPeers {
                peers: vec![RosterEntry {
                    peer_id: PeerId::from("peerA"),
                    display_name: "Ann".to_string(),
                    is_host: true,
                    status: PeerStatus::conservative(),
                }],
            };
            ws.send(Message::Text(serde_json::to_string(&roster).unwrap()))
                .await
                .unwrap();
            ws.close(None).await.unwrap();
            joined
        });

        let client = WsRelayTransport::connect(&format!("ws://{addr}")).await.unwrap();
        client
            .send_message(RelayMessage::JoinRoom {
                room_code: "abc".to_string(),
                peer_id: PeerId::from("peerB"),
                display_name: "Bob".to_string(),
                is_host: false,
            })
            .await
            .unwrap();

        match client.receive_message().await.unwrap() {
            Some(RelayMessage::ExistingPeers { peers }) => {
                assert_eq!(peers.len(), 1);
                assert_eq!(peers[0].peer_id, PeerId::from("peerA"));
            }
            other => panic!("unexpected message {other:?}"),
        }
        assert!(client.receive_message().await.unwrap().is_none());

        let joined = relay.await.unwrap();
        let joined: serde_json::Value = serde_json::from_str(&joined).unwrap();
        assert_eq!(joined["event"], "join-room");
        assert_eq!(joined["peerId"], "peerB");
        assert_eq!(joined["roomCode"], "abc");
    }
}
