//! Room relay signaling protocol
//!
//! Carries room membership, point-to-point offer/answer/candidate exchange,
//! status broadcasts and host commands between participants. The relay is
//! at-least-once with no ordering across message kinds, so nothing here
//! assumes exactly-once or ordered delivery.

use crate::identity::PeerId;
use crate::types::{HostAction, IceCandidate, PeerStatus, RosterEntry, SessionDescription};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

/// Broadcast kind carrying the screen-share flag
pub const SCREEN_SHARE_STATE: &str = "screen-share-state";
/// Broadcast kind carrying a reaction
pub const REACTION: &str = "reaction";

/// Point-to-point negotiation payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum SignalPayload {
    /// Session offer
    Offer(SessionDescription),
    /// Session answer
    Answer(SessionDescription),
    /// Trickled ICE candidate
    IceCandidate(IceCandidate),
}

impl SignalPayload {
    /// Short name used in logs
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Offer(_) => "offer",
            Self::Answer(_) => "answer",
            Self::IceCandidate(_) => "ice-candidate",
        }
    }
}

/// Relay messages, in both directions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum RelayMessage {
    /// Announce the local participant (outbound)
    #[serde(rename_all = "camelCase")]
    JoinRoom {
        /// Room code
        room_code: String,
        /// Local peer
        peer_id: PeerId,
        /// Local display name
        display_name: String,
        /// Whether the local participant hosts the room
        is_host: bool,
    },

    /// Roster of members present before the local join (inbound, once)
    ExistingPeers {
        /// Members, possibly including the local peer
        peers: Vec<RosterEntry>,
    },

    /// A member joined (inbound)
    #[serde(rename_all = "camelCase")]
    PeerJoined {
        /// Member id
        peer_id: PeerId,
        /// Display name
        display_name: String,
        /// Host flag
        #[serde(default)]
        is_host: bool,
    },

    /// A member left (inbound)
    #[serde(rename_all = "camelCase")]
    PeerLeft {
        /// Member id
        peer_id: PeerId,
    },

    /// Negotiation message between two members
    #[serde(rename_all = "camelCase")]
    Signal {
        /// Room code
        #[serde(default)]
        room_code: String,
        /// Sender
        from_peer: PeerId,
        /// Recipient
        to_peer: PeerId,
        /// Payload
        signal: SignalPayload,
    },

    /// Mute and lock flags of a member
    #[serde(rename_all = "camelCase")]
    ParticipantStatus {
        /// Room code
        #[serde(default)]
        room_code: String,
        /// Member the flags belong to
        peer_id: PeerId,
        /// Flags
        #[serde(flatten)]
        status: PeerStatus,
    },

    /// Room-wide ephemeral event, delivered to everyone but the sender
    #[serde(rename_all = "camelCase")]
    Broadcast {
        /// Room code
        #[serde(default)]
        room_code: String,
        /// Sender
        from_peer: PeerId,
        /// Event kind
        kind: String,
        /// Event body
        #[serde(default)]
        payload: serde_json::Value,
    },

    /// Privileged command from the host to one member
    #[serde(rename_all = "camelCase")]
    HostControl {
        /// Room code
        #[serde(default)]
        room_code: String,
        /// Host
        from_peer: PeerId,
        /// Target member
        target_peer: PeerId,
        /// Command
        action: HostAction,
        /// Command value
        value: bool,
    },

    /// Leave the room (outbound, fire-and-forget)
    #[serde(rename_all = "camelCase")]
    LeaveRoom {
        /// Room code
        room_code: String,
        /// Local peer
        peer_id: PeerId,
    },
}

impl RelayMessage {
    /// Short name used in logs
    #[must_use]
    pub fn message_type(&self) -> &'static str {
        match self {
            Self::JoinRoom { .. } => "join-room",
            Self::ExistingPeers { .. } => "existing-peers",
            Self::PeerJoined { .. } => "peer-joined",
            Self::PeerLeft { .. } => "peer-left",
            Self::Signal { signal, .. } => signal.kind(),
            Self::ParticipantStatus { .. } => "participant-status",
            Self::Broadcast { .. } => "broadcast",
            Self::HostControl { .. } => "host-control",
            Self::LeaveRoom { .. } => "leave-room",
        }
    }
}

/// Typed view of a broadcast body
#[derive(Debug, Clone, PartialEq)]
pub enum BroadcastPayload {
    /// Sender started or stopped sharing its screen
    ScreenShareState {
        /// Sharing flag
        is_sharing: bool,
    },
    /// Sender reacted
    Reaction(serde_json::Value),
    /// Anything the coordinator does not interpret
    Other {
        /// Kind
        kind: String,
        /// Body
        payload: serde_json::Value,
    },
}

impl BroadcastPayload {
    /// Interpret a broadcast kind and body
    #[must_use]
    pub fn from_wire(kind: &str, payload: serde_json::Value) -> Self {
        match kind {
            SCREEN_SHARE_STATE => {
                let is_sharing = payload
                    .get("isSharing")
                    .and_then(serde_json::Value::as_bool);
                match is_sharing {
                    Some(is_sharing) => Self::ScreenShareState { is_sharing },
                    None => Self::Other {
                        kind: kind.to_string(),
                        payload,
                    },
                }
            }
            REACTION => Self::Reaction(payload),
            _ => Self::Other {
                kind: kind.to_string(),
                payload,
            },
        }
    }

    /// Kind and body for the wire
    #[must_use]
    pub fn into_wire(self) -> (String, serde_json::Value) {
        match self {
            Self::ScreenShareState { is_sharing } => (
                SCREEN_SHARE_STATE.to_string(),
                serde_json::json!({ "isSharing": is_sharing }),
            ),
            Self::Reaction(payload) => (REACTION.to_string(), payload),
            Self::Other { kind, payload } => (kind, payload),
        }
    }
}

/// Signaling transport trait
///
/// Implement this for the relay in use (WebSocket, in-memory, ...). The relay
/// is scoped to one room per transport instance.
#[async_trait]
pub trait SignalingTransport: Send + Sync + 'static {
    /// Transport error type
    type Error: std::error::Error + Send + Sync + 'static;

    /// Publish a message to the relay
    async fn send_message(&self, message: RelayMessage) -> Result<(), Self::Error>;

    /// Receive the next relay message
    ///
    /// Returns `Ok(None)` once the relay has closed the channel.
    async fn receive_message(&self) -> Result<Option<RelayMessage>, Self::Error>;

    /// Close the channel to the relay
    async fn close(&self) -> Result<(), Self::Error> {
        Ok(())
    }
}

/// Cap on the receive back-off multiplier
const MAX_BACKOFF_STEPS: u32 = 10;

/// Back-off unit after a failed receive
const BACKOFF_UNIT: Duration = Duration::from_millis(100);

/// Signaling handler with receive back-off
pub struct SignalingHandler<T: SignalingTransport> {
    transport: Arc<T>,
    error_count: AtomicU32,
}

impl<T: SignalingTransport> SignalingHandler<T> {
    /// Create new signaling handler
    #[must_use]
    pub fn new(transport: Arc<T>) -> Self {
        Self {
            transport,
            error_count: AtomicU32::new(0),
        }
    }

    /// Send a message to the relay
    ///
    /// # Errors
    ///
    /// Returns error if sending fails
    #[tracing::instrument(skip(self, message), fields(message_type = message.message_type()))]
    pub async fn send_message(&self, message: RelayMessage) -> Result<(), T::Error> {
        tracing::trace!("Sending relay message");
        self.transport.send_message(message).await
    }

    /// Receive a message, backing off after consecutive failures
    ///
    /// # Errors
    ///
    /// Returns error if receiving fails
    pub async fn receive_message(&self) -> Result<Option<RelayMessage>, T::Error> {
        match self.transport.receive_message().await {
            Ok(message) => {
                self.error_count.store(0, Ordering::Relaxed);
                if let Some(message) = &message {
                    tracing::trace!(
                        message_type = message.message_type(),
                        "Received relay message"
                    );
                }
                Ok(message)
            }
            Err(e) => {
                let count = self.error_count.fetch_add(1, Ordering::Relaxed) + 1;
                let backoff = BACKOFF_UNIT * count.min(MAX_BACKOFF_STEPS);
                tracing::warn!(
                    error_count = count,
                    backoff_ms = backoff.as_millis(),
                    error = %e,
                    "Error receiving relay message, backing off"
                );
                sleep(backoff).await;
                Err(e)
            }
        }
    }

    /// Consecutive receive failures since the last success
    #[must_use]
    pub fn consecutive_errors(&self) -> u32 {
        self.error_count.load(Ordering::Relaxed)
    }

    /// Close the underlying transport
    ///
    /// # Errors
    ///
    /// Returns error if the transport fails to close
    pub async fn close(&self) -> Result<(), T::Error> {
        self.transport.close().await
    }

    /// Get access to the underlying transport
    #[must_use]
    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct MockTransport {
        inbound: Mutex<VecDeque<Result<RelayMessage, MockError>>>,
        sent: Mutex<Vec<RelayMessage>>,
    }

    #[derive(Debug)]
    struct MockError;

    impl std::fmt::Display for MockError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "Mock error")
        }
    }

    impl std::error::Error for MockError {}

    impl MockTransport {
        fn new() -> Self {
            Self {
                inbound: Mutex::new(VecDeque::new()),
                sent: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl SignalingTransport for MockTransport {
        type Error = MockError;

        async fn send_message(&self, message: RelayMessage) -> Result<(), MockError> {
            self.sent.lock().unwrap().push(message);
            Ok(())
        }

        async fn receive_message(&self) -> Result<Option<RelayMessage>, MockError> {
            self.inbound.lock().unwrap().pop_front().transpose()
        }
    }

    #[test]
    fn test_signal_wire_format() {
        let msg = RelayMessage::Signal {
            room_code: "abc-defg-hij".to_string(),
            from_peer: PeerId::from("peerA"),
            to_peer: PeerId::from("peerB"),
            signal: SignalPayload::Offer(SessionDescription::offer("v=0\r\n")),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["event"], "signal");
        assert_eq!(json["fromPeer"], "peerA");
        assert_eq!(json["toPeer"], "peerB");
        assert_eq!(json["signal"]["type"], "offer");
        assert_eq!(json["signal"]["payload"]["type"], "offer");
        assert_eq!(json["signal"]["payload"]["sdp"], "v=0\r\n");

        let back: RelayMessage = serde_json::from_value(json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_inbound_candidate_without_room_code() {
        let json = r#"{"event":"signal","fromPeer":"peerC","toPeer":"peerA",
            "signal":{"type":"ice-candidate","payload":{"candidate":"candidate:1 1 udp 1 10.0.0.1 5000 typ host","sdpMid":"0","sdpMLineIndex":0}}}"#;
        let msg: RelayMessage = serde_json::from_str(json).unwrap();
        match msg {
            RelayMessage::Signal {
                room_code, signal, ..
            } => {
                assert!(room_code.is_empty());
                assert!(matches!(signal, SignalPayload::IceCandidate(ref c) if c.sdp_mid.as_deref() == Some("0")));
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn test_participant_status_flattens_flags() {
        let msg = RelayMessage::ParticipantStatus {
            room_code: "room".to_string(),
            peer_id: PeerId::from("peerA"),
            status: PeerStatus {
                is_muted: false,
                is_camera_off: true,
                is_mic_locked: false,
                is_camera_locked: false,
            },
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["event"], "participant-status");
        assert_eq!(json["isMuted"], false);
        assert_eq!(json["isCameraOff"], true);
    }

    #[test]
    fn test_broadcast_payload_interpretation() {
        let share = BroadcastPayload::from_wire(
            SCREEN_SHARE_STATE,
            serde_json::json!({ "isSharing": true }),
        );
        assert_eq!(share, BroadcastPayload::ScreenShareState { is_sharing: true });

        let malformed = BroadcastPayload::from_wire(SCREEN_SHARE_STATE, serde_json::json!({}));
        assert!(matches!(malformed, BroadcastPayload::Other { .. }));

        let reaction =
            BroadcastPayload::from_wire(REACTION, serde_json::json!({ "emoji": "🎉" }));
        assert!(matches!(reaction, BroadcastPayload::Reaction(_)));

        let (kind, payload) = BroadcastPayload::ScreenShareState { is_sharing: false }.into_wire();
        assert_eq!(kind, SCREEN_SHARE_STATE);
        assert_eq!(payload["isSharing"], false);
    }

    #[tokio::test]
    async fn test_signaling_handler_send_message() {
        let transport = Arc::new(MockTransport::new());
        let handler = SignalingHandler::new(transport.clone());

        let message = RelayMessage::LeaveRoom {
            room_code: "room".to_string(),
            peer_id: PeerId::from("peerA"),
        };
        handler.send_message(message.clone()).await.unwrap();

        assert_eq!(transport.sent.lock().unwrap().as_slice(), &[message]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_errors_are_counted_and_reset() {
        let transport = Arc::new(MockTransport::new());
        {
            let mut inbound = transport.inbound.lock().unwrap();
            inbound.push_back(Err(MockError));
            inbound.push_back(Err(MockError));
            inbound.push_back(Ok(RelayMessage::PeerLeft {
                peer_id: PeerId::from("peerB"),
            }));
        }
        let handler = SignalingHandler::new(transport);

        assert!(handler.receive_message().await.is_err());
        assert!(handler.receive_message().await.is_err());
        assert_eq!(handler.consecutive_errors(), 2);

        let msg = handler.receive_message().await.unwrap();
        assert!(matches!(msg, Some(RelayMessage::PeerLeft { .. })));
        assert_eq!(handler.consecutive_errors(), 0);

        // Drained queue reads as a closed relay
        assert!(handler.receive_message().await.unwrap().is_none());
    }
}
