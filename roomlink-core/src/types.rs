//! Negotiation types and data structures

use crate::identity::PeerId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of a session description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    /// Offer
    Offer,
    /// Answer
    Answer,
    /// Rollback of a pending local offer
    Rollback,
}

/// Session description exchanged during negotiation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Description kind
    #[serde(rename = "type")]
    pub kind: SdpType,
    /// SDP body (empty for rollback)
    #[serde(default)]
    pub sdp: String,
}

impl SessionDescription {
    /// Offer with the given SDP
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    /// Answer with the given SDP
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }

    /// Rollback marker, returns a `have-local-offer` transport to `stable`
    #[must_use]
    pub fn rollback() -> Self {
        Self {
            kind: SdpType::Rollback,
            sdp: String::new(),
        }
    }
}

/// ICE candidate as carried over the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    /// Candidate attribute line
    pub candidate: String,
    /// SDP media id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    /// SDP media line index
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
    /// ICE username fragment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    /// Candidate with only the attribute line set
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
            username_fragment: None,
        }
    }
}

/// Offer/answer state of a media transport
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalingState {
    /// No exchange in progress
    #[default]
    Stable,
    /// Local offer committed, waiting for the answer
    HaveLocalOffer,
    /// Remote offer accepted, local answer not yet committed
    HaveRemoteOffer,
    /// Transport closed
    Closed,
}

impl fmt::Display for SignalingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Stable => "stable",
            Self::HaveLocalOffer => "have-local-offer",
            Self::HaveRemoteOffer => "have-remote-offer",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Connectivity state of a media transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Created, nothing attempted yet
    New,
    /// Connectivity checks running
    Connecting,
    /// Media can flow
    Connected,
    /// Temporarily lost
    Disconnected,
    /// Connectivity checks failed
    Failed,
    /// Transport shut down
    Closed,
}

/// Kind of an outgoing or incoming media track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    /// Audio
    Audio,
    /// Video (camera or screen)
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Audio => f.write_str("audio"),
            Self::Video => f.write_str("video"),
        }
    }
}

/// RTT below which a link is excellent
pub const EXCELLENT_RTT_MS: f64 = 80.0;
/// RTT below which a link is good
pub const GOOD_RTT_MS: f64 = 200.0;
/// RTT below which a link is fair
pub const FAIR_RTT_MS: f64 = 400.0;

/// Advisory link quality tier derived from round-trip time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalQuality {
    /// Under 80ms
    Excellent,
    /// Under 200ms
    Good,
    /// Under 400ms
    Fair,
    /// 400ms and above
    Poor,
    /// No measurement available
    Unknown,
}

impl SignalQuality {
    /// Map a round-trip time sample to a tier
    #[must_use]
    pub fn from_rtt_ms(rtt_ms: Option<f64>) -> Self {
        match rtt_ms {
            Some(rtt) if !rtt.is_finite() || rtt < 0.0 => Self::Unknown,
            Some(rtt) if rtt < EXCELLENT_RTT_MS => Self::Excellent,
            Some(rtt) if rtt < GOOD_RTT_MS => Self::Good,
            Some(rtt) if rtt < FAIR_RTT_MS => Self::Fair,
            Some(_) => Self::Poor,
            None => Self::Unknown,
        }
    }
}

/// Mute and lock flags of a participant, last writer wins
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PeerStatus {
    /// Microphone muted
    pub is_muted: bool,
    /// Camera off
    pub is_camera_off: bool,
    /// Microphone locked by the host
    pub is_mic_locked: bool,
    /// Camera locked by the host
    pub is_camera_locked: bool,
}

impl PeerStatus {
    /// Flags assumed for a peer until it reports its own
    #[must_use]
    pub fn conservative() -> Self {
        Self {
            is_muted: true,
            is_camera_off: true,
            is_mic_locked: false,
            is_camera_locked: false,
        }
    }
}

impl Default for PeerStatus {
    fn default() -> Self {
        Self::conservative()
    }
}

/// One member of the relay's roster snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterEntry {
    /// Member id
    pub peer_id: PeerId,
    /// Display name
    pub display_name: String,
    /// Whether the member hosts the room
    pub is_host: bool,
    /// Current flags
    #[serde(flatten)]
    pub status: PeerStatus,
}

/// Privileged command a host can issue to a participant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HostAction {
    /// Force mute
    Mute,
    /// Lift a forced mute
    Unmute,
    /// Lock the microphone off
    LockMic,
    /// Unlock the microphone
    UnlockMic,
    /// Lock the camera off
    LockCamera,
    /// Unlock the camera
    UnlockCamera,
}

/// Point-in-time view of a peer session for the presentation layer
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerSnapshot {
    /// Peer id
    pub peer_id: PeerId,
    /// Display name
    pub display_name: String,
    /// Host flag
    pub is_host: bool,
    /// Mute and lock flags
    pub status: PeerStatus,
    /// Screen-share flag
    pub is_screen_sharing: bool,
    /// Advisory link quality
    pub signal_quality: SignalQuality,
    /// Last reported signaling state
    pub signaling_state: SignalingState,
    /// Last reported connection state
    pub connection_state: ConnectionState,
    /// Ids of the inbound tracks currently composing the remote stream
    pub remote_tracks: Vec<(TrackKind, String)>,
}

/// Events published to the presentation layer
#[derive(Debug, Clone, PartialEq)]
pub enum RoomEvent {
    /// A peer session was created
    PeerJoined {
        /// Peer id
        peer_id: PeerId,
        /// Display name
        display_name: String,
    },
    /// Flags, tracks or screen-share state of a peer changed
    PeerUpdated {
        /// Peer id
        peer_id: PeerId,
    },
    /// A peer session was torn down
    PeerLeft {
        /// Peer id
        peer_id: PeerId,
    },
    /// Quality tier of a peer changed
    QualityChanged {
        /// Peer id
        peer_id: PeerId,
        /// New tier
        quality: SignalQuality,
        /// Round-trip time behind the tier
        rtt_ms: Option<f64>,
        /// When the sample was taken
        sampled_at: DateTime<Utc>,
    },
    /// Connectivity state of a peer changed
    ConnectionStateChanged {
        /// Peer id
        peer_id: PeerId,
        /// New state
        state: ConnectionState,
    },
    /// ICE restarts for a peer are exhausted
    ConnectionLost {
        /// Peer id
        peer_id: PeerId,
        /// Restarts attempted
        restarts: u32,
    },
    /// A participant sent a reaction
    Reaction {
        /// Sender
        from_peer: PeerId,
        /// Reaction body
        payload: serde_json::Value,
    },
    /// Room-wide broadcast of a kind the coordinator does not interpret
    Broadcast {
        /// Sender
        from_peer: PeerId,
        /// Broadcast kind
        kind: String,
        /// Body
        payload: serde_json::Value,
    },
    /// The host issued a command to the local participant
    HostControl {
        /// Host that sent it
        from_peer: PeerId,
        /// Command
        action: HostAction,
        /// Command value
        value: bool,
    },
    /// Local mute or lock flags changed
    LocalStatusChanged {
        /// New local flags
        status: PeerStatus,
    },
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_quality_thresholds() {
        assert_eq!(SignalQuality::from_rtt_ms(Some(12.0)), SignalQuality::Excellent);
        assert_eq!(SignalQuality::from_rtt_ms(Some(80.0)), SignalQuality::Good);
        assert_eq!(SignalQuality::from_rtt_ms(Some(199.9)), SignalQuality::Good);
        assert_eq!(SignalQuality::from_rtt_ms(Some(200.0)), SignalQuality::Fair);
        assert_eq!(SignalQuality::from_rtt_ms(Some(400.0)), SignalQuality::Poor);
        assert_eq!(SignalQuality::from_rtt_ms(None), SignalQuality::Unknown);
        assert_eq!(SignalQuality::from_rtt_ms(Some(f64::NAN)), SignalQuality::Unknown);
    }

    #[test]
    fn test_roster_entry_flattens_status() {
        let json = r#"{"peerId":"peerA","displayName":"Ann","isHost":true,
            "isMuted":false,"isCameraOff":true,"isMicLocked":false,"isCameraLocked":true}"#;
        let entry: RosterEntry = serde_json::from_str(json).unwrap();
        assert_eq!(entry.peer_id, PeerId::from("peerA"));
        assert!(entry.is_host);
        assert!(!entry.status.is_muted);
        assert!(entry.status.is_camera_locked);
    }

    #[test]
    fn test_host_action_wire_names() {
        assert_eq!(
            serde_json::to_string(&HostAction::LockCamera).unwrap(),
            "\"lock-camera\""
        );
        let a: HostAction = serde_json::from_str("\"unlock-mic\"").unwrap();
        assert_eq!(a, HostAction::UnlockMic);
    }

    #[test]
    fn test_rollback_description_has_no_body() {
        let d = SessionDescription::rollback();
        assert_eq!(d.kind, SdpType::Rollback);
        assert!(d.sdp.is_empty());
    }
}
