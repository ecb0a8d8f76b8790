//! Media transport capability
//!
//! One [`MediaTransport`] exists per remote peer. It is an opaque
//! standards-compliant peer connection: the coordinator drives its
//! offer/answer primitives and reacts to the events it emits through a
//! [`TransportEventSink`]. Codec negotiation, packetization and congestion
//! control all live behind this boundary.

use crate::identity::PeerId;
use crate::types::{ConnectionState, IceCandidate, SessionDescription, SignalingState, TrackKind};
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// Media transport errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaTransportError {
    /// Transport already closed
    #[error("Transport closed")]
    Closed,

    /// Operation not valid in the current signaling state
    #[error("Invalid signaling state {state} for {operation}")]
    InvalidState {
        /// Attempted operation
        operation: &'static str,
        /// State at the time
        state: SignalingState,
    },

    /// Offer/answer creation or commit failed
    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    /// Candidate rejected
    #[error("ICE candidate rejected: {0}")]
    Candidate(String),

    /// Track replacement failed
    #[error("Track replacement failed: {0}")]
    Track(String),

    /// Statistics unavailable
    #[error("Stats unavailable: {0}")]
    Stats(String),

    /// Transport could not be created
    #[error("Transport setup failed: {0}")]
    Setup(String),
}

/// Events emitted by a media transport
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Remote side started sending a track
    IncomingTrack {
        /// Track kind
        kind: TrackKind,
        /// Track id
        track_id: String,
    },
    /// Remote track was muted or unmuted by the remote side
    RemoteTrackMuted {
        /// Track kind
        kind: TrackKind,
        /// Muted flag
        muted: bool,
    },
    /// Remote track ended
    RemoteTrackEnded {
        /// Track kind
        kind: TrackKind,
    },
    /// Local ICE agent gathered a candidate
    LocalIceCandidate(IceCandidate),
    /// Connectivity state changed
    ConnectionStateChanged(ConnectionState),
    /// Offer/answer state changed
    SignalingStateChanged(SignalingState),
}

/// Delivery end for transport events of one peer
///
/// Events are queued in emission order and consumed by that peer's
/// negotiation task. Emitting after the peer has been torn down is a no-op.
#[derive(Debug, Clone)]
pub struct TransportEventSink {
    tx: mpsc::UnboundedSender<TransportEvent>,
}

impl TransportEventSink {
    /// Create a sink and the receiver it feeds
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue an event for the owning peer
    pub fn emit(&self, event: TransportEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("Dropping transport event for torn down peer");
        }
    }

    /// Whether the owning peer still consumes events
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Media transport capability, one instance per remote peer
#[async_trait]
pub trait MediaTransport: Send + Sync + 'static {
    /// Handle to a local outgoing track
    type Track: Clone + Send + Sync + 'static;

    /// Create an offer describing the current outgoing slots
    ///
    /// # Errors
    ///
    /// Returns error if the offer cannot be generated
    async fn create_offer(&self) -> Result<SessionDescription, MediaTransportError>;

    /// Create an answer to the accepted remote offer
    ///
    /// # Errors
    ///
    /// Returns error if no remote offer is set or generation fails
    async fn create_answer(&self) -> Result<SessionDescription, MediaTransportError>;

    /// Commit a local description, including rollback
    ///
    /// # Errors
    ///
    /// Returns error if the description is invalid for the current state
    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), MediaTransportError>;

    /// Accept a remote description
    ///
    /// # Errors
    ///
    /// Returns error if the description is invalid for the current state
    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), MediaTransportError>;

    /// Apply a remote ICE candidate
    ///
    /// # Errors
    ///
    /// Returns error if the candidate is rejected
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), MediaTransportError>;

    /// Restart connectivity checks without changing the session description
    ///
    /// # Errors
    ///
    /// Returns error if the transport is closed
    async fn restart_ice(&self) -> Result<(), MediaTransportError>;

    /// Whether a requested ICE restart only takes effect in the next offer
    ///
    /// When true the coordinator follows [`restart_ice`](Self::restart_ice)
    /// with an offer, subject to the usual collision guards.
    fn ice_restart_needs_offer(&self) -> bool {
        false
    }

    /// Put a track in an outgoing slot, or empty the slot
    ///
    /// # Errors
    ///
    /// Returns error if the replacement fails
    async fn replace_outgoing_track(
        &self,
        kind: TrackKind,
        track: Option<Self::Track>,
    ) -> Result<(), MediaTransportError>;

    /// Current round-trip time of the active candidate pair
    ///
    /// # Errors
    ///
    /// Returns error if statistics cannot be read
    async fn round_trip_time_ms(&self) -> Result<Option<f64>, MediaTransportError>;

    /// Whether a remote description has been accepted
    async fn has_remote_description(&self) -> bool;

    /// Current offer/answer state
    fn signaling_state(&self) -> SignalingState;

    /// Close the transport
    ///
    /// # Errors
    ///
    /// Returns error if closing fails
    async fn close(&self) -> Result<(), MediaTransportError>;
}

/// Creates one media transport per remote peer
#[async_trait]
pub trait MediaTransportFactory: Send + Sync + 'static {
    /// Transport produced
    type Transport: MediaTransport;

    /// Create the transport for `peer`, reporting its events into `events`
    ///
    /// # Errors
    ///
    /// Returns error if the transport cannot be created
    async fn create(
        &self,
        peer: &PeerId,
        events: TransportEventSink,
    ) -> Result<Self::Transport, MediaTransportError>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sink_delivers_in_order() {
        let (sink, mut rx) = TransportEventSink::channel();
        sink.emit(TransportEvent::ConnectionStateChanged(ConnectionState::Connecting));
        sink.emit(TransportEvent::ConnectionStateChanged(ConnectionState::Connected));

        assert_eq!(
            rx.recv().await.unwrap(),
            TransportEvent::ConnectionStateChanged(ConnectionState::Connecting)
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            TransportEvent::ConnectionStateChanged(ConnectionState::Connected)
        );
    }

    #[test]
    fn test_emit_after_teardown_is_silent() {
        let (sink, rx) = TransportEventSink::channel();
        drop(rx);
        assert!(sink.is_closed());
        sink.emit(TransportEvent::RemoteTrackEnded {
            kind: TrackKind::Video,
        });
    }

    #[test]
    fn test_invalid_state_message() {
        let err = MediaTransportError::InvalidState {
            operation: "create_answer",
            state: SignalingState::Stable,
        };
        assert_eq!(
            err.to_string(),
            "Invalid signaling state stable for create_answer"
        );
    }
}
