//! Per-peer negotiation session
//!
//! A [`PeerSession`] owns the media transport for one remote peer and runs
//! the offer/answer state machine against it:
//!
//! ```text
//!            create_and_send_offer            handle_answer
//!   stable ───────────────────────▶ have-local-offer ──────────▶ stable
//!     │                                   │
//!     │ handle_offer                      │ handle_offer (polite only:
//!     ▼                                   ▼  rollback first)
//!   have-remote-offer ── answer committed ──▶ stable
//! ```
//!
//! Offer collisions are resolved without an extra round trip: the side whose
//! peer id sorts higher is polite and yields, the other side ignores the
//! colliding offer. Every handler re-reads the transport's signaling state
//! before committing, so any interleaving of inbound messages for the peer
//! is safe.
//!
//! Remote ICE candidates that arrive before a remote description are queued
//! and applied, in receive order, right after the next remote description is
//! accepted.

use crate::error::NegotiationError;
use crate::identity::{NegotiationRole, PeerId};
use crate::media_transport::{MediaTransport, TransportEvent};
use crate::signaling::SignalPayload;
use crate::types::{
    ConnectionState, IceCandidate, PeerSnapshot, PeerStatus, SessionDescription, SignalQuality,
    SignalingState, TrackKind,
};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::Arc;

/// Outbound path for point-to-point negotiation messages
#[async_trait]
pub trait SignalSink: Send + Sync {
    /// Send `signal` to `to`
    ///
    /// # Errors
    ///
    /// Returns error if the relay rejects the message
    async fn send_signal(&self, to: &PeerId, signal: SignalPayload) -> Result<(), NegotiationError>;
}

/// Inbound tracks currently composing a peer's stream
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteStream {
    audio: Option<String>,
    video: Option<String>,
}

impl RemoteStream {
    fn slot_mut(&mut self, kind: TrackKind) -> &mut Option<String> {
        match kind {
            TrackKind::Audio => &mut self.audio,
            TrackKind::Video => &mut self.video,
        }
    }

    /// Track id of the given kind
    #[must_use]
    pub fn track(&self, kind: TrackKind) -> Option<&str> {
        match kind {
            TrackKind::Audio => self.audio.as_deref(),
            TrackKind::Video => self.video.as_deref(),
        }
    }

    /// Whether no inbound track is present
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.audio.is_none() && self.video.is_none()
    }

    fn tracks(&self) -> Vec<(TrackKind, String)> {
        let mut tracks = Vec::new();
        if let Some(id) = &self.audio {
            tracks.push((TrackKind::Audio, id.clone()));
        }
        if let Some(id) = &self.video {
            tracks.push((TrackKind::Video, id.clone()));
        }
        tracks
    }
}

/// Metadata of a peer shared with the presentation layer and the sampler
#[derive(Debug, Clone)]
pub struct PeerInfo {
    /// Display name
    pub display_name: String,
    /// Host flag
    pub is_host: bool,
    /// Mute and lock flags
    pub status: PeerStatus,
    /// Screen-share flag
    pub is_screen_sharing: bool,
    /// Advisory link quality, written by the sampler only
    pub signal_quality: SignalQuality,
    /// Last reported signaling state
    pub signaling_state: SignalingState,
    /// Last reported connection state
    pub connection_state: ConnectionState,
    /// Inbound tracks, lazily populated by track events
    pub remote_stream: RemoteStream,
}

impl PeerInfo {
    /// Info for a freshly created session
    pub fn new(display_name: impl Into<String>, is_host: bool, status: PeerStatus) -> Self {
        Self {
            display_name: display_name.into(),
            is_host,
            status,
            is_screen_sharing: false,
            signal_quality: SignalQuality::Unknown,
            signaling_state: SignalingState::Stable,
            connection_state: ConnectionState::New,
            remote_stream: RemoteStream::default(),
        }
    }

    /// Snapshot for the presentation layer
    #[must_use]
    pub fn snapshot(&self, peer_id: &PeerId) -> PeerSnapshot {
        PeerSnapshot {
            peer_id: peer_id.clone(),
            display_name: self.display_name.clone(),
            is_host: self.is_host,
            status: self.status,
            is_screen_sharing: self.is_screen_sharing,
            signal_quality: self.signal_quality,
            signaling_state: self.signaling_state,
            connection_state: self.connection_state,
            remote_tracks: self.remote_stream.tracks(),
        }
    }
}

/// Exactly one audio and one video outgoing slot
#[derive(Debug, Clone)]
pub struct OutgoingSlots<Track> {
    audio: Option<Track>,
    video: Option<Track>,
}

impl<Track> Default for OutgoingSlots<Track> {
    fn default() -> Self {
        Self {
            audio: None,
            video: None,
        }
    }
}

impl<Track> OutgoingSlots<Track> {
    /// Track in the slot of `kind`
    #[must_use]
    pub fn get(&self, kind: TrackKind) -> Option<&Track> {
        match kind {
            TrackKind::Audio => self.audio.as_ref(),
            TrackKind::Video => self.video.as_ref(),
        }
    }

    /// Whether the slot of `kind` holds a track
    #[must_use]
    pub fn is_occupied(&self, kind: TrackKind) -> bool {
        self.get(kind).is_some()
    }

    /// Fill or empty a slot, returning whether its occupancy flipped
    pub fn set(&mut self, kind: TrackKind, track: Option<Track>) -> bool {
        let slot = match kind {
            TrackKind::Audio => &mut self.audio,
            TrackKind::Video => &mut self.video,
        };
        let flipped = slot.is_some() != track.is_some();
        *slot = track;
        flipped
    }
}

/// Result of an offer attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferOutcome {
    /// Offer committed and sent
    Sent,
    /// Another offer is being built
    AlreadyMakingOffer,
    /// An exchange is already in progress
    NotStable(SignalingState),
    /// An inbound offer won while ours was being built
    Superseded(SignalingState),
}

/// Result of handling an inbound offer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundOffer {
    /// Offer accepted and answered
    Answered {
        /// Whether a local offer was rolled back first
        rolled_back: bool,
    },
    /// Colliding offer ignored because the local side is impolite
    Ignored,
}

/// Result of handling an inbound answer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundAnswer {
    /// Answer accepted
    Accepted,
    /// No local offer outstanding, answer discarded
    Stale(SignalingState),
}

/// Result of handling an inbound candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundCandidate {
    /// Applied to the transport
    Applied,
    /// Queued until a remote description is accepted
    Queued,
    /// Rejected by the transport, session unaffected
    Rejected,
}

/// What a transport event means for the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    /// Nothing to report
    Quiet,
    /// Peer metadata changed
    PeerUpdated,
    /// Connection state changed
    ConnectionChanged(ConnectionState),
    /// Connection failed and an ICE restart was requested
    IceRestarted {
        /// Restarts so far, including this one
        attempt: u32,
    },
    /// Connection failed with the restart budget spent
    RestartsExhausted {
        /// Restarts attempted
        restarts: u32,
    },
    /// Transport closed, the session must be torn down
    Closed,
}

/// Negotiation state for one remote peer
pub struct PeerSession<T: MediaTransport> {
    local_peer: PeerId,
    peer_id: PeerId,
    transport: Arc<T>,
    info: Arc<RwLock<PeerInfo>>,
    outgoing: OutgoingSlots<T::Track>,
    pending_candidates: VecDeque<IceCandidate>,
    making_offer: bool,
    ice_restarts: u32,
    max_ice_restarts: u32,
    loss_reported: bool,
}

impl<T: MediaTransport> PeerSession<T> {
    /// Create a session around an exclusively owned transport
    pub fn new(
        local_peer: PeerId,
        peer_id: PeerId,
        transport: Arc<T>,
        info: PeerInfo,
        max_ice_restarts: u32,
    ) -> Self {
        Self {
            local_peer,
            peer_id,
            transport,
            info: Arc::new(RwLock::new(info)),
            outgoing: OutgoingSlots::default(),
            pending_candidates: VecDeque::new(),
            making_offer: false,
            ice_restarts: 0,
            max_ice_restarts,
            loss_reported: false,
        }
    }

    /// Remote peer id
    #[must_use]
    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// Local role towards this peer
    #[must_use]
    pub fn role(&self) -> NegotiationRole {
        NegotiationRole::between(&self.local_peer, &self.peer_id)
    }

    /// The peer's transport
    #[must_use]
    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    /// Shared metadata handle
    #[must_use]
    pub fn info(&self) -> &Arc<RwLock<PeerInfo>> {
        &self.info
    }

    /// Candidates waiting for a remote description
    #[must_use]
    pub fn pending_candidates(&self) -> &VecDeque<IceCandidate> {
        &self.pending_candidates
    }

    /// Whether a local offer is being built
    #[must_use]
    pub fn is_making_offer(&self) -> bool {
        self.making_offer
    }

    /// Outgoing slots
    #[must_use]
    pub fn outgoing(&self) -> &OutgoingSlots<T::Track> {
        &self.outgoing
    }

    /// Create an offer, commit it locally and send it to the peer
    ///
    /// No-op unless the transport is `stable` and no other offer is being
    /// built. The state is checked again after creation because an inbound
    /// offer may have been accepted meanwhile.
    ///
    /// # Errors
    ///
    /// Returns error if the transport or relay fails; negotiation state is
    /// left unchanged and the next trigger may retry
    #[tracing::instrument(skip(self, out), fields(peer = %self.peer_id))]
    pub async fn create_and_send_offer<O: SignalSink + ?Sized>(
        &mut self,
        out: &O,
    ) -> Result<OfferOutcome, NegotiationError> {
        if self.making_offer {
            tracing::debug!("Offer already in progress, skipping");
            return Ok(OfferOutcome::AlreadyMakingOffer);
        }
        let state = self.transport.signaling_state();
        if state != SignalingState::Stable {
            tracing::debug!(state = %state, "Not stable, skipping offer");
            return Ok(OfferOutcome::NotStable(state));
        }

        self.making_offer = true;
        let result = self.make_offer(out).await;
        self.making_offer = false;
        result
    }

    async fn make_offer<O: SignalSink + ?Sized>(
        &mut self,
        out: &O,
    ) -> Result<OfferOutcome, NegotiationError> {
        let offer = self.transport.create_offer().await?;

        let state = self.transport.signaling_state();
        if state != SignalingState::Stable {
            tracing::debug!(state = %state, "State changed while creating offer, dropping it");
            return Ok(OfferOutcome::Superseded(state));
        }

        self.transport.set_local_description(offer.clone()).await?;
        self.record_signaling_state();
        out.send_signal(&self.peer_id, SignalPayload::Offer(offer))
            .await?;
        tracing::debug!("Offer sent");
        Ok(OfferOutcome::Sent)
    }

    /// Accept an offer from the peer and answer it, resolving collisions
    ///
    /// # Errors
    ///
    /// Returns error if the transport or relay fails. If the offer was
    /// accepted but no answer could be committed, the offer is rolled back so
    /// the session is `stable` again and the peer's next offer is handled
    /// normally.
    #[tracing::instrument(skip(self, offer, out), fields(peer = %self.peer_id))]
    pub async fn handle_offer<O: SignalSink + ?Sized>(
        &mut self,
        offer: SessionDescription,
        out: &O,
    ) -> Result<InboundOffer, NegotiationError> {
        let state = self.transport.signaling_state();
        let collision = self.making_offer || state != SignalingState::Stable;
        let role = self.role();

        if collision && !role.is_polite() {
            tracing::warn!(state = %state, "Ignoring colliding offer (impolite side)");
            return Ok(InboundOffer::Ignored);
        }

        if collision {
            tracing::debug!(state = %state, "Offer collision, rolling back local offer");
            self.transport
                .set_local_description(SessionDescription::rollback())
                .await?;
            self.making_offer = false;
        }

        self.transport.set_remote_description(offer).await?;
        self.flush_pending_candidates().await;

        let answer = match self.commit_answer().await {
            Ok(answer) => answer,
            Err(e) => {
                self.abandon_remote_offer().await;
                return Err(e);
            }
        };
        self.record_signaling_state();
        out.send_signal(&self.peer_id, SignalPayload::Answer(answer))
            .await?;
        tracing::debug!(rolled_back = collision, "Answer sent");
        Ok(InboundOffer::Answered {
            rolled_back: collision,
        })
    }

    async fn commit_answer(&self) -> Result<SessionDescription, NegotiationError> {
        let answer = self.transport.create_answer().await?;
        self.transport.set_local_description(answer.clone()).await?;
        Ok(answer)
    }

    /// Return to `stable` after an accepted offer could not be answered
    ///
    /// Left in `have-remote-offer`, every later offer would collide and every
    /// local trigger would be skipped.
    async fn abandon_remote_offer(&mut self) {
        if self.transport.signaling_state() == SignalingState::HaveRemoteOffer {
            match self
                .transport
                .set_local_description(SessionDescription::rollback())
                .await
            {
                Ok(()) => tracing::debug!(peer = %self.peer_id, "Rolled back unanswered offer"),
                Err(e) => {
                    tracing::warn!(peer = %self.peer_id, error = %e, "Failed to roll back unanswered offer");
                }
            }
        }
        self.record_signaling_state();
    }

    /// Accept the peer's answer to our outstanding offer
    ///
    /// Answers arriving in any state other than `have-local-offer` are stale
    /// and discarded.
    ///
    /// # Errors
    ///
    /// Returns error if the transport rejects the answer
    #[tracing::instrument(skip(self, answer), fields(peer = %self.peer_id))]
    pub async fn handle_answer(
        &mut self,
        answer: SessionDescription,
    ) -> Result<InboundAnswer, NegotiationError> {
        let state = self.transport.signaling_state();
        if state != SignalingState::HaveLocalOffer {
            tracing::warn!(state = %state, "Ignoring answer, no local offer outstanding");
            return Ok(InboundAnswer::Stale(state));
        }

        self.transport.set_remote_description(answer).await?;
        self.record_signaling_state();
        self.flush_pending_candidates().await;
        tracing::debug!("Answer accepted");
        Ok(InboundAnswer::Accepted)
    }

    /// Apply a remote candidate, or queue it until a remote description is set
    #[tracing::instrument(skip(self, candidate), fields(peer = %self.peer_id))]
    pub async fn handle_candidate(&mut self, candidate: IceCandidate) -> InboundCandidate {
        if !self.transport.has_remote_description().await {
            self.pending_candidates.push_back(candidate);
            tracing::trace!(
                queued = self.pending_candidates.len(),
                "Queued candidate until remote description"
            );
            return InboundCandidate::Queued;
        }

        match self.transport.add_ice_candidate(candidate).await {
            Ok(()) => InboundCandidate::Applied,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to apply ICE candidate");
                InboundCandidate::Rejected
            }
        }
    }

    /// Drain the candidate queue into the transport, in receive order
    ///
    /// Returns the number of candidates the transport accepted.
    pub async fn flush_pending_candidates(&mut self) -> usize {
        if self.pending_candidates.is_empty() {
            return 0;
        }
        let queued: Vec<IceCandidate> = self.pending_candidates.drain(..).collect();
        let total = queued.len();
        let mut applied = 0;
        for candidate in queued {
            match self.transport.add_ice_candidate(candidate).await {
                Ok(()) => applied += 1,
                Err(e) => tracing::warn!(peer = %self.peer_id, error = %e, "Failed to apply queued ICE candidate"),
            }
        }
        tracing::debug!(peer = %self.peer_id, applied, total, "Flushed queued candidates");
        applied
    }

    /// Replace the track in an outgoing slot
    ///
    /// Returns whether the slot flipped between empty and occupied, which is
    /// the only kind of change that needs renegotiation.
    ///
    /// # Errors
    ///
    /// Returns error if the transport rejects the replacement; the slot is
    /// left as it was
    pub async fn replace_outgoing_track(
        &mut self,
        kind: TrackKind,
        track: Option<T::Track>,
    ) -> Result<bool, NegotiationError> {
        self.transport
            .replace_outgoing_track(kind, track.clone())
            .await?;
        Ok(self.outgoing.set(kind, track))
    }

    /// React to an event from the transport
    pub async fn handle_transport_event<O: SignalSink + ?Sized>(
        &mut self,
        event: TransportEvent,
        out: &O,
    ) -> EventOutcome {
        match event {
            TransportEvent::IncomingTrack { kind, track_id } => {
                let mut info = self.info.write();
                *info.remote_stream.slot_mut(kind) = Some(track_id);
                set_kind_off(&mut info.status, kind, false);
                EventOutcome::PeerUpdated
            }
            TransportEvent::RemoteTrackMuted { kind, muted } => {
                let mut info = self.info.write();
                if info.remote_stream.track(kind).is_none() {
                    return EventOutcome::Quiet;
                }
                set_kind_off(&mut info.status, kind, muted);
                EventOutcome::PeerUpdated
            }
            TransportEvent::RemoteTrackEnded { kind } => {
                let mut info = self.info.write();
                if info.remote_stream.slot_mut(kind).take().is_none() {
                    return EventOutcome::Quiet;
                }
                set_kind_off(&mut info.status, kind, true);
                EventOutcome::PeerUpdated
            }
            TransportEvent::LocalIceCandidate(candidate) => {
                if let Err(e) = out
                    .send_signal(&self.peer_id, SignalPayload::IceCandidate(candidate))
                    .await
                {
                    tracing::warn!(peer = %self.peer_id, error = %e, "Failed to relay local candidate");
                }
                EventOutcome::Quiet
            }
            TransportEvent::SignalingStateChanged(state) => {
                tracing::debug!(peer = %self.peer_id, state = %state, "Signaling state changed");
                self.info.write().signaling_state = state;
                EventOutcome::Quiet
            }
            TransportEvent::ConnectionStateChanged(state) => {
                self.handle_connection_state(state).await
            }
        }
    }

    async fn handle_connection_state(&mut self, state: ConnectionState) -> EventOutcome {
        tracing::debug!(peer = %self.peer_id, state = ?state, "Connection state changed");
        self.info.write().connection_state = state;

        match state {
            ConnectionState::Connected => {
                self.ice_restarts = 0;
                self.loss_reported = false;
                EventOutcome::ConnectionChanged(state)
            }
            ConnectionState::Failed => {
                if self.ice_restarts >= self.max_ice_restarts {
                    if self.loss_reported {
                        return EventOutcome::ConnectionChanged(state);
                    }
                    self.loss_reported = true;
                    tracing::error!(
                        peer = %self.peer_id,
                        restarts = self.ice_restarts,
                        "Connection failed, ICE restarts exhausted"
                    );
                    return EventOutcome::RestartsExhausted {
                        restarts: self.ice_restarts,
                    };
                }
                self.ice_restarts += 1;
                tracing::warn!(
                    peer = %self.peer_id,
                    attempt = self.ice_restarts,
                    "Connection failed, restarting ICE"
                );
                if let Err(e) = self.transport.restart_ice().await {
                    tracing::warn!(peer = %self.peer_id, error = %e, "ICE restart request failed");
                }
                EventOutcome::IceRestarted {
                    attempt: self.ice_restarts,
                }
            }
            ConnectionState::Closed => EventOutcome::Closed,
            _ => EventOutcome::ConnectionChanged(state),
        }
    }

    /// Close the transport and drop queued candidates
    pub async fn close(&mut self) {
        self.pending_candidates.clear();
        self.making_offer = false;
        if let Err(e) = self.transport.close().await {
            tracing::debug!(peer = %self.peer_id, error = %e, "Transport close failed");
        }
        self.info.write().connection_state = ConnectionState::Closed;
    }

    fn record_signaling_state(&self) {
        self.info.write().signaling_state = self.transport.signaling_state();
    }
}

fn set_kind_off(status: &mut PeerStatus, kind: TrackKind, off: bool) {
    match kind {
        TrackKind::Audio => status.is_muted = off,
        TrackKind::Video => status.is_camera_off = off,
    }
}
