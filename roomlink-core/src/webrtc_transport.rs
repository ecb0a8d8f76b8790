//! Media transport on `webrtc::RTCPeerConnection`
//!
//! Each transport owns one peer connection with an audio and a video
//! send/receive transceiver. Outgoing slots map onto the transceivers'
//! senders, so replacing a track never adds or removes m-lines by itself.
//!
//! webrtc-rs has no standalone ICE restart, so [`MediaTransport::restart_ice`]
//! marks the connection and the next offer it creates carries fresh ICE
//! credentials. The transport reports
//! [`MediaTransport::ice_restart_needs_offer`], which makes the coordinator
//! send that offer right after the restart request.

use crate::config::{CoordinatorConfig, IceServer};
use crate::identity::PeerId;
use crate::media_transport::{
    MediaTransport, MediaTransportError, MediaTransportFactory, TransportEvent,
    TransportEventSink,
};
use crate::types::{
    ConnectionState, IceCandidate, SdpType, SessionDescription, SignalingState, TrackKind,
};
use async_trait::async_trait;
use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::stats::StatsReportType;
use webrtc::track::track_local::TrackLocal;

/// Local track handle accepted by [`WebRtcTransport`]
pub type LocalTrack = Arc<dyn TrackLocal + Send + Sync>;

fn negotiation<E: Display>(e: E) -> MediaTransportError {
    MediaTransportError::Negotiation(e.to_string())
}

fn setup<E: Display>(e: E) -> MediaTransportError {
    MediaTransportError::Setup(e.to_string())
}

fn signaling_state(state: RTCSignalingState) -> SignalingState {
    match state {
        RTCSignalingState::HaveLocalOffer | RTCSignalingState::HaveRemotePranswer => {
            SignalingState::HaveLocalOffer
        }
        RTCSignalingState::HaveRemoteOffer | RTCSignalingState::HaveLocalPranswer => {
            SignalingState::HaveRemoteOffer
        }
        RTCSignalingState::Closed => SignalingState::Closed,
        _ => SignalingState::Stable,
    }
}

fn connection_state(state: RTCPeerConnectionState) -> ConnectionState {
    match state {
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
        _ => ConnectionState::New,
    }
}

fn track_kind(kind: RTPCodecType) -> Option<TrackKind> {
    match kind {
        RTPCodecType::Audio => Some(TrackKind::Audio),
        RTPCodecType::Video => Some(TrackKind::Video),
        _ => None,
    }
}

fn ice_server(server: &IceServer) -> RTCIceServer {
    RTCIceServer {
        urls: server.urls.clone(),
        username: server.username.clone().unwrap_or_default(),
        credential: server.credential.clone().unwrap_or_default(),
        ..Default::default()
    }
}

/// Peer-connection backed media transport
pub struct WebRtcTransport {
    peer_connection: Arc<RTCPeerConnection>,
    audio_sender: Arc<RTCRtpSender>,
    video_sender: Arc<RTCRtpSender>,
    restart_requested: AtomicBool,
}

impl WebRtcTransport {
    /// Underlying peer connection, for reading remote media
    #[must_use]
    pub fn peer_connection(&self) -> &Arc<RTCPeerConnection> {
        &self.peer_connection
    }

    fn sender(&self, kind: TrackKind) -> &Arc<RTCRtpSender> {
        match kind {
            TrackKind::Audio => &self.audio_sender,
            TrackKind::Video => &self.video_sender,
        }
    }

    fn to_rtc(description: SessionDescription) -> Result<RTCSessionDescription, MediaTransportError> {
        match description.kind {
            SdpType::Offer => RTCSessionDescription::offer(description.sdp).map_err(negotiation),
            SdpType::Answer => RTCSessionDescription::answer(description.sdp).map_err(negotiation),
            SdpType::Rollback => Ok(Self::rollback_of(description.sdp)),
        }
    }

    /// Discard the pending description, local or remote
    ///
    /// A rollback has to name the description it discards.
    async fn rollback(&self) -> Result<(), MediaTransportError> {
        match self.signaling_state() {
            SignalingState::HaveLocalOffer => {
                let pending = self
                    .peer_connection
                    .pending_local_description()
                    .await
                    .ok_or(MediaTransportError::InvalidState {
                        operation: "rollback",
                        state: SignalingState::HaveLocalOffer,
                    })?;
                self.peer_connection
                    .set_local_description(Self::rollback_of(pending.sdp))
                    .await
                    .map_err(negotiation)
            }
            SignalingState::HaveRemoteOffer => {
                let pending = self
                    .peer_connection
                    .pending_remote_description()
                    .await
                    .ok_or(MediaTransportError::InvalidState {
                        operation: "rollback",
                        state: SignalingState::HaveRemoteOffer,
                    })?;
                self.peer_connection
                    .set_remote_description(Self::rollback_of(pending.sdp))
                    .await
                    .map_err(negotiation)
            }
            state => Err(MediaTransportError::InvalidState {
                operation: "rollback",
                state,
            }),
        }
    }

    fn rollback_of(sdp: String) -> RTCSessionDescription {
        let mut rollback = RTCSessionDescription::default();
        rollback.sdp_type = RTCSdpType::Rollback;
        rollback.sdp = sdp;
        rollback
    }

    fn register_callbacks(peer_connection: &RTCPeerConnection, events: &TransportEventSink) {
        let sink = events.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate| {
            if let Some(candidate) = candidate {
                match candidate.to_json() {
                    Ok(init) => sink.emit(TransportEvent::LocalIceCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_m_line_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    })),
                    Err(e) => tracing::warn!(error = %e, "Failed to serialize local candidate"),
                }
            }
            Box::pin(async {})
        }));

        let sink = events.clone();
        peer_connection.on_peer_connection_state_change(Box::new(move |state| {
            sink.emit(TransportEvent::ConnectionStateChanged(connection_state(state)));
            Box::pin(async {})
        }));

        let sink = events.clone();
        peer_connection.on_signaling_state_change(Box::new(move |state| {
            sink.emit(TransportEvent::SignalingStateChanged(signaling_state(state)));
            Box::pin(async {})
        }));

        let sink = events.clone();
        peer_connection.on_track(Box::new(move |track, _receiver, _transceiver| {
            if let Some(kind) = track_kind(track.kind()) {
                sink.emit(TransportEvent::IncomingTrack {
                    kind,
                    track_id: track.id(),
                });
            }
            Box::pin(async {})
        }));
    }
}

#[async_trait]
impl MediaTransport for WebRtcTransport {
    type Track = LocalTrack;

    async fn create_offer(&self) -> Result<SessionDescription, MediaTransportError> {
        let options = self
            .restart_requested
            .swap(false, Ordering::SeqCst)
            .then(|| RTCOfferOptions {
                ice_restart: true,
                ..Default::default()
            });
        let offer = self
            .peer_connection
            .create_offer(options)
            .await
            .map_err(negotiation)?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, MediaTransportError> {
        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(negotiation)?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), MediaTransportError> {
        if description.kind == SdpType::Rollback {
            return self.rollback().await;
        }

        self.peer_connection
            .set_local_description(Self::to_rtc(description)?)
            .await
            .map_err(negotiation)
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), MediaTransportError> {
        self.peer_connection
            .set_remote_description(Self::to_rtc(description)?)
            .await
            .map_err(negotiation)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), MediaTransportError> {
        self.peer_connection
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_m_line_index,
                username_fragment: candidate.username_fragment,
            })
            .await
            .map_err(|e| MediaTransportError::Candidate(e.to_string()))
    }

    async fn restart_ice(&self) -> Result<(), MediaTransportError> {
        if self.signaling_state() == SignalingState::Closed {
            return Err(MediaTransportError::Closed);
        }
        self.restart_requested.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn ice_restart_needs_offer(&self) -> bool {
        true
    }

    async fn replace_outgoing_track(
        &self,
        kind: TrackKind,
        track: Option<LocalTrack>,
    ) -> Result<(), MediaTransportError> {
        self.sender(kind)
            .replace_track(track)
            .await
            .map_err(|e| MediaTransportError::Track(e.to_string()))
    }

    async fn round_trip_time_ms(&self) -> Result<Option<f64>, MediaTransportError> {
        let stats = self.peer_connection.get_stats().await;
        let rtt = stats.reports.values().find_map(|report| match report {
            StatsReportType::CandidatePair(pair)
                if pair.nominated && pair.current_round_trip_time > 0.0 =>
            {
                Some(pair.current_round_trip_time * 1000.0)
            }
            _ => None,
        });
        Ok(rtt)
    }

    async fn has_remote_description(&self) -> bool {
        self.peer_connection.remote_description().await.is_some()
    }

    fn signaling_state(&self) -> SignalingState {
        signaling_state(self.peer_connection.signaling_state())
    }

    async fn close(&self) -> Result<(), MediaTransportError> {
        self.peer_connection
            .close()
            .await
            .map_err(|e| MediaTransportError::Setup(e.to_string()))
    }
}

/// Creates one [`WebRtcTransport`] per remote peer
pub struct WebRtcTransportFactory {
    ice_servers: Vec<RTCIceServer>,
}

impl WebRtcTransportFactory {
    /// Factory using the ICE servers of `config`
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid
    pub fn new(config: &CoordinatorConfig) -> Result<Self, MediaTransportError> {
        config.validate().map_err(setup)?;
        Ok(Self {
            ice_servers: config.ice_servers.iter().map(ice_server).collect(),
        })
    }
}

#[async_trait]
impl MediaTransportFactory for WebRtcTransportFactory {
    type Transport = WebRtcTransport;

    #[tracing::instrument(skip(self, events), fields(peer = %peer))]
    async fn create(
        &self,
        peer: &PeerId,
        events: TransportEventSink,
    ) -> Result<WebRtcTransport, MediaTransportError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(setup)?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(setup)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let peer_connection = Arc::new(
            api.new_peer_connection(RTCConfiguration {
                ice_servers: self.ice_servers.clone(),
                ..Default::default()
            })
            .await
            .map_err(setup)?,
        );

        let mut senders = Vec::with_capacity(2);
        for kind in [RTPCodecType::Audio, RTPCodecType::Video] {
            let transceiver = peer_connection
                .add_transceiver_from_kind(
                    kind,
                    Some(RTCRtpTransceiverInit {
                        direction: RTCRtpTransceiverDirection::Sendrecv,
                        send_encodings: vec![],
                    }),
                )
                .await
                .map_err(setup)?;
            senders.push(transceiver.sender().await);
        }
        let (Some(video_sender), Some(audio_sender)) = (senders.pop(), senders.pop()) else {
            return Err(MediaTransportError::Setup(
                "transceiver senders missing".to_string(),
            ));
        };

        WebRtcTransport::register_callbacks(&peer_connection, &events);
        tracing::debug!("Peer connection created");

        Ok(WebRtcTransport {
            peer_connection,
            audio_sender,
            video_sender,
            restart_requested: AtomicBool::new(false),
        })
    }
}
