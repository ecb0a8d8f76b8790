//! Shared mocks for coordinator integration tests

#![allow(dead_code, clippy::unwrap_used)]

use async_trait::async_trait;
use parking_lot::Mutex;
use roomlink_core::{
    CoordinatorConfig, IceCandidate, LocalParticipant, MediaTransport, MediaTransportError,
    MediaTransportFactory, NegotiationCoordinator, PeerId, RelayMessage, SdpType,
    SessionDescription, SignalPayload, SignalingHandler, SignalingState, SignalingTransport,
    TrackKind, TransportEvent, TransportEventSink,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

pub type TestCoordinator = NegotiationCoordinator<MockTransportFactory, MockSignalingTransport>;

#[derive(Debug, Default)]
pub struct MockTransportState {
    pub signaling: SignalingState,
    pub has_remote: bool,
    pub offers_created: u32,
    pub answers_created: u32,
    pub local_descriptions: Vec<SdpType>,
    pub remote_descriptions: Vec<SdpType>,
    pub applied_candidates: Vec<String>,
    pub restarts: u32,
    pub closed: bool,
    pub replaced_tracks: Vec<(TrackKind, Option<String>)>,
    pub rtt_ms: Option<f64>,
    pub fail_stats: bool,
    /// Number of upcoming `create_offer` calls that fail
    pub failing_offers: u32,
    /// Number of upcoming `create_answer` calls that fail
    pub failing_answers: u32,
    /// `create_offer` calls entered, including suspended ones
    pub offers_started: u32,
    /// When set, `create_offer` waits for a notification before returning
    pub offer_gate: Option<Arc<Notify>>,
    /// Report that ICE restarts need a follow-up offer
    pub restart_via_offer: bool,
}

/// Media transport following the offer/answer state table
#[derive(Debug, Clone)]
pub struct MockTransport {
    peer: PeerId,
    state: Arc<Mutex<MockTransportState>>,
}

impl MockTransport {
    pub fn new(peer: PeerId) -> Self {
        Self {
            peer,
            state: Arc::new(Mutex::new(MockTransportState::default())),
        }
    }

    pub fn state(&self) -> parking_lot::MutexGuard<'_, MockTransportState> {
        self.state.lock()
    }

    fn transition(
        &self,
        operation: &'static str,
        description: &SessionDescription,
        local: bool,
    ) -> Result<(), MediaTransportError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(MediaTransportError::Closed);
        }
        let next = match (local, state.signaling, description.kind) {
            (true, SignalingState::Stable, SdpType::Offer) => SignalingState::HaveLocalOffer,
            (true, SignalingState::HaveRemoteOffer, SdpType::Answer) => SignalingState::Stable,
            (
                true,
                SignalingState::HaveLocalOffer | SignalingState::HaveRemoteOffer,
                SdpType::Rollback,
            ) => SignalingState::Stable,
            (false, SignalingState::Stable, SdpType::Offer) => SignalingState::HaveRemoteOffer,
            (false, SignalingState::HaveLocalOffer, SdpType::Answer) => SignalingState::Stable,
            (_, current, _) => {
                return Err(MediaTransportError::InvalidState {
                    operation,
                    state: current,
                })
            }
        };
        state.signaling = next;
        if local {
            state.local_descriptions.push(description.kind);
        } else {
            state.has_remote = true;
            state.remote_descriptions.push(description.kind);
        }
        Ok(())
    }
}

#[async_trait]
impl MediaTransport for MockTransport {
    type Track = String;

    async fn create_offer(&self) -> Result<SessionDescription, MediaTransportError> {
        let gate = {
            let mut state = self.state.lock();
            state.offers_started += 1;
            state.offer_gate.clone()
        };
        if let Some(gate) = gate {
            gate.notified().await;
        }

        let mut state = self.state.lock();
        if state.closed {
            return Err(MediaTransportError::Closed);
        }
        if state.failing_offers > 0 {
            state.failing_offers -= 1;
            return Err(MediaTransportError::Negotiation("offer generation failed".into()));
        }
        state.offers_created += 1;
        Ok(SessionDescription::offer(format!(
            "offer-to-{}-{}",
            self.peer, state.offers_created
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription, MediaTransportError> {
        let mut state = self.state.lock();
        if state.failing_answers > 0 {
            state.failing_answers -= 1;
            return Err(MediaTransportError::Negotiation("transient".into()));
        }
        if state.signaling != SignalingState::HaveRemoteOffer {
            return Err(MediaTransportError::InvalidState {
                operation: "create_answer",
                state: state.signaling,
            });
        }
        state.answers_created += 1;
        Ok(SessionDescription::answer(format!("answer-to-{}", self.peer)))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), MediaTransportError> {
        self.transition("set_local_description", &description, true)
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), MediaTransportError> {
        self.transition("set_remote_description", &description, false)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), MediaTransportError> {
        let mut state = self.state.lock();
        if !state.has_remote {
            return Err(MediaTransportError::Candidate("no remote description".into()));
        }
        state.applied_candidates.push(candidate.candidate);
        Ok(())
    }

    async fn restart_ice(&self) -> Result<(), MediaTransportError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(MediaTransportError::Closed);
        }
        state.restarts += 1;
        Ok(())
    }

    fn ice_restart_needs_offer(&self) -> bool {
        self.state.lock().restart_via_offer
    }

    async fn replace_outgoing_track(
        &self,
        kind: TrackKind,
        track: Option<String>,
    ) -> Result<(), MediaTransportError> {
        self.state.lock().replaced_tracks.push((kind, track));
        Ok(())
    }

    async fn round_trip_time_ms(&self) -> Result<Option<f64>, MediaTransportError> {
        let state = self.state.lock();
        if state.fail_stats {
            return Err(MediaTransportError::Stats("stats unavailable".into()));
        }
        Ok(state.rtt_ms)
    }

    async fn has_remote_description(&self) -> bool {
        self.state.lock().has_remote
    }

    fn signaling_state(&self) -> SignalingState {
        self.state.lock().signaling
    }

    async fn close(&self) -> Result<(), MediaTransportError> {
        let mut state = self.state.lock();
        state.closed = true;
        state.signaling = SignalingState::Closed;
        Ok(())
    }
}

/// Factory keeping a handle to every transport it created
#[derive(Debug, Clone, Default)]
pub struct MockTransportFactory {
    created: Arc<Mutex<HashMap<PeerId, Vec<(MockTransport, TransportEventSink)>>>>,
}

impl MockTransportFactory {
    /// Most recent transport created for `peer`
    pub fn transport(&self, peer: &str) -> MockTransport {
        self.created.lock()[&PeerId::from(peer)]
            .last()
            .map(|(t, _)| t.clone())
            .unwrap()
    }

    /// Number of transports created for `peer`
    pub fn created_for(&self, peer: &str) -> usize {
        self.created
            .lock()
            .get(&PeerId::from(peer))
            .map_or(0, Vec::len)
    }

    /// Emit a transport event as the most recent transport of `peer`
    pub fn emit(&self, peer: &str, event: TransportEvent) {
        let sink = self.created.lock()[&PeerId::from(peer)]
            .last()
            .map(|(_, s)| s.clone())
            .unwrap();
        sink.emit(event);
    }
}

#[async_trait]
impl MediaTransportFactory for MockTransportFactory {
    type Transport = MockTransport;

    async fn create(
        &self,
        peer: &PeerId,
        events: TransportEventSink,
    ) -> Result<MockTransport, MediaTransportError> {
        let transport = MockTransport::new(peer.clone());
        self.created
            .lock()
            .entry(peer.clone())
            .or_default()
            .push((transport.clone(), events));
        Ok(transport)
    }
}

/// Relay that records outbound messages and replays queued inbound ones
pub struct MockSignalingTransport {
    sent: Mutex<Vec<RelayMessage>>,
    inbound_tx: Mutex<Option<mpsc::UnboundedSender<RelayMessage>>>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<RelayMessage>>,
    closed: Mutex<bool>,
}

impl MockSignalingTransport {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            sent: Mutex::new(Vec::new()),
            inbound_tx: Mutex::new(Some(tx)),
            inbound_rx: tokio::sync::Mutex::new(rx),
            closed: Mutex::new(false),
        }
    }

    /// Queue a message for `receive_message`
    pub fn deliver(&self, message: RelayMessage) {
        if let Some(tx) = self.inbound_tx.lock().as_ref() {
            let _ = tx.send(message);
        }
    }

    /// Make `receive_message` report a closed relay once the queue drains
    pub fn hang_up(&self) {
        self.inbound_tx.lock().take();
    }

    pub fn sent(&self) -> Vec<RelayMessage> {
        self.sent.lock().clone()
    }

    /// Remove and return everything sent so far
    pub fn take_sent(&self) -> Vec<RelayMessage> {
        std::mem::take(&mut *self.sent.lock())
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.lock()
    }
}

#[async_trait]
impl SignalingTransport for MockSignalingTransport {
    type Error = std::io::Error;

    async fn send_message(&self, message: RelayMessage) -> Result<(), std::io::Error> {
        self.sent.lock().push(message);
        Ok(())
    }

    async fn receive_message(&self) -> Result<Option<RelayMessage>, std::io::Error> {
        Ok(self.inbound_rx.lock().await.recv().await)
    }

    async fn close(&self) -> Result<(), std::io::Error> {
        *self.closed.lock() = true;
        Ok(())
    }
}

/// A coordinator wired to mocks
pub struct Harness {
    pub coordinator: TestCoordinator,
    pub factory: MockTransportFactory,
    pub relay: Arc<MockSignalingTransport>,
}

impl Harness {
    pub fn new(peer: &str) -> Self {
        Self::with_config(peer, test_config())
    }

    pub fn with_config(peer: &str, config: CoordinatorConfig) -> Self {
        Self::build(
            LocalParticipant::new("room-1", peer).with_peer_id(PeerId::from(peer)),
            config,
        )
    }

    pub fn host(peer: &str) -> Self {
        Self::build(
            LocalParticipant::new("room-1", peer)
                .with_peer_id(PeerId::from(peer))
                .as_host(),
            test_config(),
        )
    }

    fn build(local: LocalParticipant, config: CoordinatorConfig) -> Self {
        let factory = MockTransportFactory::default();
        let relay = Arc::new(MockSignalingTransport::new());
        let signaling = Arc::new(SignalingHandler::new(Arc::clone(&relay)));
        let coordinator =
            NegotiationCoordinator::new(local, config, factory.clone(), signaling).unwrap();
        Self {
            coordinator,
            factory,
            relay,
        }
    }

    /// Signals sent so far, removing them from the relay log
    pub fn take_signals(&self) -> Vec<RelayMessage> {
        self.relay
            .take_sent()
            .into_iter()
            .filter(|m| matches!(m, RelayMessage::Signal { .. }))
            .collect()
    }
}

/// Config with a fast retry schedule and a sampler that stays out of the way
pub fn test_config() -> CoordinatorConfig {
    CoordinatorConfig {
        stats_interval_ms: 60_000,
        ice_servers: Vec::new(),
        max_ice_restarts: 2,
        max_offer_retries: 2,
        offer_retry_base_ms: 100,
        ..CoordinatorConfig::default()
    }
}

pub fn roster_entry(peer: &str, name: &str, is_host: bool) -> roomlink_core::RosterEntry {
    roomlink_core::RosterEntry {
        peer_id: PeerId::from(peer),
        display_name: name.to_string(),
        is_host,
        status: roomlink_core::PeerStatus::conservative(),
    }
}

pub fn signal(from: &str, to: &str, signal: SignalPayload) -> RelayMessage {
    RelayMessage::Signal {
        room_code: "room-1".to_string(),
        from_peer: PeerId::from(from),
        to_peer: PeerId::from(to),
        signal,
    }
}

pub fn offers_in(messages: &[RelayMessage]) -> usize {
    messages
        .iter()
        .filter(|m| {
            matches!(
                m,
                RelayMessage::Signal {
                    signal: SignalPayload::Offer(_),
                    ..
                }
            )
        })
        .count()
}

/// Poll `check` until it holds or two seconds pass
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// Wait up to two seconds for an event matching `matches`
pub async fn next_event(
    events: &mut tokio::sync::broadcast::Receiver<roomlink_core::RoomEvent>,
    matches: impl Fn(&roomlink_core::RoomEvent) -> bool,
) -> Option<roomlink_core::RoomEvent> {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match events.recv().await {
                Ok(event) if matches(&event) => return Some(event),
                Ok(_) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .await
    .ok()
    .flatten()
}
