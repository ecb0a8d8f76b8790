//! Negotiation coordinator
//!
//! The [`NegotiationCoordinator`] owns one [`PeerSession`] per remote
//! participant and keeps that set reconciled with the room membership the
//! relay reports. Each session is driven by its own task:
//!
//! ```text
//!   relay ──▶ route ──▶ ┌────────────┐
//!                       │ peer task  │ ◀── transport events
//!   local commands ───▶ │ (session)  │
//!                       └─────┬──────┘
//!                             ▼
//!                      relay (offer / answer / candidate)
//! ```
//!
//! A peer task consumes its commands and its transport's events one at a
//! time, so everything that happens to one peer is processed in arrival
//! order while different peers progress concurrently. No lock is held
//! across a transport call.

use crate::config::{CoordinatorConfig, LocalParticipant};
use crate::error::NegotiationError;
use crate::identity::PeerId;
use crate::media_transport::{
    MediaTransport, MediaTransportFactory, TransportEvent, TransportEventSink,
};
use crate::quality::{spawn_sampler, SampleTarget};
use crate::session::{EventOutcome, OfferOutcome, OutgoingSlots, PeerInfo, PeerSession, SignalSink};
use crate::signaling::{
    BroadcastPayload, RelayMessage, SignalPayload, SignalingHandler, SignalingTransport,
};
use crate::types::{
    ConnectionState, HostAction, PeerSnapshot, PeerStatus, RoomEvent, RosterEntry, TrackKind,
};
use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

type TransportOf<F> = <F as MediaTransportFactory>::Transport;
type TrackOf<F> = <TransportOf<F> as MediaTransport>::Track;
type PeerMap<T> = Arc<Mutex<HashMap<PeerId, PeerHandle<T>>>>;

/// Display name given to a peer known only from its offer
const PLACEHOLDER_NAME: &str = "Guest";

enum PeerCommand<Track> {
    Negotiate,
    Signal(SignalPayload),
    ReplaceTrack {
        kind: TrackKind,
        track: Option<Track>,
    },
}

struct Envelope<Track> {
    command: PeerCommand<Track>,
    ack: Option<oneshot::Sender<()>>,
}

struct PeerChannel<Track> {
    commands: mpsc::UnboundedSender<Envelope<Track>>,
}

impl<Track> Clone for PeerChannel<Track> {
    fn clone(&self) -> Self {
        Self {
            commands: self.commands.clone(),
        }
    }
}

impl<Track> PeerChannel<Track> {
    /// Queue a command, returning a receiver that resolves once it ran
    fn submit(&self, command: PeerCommand<Track>) -> Option<oneshot::Receiver<()>> {
        let (ack, done) = oneshot::channel();
        self.commands
            .send(Envelope {
                command,
                ack: Some(ack),
            })
            .ok()?;
        Some(done)
    }
}

struct PeerHandle<T: MediaTransport> {
    info: Arc<RwLock<PeerInfo>>,
    transport: Arc<T>,
    channel: PeerChannel<T::Track>,
    task: JoinHandle<()>,
    /// Created from an inbound offer, metadata not yet known
    provisional: bool,
}

struct SessionMeta {
    display_name: String,
    is_host: bool,
    status: PeerStatus,
    provisional: bool,
}

impl SessionMeta {
    fn from_roster(entry: &RosterEntry) -> Self {
        Self {
            display_name: entry.display_name.clone(),
            is_host: entry.is_host,
            status: entry.status,
            provisional: false,
        }
    }

    fn joined(display_name: String, is_host: bool) -> Self {
        Self {
            display_name,
            is_host,
            status: PeerStatus::conservative(),
            provisional: false,
        }
    }

    fn placeholder() -> Self {
        Self {
            display_name: PLACEHOLDER_NAME.to_string(),
            is_host: false,
            status: PeerStatus::conservative(),
            provisional: true,
        }
    }
}

/// Relay publisher shared by the coordinator and its peer tasks
struct RelayOutbox<S: SignalingTransport> {
    signaling: Arc<SignalingHandler<S>>,
    room_code: String,
    local_peer: PeerId,
    closed: Arc<AtomicBool>,
}

impl<S: SignalingTransport> RelayOutbox<S> {
    async fn publish(&self, message: RelayMessage) -> Result<(), NegotiationError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(NegotiationError::ShutDown);
        }
        self.signaling
            .send_message(message)
            .await
            .map_err(|e| NegotiationError::Signaling(e.to_string()))
    }
}

#[async_trait]
impl<S: SignalingTransport> SignalSink for RelayOutbox<S> {
    async fn send_signal(&self, to: &PeerId, signal: SignalPayload) -> Result<(), NegotiationError> {
        self.publish(RelayMessage::Signal {
            room_code: self.room_code.clone(),
            from_peer: self.local_peer.clone(),
            to_peer: to.clone(),
            signal,
        })
        .await
    }
}

struct PendingRetry {
    at: Instant,
    attempt: u32,
}

/// Task owning one peer session
struct PeerActor<T: MediaTransport, S: SignalingTransport> {
    session: PeerSession<T>,
    outbox: Arc<RelayOutbox<S>>,
    events: broadcast::Sender<RoomEvent>,
    peers: Weak<Mutex<HashMap<PeerId, PeerHandle<T>>>>,
    config: CoordinatorConfig,
    retry: Option<PendingRetry>,
}

impl<T: MediaTransport, S: SignalingTransport> PeerActor<T, S> {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Envelope<T::Track>>,
        mut transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        let mut events_open = true;
        loop {
            let retry_at = self.retry.as_ref().map(|r| r.at);
            tokio::select! {
                envelope = commands.recv() => {
                    let Some(Envelope { command, ack }) = envelope else {
                        break;
                    };
                    self.handle_command(command).await;
                    if let Some(ack) = ack {
                        let _ = ack.send(());
                    }
                }
                event = transport_events.recv(), if events_open => match event {
                    Some(event) => {
                        if self.handle_event(event).await.is_break() {
                            break;
                        }
                    }
                    None => events_open = false,
                },
                () = sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => {
                    if let Some(retry) = self.retry.take() {
                        self.negotiate(retry.attempt).await;
                    }
                }
            }
        }
        tracing::debug!(peer = %self.session.peer_id(), "Peer task stopped");
    }

    async fn handle_command(&mut self, command: PeerCommand<T::Track>) {
        match command {
            PeerCommand::Negotiate => self.negotiate(0).await,
            PeerCommand::Signal(SignalPayload::Offer(offer)) => {
                match self.session.handle_offer(offer, self.outbox.as_ref()).await {
                    Ok(outcome) => tracing::debug!(peer = %self.session.peer_id(), ?outcome, "Handled offer"),
                    Err(e) => tracing::warn!(peer = %self.session.peer_id(), error = %e, "Failed to handle offer"),
                }
            }
            PeerCommand::Signal(SignalPayload::Answer(answer)) => {
                if let Err(e) = self.session.handle_answer(answer).await {
                    tracing::warn!(peer = %self.session.peer_id(), error = %e, "Failed to handle answer");
                }
            }
            PeerCommand::Signal(SignalPayload::IceCandidate(candidate)) => {
                self.session.handle_candidate(candidate).await;
            }
            PeerCommand::ReplaceTrack { kind, track } => {
                match self.session.replace_outgoing_track(kind, track).await {
                    // Only a change in slot occupancy alters the media lines
                    Ok(true) => self.negotiate(0).await,
                    Ok(false) => {}
                    Err(e) => {
                        tracing::warn!(peer = %self.session.peer_id(), kind = %kind, error = %e, "Track replacement failed");
                    }
                }
            }
        }
    }

    /// Offer now, scheduling a bounded back-off retry if it fails
    async fn negotiate(&mut self, attempt: u32) {
        match self.session.create_and_send_offer(self.outbox.as_ref()).await {
            Ok(outcome) => {
                tracing::trace!(peer = %self.session.peer_id(), ?outcome, "Offer attempt finished");
                if outcome == OfferOutcome::Sent {
                    self.retry = None;
                }
            }
            Err(NegotiationError::ShutDown) => self.retry = None,
            Err(e) => {
                if attempt >= self.config.max_offer_retries {
                    tracing::warn!(
                        peer = %self.session.peer_id(),
                        error = %e,
                        attempts = attempt + 1,
                        "Offer failed, waiting for the next trigger"
                    );
                    self.retry = None;
                    return;
                }
                let next = attempt + 1;
                let delay = self.config.offer_retry_delay(next);
                tracing::warn!(
                    peer = %self.session.peer_id(),
                    error = %e,
                    retry = next,
                    delay_ms = delay.as_millis(),
                    "Offer failed, retrying"
                );
                self.retry = Some(PendingRetry {
                    at: Instant::now() + delay,
                    attempt: next,
                });
            }
        }
    }

    async fn handle_event(&mut self, event: TransportEvent) -> ControlFlow<()> {
        let peer_id = self.session.peer_id().clone();
        match self
            .session
            .handle_transport_event(event, self.outbox.as_ref())
            .await
        {
            EventOutcome::Quiet => {}
            EventOutcome::PeerUpdated => {
                let _ = self.events.send(RoomEvent::PeerUpdated { peer_id });
            }
            EventOutcome::ConnectionChanged(state) => {
                let _ = self
                    .events
                    .send(RoomEvent::ConnectionStateChanged { peer_id, state });
            }
            EventOutcome::IceRestarted { .. } => {
                let _ = self.events.send(RoomEvent::ConnectionStateChanged {
                    peer_id,
                    state: ConnectionState::Failed,
                });
                if self.session.transport().ice_restart_needs_offer() {
                    self.negotiate(0).await;
                }
            }
            EventOutcome::RestartsExhausted { restarts } => {
                let _ = self.events.send(RoomEvent::ConnectionStateChanged {
                    peer_id: peer_id.clone(),
                    state: ConnectionState::Failed,
                });
                let _ = self
                    .events
                    .send(RoomEvent::ConnectionLost { peer_id, restarts });
            }
            EventOutcome::Closed => {
                self.tear_down().await;
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    /// Remove our own entry after the transport closed underneath us
    async fn tear_down(&mut self) {
        let peer_id = self.session.peer_id().clone();
        let removed = self.peers.upgrade().is_some_and(|peers| {
            let mut peers = peers.lock();
            let ours = peers
                .get(&peer_id)
                .is_some_and(|h| Arc::ptr_eq(&h.info, self.session.info()));
            if ours {
                peers.remove(&peer_id);
            }
            ours
        });

        self.retry = None;
        self.session.close().await;

        if removed {
            tracing::info!(peer = %peer_id, "Transport closed, peer session removed");
            let _ = self.events.send(RoomEvent::PeerLeft { peer_id });
        }
    }
}

struct Shared<F: MediaTransportFactory, S: SignalingTransport> {
    local: LocalParticipant,
    local_status: RwLock<PeerStatus>,
    config: CoordinatorConfig,
    factory: F,
    signaling: Arc<SignalingHandler<S>>,
    outbox: Arc<RelayOutbox<S>>,
    peers: PeerMap<TransportOf<F>>,
    /// Peers reported left and not seen joining again
    departed: Mutex<HashSet<PeerId>>,
    /// Serializes session creation so creation stays idempotent per peer
    creation: tokio::sync::Mutex<()>,
    local_tracks: Mutex<OutgoingSlots<TrackOf<F>>>,
    events: broadcast::Sender<RoomEvent>,
    closed: Arc<AtomicBool>,
    joined: AtomicBool,
    shutdown: watch::Sender<bool>,
    sampler: Mutex<Option<JoinHandle<()>>>,
}

/// Peer negotiation coordinator for one room
///
/// Cheap to clone; clones share the same room state.
///
/// # Example
///
/// ```ignore
/// let coordinator = NegotiationCoordinator::new(local, config, factory, signaling)?;
/// let mut events = coordinator.subscribe_events();
/// tokio::spawn({
///     let coordinator = coordinator.clone();
///     async move { coordinator.run().await }
/// });
/// coordinator.replace_outgoing_track(TrackKind::Audio, Some(mic)).await?;
/// // ...
/// coordinator.leave().await;
/// ```
pub struct NegotiationCoordinator<F: MediaTransportFactory, S: SignalingTransport> {
    shared: Arc<Shared<F, S>>,
}

impl<F: MediaTransportFactory, S: SignalingTransport> Clone for NegotiationCoordinator<F, S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<F: MediaTransportFactory, S: SignalingTransport> NegotiationCoordinator<F, S> {
    /// Create a coordinator for `local` in its room
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid
    pub fn new(
        local: LocalParticipant,
        config: CoordinatorConfig,
        factory: F,
        signaling: Arc<SignalingHandler<S>>,
    ) -> Result<Self, NegotiationError> {
        config.validate()?;

        let (events, _) = broadcast::channel(config.event_channel_capacity);
        let (shutdown, _) = watch::channel(false);
        let closed = Arc::new(AtomicBool::new(false));
        let outbox = Arc::new(RelayOutbox {
            signaling: Arc::clone(&signaling),
            room_code: local.room_code.clone(),
            local_peer: local.peer_id.clone(),
            closed: Arc::clone(&closed),
        });

        Ok(Self {
            shared: Arc::new(Shared {
                local_status: RwLock::new(local.status),
                local,
                config,
                factory,
                signaling,
                outbox,
                peers: Arc::new(Mutex::new(HashMap::new())),
                departed: Mutex::new(HashSet::new()),
                creation: tokio::sync::Mutex::new(()),
                local_tracks: Mutex::new(OutgoingSlots::default()),
                events,
                closed,
                joined: AtomicBool::new(false),
                shutdown,
                sampler: Mutex::new(None),
            }),
        })
    }

    /// Local peer id
    #[must_use]
    pub fn local_peer_id(&self) -> &PeerId {
        &self.shared.local.peer_id
    }

    /// Active configuration
    #[must_use]
    pub fn config(&self) -> &CoordinatorConfig {
        &self.shared.config
    }

    /// Whether [`leave`](Self::leave) has been called
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Subscribe to presentation events
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<RoomEvent> {
        self.shared.events.subscribe()
    }

    /// Snapshots of all peer sessions, sorted by peer id
    #[must_use]
    pub fn peers(&self) -> Vec<PeerSnapshot> {
        let mut snapshots: Vec<PeerSnapshot> = self
            .shared
            .peers
            .lock()
            .iter()
            .map(|(id, handle)| handle.info.read().snapshot(id))
            .collect();
        snapshots.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        snapshots
    }

    /// Snapshot of one peer session
    #[must_use]
    pub fn peer(&self, peer_id: &PeerId) -> Option<PeerSnapshot> {
        self.shared
            .peers
            .lock()
            .get(peer_id)
            .map(|handle| handle.info.read().snapshot(peer_id))
    }

    /// Current local flags
    #[must_use]
    pub fn local_status(&self) -> PeerStatus {
        *self.shared.local_status.read()
    }

    /// Announce the local participant and start quality sampling
    ///
    /// Calling it again after a successful join is a no-op.
    ///
    /// # Errors
    ///
    /// Returns error if the coordinator has left or the relay rejects the
    /// join message
    #[tracing::instrument(skip(self), fields(room = %self.shared.local.room_code, peer = %self.shared.local.peer_id))]
    pub async fn join(&self) -> Result<(), NegotiationError> {
        self.ensure_open()?;
        if self.shared.joined.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let local = &self.shared.local;
        let joined = self
            .shared
            .outbox
            .publish(RelayMessage::JoinRoom {
                room_code: local.room_code.clone(),
                peer_id: local.peer_id.clone(),
                display_name: local.display_name.clone(),
                is_host: local.is_host,
            })
            .await;
        if let Err(e) = joined {
            self.shared.joined.store(false, Ordering::SeqCst);
            return Err(e);
        }

        self.start_sampler();
        tracing::info!("Joined room");
        Ok(())
    }

    /// Join, then process relay messages until the relay closes or the
    /// coordinator leaves
    ///
    /// Messages for different peers are handed to their peer tasks without
    /// waiting, so one slow peer never holds up the others.
    ///
    /// # Errors
    ///
    /// Returns error if the join message cannot be sent
    pub async fn run(&self) -> Result<(), NegotiationError> {
        self.join().await?;
        let mut shutdown = self.shared.shutdown.subscribe();

        loop {
            if *shutdown.borrow() || self.is_closed() {
                break;
            }
            tokio::select! {
                _ = shutdown.changed() => break,
                received = self.shared.signaling.receive_message() => match received {
                    Ok(Some(message)) => {
                        let message_type = message.message_type();
                        match self.route(message).await {
                            Ok(_) => {}
                            Err(NegotiationError::ShutDown) => break,
                            Err(e) => tracing::warn!(message_type, error = %e, "Failed to handle relay message"),
                        }
                    }
                    Ok(None) => {
                        tracing::info!("Relay closed the channel");
                        break;
                    }
                    // Logged and backed off by the handler
                    Err(_) => {}
                },
            }
        }
        Ok(())
    }

    /// Process one relay message and wait until the affected peer tasks
    /// have handled it
    ///
    /// # Errors
    ///
    /// Returns error if the coordinator has left or a peer session cannot be
    /// created
    #[tracing::instrument(skip(self, message), fields(message_type = message.message_type()))]
    pub async fn handle_relay_message(&self, message: RelayMessage) -> Result<(), NegotiationError> {
        let pending = self.route(message).await?;
        for done in pending {
            let _ = done.await;
        }
        Ok(())
    }

    /// Offer to a peer now
    ///
    /// A no-op if an exchange with the peer is already in progress.
    ///
    /// # Errors
    ///
    /// Returns error if no session exists for the peer
    #[tracing::instrument(skip(self), fields(peer = %peer_id))]
    pub async fn create_and_send_offer(&self, peer_id: &PeerId) -> Result<(), NegotiationError> {
        self.ensure_open()?;
        let channel = self
            .channel(peer_id)
            .ok_or_else(|| NegotiationError::SessionNotFound(peer_id.clone()))?;
        if let Some(done) = channel.submit(PeerCommand::Negotiate) {
            let _ = done.await;
        }
        Ok(())
    }

    /// Put a local track in an outgoing slot of every session, or empty it
    ///
    /// Sessions whose slot flips between empty and occupied renegotiate if
    /// they are `stable`. The track is also kept for sessions created later.
    ///
    /// # Errors
    ///
    /// Returns error if the coordinator has left, or if a track is offered
    /// for a kind the host has locked
    #[tracing::instrument(skip(self, track), fields(kind = %kind, present = track.is_some()))]
    pub async fn replace_outgoing_track(
        &self,
        kind: TrackKind,
        track: Option<TrackOf<F>>,
    ) -> Result<(), NegotiationError> {
        self.ensure_open()?;
        if track.is_some() && self.is_locked(kind) {
            return Err(NegotiationError::TrackLocked(kind));
        }

        let pending: Vec<oneshot::Receiver<()>> = {
            let _creating = self.shared.creation.lock().await;
            self.shared.local_tracks.lock().set(kind, track.clone());
            self.channels()
                .iter()
                .filter_map(|channel| {
                    channel.submit(PeerCommand::ReplaceTrack {
                        kind,
                        track: track.clone(),
                    })
                })
                .collect()
        };
        join_all(pending).await;
        Ok(())
    }

    /// Publish the local mute and camera flags
    ///
    /// # Errors
    ///
    /// Returns error if the flag being cleared is locked by the host, or the
    /// relay rejects the message
    pub async fn update_participant_status(
        &self,
        is_muted: bool,
        is_camera_off: bool,
    ) -> Result<(), NegotiationError> {
        self.ensure_open()?;
        let status = {
            let mut status = self.shared.local_status.write();
            if !is_muted && status.is_mic_locked {
                return Err(NegotiationError::TrackLocked(TrackKind::Audio));
            }
            if !is_camera_off && status.is_camera_locked {
                return Err(NegotiationError::TrackLocked(TrackKind::Video));
            }
            status.is_muted = is_muted;
            status.is_camera_off = is_camera_off;
            *status
        };

        self.publish_status(status).await?;
        let _ = self
            .shared
            .events
            .send(RoomEvent::LocalStatusChanged { status });
        Ok(())
    }

    /// Tell the room whether the local participant is sharing its screen
    ///
    /// # Errors
    ///
    /// Returns error if the relay rejects the message
    pub async fn broadcast_screen_share_state(&self, is_sharing: bool) -> Result<(), NegotiationError> {
        self.send_broadcast(BroadcastPayload::ScreenShareState { is_sharing })
            .await
    }

    /// Send a room-wide ephemeral event
    ///
    /// # Errors
    ///
    /// Returns error if the relay rejects the message
    pub async fn send_broadcast(&self, payload: BroadcastPayload) -> Result<(), NegotiationError> {
        let (kind, payload) = payload.into_wire();
        self.shared
            .outbox
            .publish(RelayMessage::Broadcast {
                room_code: self.shared.local.room_code.clone(),
                from_peer: self.shared.local.peer_id.clone(),
                kind,
                payload,
            })
            .await
    }

    /// Send a host command to one participant
    ///
    /// # Errors
    ///
    /// Returns error if the relay rejects the message
    #[tracing::instrument(skip(self), fields(target = %target))]
    pub async fn host_control_participant(
        &self,
        target: &PeerId,
        action: HostAction,
        value: bool,
    ) -> Result<(), NegotiationError> {
        if !self.shared.local.is_host {
            tracing::debug!("Sending host control without host role, relay may drop it");
        }
        self.shared
            .outbox
            .publish(RelayMessage::HostControl {
                room_code: self.shared.local.room_code.clone(),
                from_peer: self.shared.local.peer_id.clone(),
                target_peer: target.clone(),
                action,
                value,
            })
            .await
    }

    /// Leave the room
    ///
    /// Stops sampling and message processing, closes every transport, drops
    /// all sessions and notifies the relay. Only the first call has any
    /// effect.
    #[tracing::instrument(skip(self), fields(peer = %self.shared.local.peer_id))]
    pub async fn leave(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            tracing::debug!("Already left");
            return;
        }
        tracing::info!("Leaving room");

        self.shared.shutdown.send_replace(true);
        if let Some(sampler) = self.shared.sampler.lock().take() {
            sampler.abort();
        }

        let handles: Vec<PeerHandle<TransportOf<F>>> = {
            let _creating = self.shared.creation.lock().await;
            self.shared.peers.lock().drain().map(|(_, h)| h).collect()
        };
        for handle in &handles {
            handle.task.abort();
        }
        for result in join_all(handles.iter().map(|h| h.transport.close())).await {
            if let Err(e) = result {
                tracing::debug!(error = %e, "Transport close failed");
            }
        }
        *self.shared.local_tracks.lock() = OutgoingSlots::default();

        let leave = RelayMessage::LeaveRoom {
            room_code: self.shared.local.room_code.clone(),
            peer_id: self.shared.local.peer_id.clone(),
        };
        if let Err(e) = self.shared.signaling.send_message(leave).await {
            tracing::warn!(error = %e, "Failed to send leave message");
        }
        if let Err(e) = self.shared.signaling.close().await {
            tracing::debug!(error = %e, "Failed to close relay channel");
        }
        tracing::info!(peers = handles.len(), "Left room");
    }

    async fn route(
        &self,
        message: RelayMessage,
    ) -> Result<Vec<oneshot::Receiver<()>>, NegotiationError> {
        self.ensure_open()?;
        let local = &self.shared.local.peer_id;
        let mut pending = Vec::new();

        match message {
            RelayMessage::ExistingPeers { peers } => {
                tracing::info!(count = peers.len(), "Received room roster");
                for entry in peers.iter().filter(|e| &e.peer_id != local) {
                    // Pre-existing members expect the newcomer to offer
                    match self
                        .ensure_session(&entry.peer_id, SessionMeta::from_roster(entry))
                        .await
                    {
                        Ok(channel) => pending.extend(channel.submit(PeerCommand::Negotiate)),
                        Err(NegotiationError::ShutDown) => return Err(NegotiationError::ShutDown),
                        Err(e) => {
                            tracing::warn!(peer = %entry.peer_id, error = %e, "Failed to create peer session");
                        }
                    }
                }
            }
            RelayMessage::PeerJoined {
                peer_id,
                display_name,
                is_host,
            } => {
                if &peer_id != local {
                    self.ensure_session(&peer_id, SessionMeta::joined(display_name, is_host))
                        .await?;
                }
            }
            RelayMessage::PeerLeft { peer_id } => {
                self.remove_peer(&peer_id).await;
            }
            RelayMessage::Signal {
                from_peer,
                to_peer,
                signal,
                ..
            } => {
                if &to_peer != local || &from_peer == local {
                    tracing::trace!(from = %from_peer, to = %to_peer, "Ignoring signal not addressed to us");
                    return Ok(pending);
                }
                let channel = match signal {
                    // Late or redelivered offer from a peer that already left
                    SignalPayload::Offer(_) if self.has_departed(&from_peer) => {
                        tracing::debug!(peer = %from_peer, "Discarding offer from departed peer");
                        return Ok(pending);
                    }
                    // Relay order between peer-joined and signal is not guaranteed
                    SignalPayload::Offer(_) => Some(
                        self.ensure_session(&from_peer, SessionMeta::placeholder())
                            .await?,
                    ),
                    _ => self.channel(&from_peer),
                };
                match channel {
                    Some(channel) => pending.extend(channel.submit(PeerCommand::Signal(signal))),
                    None => tracing::warn!(
                        peer = %from_peer,
                        kind = signal.kind(),
                        "Discarding signal from unknown peer"
                    ),
                }
            }
            RelayMessage::ParticipantStatus {
                peer_id, status, ..
            } => {
                if &peer_id != local {
                    self.apply_remote_status(&peer_id, status);
                }
            }
            RelayMessage::Broadcast {
                from_peer,
                kind,
                payload,
                ..
            } => {
                if &from_peer != local {
                    self.apply_broadcast(from_peer, &kind, payload);
                }
            }
            RelayMessage::HostControl {
                from_peer,
                target_peer,
                action,
                value,
                ..
            } => {
                if &target_peer == local {
                    self.apply_host_control(&from_peer, action, value).await?;
                }
            }
            RelayMessage::JoinRoom { .. } | RelayMessage::LeaveRoom { .. } => {
                tracing::debug!("Ignoring outbound-only relay message");
            }
        }
        Ok(pending)
    }

    /// Return the session for `peer_id`, creating it if needed
    async fn ensure_session(
        &self,
        peer_id: &PeerId,
        meta: SessionMeta,
    ) -> Result<PeerChannel<TrackOf<F>>, NegotiationError> {
        let _creating = self.shared.creation.lock().await;
        self.ensure_open()?;
        if !meta.provisional {
            self.shared.departed.lock().remove(peer_id);
        }

        if let Some(channel) = self.existing_session(peer_id, &meta) {
            return Ok(channel);
        }

        let (sink, transport_events) = TransportEventSink::channel();
        let transport = Arc::new(self.shared.factory.create(peer_id, sink).await?);
        let mut session = PeerSession::new(
            self.shared.local.peer_id.clone(),
            peer_id.clone(),
            Arc::clone(&transport),
            PeerInfo::new(meta.display_name.clone(), meta.is_host, meta.status),
            self.shared.config.max_ice_restarts,
        );
        self.seed_tracks(&mut session).await;

        let info = Arc::clone(session.info());
        let (commands, command_rx) = mpsc::unbounded_channel();
        let actor = PeerActor {
            session,
            outbox: Arc::clone(&self.shared.outbox),
            events: self.shared.events.clone(),
            peers: Arc::downgrade(&self.shared.peers),
            config: self.shared.config.clone(),
            retry: None,
        };
        let task = tokio::spawn(actor.run(command_rx, transport_events));
        let channel = PeerChannel { commands };

        self.shared.peers.lock().insert(
            peer_id.clone(),
            PeerHandle {
                info,
                transport,
                channel: channel.clone(),
                task,
                provisional: meta.provisional,
            },
        );

        tracing::info!(peer = %peer_id, name = %meta.display_name, "Peer session created");
        let _ = self.shared.events.send(RoomEvent::PeerJoined {
            peer_id: peer_id.clone(),
            display_name: meta.display_name,
        });
        Ok(channel)
    }

    /// Existing session, filling in metadata if it was created from an offer
    fn existing_session(
        &self,
        peer_id: &PeerId,
        meta: &SessionMeta,
    ) -> Option<PeerChannel<TrackOf<F>>> {
        let mut peers = self.shared.peers.lock();
        let handle = peers.get_mut(peer_id)?;

        if handle.provisional && !meta.provisional {
            handle.provisional = false;
            {
                let mut info = handle.info.write();
                info.display_name.clone_from(&meta.display_name);
                info.is_host = meta.is_host;
                info.status = meta.status;
            }
            let _ = self.shared.events.send(RoomEvent::PeerUpdated {
                peer_id: peer_id.clone(),
            });
        }
        Some(handle.channel.clone())
    }

    /// Put the current local tracks in a new session's slots
    async fn seed_tracks(&self, session: &mut PeerSession<TransportOf<F>>) {
        let tracks = self.shared.local_tracks.lock().clone();
        for kind in [TrackKind::Audio, TrackKind::Video] {
            if let Some(track) = tracks.get(kind) {
                if let Err(e) = session
                    .replace_outgoing_track(kind, Some(track.clone()))
                    .await
                {
                    tracing::warn!(peer = %session.peer_id(), kind = %kind, error = %e, "Failed to seed track");
                }
            }
        }
    }

    async fn remove_peer(&self, peer_id: &PeerId) -> bool {
        self.shared.departed.lock().insert(peer_id.clone());
        let handle = self.shared.peers.lock().remove(peer_id);
        let Some(handle) = handle else {
            tracing::debug!(peer = %peer_id, "Peer left without a session");
            return false;
        };

        // Abandons any in-flight negotiation and pending retry
        handle.task.abort();
        if let Err(e) = handle.transport.close().await {
            tracing::debug!(peer = %peer_id, error = %e, "Transport close failed");
        }
        handle.info.write().connection_state = ConnectionState::Closed;

        tracing::info!(peer = %peer_id, "Peer session removed");
        let _ = self.shared.events.send(RoomEvent::PeerLeft {
            peer_id: peer_id.clone(),
        });
        true
    }

    fn apply_remote_status(&self, peer_id: &PeerId, status: PeerStatus) {
        let Some(info) = self.info(peer_id) else {
            tracing::debug!(peer = %peer_id, "Status for unknown peer");
            return;
        };
        info.write().status = status;
        let _ = self.shared.events.send(RoomEvent::PeerUpdated {
            peer_id: peer_id.clone(),
        });
    }

    fn apply_broadcast(&self, from_peer: PeerId, kind: &str, payload: serde_json::Value) {
        match BroadcastPayload::from_wire(kind, payload) {
            BroadcastPayload::ScreenShareState { is_sharing } => {
                let Some(info) = self.info(&from_peer) else {
                    tracing::debug!(peer = %from_peer, "Screen-share state for unknown peer");
                    return;
                };
                info.write().is_screen_sharing = is_sharing;
                let _ = self
                    .shared
                    .events
                    .send(RoomEvent::PeerUpdated { peer_id: from_peer });
            }
            BroadcastPayload::Reaction(payload) => {
                let _ = self
                    .shared
                    .events
                    .send(RoomEvent::Reaction { from_peer, payload });
            }
            BroadcastPayload::Other { kind, payload } => {
                let _ = self.shared.events.send(RoomEvent::Broadcast {
                    from_peer,
                    kind,
                    payload,
                });
            }
        }
    }

    async fn apply_host_control(
        &self,
        from_peer: &PeerId,
        action: HostAction,
        value: bool,
    ) -> Result<(), NegotiationError> {
        let from_host = self
            .info(from_peer)
            .is_some_and(|info| info.read().is_host);
        if !from_host {
            tracing::warn!(peer = %from_peer, ?action, "Ignoring host control from non-host");
            return Ok(());
        }

        let (status, cleared) = {
            let mut status = self.shared.local_status.write();
            let mut cleared = None;
            match action {
                HostAction::Mute | HostAction::Unmute => {
                    status.is_muted = value;
                    if value {
                        cleared = Some(TrackKind::Audio);
                    }
                }
                HostAction::LockMic => {
                    status.is_mic_locked = value;
                    if value {
                        status.is_muted = true;
                        cleared = Some(TrackKind::Audio);
                    }
                }
                HostAction::UnlockMic => status.is_mic_locked = false,
                HostAction::LockCamera => {
                    status.is_camera_locked = value;
                    if value {
                        status.is_camera_off = true;
                        cleared = Some(TrackKind::Video);
                    }
                }
                HostAction::UnlockCamera => status.is_camera_locked = false,
            }
            (*status, cleared)
        };
        tracing::info!(from = %from_peer, ?action, value, "Applied host control");

        if let Some(kind) = cleared {
            self.replace_outgoing_track(kind, None).await?;
        }
        if let Err(e) = self.publish_status(status).await {
            tracing::warn!(error = %e, "Failed to publish status after host control");
        }

        let _ = self.shared.events.send(RoomEvent::HostControl {
            from_peer: from_peer.clone(),
            action,
            value,
        });
        let _ = self
            .shared
            .events
            .send(RoomEvent::LocalStatusChanged { status });
        Ok(())
    }

    async fn publish_status(&self, status: PeerStatus) -> Result<(), NegotiationError> {
        self.shared
            .outbox
            .publish(RelayMessage::ParticipantStatus {
                room_code: self.shared.local.room_code.clone(),
                peer_id: self.shared.local.peer_id.clone(),
                status,
            })
            .await
    }

    fn start_sampler(&self) {
        let peers = Arc::downgrade(&self.shared.peers);
        let handle = spawn_sampler(
            self.shared.config.stats_interval(),
            move || {
                let peers = peers.upgrade()?;
                let targets = peers
                    .lock()
                    .iter()
                    .map(|(peer_id, handle)| SampleTarget {
                        peer_id: peer_id.clone(),
                        info: Arc::clone(&handle.info),
                        transport: Arc::clone(&handle.transport),
                    })
                    .collect();
                Some(targets)
            },
            self.shared.events.clone(),
        );
        if let Some(previous) = self.shared.sampler.lock().replace(handle) {
            previous.abort();
        }
    }

    fn is_locked(&self, kind: TrackKind) -> bool {
        let status = self.shared.local_status.read();
        match kind {
            TrackKind::Audio => status.is_mic_locked,
            TrackKind::Video => status.is_camera_locked,
        }
    }

    fn channel(&self, peer_id: &PeerId) -> Option<PeerChannel<TrackOf<F>>> {
        self.shared
            .peers
            .lock()
            .get(peer_id)
            .map(|handle| handle.channel.clone())
    }

    fn channels(&self) -> Vec<PeerChannel<TrackOf<F>>> {
        self.shared
            .peers
            .lock()
            .values()
            .map(|handle| handle.channel.clone())
            .collect()
    }

    fn info(&self, peer_id: &PeerId) -> Option<Arc<RwLock<PeerInfo>>> {
        self.shared
            .peers
            .lock()
            .get(peer_id)
            .map(|handle| Arc::clone(&handle.info))
    }

    fn has_departed(&self, peer_id: &PeerId) -> bool {
        self.shared.departed.lock().contains(peer_id)
    }

    fn ensure_open(&self) -> Result<(), NegotiationError> {
        if self.is_closed() {
            Err(NegotiationError::ShutDown)
        } else {
            Ok(())
        }
    }
}
