//! Roomlink - peer negotiation for multi-party WebRTC rooms
//!
//! This library drives one media session per remote participant of a room
//! over an unreliable, unordered, at-least-once signaling relay:
//!
//! - **Offer/answer state machine** per peer, safe under any interleaving of
//!   inbound messages
//! - **Collision handling** without extra round trips: the peer whose id
//!   sorts higher is polite and yields
//! - **ICE candidate buffering** until the matching remote description lands
//! - **Renegotiation** only when an outgoing slot gains or loses a track
//! - **Membership reconciliation**, connection-quality sampling and bounded
//!   recovery (ICE restarts, offer retries)
//!
//! Media transports and the relay are pluggable through
//! [`MediaTransport`]/[`MediaTransportFactory`] and [`SignalingTransport`].
//! With the default features the crate ships a WebRTC transport
//! (`webrtc-transport`) and a WebSocket relay client (`ws-relay`).
//!
//! # Examples
//!
//! ```rust,ignore
//! use roomlink_core::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let relay = WsRelayTransport::connect("wss://relay.example.org/ws").await?;
//! let signaling = Arc::new(SignalingHandler::new(Arc::new(relay)));
//! let config = CoordinatorConfig::default();
//! let factory = WebRtcTransportFactory::new(&config)?;
//!
//! let me = LocalParticipant::new("abc-defg-hij", "Ann");
//! let coordinator = NegotiationCoordinator::new(me, config, factory, signaling)?;
//! let mut events = coordinator.subscribe_events();
//!
//! let runner = coordinator.clone();
//! tokio::spawn(async move { runner.run().await });
//!
//! while let Ok(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! coordinator.leave().await;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::pedantic)]
#![allow(clippy::nursery)]
#![allow(clippy::unused_async)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::derivable_impls)]

/// Peer identity and negotiation roles
pub mod identity;

/// Negotiation types and data structures
pub mod types;

/// Relay protocol and signaling handler
pub mod signaling;

/// Media transport capability
pub mod media_transport;

/// Per-peer negotiation state machine
pub mod session;

/// Room-level negotiation coordinator
pub mod coordinator;

/// Connection-quality sampling
pub mod quality;

/// Coordinator configuration
pub mod config;

/// Coordinator errors
pub mod error;

/// Media transport on the `webrtc` crate
#[cfg(feature = "webrtc-transport")]
pub mod webrtc_transport;

/// WebSocket relay client
#[cfg(feature = "ws-relay")]
pub mod ws_relay;

// Re-export main types at crate root
pub use config::{ConfigError, CoordinatorConfig, IceServer, LocalParticipant};
pub use coordinator::NegotiationCoordinator;
pub use error::NegotiationError;
pub use identity::{NegotiationRole, PeerId};
pub use media_transport::{
    MediaTransport, MediaTransportError, MediaTransportFactory, TransportEvent,
    TransportEventSink,
};
pub use session::{PeerInfo, PeerSession, RemoteStream, SignalSink};
pub use signaling::{
    BroadcastPayload, RelayMessage, SignalPayload, SignalingHandler, SignalingTransport,
};
pub use types::*;
#[cfg(feature = "webrtc-transport")]
pub use webrtc_transport::{LocalTrack, WebRtcTransport, WebRtcTransportFactory};
#[cfg(feature = "ws-relay")]
pub use ws_relay::{WsRelayError, WsRelayTransport};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{CoordinatorConfig, IceServer, LocalParticipant};
    pub use crate::coordinator::NegotiationCoordinator;
    pub use crate::error::NegotiationError;
    pub use crate::identity::{NegotiationRole, PeerId};
    pub use crate::media_transport::{MediaTransport, MediaTransportFactory, TransportEvent};
    pub use crate::signaling::{BroadcastPayload, RelayMessage, SignalingHandler, SignalingTransport};
    pub use crate::types::{
        ConnectionState, HostAction, PeerSnapshot, PeerStatus, RoomEvent, SignalQuality,
        SignalingState, TrackKind,
    };
    #[cfg(feature = "webrtc-transport")]
    pub use crate::webrtc_transport::{LocalTrack, WebRtcTransportFactory};
    #[cfg(feature = "ws-relay")]
    pub use crate::ws_relay::WsRelayTransport;
}
