//! Coordinator errors

use crate::config::ConfigError;
use crate::identity::PeerId;
use crate::media_transport::MediaTransportError;
use crate::types::TrackKind;
use thiserror::Error;

/// Negotiation coordinator errors
#[derive(Error, Debug)]
pub enum NegotiationError {
    /// No session exists for the peer
    #[error("Session not found: {0}")]
    SessionNotFound(PeerId),

    /// The coordinator has left the room
    #[error("Coordinator shut down")]
    ShutDown,

    /// Media transport error
    #[error("Media transport error: {0}")]
    Transport(#[from] MediaTransportError),

    /// The host has locked this kind of media off
    #[error("{0} is locked by the host")]
    TrackLocked(TrackKind),

    /// Relay send or receive failed
    #[error("Signaling error: {0}")]
    Signaling(String),

    /// Configuration rejected
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}
