//! Seam between the call state machine and the platform media stack.
//!
//! The engine captures the microphone, generates session descriptors and
//! candidates, and reports inbound audio. Packetization, jitter buffering and
//! codecs stay behind this trait.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::IceServer;
use crate::protocol::{IceCandidate, SessionDescription};
use crate::ringtone::RingTone;
use crate::volume::LevelSource;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MediaError {
    #[error("microphone permission denied")]
    PermissionDenied,
    #[error("no audio input device available")]
    NoDevice,
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("peer connection closed")]
    Closed,
    #[error("media engine error: {0}")]
    Engine(String),
}

impl MediaError {
    pub fn is_acquisition(&self) -> bool {
        matches!(self, MediaError::PermissionDenied | MediaError::NoDevice)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Captured microphone audio owned by exactly one call session.
pub trait LocalAudio: Send + Sync {
    /// Mutes or unmutes every captured track without releasing the device.
    fn set_enabled(&self, enabled: bool);
    /// Stops every track and releases the device. Idempotent.
    fn stop(&self);
    fn is_live(&self) -> bool;
    fn level_source(&self) -> Arc<dyn LevelSource>;
    fn as_any(&self) -> &dyn Any;
}

/// Inbound audio from the remote peer.
pub trait RemoteAudio: Send + Sync {
    /// Stops playback. Idempotent.
    fn stop(&self);
    fn level_source(&self) -> Arc<dyn LevelSource>;
}

/// Keeps a sound playing until dropped.
pub trait Playback: Send + Sync {}

pub enum PeerEvent {
    LocalCandidate(IceCandidate),
    RemoteAudio(Box<dyn RemoteAudio>),
    StateChanged(PeerState),
}

impl fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerEvent::LocalCandidate(candidate) => {
                f.debug_tuple("LocalCandidate").field(candidate).finish()
            }
            PeerEvent::RemoteAudio(_) => f.write_str("RemoteAudio"),
            PeerEvent::StateChanged(state) => f.debug_tuple("StateChanged").field(state).finish(),
        }
    }
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn add_local_audio(&self, audio: &dyn LocalAudio) -> Result<(), MediaError>;
    async fn create_offer(&self) -> Result<SessionDescription, MediaError>;
    async fn create_answer(&self) -> Result<SessionDescription, MediaError>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), MediaError>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), MediaError>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError>;
    fn has_remote_description(&self) -> bool;
    /// Closes the connection. Takes effect immediately; any engine-side
    /// cleanup continues in the background.
    fn close(&self);
}

/// A freshly created peer connection plus the stream of its events.
pub struct PeerLink {
    pub connection: Arc<dyn PeerConnection>,
    pub events: mpsc::UnboundedReceiver<PeerEvent>,
}

#[async_trait]
pub trait MediaEngine: Send + Sync + 'static {
    async fn acquire_local_audio(&self) -> Result<Box<dyn LocalAudio>, MediaError>;
    async fn create_peer_connection(&self, ice_servers: &[IceServer])
        -> Result<PeerLink, MediaError>;

    fn play_ringtone(&self, _tone: RingTone) -> Option<Box<dyn Playback>> {
        None
    }
}
