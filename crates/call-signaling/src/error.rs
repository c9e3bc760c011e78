use relay_bus::RelayError;
use thiserror::Error;

use crate::media::MediaError;
use crate::protocol::Identity;
use crate::session::CallPhase;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("relay error: {0}")]
    Relay(#[from] RelayError),
    #[error("signal codec error: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("subscription failed after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: RelayError },
}

#[derive(Debug, Error)]
pub enum CallError {
    #[error("could not acquire microphone: {0}")]
    MediaAcquisition(MediaError),
    #[error("signaling channel error: {0}")]
    Channel(#[from] ChannelError),
    #[error("session negotiation failed: {0}")]
    Negotiation(MediaError),
    #[error("{operation} is not allowed while {phase}")]
    InvalidPhase {
        operation: &'static str,
        phase: CallPhase,
    },
    #[error("no chat partner is open")]
    NoPartner,
    #[error("unknown peer {0}")]
    UnknownPeer(Identity),
    #[error("call attempt superseded before it completed")]
    Superseded,
    #[error("call agent has shut down")]
    AgentClosed,
}

impl CallError {
    /// Classifies an engine failure raised while preparing a call.
    pub(crate) fn from_media(err: MediaError) -> Self {
        if err.is_acquisition() {
            CallError::MediaAcquisition(err)
        } else {
            CallError::Negotiation(err)
        }
    }
}

pub type CallResult<T> = Result<T, CallError>;
