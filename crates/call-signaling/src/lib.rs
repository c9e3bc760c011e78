//! Peer-to-peer audio call signaling.
//!
//! Each user listens on the relay topic named after their identity. A
//! [`CallAgent`] drives one user's call state machine over that topic and a
//! [`MediaEngine`](media::MediaEngine), alongside the typing and volume
//! side-channels the chat UI shows.

pub mod agent;
pub mod channel;
pub mod config;
pub mod directory;
pub mod error;
pub mod media;
pub mod protocol;
pub mod ringtone;
pub mod session;
pub mod telemetry;
pub mod typing;
pub mod volume;

pub use agent::{CallAgent, CallEvent, CallHandle, CallStatus};
pub use channel::{ChannelHandle, SignalingChannel};
pub use config::{BackoffPolicy, CallConfig, IceServer};
pub use directory::{Directory, DirectoryEntry, Reachability, StaticDirectory};
pub use error::{CallError, CallResult, ChannelError};
pub use media::{MediaEngine, MediaError};
pub use protocol::{CallSignal, Envelope, IceCandidate, Identity, SessionDescription, SignalPayload, TypingSignal};
pub use session::{CallPhase, EndReason, PendingCandidates, Role, SessionId};
